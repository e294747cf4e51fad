//! Connection configuration: ICE servers and identity.

use std::sync::Arc;

use shared::error::{Error, Result};

use crate::transport::certificate::Certificate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// One `stun:`/`turn:` server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub kind: IceServerKind,
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl IceServer {
    /// Parses `stun:host[:port]` and
    /// `turn:[user:pass@]host[:port][?transport=udp]` URLs.
    pub fn parse(url: &str) -> Result<IceServer> {
        let (scheme, rest) = url
            .split_once(':')
            .ok_or_else(|| Error::BadMediaConfiguration(format!("bad ice server url: {url}")))?;
        let kind = match scheme {
            "stun" | "stuns" => IceServerKind::Stun,
            "turn" | "turns" => IceServerKind::Turn,
            _ => {
                return Err(Error::BadMediaConfiguration(format!(
                    "unknown ice server scheme: {scheme}"
                )))
            }
        };
        // Strip any ?transport= tail.
        let rest = rest.split('?').next().unwrap_or(rest);

        let (credentials, host_port) = match rest.rsplit_once('@') {
            Some((creds, host)) => (Some(creds), host),
            None => (None, rest),
        };
        let (username, password) = match credentials {
            Some(creds) => match creds.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(creds.to_string()), None),
            },
            None => (None, None),
        };

        let (hostname, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| Error::BadMediaConfiguration(format!("bad port in {url}")))?,
            ),
            None => (
                host_port.to_string(),
                if kind == IceServerKind::Stun { 3478 } else { 3478 },
            ),
        };
        if hostname.is_empty() {
            return Err(Error::BadMediaConfiguration(format!(
                "empty hostname in {url}"
            )));
        }
        Ok(IceServer {
            kind,
            hostname,
            port,
            username,
            password,
        })
    }
}

/// Top-level connection configuration.
#[derive(Default, Clone)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    /// DTLS identity; a process-shared certificate is generated when
    /// absent.
    pub certificate: Option<Arc<Certificate>>,
}

impl RtcConfiguration {
    pub fn add_ice_server(&mut self, url: &str) -> Result<&mut Self> {
        self.ice_servers.push(IceServer::parse(url)?);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stun() {
        let server = IceServer::parse("stun:stun.l.example.org:19302").unwrap();
        assert_eq!(server.kind, IceServerKind::Stun);
        assert_eq!(server.hostname, "stun.l.example.org");
        assert_eq!(server.port, 19302);
        assert_eq!(server.username, None);
    }

    #[test]
    fn test_parse_stun_default_port() {
        let server = IceServer::parse("stun:stun.example.org").unwrap();
        assert_eq!(server.port, 3478);
    }

    #[test]
    fn test_parse_turn_with_credentials() {
        let server = IceServer::parse("turn:alice:secret@turn.example.org:3479?transport=udp")
            .unwrap();
        assert_eq!(server.kind, IceServerKind::Turn);
        assert_eq!(server.hostname, "turn.example.org");
        assert_eq!(server.port, 3479);
        assert_eq!(server.username.as_deref(), Some("alice"));
        assert_eq!(server.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_parse_failures() {
        assert!(IceServer::parse("http://example.org").is_err());
        assert!(IceServer::parse("stun:host:notaport").is_err());
        assert!(IceServer::parse("stun").is_err());
    }
}
