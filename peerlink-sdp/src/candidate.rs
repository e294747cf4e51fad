use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};

use shared::error::{Error, Result};

/// Address family of a resolved candidate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    #[default]
    Unresolved,
    Ipv4,
    Ipv6,
}

/// ICE candidate type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    #[default]
    Unknown,
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateType {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Unknown => "unknown",
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        }
    }

    fn from_str(s: &str) -> CandidateType {
        match s {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "prflx" => CandidateType::PeerReflexive,
            "relay" => CandidateType::Relayed,
            _ => CandidateType::Unknown,
        }
    }
}

/// Candidate transport, including the TCP candidate types of
/// draft-ietf-mmusic-ice-tcp.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    #[default]
    Unknown,
    Udp,
    TcpActive,
    TcpPassive,
    TcpSo,
    TcpUnknown,
}

/// How to resolve the advertised hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Accept numeric addresses only.
    Simple,
    /// Allow a blocking DNS lookup.
    LookUp,
}

/// One ICE candidate, either locally gathered or parsed from a
/// `candidate:` line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Candidate {
    foundation: String,
    component_id: u32,
    transport_type: TransportType,
    transport_type_str: String,
    priority: u32,
    host_name: String,
    service: String,
    candidate_type: CandidateType,
    type_str: String,
    /// Everything after the `typ <type>` token pair, preserved verbatim.
    various_tail: String,

    family: Family,
    address: Option<String>,
    port: Option<u16>,

    mid: Option<String>,
}

impl Candidate {
    /// Parses a candidate line. Accepts `a=candidate:...`, `candidate:...`
    /// or the bare attribute value.
    pub fn parse(line: &str) -> Result<Candidate> {
        let value = line
            .trim()
            .trim_start_matches("a=")
            .trim_start_matches("candidate:");

        let mut tokens = value.split_whitespace();
        let foundation = tokens
            .next()
            .ok_or_else(|| Error::InvalidCandidate(line.to_string()))?
            .to_string();
        let component_id = tokens
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| Error::InvalidCandidate(line.to_string()))?;
        let transport_type_str = tokens
            .next()
            .ok_or_else(|| Error::InvalidCandidate(line.to_string()))?
            .to_string();
        let priority = tokens
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| Error::InvalidCandidate(line.to_string()))?;
        let host_name = tokens
            .next()
            .ok_or_else(|| Error::InvalidCandidate(line.to_string()))?
            .to_string();
        let service = tokens
            .next()
            .ok_or_else(|| Error::InvalidCandidate(line.to_string()))?
            .to_string();
        match tokens.next() {
            Some("typ") => {}
            _ => return Err(Error::InvalidCandidate(line.to_string())),
        }
        let type_str = tokens
            .next()
            .ok_or_else(|| Error::InvalidCandidate(line.to_string()))?
            .to_string();

        let various_tail = tokens.collect::<Vec<_>>().join(" ");

        let transport_type = match transport_type_str.to_ascii_uppercase().as_str() {
            "UDP" => TransportType::Udp,
            "TCP" => {
                // TCP candidates carry their sub-type in the tail
                // (`tcptype active|passive|so`).
                match tail_value(&various_tail, "tcptype") {
                    Some("active") => TransportType::TcpActive,
                    Some("passive") => TransportType::TcpPassive,
                    Some("so") => TransportType::TcpSo,
                    _ => TransportType::TcpUnknown,
                }
            }
            _ => TransportType::Unknown,
        };

        Ok(Candidate {
            foundation,
            component_id,
            transport_type,
            transport_type_str,
            priority,
            host_name,
            service,
            candidate_type: CandidateType::from_str(&type_str),
            type_str,
            various_tail,
            family: Family::Unresolved,
            address: None,
            port: None,
            mid: None,
        })
    }

    pub fn parse_with_mid(line: &str, mid: &str) -> Result<Candidate> {
        let mut candidate = Candidate::parse(line)?;
        candidate.mid = Some(mid.to_string());
        Ok(candidate)
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn component_id(&self) -> u32 {
        self.component_id
    }

    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref()
    }

    pub fn set_mid(&mut self, mid: &str) {
        self.mid = Some(mid.to_string());
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_resolved(&self) -> bool {
        self.family != Family::Unresolved
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Resolves the advertised hostname and service to a concrete address.
    ///
    /// `Simple` mode accepts numeric addresses only; `LookUp` may block on
    /// DNS. Returns whether a resolution is now available.
    pub fn resolve(&mut self, mode: ResolveMode) -> bool {
        if self.is_resolved() {
            return true;
        }
        let port = match self.service.parse::<u16>() {
            Ok(p) => p,
            Err(_) => return false,
        };
        if let Ok(ip) = self.host_name.parse::<IpAddr>() {
            self.apply_resolution(ip, port);
            return true;
        }
        if mode == ResolveMode::LookUp {
            if let Ok(mut addrs) = (self.host_name.as_str(), port).to_socket_addrs() {
                if let Some(addr) = addrs.next() {
                    self.apply_resolution(addr.ip(), addr.port());
                    return true;
                }
            }
        }
        false
    }

    fn apply_resolution(&mut self, ip: IpAddr, port: u16) {
        self.family = match ip {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        };
        self.address = Some(ip.to_string());
        self.port = Some(port);
    }

    /// The `a=candidate:` attribute value (without the `a=` prefix).
    pub fn sdp_line(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component_id,
            self.transport_type_str,
            self.priority,
            self.host_name,
            self.service,
            self.type_str
        );
        if !self.various_tail.is_empty() {
            line.push(' ');
            line.push_str(&self.various_tail);
        }
        line
    }
}

fn tail_value<'a>(tail: &'a str, key: &str) -> Option<&'a str> {
    let mut tokens = tail.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == key {
            return tokens.next();
        }
    }
    None
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sdp_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_LINE: &str = "candidate:1 1 UDP 2122317823 192.168.1.9 51413 typ host";

    #[test]
    fn test_parse_host_candidate() {
        let candidate = Candidate::parse(HOST_LINE).unwrap();
        assert_eq!(candidate.foundation(), "1");
        assert_eq!(candidate.component_id(), 1);
        assert_eq!(candidate.transport_type(), TransportType::Udp);
        assert_eq!(candidate.priority(), 2122317823);
        assert_eq!(candidate.host_name(), "192.168.1.9");
        assert_eq!(candidate.service(), "51413");
        assert_eq!(candidate.candidate_type(), CandidateType::Host);
        assert!(!candidate.is_resolved());
    }

    #[test]
    fn test_parse_accepts_attribute_prefix() {
        let with_prefix = format!("a={HOST_LINE}");
        assert_eq!(
            Candidate::parse(&with_prefix).unwrap(),
            Candidate::parse(HOST_LINE).unwrap()
        );
    }

    #[test]
    fn test_parse_srflx_with_tail() {
        let line = "candidate:4 1 UDP 1686110207 203.0.113.7 40000 typ srflx raddr 192.168.1.9 rport 51413";
        let candidate = Candidate::parse(line).unwrap();
        assert_eq!(candidate.candidate_type(), CandidateType::ServerReflexive);
        // The tail survives a round trip verbatim.
        assert_eq!(candidate.sdp_line(), line);
    }

    #[test]
    fn test_parse_tcp_type_from_tail() {
        let line = "candidate:2 1 TCP 1010827775 10.0.0.4 9 typ host tcptype active";
        let candidate = Candidate::parse(line).unwrap();
        assert_eq!(candidate.transport_type(), TransportType::TcpActive);
    }

    #[test]
    fn test_malformed_candidate() {
        assert!(Candidate::parse("candidate:1 x UDP").is_err());
        assert!(Candidate::parse("candidate:1 1 UDP nope 1.2.3.4 80 typ host").is_err());
        assert!(Candidate::parse("candidate:1 1 UDP 1 1.2.3.4 80 host").is_err());
    }

    #[test]
    fn test_simple_resolve() {
        let mut candidate = Candidate::parse(HOST_LINE).unwrap();
        assert!(candidate.resolve(ResolveMode::Simple));
        assert_eq!(candidate.family(), Family::Ipv4);
        assert_eq!(candidate.address(), Some("192.168.1.9"));
        assert_eq!(candidate.port(), Some(51413));

        let mut v6 = Candidate::parse("candidate:1 1 UDP 1 ::1 9000 typ host").unwrap();
        assert!(v6.resolve(ResolveMode::Simple));
        assert_eq!(v6.family(), Family::Ipv6);
    }

    #[test]
    fn test_simple_resolve_rejects_names() {
        let mut candidate =
            Candidate::parse("candidate:1 1 UDP 1 example.invalid 9000 typ host").unwrap();
        assert!(!candidate.resolve(ResolveMode::Simple));
        assert!(!candidate.is_resolved());
    }

    #[test]
    fn test_structural_equality() {
        let a = Candidate::parse(HOST_LINE).unwrap();
        let b = Candidate::parse(HOST_LINE).unwrap();
        let c = Candidate::parse("candidate:2 1 UDP 2122317823 192.168.1.9 51413 typ host").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
