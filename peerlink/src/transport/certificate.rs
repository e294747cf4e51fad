//! Self-signed certificates for DTLS identity.

use std::sync::{Arc, OnceLock};

use ring::digest;

use shared::error::{Error, Result};

/// A self-signed certificate (ECDSA P-256 by default, which is what
/// `rcgen` generates) together with its private key and SHA-256
/// fingerprint.
pub struct Certificate {
    der: Vec<u8>,
    private_key_der: Vec<u8>,
    fingerprint: String,
}

impl Certificate {
    /// Generates a fresh self-signed certificate.
    pub fn generate() -> Result<Arc<Certificate>> {
        let certified = rcgen::generate_simple_self_signed(vec!["peerlink".to_string()])
            .map_err(|e| Error::TlsError(format!("certificate generation failed: {e}")))?;
        let der = certified.cert.der().to_vec();
        let fingerprint = Certificate::make_fingerprint(&der);
        Ok(Arc::new(Certificate {
            der,
            private_key_der: certified.key_pair.serialize_der(),
            fingerprint,
        }))
    }

    /// Process-wide certificate: key generation is expensive, so the first
    /// caller pays and everyone else shares.
    pub fn shared() -> Result<Arc<Certificate>> {
        static SHARED: OnceLock<Arc<Certificate>> = OnceLock::new();
        if let Some(cert) = SHARED.get() {
            return Ok(Arc::clone(cert));
        }
        let cert = Certificate::generate()?;
        Ok(Arc::clone(SHARED.get_or_init(|| cert)))
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    /// `XX:XX:…` SHA-256 fingerprint of the DER encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Computes the colon-separated SHA-256 fingerprint of a DER blob.
    pub fn make_fingerprint(der: &[u8]) -> String {
        let hash = digest::digest(&digest::SHA256, der);
        let mut out = String::with_capacity(32 * 3 - 1);
        for (i, byte) in hash.as_ref().iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }

    /// Case-insensitive fingerprint comparison.
    pub fn fingerprint_matches(expected: &str, der: &[u8]) -> bool {
        Certificate::make_fingerprint(der).eq_ignore_ascii_case(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdp::defines::is_sha256_fingerprint;

    #[test]
    fn test_fingerprint_shape() {
        let cert = Certificate::generate().unwrap();
        assert!(is_sha256_fingerprint(cert.fingerprint()));
    }

    #[test]
    fn test_fingerprint_matches_der() {
        let cert = Certificate::generate().unwrap();
        assert!(Certificate::fingerprint_matches(
            cert.fingerprint(),
            cert.der()
        ));
        assert!(Certificate::fingerprint_matches(
            &cert.fingerprint().to_ascii_lowercase(),
            cert.der()
        ));
        let other = Certificate::generate().unwrap();
        assert!(!Certificate::fingerprint_matches(
            other.fingerprint(),
            cert.der()
        ));
    }

    #[test]
    fn test_shared_certificate_is_cached() {
        let a = Certificate::shared().unwrap();
        let b = Certificate::shared().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
