//! `sprop-parameter-sets` fmtp parsing: out-of-band SPS/PPS for H.264.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Decoded out-of-band parameter sets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpropParameterSets {
    pub sps_nalu: Vec<u8>,
    pub pps_nalu: Vec<u8>,
}

impl SpropParameterSets {
    /// Extracts and decodes the `sprop-parameter-sets` value from an fmtp
    /// line. Returns `None` when the attribute is absent or undecodable.
    pub fn parse_from_fmtp(fmtp: &str) -> Option<SpropParameterSets> {
        let value = fmtp
            .split(';')
            .map(str::trim)
            .find_map(|param| param.strip_prefix("sprop-parameter-sets="))?;

        let mut sets = SpropParameterSets::default();
        for encoded in value.split(',') {
            let nalu = STANDARD.decode(encoded.trim()).ok()?;
            match nalu.first().map(|b| b & 0x1F) {
                Some(7) if sets.sps_nalu.is_empty() => sets.sps_nalu = nalu,
                Some(8) if sets.pps_nalu.is_empty() => sets.pps_nalu = nalu,
                _ => {}
            }
        }
        if sets.sps_nalu.is_empty() && sets.pps_nalu.is_empty() {
            return None;
        }
        Some(sets)
    }

    /// The parameter sets as an Annex B prefix, ready to prepend to a
    /// keyframe.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.sps_nalu.len() + self.pps_nalu.len());
        for nalu in [&self.sps_nalu, &self.pps_nalu] {
            if !nalu.is_empty() {
                out.extend_from_slice(&[0, 0, 0, 1]);
                out.extend_from_slice(nalu);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A 4-byte SPS (0x67...) and PPS (0x68...), base64 encoded.
    const FMTP: &str =
        "packetization-mode=1;sprop-parameter-sets=Z0LAH6kA,aM4G4g==;profile-level-id=42c01f";

    #[test]
    fn test_parse_both_sets() {
        let sets = SpropParameterSets::parse_from_fmtp(FMTP).unwrap();
        assert_eq!(sets.sps_nalu[0] & 0x1F, 7);
        assert_eq!(sets.pps_nalu[0] & 0x1F, 8);

        let annex_b = sets.to_annex_b();
        assert_eq!(&annex_b[..4], &[0, 0, 0, 1]);
        assert!(annex_b.len() > 8 + sets.sps_nalu.len());
    }

    #[test]
    fn test_absent_attribute() {
        assert_eq!(
            SpropParameterSets::parse_from_fmtp("packetization-mode=1"),
            None
        );
    }

    #[test]
    fn test_garbage_base64_rejected() {
        assert_eq!(
            SpropParameterSets::parse_from_fmtp("sprop-parameter-sets=!!!,???"),
            None
        );
    }
}
