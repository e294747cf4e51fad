//! Receiver estimated maximum bitrate, carried as application-layer
//! feedback (draft-alvestrand-rmcat-remb).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, FMT_AFB, PT_PSFB};

const UNIQUE_IDENTIFIER: [u8; 4] = *b"REMB";
const MAX_MANTISSA: u64 = (1 << 18) - 1;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Remb {
    pub sender_ssrc: u32,
    /// Estimated maximum bitrate in bits per second.
    pub bitrate_bps: u64,
    pub ssrcs: Vec<u32>,
}

impl Remb {
    pub fn new(sender_ssrc: u32, bitrate_bps: u64, ssrcs: Vec<u32>) -> Self {
        Remb {
            sender_ssrc,
            bitrate_bps,
            ssrcs,
        }
    }

    pub fn packet_size(&self) -> usize {
        20 + 4 * self.ssrcs.len()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(PT_PSFB, FMT_AFB, self.packet_size() - 4);
        header.pack_into(out);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        // Media SSRC must be zero for AFB.
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&UNIQUE_IDENTIFIER);

        // 6-bit exponent, 18-bit mantissa.
        let mut exponent = 0u8;
        let mut mantissa = self.bitrate_bps;
        while mantissa > MAX_MANTISSA {
            mantissa >>= 1;
            exponent += 1;
        }
        out.push(self.ssrcs.len() as u8);
        out.push(((exponent << 2) | ((mantissa >> 16) as u8 & 0x03)) as u8);
        out.extend_from_slice(&[(mantissa >> 8) as u8, mantissa as u8]);
        for ssrc in &self.ssrcs {
            out.extend_from_slice(&ssrc.to_be_bytes());
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Remb> {
        if payload.len() < 16 {
            return Err(Error::PacketTooShort);
        }
        if payload[8..12] != UNIQUE_IDENTIFIER {
            return Err(Error::MissingRembIdentifier);
        }
        let num_ssrcs = payload[12] as usize;
        if payload.len() < 16 + 4 * num_ssrcs {
            return Err(Error::SsrcNumAndLengthMismatch);
        }
        let exponent = payload[13] >> 2;
        let mantissa = (((payload[13] & 0x03) as u64) << 16)
            | ((payload[14] as u64) << 8)
            | payload[15] as u64;
        let mut remb = Remb {
            sender_ssrc: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            bitrate_bps: mantissa << exponent,
            ssrcs: Vec::with_capacity(num_ssrcs),
        };
        for i in 0..num_ssrcs {
            let offset = 16 + 4 * i;
            remb.ssrcs
                .push(u32::from_be_bytes(payload[offset..offset + 4].try_into().unwrap()));
        }
        Ok(remb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_exact_bitrate() {
        let remb = Remb::new(0x1111, 250_000, vec![0x2222, 0x3333]);
        let mut wire = Vec::new();
        remb.pack_into(&mut wire);
        assert_eq!(wire.len(), remb.packet_size());
        assert_eq!(Remb::parse(&wire[4..]).unwrap(), remb);
    }

    #[test]
    fn test_large_bitrate_uses_exponent() {
        let remb = Remb::new(1, 64 << 18, vec![2]);
        let mut wire = Vec::new();
        remb.pack_into(&mut wire);
        let parsed = Remb::parse(&wire[4..]).unwrap();
        // Exact up to mantissa precision.
        assert_eq!(parsed.bitrate_bps, 64 << 18);
    }

    #[test]
    fn test_missing_identifier_rejected() {
        let remb = Remb::new(1, 1000, vec![]);
        let mut wire = Vec::new();
        remb.pack_into(&mut wire);
        wire[12] = b'X';
        assert_eq!(Remb::parse(&wire[4..]), Err(Error::MissingRembIdentifier));
    }
}
