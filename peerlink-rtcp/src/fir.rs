//! Full intra request (RFC 5104 §4.3.1).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, FMT_FIR, PT_PSFB};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: u32,
    /// Command sequence number, incremented per distinct request.
    pub seq_nr: u8,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: u32,
    pub entries: Vec<FirEntry>,
}

impl Fir {
    pub fn new(sender_ssrc: u32, media_ssrc: u32, seq_nr: u8) -> Self {
        Fir {
            sender_ssrc,
            entries: vec![FirEntry {
                ssrc: media_ssrc,
                seq_nr,
            }],
        }
    }

    pub fn packet_size(&self) -> usize {
        12 + 8 * self.entries.len()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(PT_PSFB, FMT_FIR, self.packet_size() - 4);
        header.pack_into(out);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        // Media SSRC of the FIR FCI is unused and must be zero.
        out.extend_from_slice(&0u32.to_be_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.ssrc.to_be_bytes());
            out.push(entry.seq_nr);
            out.extend_from_slice(&[0, 0, 0]);
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Fir> {
        if payload.len() < 8 || (payload.len() - 8) % 8 != 0 {
            return Err(Error::PacketTooShort);
        }
        let mut fir = Fir {
            sender_ssrc: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            entries: Vec::new(),
        };
        let mut offset = 8;
        while offset + 8 <= payload.len() {
            fir.entries.push(FirEntry {
                ssrc: u32::from_be_bytes(payload[offset..offset + 4].try_into().unwrap()),
                seq_nr: payload[offset + 4],
            });
            offset += 8;
        }
        Ok(fir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let fir = Fir::new(0xAAAA_BBBB, 0xCCCC_DDDD, 9);
        let mut wire = Vec::new();
        fir.pack_into(&mut wire);
        assert_eq!(wire.len(), fir.packet_size());
        assert_eq!(Fir::parse(&wire[4..]).unwrap(), fir);
    }
}
