//! Picture loss indication (RFC 4585 §6.3.1).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, FMT_PLI, PT_PSFB};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl Pli {
    pub fn new(sender_ssrc: u32, media_ssrc: u32) -> Self {
        Pli {
            sender_ssrc,
            media_ssrc,
        }
    }

    pub fn packet_size(&self) -> usize {
        12
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(PT_PSFB, FMT_PLI, 8);
        header.pack_into(out);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        out.extend_from_slice(&self.media_ssrc.to_be_bytes());
    }

    pub fn parse(payload: &[u8]) -> Result<Pli> {
        if payload.len() < 8 {
            return Err(Error::PacketTooShort);
        }
        Ok(Pli {
            sender_ssrc: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            media_ssrc: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let pli = Pli::new(0x1234, 0x5678);
        let mut wire = Vec::new();
        pli.pack_into(&mut wire);
        assert_eq!(wire.len(), pli.packet_size());
        assert_eq!(Pli::parse(&wire[4..]).unwrap(), pli);
    }
}
