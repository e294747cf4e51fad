//! Goodbye packet (RFC 3550 §6.6).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, PT_BYE};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Bye {
    pub ssrcs: Vec<u32>,
    pub reason: Option<String>,
}

impl Bye {
    pub fn new(ssrcs: Vec<u32>) -> Self {
        Bye {
            ssrcs,
            reason: None,
        }
    }

    pub fn packet_size(&self) -> usize {
        let reason_size = match &self.reason {
            Some(reason) => (1 + reason.len() + 3) / 4 * 4,
            None => 0,
        };
        4 + 4 * self.ssrcs.len() + reason_size
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(PT_BYE, self.ssrcs.len() as u8, self.packet_size() - 4);
        header.pack_into(out);
        for ssrc in &self.ssrcs {
            out.extend_from_slice(&ssrc.to_be_bytes());
        }
        if let Some(reason) = &self.reason {
            let start = out.len();
            out.push(reason.len() as u8);
            out.extend_from_slice(reason.as_bytes());
            while (out.len() - start) % 4 != 0 {
                out.push(0);
            }
        }
    }

    pub fn parse(header: &RtcpHeader, payload: &[u8]) -> Result<Bye> {
        let count = header.count_or_format as usize;
        if payload.len() < 4 * count {
            return Err(Error::PacketTooShort);
        }
        let mut bye = Bye::default();
        for i in 0..count {
            bye.ssrcs
                .push(u32::from_be_bytes(payload[i * 4..i * 4 + 4].try_into().unwrap()));
        }
        let mut offset = 4 * count;
        if offset < payload.len() {
            let len = payload[offset] as usize;
            offset += 1;
            if offset + len > payload.len() {
                return Err(Error::PacketTooShort);
            }
            bye.reason =
                Some(String::from_utf8_lossy(&payload[offset..offset + len]).into_owned());
        }
        Ok(bye)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_reason() {
        let mut bye = Bye::new(vec![0x1111, 0x2222]);
        bye.reason = Some("shutting down".to_string());
        let mut wire = Vec::new();
        bye.pack_into(&mut wire);
        assert_eq!(wire.len(), bye.packet_size());
        let header = RtcpHeader::parse(&wire).unwrap();
        assert_eq!(Bye::parse(&header, &wire[4..]).unwrap(), bye);
    }
}
