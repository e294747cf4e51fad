//! Source description with CNAME items (RFC 3550 §6.5).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, PT_SDES};

const ITEM_TYPE_END: u8 = 0;
const ITEM_TYPE_CNAME: u8 = 1;
const MAX_TEXT_LEN: usize = 255;
const MAX_CHUNKS: usize = 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sdes {
    pub chunks: Vec<SdesChunk>,
}

impl Sdes {
    pub fn add_cname(&mut self, ssrc: u32, cname: &str) -> Result<()> {
        if self.chunks.len() >= MAX_CHUNKS {
            return Err(Error::TooManyReports);
        }
        if cname.len() > MAX_TEXT_LEN {
            return Err(Error::BadMediaConfiguration(
                "cname longer than 255 octets".to_string(),
            ));
        }
        self.chunks.push(SdesChunk {
            ssrc,
            cname: cname.to_string(),
        });
        Ok(())
    }

    fn chunk_size(chunk: &SdesChunk) -> usize {
        // ssrc + item type + length + text, padded with at least one END
        // byte to a word boundary.
        let unpadded = 4 + 2 + chunk.cname.len() + 1;
        (unpadded + 3) / 4 * 4
    }

    pub fn packet_size(&self) -> usize {
        4 + self.chunks.iter().map(Self::chunk_size).sum::<usize>()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(PT_SDES, self.chunks.len() as u8, self.packet_size() - 4);
        header.pack_into(out);
        for chunk in &self.chunks {
            let start = out.len();
            out.extend_from_slice(&chunk.ssrc.to_be_bytes());
            out.push(ITEM_TYPE_CNAME);
            out.push(chunk.cname.len() as u8);
            out.extend_from_slice(chunk.cname.as_bytes());
            out.push(ITEM_TYPE_END);
            while (out.len() - start) % 4 != 0 {
                out.push(ITEM_TYPE_END);
            }
        }
    }

    pub fn parse(header: &RtcpHeader, payload: &[u8]) -> Result<Sdes> {
        let mut sdes = Sdes::default();
        let mut offset = 0;
        for _ in 0..header.count_or_format {
            if offset + 4 > payload.len() {
                return Err(Error::PacketTooShort);
            }
            let ssrc = u32::from_be_bytes(payload[offset..offset + 4].try_into().unwrap());
            offset += 4;
            let mut cname = String::new();
            loop {
                if offset >= payload.len() {
                    return Err(Error::PacketTooShort);
                }
                let item_type = payload[offset];
                offset += 1;
                if item_type == ITEM_TYPE_END {
                    break;
                }
                if offset >= payload.len() {
                    return Err(Error::PacketTooShort);
                }
                let len = payload[offset] as usize;
                offset += 1;
                if offset + len > payload.len() {
                    return Err(Error::PacketTooShort);
                }
                let text = String::from_utf8_lossy(&payload[offset..offset + len]).into_owned();
                offset += len;
                if item_type == ITEM_TYPE_CNAME {
                    cname = text;
                }
            }
            // Chunks are word aligned.
            offset = (offset + 3) / 4 * 4;
            sdes.chunks.push(SdesChunk { ssrc, cname });
        }
        Ok(sdes)
    }
}
