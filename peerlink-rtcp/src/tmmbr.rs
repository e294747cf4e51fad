//! Temporary maximum media stream bitrate request and notification
//! (RFC 5104 §4.2).

use shared::error::{Error, Result};

use crate::header::{RtcpHeader, FMT_TMMBN, FMT_TMMBR, PT_RTPFB};

const MAX_MANTISSA: u64 = (1 << 17) - 1;

/// One bounding-set entry: SSRC plus MxTBR fixed point and overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmmbItem {
    pub ssrc: u32,
    pub bitrate_bps: u64,
    /// Per-packet overhead in bytes (9 bits).
    pub packet_overhead: u16,
}

impl TmmbItem {
    fn pack_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        let mut exponent = 0u8;
        let mut mantissa = self.bitrate_bps;
        while mantissa > MAX_MANTISSA {
            mantissa >>= 1;
            exponent += 1;
        }
        let word = ((exponent as u32) << 26)
            | ((mantissa as u32) << 9)
            | (self.packet_overhead as u32 & 0x1FF);
        out.extend_from_slice(&word.to_be_bytes());
    }

    fn parse(data: &[u8]) -> Result<TmmbItem> {
        if data.len() < 8 {
            return Err(Error::PacketTooShort);
        }
        let word = u32::from_be_bytes(data[4..8].try_into().unwrap());
        let exponent = (word >> 26) as u8;
        let mantissa = ((word >> 9) & 0x1FFFF) as u64;
        Ok(TmmbItem {
            ssrc: u32::from_be_bytes(data[0..4].try_into().unwrap()),
            bitrate_bps: mantissa << exponent,
            packet_overhead: (word & 0x1FF) as u16,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tmmbr {
    pub sender_ssrc: u32,
    pub items: Vec<TmmbItem>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tmmbn {
    pub sender_ssrc: u32,
    pub items: Vec<TmmbItem>,
}

fn packet_size(items: &[TmmbItem]) -> usize {
    12 + 8 * items.len()
}

fn pack(sender_ssrc: u32, items: &[TmmbItem], fmt: u8, out: &mut Vec<u8>) {
    let header = RtcpHeader::new(PT_RTPFB, fmt, packet_size(items) - 4);
    header.pack_into(out);
    out.extend_from_slice(&sender_ssrc.to_be_bytes());
    // Media SSRC is unused for TMMBR/TMMBN.
    out.extend_from_slice(&0u32.to_be_bytes());
    for item in items {
        item.pack_into(out);
    }
}

fn parse_items(payload: &[u8]) -> Result<(u32, Vec<TmmbItem>)> {
    if payload.len() < 8 || (payload.len() - 8) % 8 != 0 {
        return Err(Error::PacketTooShort);
    }
    let sender_ssrc = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let mut items = Vec::new();
    let mut offset = 8;
    while offset + 8 <= payload.len() {
        items.push(TmmbItem::parse(&payload[offset..])?);
        offset += 8;
    }
    Ok((sender_ssrc, items))
}

impl Tmmbr {
    pub fn packet_size(&self) -> usize {
        packet_size(&self.items)
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        pack(self.sender_ssrc, &self.items, FMT_TMMBR, out);
    }

    pub fn parse(payload: &[u8]) -> Result<Tmmbr> {
        let (sender_ssrc, items) = parse_items(payload)?;
        Ok(Tmmbr { sender_ssrc, items })
    }
}

impl Tmmbn {
    pub fn packet_size(&self) -> usize {
        packet_size(&self.items)
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        pack(self.sender_ssrc, &self.items, FMT_TMMBN, out);
    }

    pub fn parse(payload: &[u8]) -> Result<Tmmbn> {
        let (sender_ssrc, items) = parse_items(payload)?;
        Ok(Tmmbn { sender_ssrc, items })
    }
}
