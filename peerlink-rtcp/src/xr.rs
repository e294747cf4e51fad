//! Extended reports (RFC 3611): receiver reference time, DLRR and the
//! target-bitrate block.

use shared::error::{Error, Result};
use shared::units::NtpTime;

use crate::header::{RtcpHeader, PT_XR};

const BLOCK_RRTR: u8 = 4;
const BLOCK_DLRR: u8 = 5;
const BLOCK_TARGET_BITRATE: u8 = 42;

/// Receiver reference time block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rrtr {
    pub ntp_timestamp: NtpTime,
}

/// One DLRR sub-block: the echo a sender needs to compute RTT towards a
/// receiver-only peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlrrItem {
    pub ssrc: u32,
    /// Middle 32 bits of the last RRTR received from `ssrc`.
    pub last_rr: u32,
    /// Delay since that RRTR in 1/65536 seconds.
    pub delay_since_last_rr: u32,
}

/// Target-bitrate item per spatial/temporal layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetBitrateItem {
    pub spatial_layer: u8,
    pub temporal_layer: u8,
    pub target_bitrate_kbps: u32,
}

/// An XR packet with any combination of the supported blocks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Xr {
    pub sender_ssrc: u32,
    pub rrtr: Option<Rrtr>,
    pub dlrr_items: Vec<DlrrItem>,
    pub target_bitrates: Vec<TargetBitrateItem>,
}

impl Xr {
    pub fn new(sender_ssrc: u32) -> Self {
        Xr {
            sender_ssrc,
            ..Default::default()
        }
    }

    pub fn packet_size(&self) -> usize {
        let mut size = 8;
        if self.rrtr.is_some() {
            size += 4 + 8;
        }
        if !self.dlrr_items.is_empty() {
            size += 4 + 12 * self.dlrr_items.len();
        }
        if !self.target_bitrates.is_empty() {
            size += 4 + 4 * self.target_bitrates.len();
        }
        size
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let header = RtcpHeader::new(PT_XR, 0, self.packet_size() - 4);
        header.pack_into(out);
        out.extend_from_slice(&self.sender_ssrc.to_be_bytes());

        if let Some(rrtr) = &self.rrtr {
            out.push(BLOCK_RRTR);
            out.push(0);
            out.extend_from_slice(&2u16.to_be_bytes());
            out.extend_from_slice(&rrtr.ntp_timestamp.as_u64().to_be_bytes());
        }
        if !self.dlrr_items.is_empty() {
            out.push(BLOCK_DLRR);
            out.push(0);
            out.extend_from_slice(&((3 * self.dlrr_items.len()) as u16).to_be_bytes());
            for item in &self.dlrr_items {
                out.extend_from_slice(&item.ssrc.to_be_bytes());
                out.extend_from_slice(&item.last_rr.to_be_bytes());
                out.extend_from_slice(&item.delay_since_last_rr.to_be_bytes());
            }
        }
        if !self.target_bitrates.is_empty() {
            out.push(BLOCK_TARGET_BITRATE);
            out.push(0);
            out.extend_from_slice(&(self.target_bitrates.len() as u16).to_be_bytes());
            for item in &self.target_bitrates {
                out.push((item.spatial_layer << 4) | (item.temporal_layer & 0x0F));
                let kbps = item.target_bitrate_kbps & 0x00FF_FFFF;
                out.extend_from_slice(&[(kbps >> 16) as u8, (kbps >> 8) as u8, kbps as u8]);
            }
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Xr> {
        if payload.len() < 4 {
            return Err(Error::PacketTooShort);
        }
        let mut xr = Xr::new(u32::from_be_bytes(payload[0..4].try_into().unwrap()));
        let mut offset = 4;
        while offset + 4 <= payload.len() {
            let block_type = payload[offset];
            let block_words = u16::from_be_bytes(payload[offset + 2..offset + 4].try_into().unwrap())
                as usize;
            let block_len = block_words * 4;
            offset += 4;
            if offset + block_len > payload.len() {
                return Err(Error::InvalidBlockSize);
            }
            let block = &payload[offset..offset + block_len];
            offset += block_len;
            match block_type {
                BLOCK_RRTR => {
                    if block.len() != 8 {
                        return Err(Error::InvalidBlockSize);
                    }
                    xr.rrtr = Some(Rrtr {
                        ntp_timestamp: NtpTime::from_u64(u64::from_be_bytes(
                            block.try_into().unwrap(),
                        )),
                    });
                }
                BLOCK_DLRR => {
                    if block.len() % 12 != 0 {
                        return Err(Error::InvalidBlockSize);
                    }
                    for item in block.chunks_exact(12) {
                        xr.dlrr_items.push(DlrrItem {
                            ssrc: u32::from_be_bytes(item[0..4].try_into().unwrap()),
                            last_rr: u32::from_be_bytes(item[4..8].try_into().unwrap()),
                            delay_since_last_rr: u32::from_be_bytes(
                                item[8..12].try_into().unwrap(),
                            ),
                        });
                    }
                }
                BLOCK_TARGET_BITRATE => {
                    for item in block.chunks_exact(4) {
                        xr.target_bitrates.push(TargetBitrateItem {
                            spatial_layer: item[0] >> 4,
                            temporal_layer: item[0] & 0x0F,
                            target_bitrate_kbps: ((item[1] as u32) << 16)
                                | ((item[2] as u32) << 8)
                                | item[3] as u32,
                        });
                    }
                }
                _ => {
                    // Unknown block: skipped, the length field already
                    // advanced us past it.
                }
            }
        }
        Ok(xr)
    }
}
