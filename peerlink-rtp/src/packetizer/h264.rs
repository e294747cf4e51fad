//! H.264 packetization (RFC 6184): single NAL unit, STAP-A and FU-A.

use std::collections::VecDeque;

use shared::error::{Error, Result};

use super::{split_about_equally, PayloadSizeLimits};
use crate::packet::RtpPacket;

pub const NAL_TYPE_STAP_A: u8 = 24;
pub const NAL_TYPE_FU_A: u8 = 28;

const NAL_HEADER_SIZE: usize = 1;
const FU_A_HEADER_SIZE: usize = 2;
const STAP_A_LENGTH_FIELD_SIZE: usize = 2;

const FU_START_BIT: u8 = 0x80;
const FU_END_BIT: u8 = 0x40;

/// H.264 NAL unit type (lower five bits of the NALU header).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    #[default]
    Unspecified = 0,
    CodedSliceNonIdr = 1,
    CodedSliceDataPartitionA = 2,
    CodedSliceDataPartitionB = 3,
    CodedSliceDataPartitionC = 4,
    CodedSliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    Aud = 9,
    EndOfSequence = 10,
    EndOfStream = 11,
    Filler = 12,
    SpsExt = 13,
    StapA = 24,
    FuA = 28,
    Reserved = 31,
}

impl From<u8> for NaluType {
    fn from(v: u8) -> Self {
        match v & 0x1F {
            0 => NaluType::Unspecified,
            1 => NaluType::CodedSliceNonIdr,
            2 => NaluType::CodedSliceDataPartitionA,
            3 => NaluType::CodedSliceDataPartitionB,
            4 => NaluType::CodedSliceDataPartitionC,
            5 => NaluType::CodedSliceIdr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::Aud,
            10 => NaluType::EndOfSequence,
            11 => NaluType::EndOfStream,
            12 => NaluType::Filler,
            13 => NaluType::SpsExt,
            24 => NaluType::StapA,
            28 => NaluType::FuA,
            _ => NaluType::Reserved,
        }
    }
}

/// RFC 6184 packetization mode. `NonInterleaved` (mode 1) is the one every
/// WebRTC endpoint negotiates; `SingleNalUnit` (mode 0) restricts output to
/// one NALU per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketizationMode {
    SingleNalUnit,
    NonInterleaved,
}

/// Splits an Annex B bitstream into NALU slices (start codes stripped).
pub fn split_annex_b(bitstream: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;
    while i + 2 < bitstream.len() {
        if bitstream[i] == 0 && bitstream[i + 1] == 0 && bitstream[i + 2] == 1 {
            let code_start = if i > 0 && bitstream[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                nalus.push(&bitstream[s..code_start]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < bitstream.len() {
            nalus.push(&bitstream[s..]);
        }
    }
    nalus
}

/// Splits one encoded frame into RTP payloads.
pub struct H264Packetizer {
    payloads: VecDeque<Vec<u8>>,
}

impl H264Packetizer {
    /// Packetizes an Annex B frame bitstream.
    pub fn new(
        bitstream: &[u8],
        limits: PayloadSizeLimits,
        mode: PacketizationMode,
    ) -> Result<Self> {
        let nalus = split_annex_b(bitstream);
        if nalus.is_empty() {
            return Err(Error::BadMediaConfiguration(
                "no NAL units in frame".to_string(),
            ));
        }
        let mut payloads = VecDeque::new();
        let mut index = 0;
        while index < nalus.len() {
            let nalu = nalus[index];
            if nalu.len() + limits.single_packet_reduction_len > limits.max_payload_len {
                packetize_fu_a(nalu, &limits, &mut payloads)?;
                index += 1;
            } else if mode == PacketizationMode::NonInterleaved {
                index = packetize_stap_a(&nalus, index, &limits, &mut payloads);
            } else {
                payloads.push_back(nalu.to_vec());
                index += 1;
            }
        }
        Ok(H264Packetizer { payloads })
    }

    pub fn num_packets(&self) -> usize {
        self.payloads.len()
    }

    /// Moves the next payload into `packet`; the marker bit is set on the
    /// last packet of the access unit.
    pub fn next_packet(&mut self, packet: &mut RtpPacket) -> bool {
        let Some(payload) = self.payloads.pop_front() else {
            return false;
        };
        packet.set_payload(&payload);
        packet.set_marker(self.payloads.is_empty());
        true
    }
}

fn packetize_fu_a(
    nalu: &[u8],
    limits: &PayloadSizeLimits,
    out: &mut VecDeque<Vec<u8>>,
) -> Result<()> {
    if nalu.len() <= NAL_HEADER_SIZE {
        return Err(Error::BadMediaConfiguration("empty NAL unit".to_string()));
    }
    let header = nalu[0];
    let body = &nalu[NAL_HEADER_SIZE..];

    let mut fragment_limits = *limits;
    fragment_limits.max_payload_len = limits
        .max_payload_len
        .saturating_sub(FU_A_HEADER_SIZE);
    let sizes = split_about_equally(body.len(), &fragment_limits);
    if sizes.is_empty() {
        return Err(Error::BadMediaConfiguration(
            "payload limits leave no room for FU-A".to_string(),
        ));
    }

    let fu_indicator = (header & 0xE0) | NAL_TYPE_FU_A;
    let nalu_type = header & 0x1F;
    let mut offset = 0;
    for (i, size) in sizes.iter().enumerate() {
        let mut fu_header = nalu_type;
        if i == 0 {
            fu_header |= FU_START_BIT;
        }
        if i == sizes.len() - 1 {
            fu_header |= FU_END_BIT;
        }
        let mut payload = Vec::with_capacity(FU_A_HEADER_SIZE + size);
        payload.push(fu_indicator);
        payload.push(fu_header);
        payload.extend_from_slice(&body[offset..offset + size]);
        out.push_back(payload);
        offset += size;
    }
    Ok(())
}

/// Aggregates NALUs starting at `index` into one STAP-A payload (or a
/// single-NALU payload when aggregation does not pay off). Returns the
/// index of the first NALU not consumed.
fn packetize_stap_a(
    nalus: &[&[u8]],
    index: usize,
    limits: &PayloadSizeLimits,
    out: &mut VecDeque<Vec<u8>>,
) -> usize {
    let budget = limits
        .max_payload_len
        .saturating_sub(limits.single_packet_reduction_len);

    let mut aggregate_size = NAL_HEADER_SIZE;
    let mut end = index;
    while end < nalus.len() {
        let added = STAP_A_LENGTH_FIELD_SIZE + nalus[end].len();
        if aggregate_size + added > budget {
            break;
        }
        aggregate_size += added;
        end += 1;
    }

    if end - index <= 1 {
        out.push_back(nalus[index].to_vec());
        return index + 1;
    }

    // STAP-A NAL header takes the strongest NRI of its members.
    let nri = nalus[index..end]
        .iter()
        .map(|n| n[0] & 0x60)
        .max()
        .unwrap_or(0);
    let mut payload = Vec::with_capacity(aggregate_size);
    payload.push(nri | NAL_TYPE_STAP_A);
    for nalu in &nalus[index..end] {
        payload.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
        payload.extend_from_slice(nalu);
    }
    out.push_back(payload);
    end
}

/// One decoded unit out of the depacketizer: Annex B bytes plus the frame
/// metadata the receive pipeline keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepacketizedUnit {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
    pub is_first_packet_in_frame: bool,
}

/// Reassembles RTP payloads back into Annex B NAL units.
///
/// FU-A fragments must arrive in sequence order with matching start/end
/// bits; a gap or a malformed fragment invalidates the access unit under
/// assembly.
#[derive(Default)]
pub struct H264Depacketizer {
    fragment_buffer: Vec<u8>,
    fragment_last_seq: Option<u16>,
    fragment_is_keyframe: bool,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one RTP payload. `Ok(Some)` yields a complete unit,
    /// `Ok(None)` an in-progress fragment; errors invalidate the current
    /// access unit and reset the fragment state.
    pub fn depacketize(
        &mut self,
        payload: &[u8],
        sequence_number: u16,
    ) -> Result<Option<DepacketizedUnit>> {
        if payload.is_empty() {
            self.reset();
            return Err(Error::BufferTooShort);
        }
        match NaluType::from(payload[0]) {
            NaluType::FuA => self.depacketize_fu_a(payload, sequence_number),
            NaluType::StapA => {
                self.reset();
                self.depacketize_stap_a(payload)
            }
            _ => {
                self.reset();
                let is_keyframe = matches!(
                    NaluType::from(payload[0]),
                    NaluType::CodedSliceIdr | NaluType::Sps
                );
                let mut data = vec![0, 0, 0, 1];
                data.extend_from_slice(payload);
                Ok(Some(DepacketizedUnit {
                    data,
                    is_keyframe,
                    is_first_packet_in_frame: true,
                }))
            }
        }
    }

    fn depacketize_stap_a(&mut self, payload: &[u8]) -> Result<Option<DepacketizedUnit>> {
        let mut data = Vec::with_capacity(payload.len() + 8);
        let mut is_keyframe = false;
        let mut offset = NAL_HEADER_SIZE;
        while offset < payload.len() {
            if offset + STAP_A_LENGTH_FIELD_SIZE > payload.len() {
                return Err(Error::BufferTooShort);
            }
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += STAP_A_LENGTH_FIELD_SIZE;
            if offset + size > payload.len() || size == 0 {
                return Err(Error::BufferTooShort);
            }
            let nalu = &payload[offset..offset + size];
            if matches!(
                NaluType::from(nalu[0]),
                NaluType::CodedSliceIdr | NaluType::Sps
            ) {
                is_keyframe = true;
            }
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nalu);
            offset += size;
        }
        Ok(Some(DepacketizedUnit {
            data,
            is_keyframe,
            is_first_packet_in_frame: true,
        }))
    }

    fn depacketize_fu_a(
        &mut self,
        payload: &[u8],
        sequence_number: u16,
    ) -> Result<Option<DepacketizedUnit>> {
        if payload.len() <= FU_A_HEADER_SIZE {
            self.reset();
            return Err(Error::BufferTooShort);
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & FU_START_BIT != 0;
        let end = fu_header & FU_END_BIT != 0;
        let nalu_type = fu_header & 0x1F;
        let body = &payload[FU_A_HEADER_SIZE..];

        if start {
            self.fragment_buffer.clear();
            self.fragment_buffer.extend_from_slice(&[0, 0, 0, 1]);
            // Reconstruct the original NALU header from indicator NRI bits
            // and the type in the FU header.
            self.fragment_buffer.push((fu_indicator & 0xE0) | nalu_type);
            self.fragment_is_keyframe =
                matches!(NaluType::from(nalu_type), NaluType::CodedSliceIdr);
        } else {
            let expected = self.fragment_last_seq.map(|s| s.wrapping_add(1));
            if expected != Some(sequence_number) || self.fragment_buffer.is_empty() {
                // Gap, or a middle/end fragment with no start seen.
                self.reset();
                return Err(Error::UnexpectedState(
                    "FU-A fragment out of order".to_string(),
                ));
            }
        }
        self.fragment_last_seq = Some(sequence_number);
        self.fragment_buffer.extend_from_slice(body);

        if end {
            let unit = DepacketizedUnit {
                data: std::mem::take(&mut self.fragment_buffer),
                is_keyframe: self.fragment_is_keyframe,
                is_first_packet_in_frame: false,
            };
            self.reset();
            return Ok(Some(unit));
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.fragment_buffer.clear();
        self.fragment_last_seq = None;
        self.fragment_is_keyframe = false;
    }
}
