//! Send-side ULPFEC generation.

use log::debug;

use super::{
    red_wrap, FecRecovery, FEC_HEADER_SIZE, FEC_LEVEL_HEADER_SIZE_LONG,
    FEC_LEVEL_HEADER_SIZE_SHORT, MAX_MEDIA_PACKETS_SHORT_MASK, RED_HEADER_SIZE,
};
use crate::packet::{RtpPacket, RtpPacketToSend, RtpPacketType, FIXED_HEADER_SIZE};

/// Protection tuning for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecProtectionParams {
    /// Protection factor in 1/256 units: the FEC packet count per window is
    /// `(media_packets · fec_rate + 128) / 256`, at least one while the
    /// rate is non-zero.
    pub fec_rate: u8,
    /// Frames to accumulate before protection packets are emitted.
    pub max_fec_frames: usize,
}

impl Default for FecProtectionParams {
    fn default() -> Self {
        FecProtectionParams {
            fec_rate: 255,
            max_fec_frames: 1,
        }
    }
}

/// Generates ULPFEC protection packets over a window of sequenced media
/// packets and RED-wraps both directions.
///
/// Feed every outbound media packet after sequencing; emitted FEC packets
/// still need sequence numbers (loop them back through the sequencer).
pub struct UlpFecGenerator {
    red_payload_type: u8,
    ulpfec_payload_type: u8,
    params: FecProtectionParams,

    /// Serialized protected packets with their sequence numbers.
    media_packets: Vec<(u16, Vec<u8>)>,
    media_ssrc: Option<u32>,
    last_timestamp: u32,
    complete_frames: usize,
}

impl UlpFecGenerator {
    pub fn new(red_payload_type: u8, ulpfec_payload_type: u8, params: FecProtectionParams) -> Self {
        UlpFecGenerator {
            red_payload_type,
            ulpfec_payload_type,
            params,
            media_packets: Vec::new(),
            media_ssrc: None,
            last_timestamp: 0,
            complete_frames: 0,
        }
    }

    pub fn set_protection_params(&mut self, params: FecProtectionParams) {
        self.params = params;
    }

    pub fn red_payload_type(&self) -> u8 {
        self.red_payload_type
    }

    pub fn ulpfec_payload_type(&self) -> u8 {
        self.ulpfec_payload_type
    }

    /// Adds a sequenced media packet (pre-RED form) to the protection
    /// window and returns its RED-wrapped wire form.
    pub fn protect_media_packet(&mut self, packet: &RtpPacket) -> RtpPacket {
        if self.media_packets.len() < MAX_MEDIA_PACKETS_SHORT_MASK {
            self.media_packets
                .push((packet.sequence_number(), packet.build().into_vec()));
        } else {
            debug!("fec window full, packet {} unprotected", packet.sequence_number());
        }
        self.media_ssrc = Some(packet.ssrc());
        self.last_timestamp = packet.timestamp();
        if packet.marker() {
            self.complete_frames += 1;
        }
        red_wrap(packet, self.red_payload_type)
    }

    /// Emits RED-wrapped FEC packets once enough frames accumulated, and
    /// resets the window. Sequence numbers are unassigned.
    pub fn poll_fec_packets(&mut self) -> Vec<RtpPacketToSend> {
        if self.media_packets.is_empty()
            || (self.complete_frames < self.params.max_fec_frames
                && self.media_packets.len() < MAX_MEDIA_PACKETS_SHORT_MASK)
        {
            return Vec::new();
        }

        let num_media = self.media_packets.len();
        let num_fec = (num_media * self.params.fec_rate as usize + 128) / 256;
        let num_fec = if self.params.fec_rate > 0 {
            num_fec.max(1).min(num_media)
        } else {
            0
        };

        let mut fec_packets = Vec::with_capacity(num_fec);
        for i in 0..num_fec {
            // Row-interleaved masks: FEC packet i protects every
            // num_fec-th media packet starting at i.
            let protected: Vec<&(u16, Vec<u8>)> = self
                .media_packets
                .iter()
                .skip(i)
                .step_by(num_fec)
                .collect();
            if let Some(packet) = self.build_fec_packet(&protected) {
                fec_packets.push(packet);
            }
        }

        self.media_packets.clear();
        self.complete_frames = 0;
        fec_packets
    }

    fn build_fec_packet(&self, protected: &[&(u16, Vec<u8>)]) -> Option<RtpPacketToSend> {
        let ssrc = self.media_ssrc?;
        // Packets enter the window in send order, so the first protected
        // one carries the lowest sequence number.
        let sn_base = protected.first()?.0;

        let mut recovery = FecRecovery::default();
        let mut mask: u64 = 0;
        let mut max_offset = 0u16;
        for (seq, wire) in protected {
            let offset = seq.wrapping_sub(sn_base);
            debug_assert!((offset as usize) < super::MAX_MEDIA_PACKETS);
            mask |= 1u64 << (47 - offset);
            max_offset = max_offset.max(offset);
            recovery.xor_packet(wire);
        }
        let long_mask = max_offset as usize >= MAX_MEDIA_PACKETS_SHORT_MASK;

        let protection_length = recovery.payload.len();
        let level_header = if long_mask {
            FEC_LEVEL_HEADER_SIZE_LONG
        } else {
            FEC_LEVEL_HEADER_SIZE_SHORT
        };
        let mut fec_payload =
            Vec::with_capacity(FEC_HEADER_SIZE + level_header + protection_length);
        // E = 0, L flags the mask width; P, X and CC recovery follow.
        fec_payload.push((recovery.byte0 & 0x3F) | if long_mask { 0x40 } else { 0x00 });
        fec_payload.push(recovery.byte1);
        fec_payload.extend_from_slice(&sn_base.to_be_bytes());
        fec_payload.extend_from_slice(&recovery.timestamp.to_be_bytes());
        fec_payload.extend_from_slice(&recovery.length.to_be_bytes());
        fec_payload.extend_from_slice(&(protection_length as u16).to_be_bytes());
        let mask_bytes = mask.to_be_bytes();
        if long_mask {
            fec_payload.extend_from_slice(&mask_bytes[2..8]);
        } else {
            fec_payload.extend_from_slice(&mask_bytes[2..4]);
        }
        fec_payload.extend_from_slice(&recovery.payload);

        // The protection packet travels RED-wrapped on the media SSRC.
        let mut packet = RtpPacket::new();
        packet.set_ssrc(ssrc);
        packet.set_payload_type(self.red_payload_type);
        packet.set_timestamp(self.last_timestamp);
        let mut red_payload = Vec::with_capacity(RED_HEADER_SIZE + fec_payload.len());
        red_payload.push(self.ulpfec_payload_type & 0x7F);
        red_payload.extend_from_slice(&fec_payload);
        packet.set_payload(&red_payload);

        let mut to_send = RtpPacketToSend::new(packet, RtpPacketType::ForwardErrorCorrection);
        to_send.is_red = true;
        Some(to_send)
    }

    /// Current window occupancy, exposed for stats.
    pub fn pending_media_packets(&self) -> usize {
        self.media_packets.len()
    }
}
