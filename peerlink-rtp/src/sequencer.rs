//! Send-side sequence-number assignment.

use std::sync::Arc;

use shared::Clock;

use crate::packet::{RtpPacketToSend, RtpPacketType};
use crate::VIDEO_TIMESTAMP_TICKS_PER_MS;

// RED header is the first byte of the payload, if present.
const RED_HEADER_SIZE: usize = 1;

/// Snapshot of the send state, used to survive re-negotiation without
/// restarting sequence numbers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtpState {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub capture_time_ms: i64,
    pub last_timestamp_time_ms: i64,
}

/// Owns the media and RTX sequence counters of one outbound stream.
///
/// Not thread safe; confine to the send queue.
pub struct RtpPacketSequencer {
    media_ssrc: u32,
    rtx_ssrc: Option<u32>,
    /// With this set, padding on the media SSRC is refused mid frame (the
    /// last sequenced media packet must have carried the marker bit).
    require_marker_before_media_padding: bool,
    clock: Arc<dyn Clock>,

    media_sequence_number: u16,
    rtx_sequence_number: u16,

    last_payload_type: Option<u8>,
    last_rtp_timestamp: u32,
    last_capture_time_ms: i64,
    last_timestamp_time_ms: i64,
    last_packet_marker_bit: bool,
}

impl RtpPacketSequencer {
    pub fn new(
        media_ssrc: u32,
        rtx_ssrc: Option<u32>,
        require_marker_before_media_padding: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RtpPacketSequencer {
            media_ssrc,
            rtx_ssrc,
            require_marker_before_media_padding,
            clock,
            media_sequence_number: 0,
            rtx_sequence_number: 0,
            last_payload_type: None,
            last_rtp_timestamp: 0,
            last_capture_time_ms: 0,
            last_timestamp_time_ms: 0,
            last_packet_marker_bit: false,
        }
    }

    pub fn media_sequence_number(&self) -> u16 {
        self.media_sequence_number
    }

    pub fn set_media_sequence_number(&mut self, sequence_number: u16) {
        self.media_sequence_number = sequence_number;
    }

    pub fn rtx_sequence_number(&self) -> u16 {
        self.rtx_sequence_number
    }

    pub fn set_rtx_sequence_number(&mut self, sequence_number: u16) {
        self.rtx_sequence_number = sequence_number;
    }

    /// Assigns the next sequence number, and for non-RTX padding also the
    /// timestamp and payload type. Returns false without consuming a number
    /// when the packet cannot be sequenced in the current state.
    pub fn sequence(&mut self, packet: &mut RtpPacketToSend) -> bool {
        if packet.packet_type == RtpPacketType::Padding && !self.populate_padding_fields(packet) {
            return false;
        }

        if packet.ssrc() == self.media_ssrc {
            let seq = self.media_sequence_number;
            self.media_sequence_number = self.media_sequence_number.wrapping_add(1);
            packet.set_sequence_number(seq);
            if packet.packet_type != RtpPacketType::Padding {
                self.update_last_packet_state(packet);
            }
            return true;
        }

        if Some(packet.ssrc()) == self.rtx_ssrc {
            let seq = self.rtx_sequence_number;
            self.rtx_sequence_number = self.rtx_sequence_number.wrapping_add(1);
            packet.set_sequence_number(seq);
            return true;
        }

        false
    }

    pub fn set_rtp_state(&mut self, state: RtpState) {
        self.media_sequence_number = state.sequence_number;
        self.last_rtp_timestamp = state.timestamp;
        self.last_capture_time_ms = state.capture_time_ms;
        self.last_timestamp_time_ms = state.last_timestamp_time_ms;
    }

    pub fn populate_rtp_state(&self, state: &mut RtpState) {
        state.sequence_number = self.media_sequence_number;
        state.timestamp = self.last_rtp_timestamp;
        state.capture_time_ms = self.last_capture_time_ms;
        state.last_timestamp_time_ms = self.last_timestamp_time_ms;
    }

    fn update_last_packet_state(&mut self, packet: &RtpPacketToSend) {
        // The marker bit decides whether padding may follow this packet.
        self.last_packet_marker_bit = packet.marker();
        // The padding payload type mirrors the last media packet; for RED
        // packets that is the encapsulated type in the first payload byte.
        if packet.is_red {
            debug_assert!(packet.payload_size() >= RED_HEADER_SIZE);
            self.last_payload_type = Some(packet.payload()[0] & 0x7F);
        } else {
            self.last_payload_type = Some(packet.payload_type());
        }
        self.last_rtp_timestamp = packet.timestamp();
        self.last_timestamp_time_ms = self.clock.now_ms();
        self.last_capture_time_ms = packet.capture_time_ms;
    }

    fn populate_padding_fields(&self, packet: &mut RtpPacketToSend) -> bool {
        if packet.ssrc() == self.media_ssrc {
            let Some(payload_type) = self.last_payload_type else {
                return false;
            };
            // Without RTX, padding cannot go out in the middle of a frame.
            // Audio markers do not delimit frames, so the rule only applies
            // to video.
            if self.require_marker_before_media_padding && !self.last_packet_marker_bit {
                return false;
            }
            packet.set_timestamp(self.last_rtp_timestamp);
            packet.capture_time_ms = self.last_capture_time_ms;
            packet.set_payload_type(payload_type);
            return true;
        }

        if Some(packet.ssrc()) == self.rtx_ssrc {
            if packet.payload_size() > 0 {
                // Payload padding keeps the fields of the wrapped packet.
                return true;
            }
            packet.set_timestamp(self.last_rtp_timestamp);
            packet.capture_time_ms = self.last_capture_time_ms;

            // Padding-only packets over RTX are independent of media frames
            // and advance the timestamp with wall time.
            let now_ms = self.clock.now_ms();
            if self.last_timestamp_time_ms > 0 {
                let elapsed = now_ms - self.last_timestamp_time_ms;
                let new_timestamp = packet
                    .timestamp()
                    .wrapping_add((elapsed as u32).wrapping_mul(VIDEO_TIMESTAMP_TICKS_PER_MS));
                packet.set_timestamp(new_timestamp);
                if packet.capture_time_ms > 0 {
                    packet.capture_time_ms += elapsed;
                }
            }
            return true;
        }

        false
    }
}
