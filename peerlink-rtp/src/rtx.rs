//! RTX retransmission encapsulation (RFC 4588).
//!
//! A retransmitted packet travels under the RTX SSRC and payload type with
//! the original sequence number prefixed to the payload; the receive-side
//! inverse lives with the call layer.

use crate::packet::{RtpPacket, RtpPacketToSend, RtpPacketType};

/// Original-sequence-number prefix length.
pub const RTX_HEADER_SIZE: usize = 2;

/// Wraps `media` for retransmission. The RTX sequence number is left for
/// the sequencer to assign.
pub fn build_rtx_packet(
    media: &RtpPacket,
    rtx_ssrc: u32,
    rtx_payload_type: u8,
) -> RtpPacketToSend {
    let mut packet = media.clone();
    packet.set_ssrc(rtx_ssrc);
    packet.set_payload_type(rtx_payload_type);

    let mut payload = Vec::with_capacity(RTX_HEADER_SIZE + media.payload_size());
    payload.extend_from_slice(&media.sequence_number().to_be_bytes());
    payload.extend_from_slice(media.payload());
    packet.set_payload(&payload);

    let mut to_send = RtpPacketToSend::new(packet, RtpPacketType::Retransmission);
    to_send.retransmitted_sequence_number = Some(media.sequence_number());
    to_send
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_prefixes_original_sequence_number() {
        let mut media = RtpPacket::new();
        media.set_ssrc(725_242);
        media.set_payload_type(98);
        media.set_sequence_number(33);
        media.set_timestamp(0x1020_3040);
        media.set_marker(true);
        media.set_payload(&[0xAA, 0xBB, 0xCC]);

        let rtx = build_rtx_packet(&media, 12_345, 99);
        assert_eq!(rtx.ssrc(), 12_345);
        assert_eq!(rtx.payload_type(), 99);
        assert_eq!(rtx.timestamp(), 0x1020_3040);
        assert!(rtx.marker());
        assert_eq!(rtx.payload(), &[0, 33, 0xAA, 0xBB, 0xCC]);
        assert_eq!(rtx.retransmitted_sequence_number, Some(33));
        assert_eq!(rtx.packet_type, RtpPacketType::Retransmission);
    }
}
