//! RTX decapsulation (RFC 4588): turns retransmission packets back into
//! the media packets they carry.

use std::collections::BTreeMap;

use log::{debug, warn};

use rtp::rtx::RTX_HEADER_SIZE;
use rtp::RtpPacketReceived;

pub type MediaPacketCallback = Box<dyn FnMut(RtpPacketReceived) + Send>;

/// Receive side of one RTX stream, bound to its media SSRC and the
/// rtx-payload-type → media-payload-type association from the SDP.
pub struct RtxReceiveStream {
    media_ssrc: u32,
    associated_payload_types: BTreeMap<u8, u8>,
    media_sink: Option<MediaPacketCallback>,
}

impl RtxReceiveStream {
    pub fn new(media_ssrc: u32, associated_payload_types: BTreeMap<u8, u8>) -> Self {
        if associated_payload_types.is_empty() {
            warn!("RtxReceiveStream created with empty associated payload type mapping");
        }
        RtxReceiveStream {
            media_ssrc,
            associated_payload_types,
            media_sink: None,
        }
    }

    pub fn on_media_packet(&mut self, callback: MediaPacketCallback) {
        self.media_sink = Some(callback);
    }

    /// Rebuilds the original media packet and emits it through the sink.
    /// Also returns it for callers that route directly.
    pub fn on_rtx_packet(&mut self, rtx_packet: RtpPacketReceived) -> Option<RtpPacketReceived> {
        let payload = rtx_packet.payload();
        if payload.len() < RTX_HEADER_SIZE {
            return None;
        }

        let Some(&media_payload_type) = self
            .associated_payload_types
            .get(&rtx_packet.payload_type())
        else {
            debug!(
                "unknown payload type {} on rtx ssrc {}",
                rtx_packet.payload_type(),
                rtx_packet.ssrc()
            );
            return None;
        };

        let mut media_packet = rtx_packet.clone();
        media_packet.set_ssrc(self.media_ssrc);
        // The original sequence number travels in the first two payload
        // bytes.
        media_packet.set_sequence_number(u16::from_be_bytes([payload[0], payload[1]]));
        media_packet.set_payload_type(media_payload_type);
        media_packet.is_recovered = true;
        media_packet.arrival_time = rtx_packet.arrival_time;
        let media_payload = rtx_packet.payload()[RTX_HEADER_SIZE..].to_vec();
        media_packet.set_payload(&media_payload);

        if let Some(sink) = self.media_sink.as_mut() {
            sink(media_packet.clone());
        }
        Some(media_packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::rtx::build_rtx_packet;
    use rtp::RtpPacket;
    use shared::units::Timestamp;

    const MEDIA_SSRC: u32 = 725_242;
    const RTX_SSRC: u32 = 12_345;
    const MEDIA_PT: u8 = 98;
    const RTX_PT: u8 = 99;

    fn media_packet() -> RtpPacket {
        let mut packet = RtpPacket::new();
        packet.set_ssrc(MEDIA_SSRC);
        packet.set_payload_type(MEDIA_PT);
        packet.set_sequence_number(33);
        packet.set_timestamp(0xABCD_EF01);
        packet.set_marker(true);
        packet.set_payload(&[1, 2, 3, 4, 5]);
        packet
    }

    fn stream() -> RtxReceiveStream {
        RtxReceiveStream::new(MEDIA_SSRC, BTreeMap::from([(RTX_PT, MEDIA_PT)]))
    }

    #[test]
    fn test_rtx_inversion() {
        let media = media_packet();
        let wrapped = build_rtx_packet(&media, RTX_SSRC, RTX_PT);
        let arrival = Timestamp::from_millis(5_000);
        let received = RtpPacketReceived::new(wrapped.packet, arrival);

        let restored = stream().on_rtx_packet(received).unwrap();
        assert_eq!(restored.ssrc(), MEDIA_SSRC);
        assert_eq!(restored.sequence_number(), 33);
        assert_eq!(restored.payload_type(), MEDIA_PT);
        assert_eq!(restored.timestamp(), media.timestamp());
        assert_eq!(restored.marker(), media.marker());
        assert_eq!(restored.payload(), media.payload());
        assert!(restored.is_recovered);
        assert_eq!(restored.arrival_time, arrival);
        assert_eq!(restored.packet, media);
    }

    #[test]
    fn test_short_payload_dropped() {
        let mut rtx = RtpPacket::new();
        rtx.set_ssrc(RTX_SSRC);
        rtx.set_payload_type(RTX_PT);
        rtx.set_payload(&[7]);
        let received = RtpPacketReceived::new(rtx, Timestamp::ZERO);
        assert!(stream().on_rtx_packet(received).is_none());
    }

    #[test]
    fn test_unknown_payload_type_dropped() {
        let media = media_packet();
        let wrapped = build_rtx_packet(&media, RTX_SSRC, 111);
        let received = RtpPacketReceived::new(wrapped.packet, Timestamp::ZERO);
        assert!(stream().on_rtx_packet(received).is_none());
    }

    #[test]
    fn test_sink_receives_restored_packet() {
        let media = media_packet();
        let wrapped = build_rtx_packet(&media, RTX_SSRC, RTX_PT);
        let received = RtpPacketReceived::new(wrapped.packet, Timestamp::ZERO);

        let mut stream = stream();
        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&delivered);
        stream.on_media_packet(Box::new(move |packet| {
            sink.lock().unwrap().push(packet.sequence_number());
        }));
        stream.on_rtx_packet(received);
        assert_eq!(*delivered.lock().unwrap(), vec![33]);
    }
}
