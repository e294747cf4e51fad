//! Send side of one video track: packetization, sequencing, egress and
//! NACK answering.

use std::sync::Arc;

use log::{debug, warn};

use rtp::fec::{FecProtectionParams, UlpFecGenerator};
use rtp::packetizer::h264::{H264Packetizer, PacketizationMode};
use rtp::packetizer::PayloadSizeLimits;
use rtp::sequencer::RtpPacketSequencer;
use rtp::{RtpPacket, RtpPacketToSend, RtpPacketType};
use shared::Clock;

use crate::call::rtp_egress::{RtpPacketEgresser, SendCallback, SendCounters};
use crate::media::track::MediaTrackConfiguration;

/// Outcome of sending one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentFrame {
    pub packets: usize,
    pub fec_packets: usize,
}

/// Packetizes encoded video frames onto the wire path.
pub struct VideoSendStream {
    config: MediaTrackConfiguration,
    sequencer: RtpPacketSequencer,
    egresser: RtpPacketEgresser,
    limits: PayloadSizeLimits,
}

impl VideoSendStream {
    pub fn new(
        config: MediaTrackConfiguration,
        clock: Arc<dyn Clock>,
        send_callback: SendCallback,
    ) -> Self {
        let fec_generator = match (config.red_payload_type, config.ulpfec_payload_type) {
            (Some(red), Some(ulpfec)) => Some(UlpFecGenerator::new(
                red,
                ulpfec,
                FecProtectionParams::default(),
            )),
            _ => None,
        };
        let sequencer = RtpPacketSequencer::new(
            config.media_ssrc,
            config.rtx_ssrc,
            /* require_marker_before_media_padding */ true,
            Arc::clone(&clock),
        );
        let egresser = RtpPacketEgresser::new(
            clock,
            config.media_ssrc,
            config.rtx_ssrc,
            config.rtx_payload_type,
            fec_generator,
            send_callback,
        );
        VideoSendStream {
            limits: PayloadSizeLimits::default(),
            config,
            sequencer,
            egresser,
        }
    }

    pub fn counters(&self) -> SendCounters {
        self.egresser.counters()
    }

    pub fn ssrc(&self) -> u32 {
        self.config.media_ssrc
    }

    /// Packetizes and sends one encoded frame (Annex B bitstream at a
    /// 90 kHz RTP timestamp). Returns what went out.
    pub fn send_frame(
        &mut self,
        bitstream: &[u8],
        rtp_timestamp: u32,
        capture_time_ms: i64,
    ) -> Option<SentFrame> {
        let mut packetizer = match H264Packetizer::new(
            bitstream,
            self.limits,
            PacketizationMode::NonInterleaved,
        ) {
            Ok(packetizer) => packetizer,
            Err(e) => {
                warn!("frame refused by packetizer: {e}");
                return None;
            }
        };

        let mut packets = 0;
        let mut fec_packets = 0;
        loop {
            let mut packet = RtpPacket::new();
            if !packetizer.next_packet(&mut packet) {
                break;
            }
            packet.set_ssrc(self.config.media_ssrc);
            packet.set_payload_type(self.config.payload_type);
            packet.set_timestamp(rtp_timestamp);
            let mut to_send = RtpPacketToSend::new(packet, RtpPacketType::Video);
            to_send.capture_time_ms = capture_time_ms;
            if !self.sequencer.sequence(&mut to_send) {
                debug!("sequencer refused media packet");
                continue;
            }
            packets += 1;
            fec_packets += self.dispatch(to_send);
        }
        Some(SentFrame {
            packets,
            fec_packets,
        })
    }

    /// Answers a remote NACK by retransmitting from the history.
    pub fn on_nack_received(&mut self, sequence_numbers: &[u16]) {
        for &seq in sequence_numbers {
            let Some(mut packet) = self.egresser.retransmit(seq) else {
                continue;
            };
            if !self.sequencer.sequence(&mut packet) {
                debug!("sequencer refused retransmission of {seq}");
                continue;
            }
            self.egresser.send_packet(packet);
        }
    }

    /// Sends FEC packets back through the sequencer and egress; returns
    /// how many went out.
    fn dispatch(&mut self, packet: RtpPacketToSend) -> usize {
        let mut sent = 0;
        let fec = self.egresser.send_packet(packet);
        for mut fec_packet in fec {
            if self.sequencer.sequence(&mut fec_packet) {
                sent += 1;
                // FEC packets never generate further FEC.
                let nested = self.egresser.send_packet(fec_packet);
                debug_assert!(nested.is_empty());
            }
        }
        sent
    }
}
