//! Send-side egress: statistics, FEC feeding, packet history for RTX and
//! the hand-off to the transport. Non-paced: packets leave immediately.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::debug;

use rtp::fec::UlpFecGenerator;
use rtp::rtx::build_rtx_packet;
use rtp::{RtpPacket, RtpPacketToSend, RtpPacketType};
use shared::units::{DataRate, TimeDelta, Timestamp};
use shared::{Clock, CopyOnWriteBuffer};

const PACKET_HISTORY_CAPACITY: usize = 600;
const BITRATE_WINDOW: TimeDelta = TimeDelta::from_seconds(1);

/// Per-type send counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SendCounters {
    pub media_packets: u64,
    pub retransmitted_packets: u64,
    pub fec_packets: u64,
    pub padding_packets: u64,
    pub total_bytes: u64,
    pub last_send: Option<Timestamp>,
}

pub type SendCallback = Box<dyn FnMut(CopyOnWriteBuffer) + Send>;

/// Bounded store of sent media packets, for answering NACKs.
struct PacketHistory {
    packets: BTreeMap<u16, RtpPacket>,
    order: VecDeque<u16>,
}

impl PacketHistory {
    fn new() -> Self {
        PacketHistory {
            packets: BTreeMap::new(),
            order: VecDeque::new(),
        }
    }

    fn put(&mut self, packet: RtpPacket) {
        let seq = packet.sequence_number();
        if self.packets.insert(seq, packet).is_none() {
            self.order.push_back(seq);
        }
        while self.order.len() > PACKET_HISTORY_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.packets.remove(&old);
            }
        }
    }

    fn get(&self, seq: u16) -> Option<&RtpPacket> {
        self.packets.get(&seq)
    }
}

/// The egress of one outbound RTP stream.
pub struct RtpPacketEgresser {
    clock: Arc<dyn Clock>,
    media_ssrc: u32,
    rtx_ssrc: Option<u32>,
    rtx_payload_type: Option<u8>,
    fec_generator: Option<UlpFecGenerator>,
    send_callback: SendCallback,

    history: PacketHistory,
    counters: SendCounters,
    send_window: VecDeque<(Timestamp, usize)>,
    dropped: u64,
}

impl RtpPacketEgresser {
    pub fn new(
        clock: Arc<dyn Clock>,
        media_ssrc: u32,
        rtx_ssrc: Option<u32>,
        rtx_payload_type: Option<u8>,
        fec_generator: Option<UlpFecGenerator>,
        send_callback: SendCallback,
    ) -> Self {
        RtpPacketEgresser {
            clock,
            media_ssrc,
            rtx_ssrc,
            rtx_payload_type,
            fec_generator,
            send_callback,
            history: PacketHistory::new(),
            counters: SendCounters::default(),
            send_window: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn counters(&self) -> SendCounters {
        self.counters
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped
    }

    /// Sends one sequenced packet. Returns freshly generated FEC packets;
    /// the caller loops them through the sequencer and back in here.
    pub fn send_packet(&mut self, packet: RtpPacketToSend) -> Vec<RtpPacketToSend> {
        let now = self.clock.now();
        let mut fec_packets = Vec::new();

        let wire = match packet.packet_type {
            RtpPacketType::Video | RtpPacketType::Audio => {
                self.counters.media_packets += 1;
                if packet.packet_type == RtpPacketType::Video {
                    self.history.put(packet.packet.clone());
                }
                match self.fec_generator.as_mut() {
                    Some(generator) if packet.packet_type == RtpPacketType::Video => {
                        let red = generator.protect_media_packet(&packet.packet);
                        fec_packets = generator.poll_fec_packets();
                        red.build()
                    }
                    _ => packet.build(),
                }
            }
            RtpPacketType::Retransmission => {
                self.counters.retransmitted_packets += 1;
                packet.build()
            }
            RtpPacketType::ForwardErrorCorrection => {
                self.counters.fec_packets += 1;
                packet.build()
            }
            RtpPacketType::Padding => {
                self.counters.padding_packets += 1;
                packet.build()
            }
        };

        self.counters.total_bytes += wire.len() as u64;
        self.counters.last_send = Some(now);
        self.send_window.push_back((now, wire.len()));
        while let Some((at, _)) = self.send_window.front() {
            if now - *at > BITRATE_WINDOW {
                self.send_window.pop_front();
            } else {
                break;
            }
        }

        (self.send_callback)(wire);
        fec_packets
    }

    /// Builds a retransmission for `seq` out of the history: RTX-wrapped
    /// when an RTX stream is negotiated, a plain re-send otherwise.
    pub fn retransmit(&mut self, seq: u16) -> Option<RtpPacketToSend> {
        let media = match self.history.get(seq) {
            Some(packet) => packet,
            None => {
                self.dropped += 1;
                debug!("retransmit of {seq} not in history");
                return None;
            }
        };
        match (self.rtx_ssrc, self.rtx_payload_type) {
            (Some(rtx_ssrc), Some(rtx_payload_type)) => {
                Some(build_rtx_packet(media, rtx_ssrc, rtx_payload_type))
            }
            _ => {
                let mut resend = RtpPacketToSend::new(media.clone(), RtpPacketType::Retransmission);
                resend.retransmitted_sequence_number = Some(seq);
                Some(resend)
            }
        }
    }

    /// Send rate over the trailing window.
    pub fn send_bitrate(&self) -> DataRate {
        let bytes: usize = self.send_window.iter().map(|(_, len)| len).sum();
        DataRate::from_bytes_per(bytes as i64, BITRATE_WINDOW)
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::fec::FecProtectionParams;
    use shared::SimulatedClock;
    use std::sync::Mutex;

    const SSRC: u32 = 0x2222;
    const RTX_SSRC: u32 = 0x3333;

    fn media(seq: u16, marker: bool) -> RtpPacketToSend {
        let mut packet = RtpPacket::new();
        packet.set_ssrc(SSRC);
        packet.set_payload_type(102);
        packet.set_sequence_number(seq);
        packet.set_timestamp(seq as u32 * 3000);
        packet.set_marker(marker);
        packet.set_payload(&[seq as u8; 100]);
        RtpPacketToSend::new(packet, RtpPacketType::Video)
    }

    fn egresser(fec: Option<UlpFecGenerator>) -> (RtpPacketEgresser, Arc<Mutex<Vec<Vec<u8>>>>) {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(50_000)));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let egresser = RtpPacketEgresser::new(
            clock as Arc<dyn Clock>,
            SSRC,
            Some(RTX_SSRC),
            Some(99),
            fec,
            Box::new(move |wire| sink.lock().unwrap().push(wire.data().to_vec())),
        );
        (egresser, sent)
    }

    #[test]
    fn test_media_packets_flow_to_callback() {
        let (mut egresser, sent) = egresser(None);
        assert!(egresser.send_packet(media(1, true)).is_empty());
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(egresser.counters().media_packets, 1);
        assert!(egresser.counters().total_bytes > 0);
        assert!(egresser.send_bitrate().bps() > 0);
    }

    #[test]
    fn test_fec_generation_returns_packets_for_sequencing() {
        let generator = UlpFecGenerator::new(
            116,
            117,
            FecProtectionParams {
                fec_rate: 51,
                max_fec_frames: 1,
            },
        );
        let (mut egresser, sent) = egresser(Some(generator));
        assert!(egresser.send_packet(media(1, false)).is_empty());
        let fec = egresser.send_packet(media(2, true));
        assert_eq!(fec.len(), 1);
        assert_eq!(fec[0].packet_type, RtpPacketType::ForwardErrorCorrection);
        // The media went out RED-wrapped.
        let wires = sent.lock().unwrap();
        assert_eq!(wires.len(), 2);
        assert_eq!(wires[0][1] & 0x7F, 116);
    }

    #[test]
    fn test_retransmit_wraps_rtx_from_history() {
        let (mut egresser, _sent) = egresser(None);
        egresser.send_packet(media(7, true));
        let rtx = egresser.retransmit(7).unwrap();
        assert_eq!(rtx.ssrc(), RTX_SSRC);
        assert_eq!(rtx.payload_type(), 99);
        assert_eq!(rtx.retransmitted_sequence_number, Some(7));
        assert_eq!(&rtx.payload()[..2], &7u16.to_be_bytes());

        assert!(egresser.retransmit(8).is_none());
        assert_eq!(egresser.dropped_packets(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let (mut egresser, _sent) = egresser(None);
        for seq in 0..(PACKET_HISTORY_CAPACITY as u16 + 100) {
            egresser.send_packet(media(seq, true));
        }
        assert!(egresser.retransmit(0).is_none());
        assert!(egresser.retransmit(PACKET_HISTORY_CAPACITY as u16 + 50).is_some());
    }
}
