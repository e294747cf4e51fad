//! Routes RTP packets by SSRC (with MID/RRID fallback) and RTCP packets by
//! every SSRC a compound mentions.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use log::debug;

use rtcp::packet::RtcpPacket;
use rtp::extension::{Mid, RepairedRtpStreamId};
use rtp::RtpPacketReceived;

/// Receives demultiplexed RTP packets for one stream.
pub trait RtpPacketSink: Send {
    fn on_rtp_packet(&mut self, packet: RtpPacketReceived);
}

/// Receives the RTCP packets of a compound that mentioned one of the
/// sink's SSRCs.
pub trait RtcpSink: Send {
    fn on_rtcp_packets(&mut self, packets: &[RtcpPacket]);
}

type WeakRtpSink = Weak<Mutex<dyn RtpPacketSink>>;
type WeakRtcpSink = Weak<Mutex<dyn RtcpSink>>;

/// The demultiplexer at the top of the receive path.
///
/// Sinks are weakly referenced; a packet for a dropped sink is silently
/// discarded and counted.
#[derive(Default)]
pub struct RtpDemuxer {
    by_ssrc: HashMap<u32, WeakRtpSink>,
    by_mid: HashMap<String, WeakRtpSink>,
    by_rrid: HashMap<String, WeakRtpSink>,
    rtcp_sinks: Vec<(u32, WeakRtcpSink)>,
    dropped_rtp: u64,
    dropped_rtcp: u64,
}

impl RtpDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink_by_ssrc(&mut self, ssrc: u32, sink: WeakRtpSink) {
        self.by_ssrc.insert(ssrc, sink);
    }

    pub fn add_sink_by_mid(&mut self, mid: &str, sink: WeakRtpSink) {
        self.by_mid.insert(mid.to_string(), sink);
    }

    pub fn add_sink_by_rrid(&mut self, rrid: &str, sink: WeakRtpSink) {
        self.by_rrid.insert(rrid.to_string(), sink);
    }

    pub fn add_rtcp_sink(&mut self, ssrc: u32, sink: WeakRtcpSink) {
        self.rtcp_sinks.push((ssrc, sink));
    }

    pub fn remove_ssrc(&mut self, ssrc: u32) {
        self.by_ssrc.remove(&ssrc);
        self.rtcp_sinks.retain(|(s, _)| *s != ssrc);
    }

    pub fn dropped_rtp(&self) -> u64 {
        self.dropped_rtp
    }

    /// Routes one RTP packet. SSRC wins; unknown SSRCs fall back to the
    /// MID then RRID header extensions, learning the SSRC binding on a
    /// match.
    pub fn on_rtp_packet(&mut self, packet: RtpPacketReceived) -> bool {
        let ssrc = packet.ssrc();
        if let Some(weak) = self.by_ssrc.get(&ssrc) {
            if let Some(sink) = weak.upgrade() {
                sink.lock().unwrap().on_rtp_packet(packet);
                return true;
            }
            self.dropped_rtp += 1;
            debug!("rtp sink for ssrc {ssrc} gone, packet dropped");
            return false;
        }

        let fallback = packet
            .get_extension::<Mid>()
            .and_then(|mid| self.by_mid.get(&mid.0).cloned())
            .or_else(|| {
                packet
                    .get_extension::<RepairedRtpStreamId>()
                    .and_then(|rrid| self.by_rrid.get(&rrid.0).cloned())
            });
        if let Some(weak) = fallback {
            if let Some(sink) = weak.upgrade() {
                // Subsequent packets route by SSRC directly.
                self.by_ssrc.insert(ssrc, Weak::clone(&weak));
                sink.lock().unwrap().on_rtp_packet(packet);
                return true;
            }
        }

        self.dropped_rtp += 1;
        debug!("no rtp sink for ssrc {ssrc}");
        false
    }

    /// Fan-out of a parsed compound: each sink whose SSRC appears anywhere
    /// in the compound receives the whole packet list once.
    pub fn on_rtcp_packets(&mut self, packets: &[RtcpPacket]) {
        let mut mentioned: Vec<u32> = Vec::new();
        for packet in packets {
            collect_ssrcs(packet, &mut mentioned);
        }

        for (ssrc, weak) in &self.rtcp_sinks {
            if !mentioned.contains(ssrc) {
                continue;
            }
            match weak.upgrade() {
                Some(sink) => sink.lock().unwrap().on_rtcp_packets(packets),
                None => {
                    self.dropped_rtcp += 1;
                    debug!("rtcp sink for ssrc {ssrc} gone");
                }
            }
        }
    }
}

fn collect_ssrcs(packet: &RtcpPacket, out: &mut Vec<u32>) {
    match packet {
        RtcpPacket::SenderReport(sr) => {
            out.push(sr.sender_ssrc);
            out.extend(sr.report_blocks.iter().map(|b| b.source_ssrc()));
        }
        RtcpPacket::ReceiverReport(rr) => {
            out.push(rr.sender_ssrc);
            out.extend(rr.report_blocks.iter().map(|b| b.source_ssrc()));
        }
        RtcpPacket::Nack(nack) => {
            out.push(nack.sender_ssrc);
            out.push(nack.media_ssrc);
        }
        RtcpPacket::Pli(pli) => {
            out.push(pli.sender_ssrc);
            out.push(pli.media_ssrc);
        }
        RtcpPacket::Fir(fir) => {
            out.push(fir.sender_ssrc);
            out.extend(fir.entries.iter().map(|e| e.ssrc));
        }
        RtcpPacket::Remb(remb) => {
            out.push(remb.sender_ssrc);
            out.extend(remb.ssrcs.iter().copied());
        }
        RtcpPacket::Tmmbr(tmmbr) => {
            out.push(tmmbr.sender_ssrc);
            out.extend(tmmbr.items.iter().map(|i| i.ssrc));
        }
        RtcpPacket::Tmmbn(tmmbn) => {
            out.push(tmmbn.sender_ssrc);
            out.extend(tmmbn.items.iter().map(|i| i.ssrc));
        }
        RtcpPacket::TransportFeedback(feedback) => {
            out.push(feedback.sender_ssrc);
            out.push(feedback.media_ssrc);
        }
        RtcpPacket::Xr(xr) => {
            out.push(xr.sender_ssrc);
            out.extend(xr.dlrr_items.iter().map(|i| i.ssrc));
        }
        RtcpPacket::Sdes(sdes) => {
            out.extend(sdes.chunks.iter().map(|c| c.ssrc));
        }
        RtcpPacket::Bye(bye) => {
            out.extend(bye.ssrcs.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcp::pli::Pli;
    use rtp::extension::{ExtensionType, HeaderExtensionMap};
    use rtp::RtpPacket;
    use shared::units::Timestamp;
    use std::sync::Arc;

    #[derive(Default)]
    struct Collector {
        rtp: Vec<u32>,
        rtcp_batches: usize,
    }

    impl RtpPacketSink for Collector {
        fn on_rtp_packet(&mut self, packet: RtpPacketReceived) {
            self.rtp.push(packet.ssrc());
        }
    }

    impl RtcpSink for Collector {
        fn on_rtcp_packets(&mut self, _packets: &[RtcpPacket]) {
            self.rtcp_batches += 1;
        }
    }

    fn received(ssrc: u32) -> RtpPacketReceived {
        let mut packet = RtpPacket::new();
        packet.set_ssrc(ssrc);
        RtpPacketReceived::new(packet, Timestamp::from_millis(0))
    }

    #[test]
    fn test_route_by_ssrc() {
        let mut demuxer = RtpDemuxer::new();
        let sink = Arc::new(Mutex::new(Collector::default()));
        let weak: WeakRtpSink = {
            let arc: Arc<Mutex<dyn RtpPacketSink>> = sink.clone();
            Arc::downgrade(&arc)
        };
        demuxer.add_sink_by_ssrc(42, weak);
        assert!(demuxer.on_rtp_packet(received(42)));
        assert!(!demuxer.on_rtp_packet(received(43)));
        assert_eq!(sink.lock().unwrap().rtp, vec![42]);
        assert_eq!(demuxer.dropped_rtp(), 1);
    }

    #[test]
    fn test_mid_fallback_learns_ssrc() {
        let mut demuxer = RtpDemuxer::new();
        let sink = Arc::new(Mutex::new(Collector::default()));
        let weak: WeakRtpSink = {
            let arc: Arc<Mutex<dyn RtpPacketSink>> = sink.clone();
            Arc::downgrade(&arc)
        };
        demuxer.add_sink_by_mid("video0", weak);

        let mut map = HeaderExtensionMap::new();
        map.register(1, ExtensionType::Mid).unwrap();
        let mut packet = RtpPacket::with_extension_map(map);
        packet.set_ssrc(77);
        packet.set_extension(&Mid("video0".into())).unwrap();
        let packet = RtpPacketReceived::new(packet, Timestamp::from_millis(0));

        assert!(demuxer.on_rtp_packet(packet));
        // Second packet without the extension routes by the learned SSRC.
        assert!(demuxer.on_rtp_packet(received(77)));
        assert_eq!(sink.lock().unwrap().rtp, vec![77, 77]);
    }

    #[test]
    fn test_dead_sink_is_silent_drop() {
        let mut demuxer = RtpDemuxer::new();
        let weak: WeakRtpSink = {
            let arc: Arc<Mutex<dyn RtpPacketSink>> =
                Arc::new(Mutex::new(Collector::default()));
            Arc::downgrade(&arc)
            // arc dropped here
        };
        demuxer.add_sink_by_ssrc(9, weak);
        assert!(!demuxer.on_rtp_packet(received(9)));
        assert_eq!(demuxer.dropped_rtp(), 1);
    }

    #[test]
    fn test_rtcp_routing_by_mentioned_ssrcs() {
        let mut demuxer = RtpDemuxer::new();
        let interested = Arc::new(Mutex::new(Collector::default()));
        let bystander = Arc::new(Mutex::new(Collector::default()));
        let weak_a: WeakRtcpSink = {
            let arc: Arc<Mutex<dyn RtcpSink>> = interested.clone();
            Arc::downgrade(&arc)
        };
        let weak_b: WeakRtcpSink = {
            let arc: Arc<Mutex<dyn RtcpSink>> = bystander.clone();
            Arc::downgrade(&arc)
        };
        demuxer.add_rtcp_sink(100, weak_a);
        demuxer.add_rtcp_sink(200, weak_b);

        let packets = vec![RtcpPacket::Pli(Pli::new(1, 100))];
        demuxer.on_rtcp_packets(&packets);
        assert_eq!(interested.lock().unwrap().rtcp_batches, 1);
        assert_eq!(bystander.lock().unwrap().rtcp_batches, 0);
    }
}
