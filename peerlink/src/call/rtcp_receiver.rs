//! RTCP receive side: RTT tracking, remote report bookkeeping and
//! observer dispatch.

use std::sync::{Arc, Mutex};

use log::debug;

use rtcp::report_block::ReportBlock;
use rtcp::tmmbr::TmmbItem;
use rtcp::RtcpPacket;
use shared::units::{NtpTime, TimeDelta, Timestamp};
use shared::Clock;

/// Callbacks into the owner of the stream. Multiplexing across events is
/// the observer's business.
pub trait RtcpObserver: Send {
    fn on_nack_received(&mut self, _sequence_numbers: Vec<u16>) {}
    /// PLI or FIR asked for a refresh.
    fn on_keyframe_request(&mut self) {}
    fn on_report_blocks(&mut self, _blocks: &[ReportBlock]) {}
    fn on_tmmbn(&mut self, _items: Vec<TmmbItem>) {}
    fn on_remb(&mut self, _bitrate_bps: u64) {}
}

/// Round-trip-time statistics with an exponentially weighted average.
#[derive(Debug, Default, Clone, Copy)]
pub struct RttStats {
    pub last: TimeDelta,
    pub avg: TimeDelta,
    pub min: TimeDelta,
    pub max: TimeDelta,
    samples: u32,
}

impl RttStats {
    fn add(&mut self, rtt: TimeDelta) {
        self.last = rtt;
        if self.samples == 0 {
            self.avg = rtt;
            self.min = rtt;
            self.max = rtt;
        } else {
            // EWMA with 1/8 weight on the new sample.
            self.avg = self.avg + (rtt - self.avg) / 8;
            self.min = self.min.min(rtt);
            self.max = self.max.max(rtt);
        }
        self.samples += 1;
    }
}

/// The remote SR snapshot needed for the DLRR/LSR echo.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSenderReport {
    pub ntp: NtpTime,
    pub rtp_timestamp: u32,
    pub arrival: Timestamp,
}

/// Parses delivered compounds and maintains per-stream remote state.
pub struct RtcpReceiver {
    clock: Arc<dyn Clock>,
    local_media_ssrc: u32,
    remote_ssrc: u32,
    observer: Arc<Mutex<dyn RtcpObserver>>,

    rtt: Option<RttStats>,
    remote_sr: Option<RemoteSenderReport>,
    last_report_blocks: Vec<ReportBlock>,
}

impl RtcpReceiver {
    pub fn new(
        clock: Arc<dyn Clock>,
        local_media_ssrc: u32,
        remote_ssrc: u32,
        observer: Arc<Mutex<dyn RtcpObserver>>,
    ) -> Self {
        RtcpReceiver {
            clock,
            local_media_ssrc,
            remote_ssrc,
            observer,
            rtt: None,
            remote_sr: None,
            last_report_blocks: Vec::new(),
        }
    }

    pub fn rtt(&self) -> Option<RttStats> {
        self.rtt
    }

    /// Last remote SR (NTP + RTP timestamp) with its arrival time,
    /// the pair a sender needs for the LSR/DLSR echo.
    pub fn remote_sender_report(&self) -> Option<RemoteSenderReport> {
        self.remote_sr
    }

    /// Remote NTP of the last SR together with our arrival NTP.
    pub fn ntp(&self) -> Option<(NtpTime, NtpTime)> {
        self.remote_sr
            .map(|sr| (sr.ntp, NtpTime::from_timestamp(sr.arrival)))
    }

    pub fn last_report_blocks(&self) -> &[ReportBlock] {
        &self.last_report_blocks
    }

    /// Processes every packet of a parsed compound.
    pub fn incoming_packets(&mut self, packets: &[RtcpPacket]) {
        let now = self.clock.now();
        for packet in packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    if sr.sender_ssrc == self.remote_ssrc {
                        self.remote_sr = Some(RemoteSenderReport {
                            ntp: sr.ntp_timestamp,
                            rtp_timestamp: sr.rtp_timestamp,
                            arrival: now,
                        });
                    }
                    self.handle_report_blocks(&sr.report_blocks, now);
                }
                RtcpPacket::ReceiverReport(rr) => {
                    self.handle_report_blocks(&rr.report_blocks, now);
                }
                RtcpPacket::Nack(nack) => {
                    if nack.media_ssrc == self.local_media_ssrc {
                        self.observer
                            .lock()
                            .unwrap()
                            .on_nack_received(nack.sequence_numbers());
                    }
                }
                RtcpPacket::Pli(pli) => {
                    if pli.media_ssrc == self.local_media_ssrc {
                        self.observer.lock().unwrap().on_keyframe_request();
                    }
                }
                RtcpPacket::Fir(fir) => {
                    if fir.entries.iter().any(|e| e.ssrc == self.local_media_ssrc) {
                        self.observer.lock().unwrap().on_keyframe_request();
                    }
                }
                RtcpPacket::Tmmbn(tmmbn) => {
                    self.observer
                        .lock()
                        .unwrap()
                        .on_tmmbn(tmmbn.items.clone());
                }
                RtcpPacket::Remb(remb) => {
                    self.observer.lock().unwrap().on_remb(remb.bitrate_bps);
                }
                RtcpPacket::Bye(bye) => {
                    debug!("bye from {:?}", bye.ssrcs);
                }
                _ => {}
            }
        }
    }

    fn handle_report_blocks(&mut self, blocks: &[ReportBlock], now: Timestamp) {
        if blocks.is_empty() {
            return;
        }
        for block in blocks {
            if block.source_ssrc() != self.local_media_ssrc {
                continue;
            }
            // RFC 3550 §6.4.1: RTT = now - LSR - DLSR, all in compact NTP
            // (1/65536 s) units.
            if block.last_sr_ntp_timestamp() != 0 {
                let now_compact = NtpTime::from_timestamp(now).compact() as i64;
                let rtt_compact = now_compact
                    - block.last_sr_ntp_timestamp() as i64
                    - block.delay_since_last_sr() as i64;
                if rtt_compact >= 0 {
                    let rtt = TimeDelta::from_micros(rtt_compact * 1_000_000 / 65_536);
                    self.rtt.get_or_insert_with(RttStats::default).add(rtt);
                }
            }
        }
        self.last_report_blocks = blocks.to_vec();
        self.observer.lock().unwrap().on_report_blocks(blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcp::fir::Fir;
    use rtcp::nack::Nack;
    use rtcp::pli::Pli;
    use rtcp::receiver_report::ReceiverReport;
    use rtcp::sender_report::SenderReport;
    use shared::SimulatedClock;

    const LOCAL_SSRC: u32 = 0x1111;
    const REMOTE_SSRC: u32 = 0x2222;

    #[derive(Default)]
    struct Events {
        nacks: Vec<Vec<u16>>,
        keyframe_requests: usize,
        report_block_batches: usize,
        remb: Option<u64>,
    }

    impl RtcpObserver for Events {
        fn on_nack_received(&mut self, seqs: Vec<u16>) {
            self.nacks.push(seqs);
        }

        fn on_keyframe_request(&mut self) {
            self.keyframe_requests += 1;
        }

        fn on_report_blocks(&mut self, _blocks: &[ReportBlock]) {
            self.report_block_batches += 1;
        }

        fn on_remb(&mut self, bitrate_bps: u64) {
            self.remb = Some(bitrate_bps);
        }
    }

    fn receiver() -> (Arc<SimulatedClock>, Arc<Mutex<Events>>, RtcpReceiver) {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_seconds(20_000)));
        let events = Arc::new(Mutex::new(Events::default()));
        let receiver = RtcpReceiver::new(
            Arc::clone(&clock) as Arc<dyn Clock>,
            LOCAL_SSRC,
            REMOTE_SSRC,
            Arc::clone(&events) as Arc<Mutex<dyn RtcpObserver>>,
        );
        (clock, events, receiver)
    }

    #[test]
    fn test_remote_sr_is_remembered() {
        let (clock, _events, mut receiver) = receiver();
        let sr = SenderReport {
            sender_ssrc: REMOTE_SSRC,
            ntp_timestamp: NtpTime::new(100, 200),
            rtp_timestamp: 90_000,
            sender_packet_count: 5,
            sender_octet_count: 500,
            report_blocks: Vec::new(),
        };
        receiver.incoming_packets(&[RtcpPacket::SenderReport(sr)]);
        let remote = receiver.remote_sender_report().unwrap();
        assert_eq!(remote.ntp, NtpTime::new(100, 200));
        assert_eq!(remote.rtp_timestamp, 90_000);
        assert_eq!(remote.arrival, clock.now());
        let (remote_ntp, arrival_ntp) = receiver.ntp().unwrap();
        assert_eq!(remote_ntp, NtpTime::new(100, 200));
        assert_eq!(arrival_ntp, NtpTime::from_timestamp(clock.now()));
    }

    #[test]
    fn test_rtt_from_report_block() {
        let (clock, _events, mut receiver) = receiver();
        // Pretend we sent an SR at `now`; the peer echoes it with a DLSR of
        // 100 ms and the report arrives 350 ms later: RTT = 250 ms.
        let sent_ntp = NtpTime::from_timestamp(clock.now());
        clock.advance(TimeDelta::from_millis(350));

        let mut block = ReportBlock::new();
        block.set_source_ssrc(LOCAL_SSRC);
        block.set_last_sr_ntp_timestamp(sent_ntp.compact());
        block.set_delay_since_last_sr(65_536 / 10);
        let mut rr = ReceiverReport::new(REMOTE_SSRC);
        rr.add_report_block(block).unwrap();
        receiver.incoming_packets(&[RtcpPacket::ReceiverReport(rr)]);

        let rtt = receiver.rtt().unwrap();
        assert!((rtt.last.ms() - 250).abs() <= 1, "rtt {}", rtt.last);
        assert_eq!(rtt.avg, rtt.last);
        assert_eq!(rtt.min, rtt.last);
    }

    #[test]
    fn test_rtt_ewma_converges() {
        let (clock, _events, mut receiver) = receiver();
        for delay_ms in [100i64, 200, 200, 200] {
            let sent_ntp = NtpTime::from_timestamp(clock.now());
            clock.advance(TimeDelta::from_millis(delay_ms));
            let mut block = ReportBlock::new();
            block.set_source_ssrc(LOCAL_SSRC);
            block.set_last_sr_ntp_timestamp(sent_ntp.compact());
            let mut rr = ReceiverReport::new(REMOTE_SSRC);
            rr.add_report_block(block).unwrap();
            receiver.incoming_packets(&[RtcpPacket::ReceiverReport(rr)]);
        }
        let rtt = receiver.rtt().unwrap();
        assert!(rtt.min < rtt.max);
        assert!(rtt.avg > rtt.min && rtt.avg < rtt.max);
    }

    #[test]
    fn test_nack_dispatch_filters_by_media_ssrc() {
        let (_clock, events, mut receiver) = receiver();
        receiver.incoming_packets(&[RtcpPacket::Nack(Nack::with_sequence_numbers(
            REMOTE_SSRC,
            LOCAL_SSRC,
            &[5, 6],
        ))]);
        receiver.incoming_packets(&[RtcpPacket::Nack(Nack::with_sequence_numbers(
            REMOTE_SSRC,
            0x9999,
            &[7],
        ))]);
        let events = events.lock().unwrap();
        assert_eq!(events.nacks, vec![vec![5, 6]]);
    }

    #[test]
    fn test_pli_and_fir_request_keyframes() {
        let (_clock, events, mut receiver) = receiver();
        receiver.incoming_packets(&[RtcpPacket::Pli(Pli::new(REMOTE_SSRC, LOCAL_SSRC))]);
        receiver.incoming_packets(&[RtcpPacket::Fir(Fir::new(REMOTE_SSRC, LOCAL_SSRC, 1))]);
        // A FIR for someone else is ignored.
        receiver.incoming_packets(&[RtcpPacket::Fir(Fir::new(REMOTE_SSRC, 0x9999, 2))]);
        assert_eq!(events.lock().unwrap().keyframe_requests, 2);
    }

    #[test]
    fn test_remb_dispatch() {
        let (_clock, events, mut receiver) = receiver();
        receiver.incoming_packets(&[RtcpPacket::Remb(rtcp::remb::Remb::new(
            REMOTE_SSRC,
            500_000,
            vec![LOCAL_SSRC],
        ))]);
        assert_eq!(events.lock().unwrap().remb, Some(500_000));
    }
}
