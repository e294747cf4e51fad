//! Per-SSRC receive statistics (RFC 3550 appendix A).

use std::collections::HashMap;
use std::sync::Arc;

use rtcp::report_block::ReportBlock;
use rtp::RtpPacketReceived;
use shared::numerics::SeqNumUnwrapper;
use shared::units::Timestamp;
use shared::Clock;

const DEFAULT_MAX_REORDERING_THRESHOLD: i64 = 50;
const DEFAULT_CLOCK_RATE_HZ: u32 = 90_000;

/// Running counters of one inbound stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamDataCounters {
    pub packets: u64,
    pub payload_bytes: u64,
    pub header_bytes: u64,
    pub last_packet_received: Option<Timestamp>,
}

/// Statistics of a single inbound SSRC: extended highest sequence number,
/// cumulative loss, interarrival jitter and report-block generation.
pub struct StreamStatistician {
    ssrc: u32,
    clock: Arc<dyn Clock>,
    clock_rate_hz: u32,
    max_reordering_threshold: i64,

    unwrapper: SeqNumUnwrapper,
    first_seq: Option<i64>,
    received_seq_max: i64,
    cumulative_loss: i64,

    jitter: f64,
    last_arrival: Option<Timestamp>,
    last_rtp_timestamp: u32,

    counters: StreamDataCounters,

    // Since-last-report state.
    last_report_seq_max: i64,
    last_report_cumulative_loss: i64,
    received_since_last_report: u64,
}

impl StreamStatistician {
    pub fn new(ssrc: u32, clock: Arc<dyn Clock>) -> Self {
        StreamStatistician {
            ssrc,
            clock,
            clock_rate_hz: DEFAULT_CLOCK_RATE_HZ,
            max_reordering_threshold: DEFAULT_MAX_REORDERING_THRESHOLD,
            unwrapper: SeqNumUnwrapper::new(),
            first_seq: None,
            received_seq_max: 0,
            cumulative_loss: 0,
            jitter: 0.0,
            last_arrival: None,
            last_rtp_timestamp: 0,
            counters: StreamDataCounters::default(),
            last_report_seq_max: 0,
            last_report_cumulative_loss: 0,
            received_since_last_report: 0,
        }
    }

    pub fn set_clock_rate(&mut self, clock_rate_hz: u32) {
        debug_assert!(clock_rate_hz > 0);
        self.clock_rate_hz = clock_rate_hz;
    }

    pub fn set_max_reordering_threshold(&mut self, threshold: i64) {
        self.max_reordering_threshold = threshold;
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn counters(&self) -> StreamDataCounters {
        self.counters
    }

    pub fn cumulative_loss(&self) -> i64 {
        self.cumulative_loss
    }

    pub fn extended_highest_sequence_number(&self) -> u32 {
        self.received_seq_max as u32
    }

    /// Interarrival jitter in clock-rate ticks.
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    pub fn insert_packet(&mut self, packet: &RtpPacketReceived) {
        let unwrapped = self.unwrapper.unwrap(packet.sequence_number());
        let arrival = packet.arrival_time;

        match self.first_seq {
            None => {
                self.first_seq = Some(unwrapped);
                self.received_seq_max = unwrapped;
                self.last_report_seq_max = unwrapped - 1;
            }
            Some(_) => {
                if unwrapped > self.received_seq_max {
                    // Every skipped number counts as lost until it shows up.
                    self.cumulative_loss += unwrapped - (self.received_seq_max + 1);
                    self.received_seq_max = unwrapped;
                } else if self.received_seq_max - unwrapped <= self.max_reordering_threshold {
                    // Late arrival of a packet counted lost.
                    self.cumulative_loss -= 1;
                }
                // Beyond the threshold: treated as a retransmission, the
                // loss accounting stands.
            }
        }

        self.update_jitter(packet, arrival);

        self.counters.packets += 1;
        self.counters.payload_bytes += packet.payload_size() as u64;
        self.counters.header_bytes += packet.header_size() as u64;
        self.counters.last_packet_received = Some(arrival);
        self.received_since_last_report += 1;

        self.last_arrival = Some(arrival);
        self.last_rtp_timestamp = packet.timestamp();
    }

    /// RFC 3550 eq. A.8: `J += (|D| - J) / 16` with `D` the difference in
    /// relative transit times.
    fn update_jitter(&mut self, packet: &RtpPacketReceived, arrival: Timestamp) {
        let Some(last_arrival) = self.last_arrival else {
            return;
        };
        if packet.timestamp() == self.last_rtp_timestamp {
            // Same frame: no transit information.
            return;
        }
        let arrival_diff_ticks =
            (arrival - last_arrival).us() as f64 * self.clock_rate_hz as f64 / 1e6;
        let rtp_diff_ticks = packet.timestamp().wrapping_sub(self.last_rtp_timestamp) as i32 as f64;
        let d = (arrival_diff_ticks - rtp_diff_ticks).abs();
        self.jitter += (d - self.jitter) / 16.0;
    }

    /// Produces a report block, or `None` when nothing arrived since the
    /// last report. Resets the since-last-report counters.
    pub fn get_report_block(&mut self) -> Option<ReportBlock> {
        self.first_seq?;
        if self.received_since_last_report == 0 {
            return None;
        }

        let expected = self.received_seq_max - self.last_report_seq_max;
        let lost_since = self.cumulative_loss - self.last_report_cumulative_loss;
        let fraction_lost = if expected > 0 && lost_since > 0 {
            ((lost_since * 256) / expected).clamp(0, 255) as u8
        } else {
            0
        };

        let mut block = ReportBlock::new();
        block.set_source_ssrc(self.ssrc);
        block.set_fraction_lost(fraction_lost);
        block.set_cumulative_packet_lost(self.cumulative_loss.max(0));
        block.set_extended_highest_sequence_number(self.received_seq_max as u32);
        block.set_jitter(self.jitter as u32);

        self.last_report_seq_max = self.received_seq_max;
        self.last_report_cumulative_loss = self.cumulative_loss;
        self.received_since_last_report = 0;
        Some(block)
    }

    pub fn last_arrival(&self) -> Option<Timestamp> {
        self.last_arrival
    }
}

/// The per-call collection of statisticians.
pub struct ReceiveStatistics {
    clock: Arc<dyn Clock>,
    streams: HashMap<u32, StreamStatistician>,
}

impl ReceiveStatistics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        ReceiveStatistics {
            clock,
            streams: HashMap::new(),
        }
    }

    pub fn on_rtp_packet(&mut self, packet: &RtpPacketReceived) {
        let clock = Arc::clone(&self.clock);
        self.streams
            .entry(packet.ssrc())
            .or_insert_with(|| StreamStatistician::new(packet.ssrc(), clock))
            .insert_packet(packet);
    }

    pub fn statistician(&self, ssrc: u32) -> Option<&StreamStatistician> {
        self.streams.get(&ssrc)
    }

    pub fn statistician_mut(&mut self, ssrc: u32) -> Option<&mut StreamStatistician> {
        self.streams.get_mut(&ssrc)
    }

    /// Up to `max` report blocks across streams with fresh data.
    pub fn report_blocks(&mut self, max: usize) -> Vec<ReportBlock> {
        self.streams
            .values_mut()
            .filter_map(StreamStatistician::get_report_block)
            .take(max)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::RtpPacket;
    use shared::units::TimeDelta;
    use shared::SimulatedClock;

    const SSRC: u32 = 0x1234;

    fn clock() -> Arc<SimulatedClock> {
        Arc::new(SimulatedClock::new(Timestamp::from_millis(100_000)))
    }

    fn packet(seq: u16, timestamp: u32, arrival: Timestamp) -> RtpPacketReceived {
        let mut rtp = RtpPacket::new();
        rtp.set_ssrc(SSRC);
        rtp.set_sequence_number(seq);
        rtp.set_timestamp(timestamp);
        rtp.set_payload(&[0; 100]);
        RtpPacketReceived::new(rtp, arrival)
    }

    #[test]
    fn test_in_order_stream_has_no_loss() {
        let clock = clock();
        let mut statistician =
            StreamStatistician::new(SSRC, Arc::clone(&clock) as Arc<dyn Clock>);
        for seq in 0..100u16 {
            clock.advance(TimeDelta::from_millis(10));
            statistician.insert_packet(&packet(seq, seq as u32 * 900, clock.now()));
        }
        let block = statistician.get_report_block().unwrap();
        assert_eq!(block.cumulative_packet_lost(), 0);
        assert_eq!(block.extended_highest_sequence_number(), 99);
        assert_eq!(block.fraction_lost(), 0);
        // Nothing new: no block.
        assert!(statistician.get_report_block().is_none());
    }

    #[test]
    fn test_single_loss() {
        let clock = clock();
        let mut statistician =
            StreamStatistician::new(SSRC, Arc::clone(&clock) as Arc<dyn Clock>);
        for seq in 0..100u16 {
            if seq == 50 {
                continue;
            }
            clock.advance(TimeDelta::from_millis(10));
            statistician.insert_packet(&packet(seq, seq as u32 * 900, clock.now()));
        }
        let block = statistician.get_report_block().unwrap();
        assert_eq!(block.cumulative_packet_lost(), 1);
        assert_eq!(block.extended_highest_sequence_number(), 99);
        // 1 lost of 100 expected, in 1/256 units.
        assert_eq!(block.fraction_lost(), 2);
    }

    #[test]
    fn test_late_arrival_repairs_loss() {
        let clock = clock();
        let mut statistician =
            StreamStatistician::new(SSRC, Arc::clone(&clock) as Arc<dyn Clock>);
        for seq in [0u16, 1, 3, 4] {
            clock.advance(TimeDelta::from_millis(10));
            statistician.insert_packet(&packet(seq, seq as u32 * 900, clock.now()));
        }
        assert_eq!(statistician.cumulative_loss(), 1);
        // 2 arrives late, within the reordering threshold.
        statistician.insert_packet(&packet(2, 1800, clock.now()));
        assert_eq!(statistician.cumulative_loss(), 0);
    }

    #[test]
    fn test_sequence_wrap_extends_highest() {
        let clock = clock();
        let mut statistician =
            StreamStatistician::new(SSRC, Arc::clone(&clock) as Arc<dyn Clock>);
        for seq in [0xFFFE_u16, 0xFFFF, 0, 1] {
            clock.advance(TimeDelta::from_millis(10));
            statistician.insert_packet(&packet(seq, 900, clock.now()));
        }
        let block = statistician.get_report_block().unwrap();
        // One cycle, low 16 bits = 1.
        assert_eq!(block.sequence_number_cycles(), 1);
        assert_eq!(block.highest_sequence_number(), 1);
        assert_eq!(block.cumulative_packet_lost(), 0);
    }

    #[test]
    fn test_jitter_converges_for_steady_stream() {
        let clock = clock();
        let mut statistician =
            StreamStatistician::new(SSRC, Arc::clone(&clock) as Arc<dyn Clock>);
        // Perfectly paced stream: 20 ms spacing, 20 ms of rtp ticks.
        for seq in 0..50u16 {
            clock.advance(TimeDelta::from_millis(20));
            statistician.insert_packet(&packet(seq, seq as u32 * 1800, clock.now()));
        }
        assert_eq!(statistician.jitter(), 0);

        // A 10 ms arrival glitch shows up as ~900/16 ticks.
        clock.advance(TimeDelta::from_millis(30));
        statistician.insert_packet(&packet(50, 50 * 1800, clock.now()));
        assert!(statistician.jitter() > 0);
    }

    #[test]
    fn test_collection_routes_by_ssrc() {
        let clock = clock();
        let mut statistics = ReceiveStatistics::new(clock.clone() as Arc<dyn Clock>);
        statistics.on_rtp_packet(&packet(0, 0, clock.now()));
        let mut other = packet(0, 0, clock.now());
        other.packet.set_ssrc(999);
        statistics.on_rtp_packet(&other);
        assert!(statistics.statistician(SSRC).is_some());
        assert!(statistics.statistician(999).is_some());
        assert_eq!(statistics.report_blocks(31).len(), 2);
    }
}
