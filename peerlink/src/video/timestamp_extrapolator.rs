//! Maps 90 kHz RTP timestamps onto the local clock with a two-state
//! recursive-least-squares fit.

use shared::units::{TimeDelta, Timestamp};

const LAMBDA: f64 = 1.0;
const START_UP_FILTER_DELAY_IN_PACKETS: u32 = 2;
const ALARM_THRESHOLD: f64 = 60e3;
const ACC_DRIFT: f64 = 6600.0; // 90 kHz ticks
const ACC_MAX_ERROR: f64 = 7000.0;
const P11: f64 = 1e10;

/// A new timestamp this far below the previous one, with the previous one
/// in the upper half of the range, counts as a wrap.
const WRAP_SWITCH_THRESHOLD: u32 = 0x8000_0000;

/// Estimates `local_time(rtp_timestamp)` as a linear fit
/// `ticks ≈ w0·t_ms + w1`, refined per packet.
pub struct TimestampExtrapolator {
    start_time: Timestamp,
    prev_time: Timestamp,
    w: [f64; 2],
    p: [[f64; 2]; 2],
    first_unwrapped: i64,

    num_wrap_arounds: i64,
    prev_timestamp: Option<u32>,

    first_after_reset: bool,
    packet_count: u32,
    detector_accumulator_pos: f64,
    detector_accumulator_neg: f64,
}

impl TimestampExtrapolator {
    pub fn new(start_time: Timestamp) -> Self {
        let mut extrapolator = TimestampExtrapolator {
            start_time: Timestamp::ZERO,
            prev_time: Timestamp::ZERO,
            w: [0.0; 2],
            p: [[0.0; 2]; 2],
            first_unwrapped: 0,
            num_wrap_arounds: 0,
            prev_timestamp: None,
            first_after_reset: true,
            packet_count: 0,
            detector_accumulator_pos: 0.0,
            detector_accumulator_neg: 0.0,
        };
        extrapolator.reset(start_time);
        extrapolator
    }

    pub fn reset(&mut self, start_time: Timestamp) {
        self.start_time = start_time;
        self.prev_time = start_time;
        self.first_after_reset = true;
        self.w = [90.0, 0.0];
        self.p = [[1.0, 0.0], [0.0, P11]];
        self.first_unwrapped = 0;
        self.num_wrap_arounds = 0;
        self.prev_timestamp = None;
        self.packet_count = 0;
        self.detector_accumulator_pos = 0.0;
        self.detector_accumulator_neg = 0.0;
    }

    pub fn update(&mut self, now: Timestamp, timestamp: u32) {
        if now - self.prev_time > TimeDelta::from_seconds(10) {
            // More than 10 seconds between packets: restart the fit.
            self.reset(now);
        } else {
            self.prev_time = now;
        }

        let t_ms = (now - self.start_time).ms() as f64;
        let unwrapped = self.unwrap(timestamp) as f64;

        if self.first_after_reset {
            // Pin the intercept so the first sample has zero residual.
            self.w[1] = -self.w[0] * t_ms;
            self.first_unwrapped = unwrapped as i64;
            self.first_after_reset = false;
        }

        let ts_diff = unwrapped - self.first_unwrapped as f64;
        let residual = ts_diff - t_ms * self.w[0] - self.w[1];
        if self.delay_change_detection(residual)
            && self.packet_count >= START_UP_FILTER_DELAY_IN_PACKETS
        {
            // A delay shift, not noise: restart from this sample.
            self.first_after_reset = true;
            return;
        }

        // RLS update with h = [t_ms, 1].
        let ph = [
            self.p[0][0] * t_ms + self.p[0][1],
            self.p[1][0] * t_ms + self.p[1][1],
        ];
        let denom = LAMBDA + t_ms * ph[0] + ph[1];
        let k = [ph[0] / denom, ph[1] / denom];
        self.w[0] += k[0] * residual;
        self.w[1] += k[1] * residual;

        let p00 = (self.p[0][0] - k[0] * (t_ms * self.p[0][0] + self.p[1][0])) / LAMBDA;
        let p01 = (self.p[0][1] - k[0] * (t_ms * self.p[0][1] + self.p[1][1])) / LAMBDA;
        let p10 = (self.p[1][0] - k[1] * (t_ms * self.p[0][0] + self.p[1][0])) / LAMBDA;
        let p11 = (self.p[1][1] - k[1] * (t_ms * self.p[0][1] + self.p[1][1])) / LAMBDA;
        self.p = [[p00, p01], [p10, p11]];

        if self.packet_count < START_UP_FILTER_DELAY_IN_PACKETS {
            self.packet_count += 1;
        }
    }

    /// Estimated local time at which `timestamp` was captured.
    pub fn extrapolate_local_time(&self, timestamp: u32) -> Option<Timestamp> {
        if self.packet_count == 0 {
            return None;
        }
        let unwrapped = self.peek_unwrap(timestamp) as f64;
        let ts_diff = unwrapped - self.first_unwrapped as f64;
        let local_ms = if self.packet_count < START_UP_FILTER_DELAY_IN_PACKETS {
            // Startup: assume the nominal 90 kHz clock.
            ts_diff / 90.0
        } else if self.w[0] < 1e-3 {
            0.0
        } else {
            (ts_diff - self.w[1]) / self.w[0]
        };
        Some(self.start_time + TimeDelta::from_micros((local_ms * 1000.0).round() as i64))
    }

    fn unwrap(&mut self, timestamp: u32) -> i64 {
        self.check_for_wrap_arounds(timestamp);
        timestamp as i64 + self.num_wrap_arounds * (1i64 << 32)
    }

    fn peek_unwrap(&self, timestamp: u32) -> i64 {
        let mut wraps = self.num_wrap_arounds;
        if let Some(prev) = self.prev_timestamp {
            if prev > timestamp
                && prev.wrapping_sub(timestamp) > WRAP_SWITCH_THRESHOLD
                && prev >= WRAP_SWITCH_THRESHOLD
            {
                wraps += 1;
            }
        }
        timestamp as i64 + wraps * (1i64 << 32)
    }

    fn check_for_wrap_arounds(&mut self, timestamp: u32) {
        let Some(prev) = self.prev_timestamp else {
            self.prev_timestamp = Some(timestamp);
            return;
        };
        if prev > timestamp {
            // Far behind the previous one while the previous sat near the
            // top of the range: the counter wrapped forward.
            if prev.wrapping_sub(timestamp) > WRAP_SWITCH_THRESHOLD
                && prev >= WRAP_SWITCH_THRESHOLD
            {
                self.num_wrap_arounds += 1;
            }
        } else if timestamp.wrapping_sub(prev) > WRAP_SWITCH_THRESHOLD
            && timestamp >= WRAP_SWITCH_THRESHOLD
            && self.num_wrap_arounds > 0
        {
            // Out-of-order packet from before a recent wrap.
            self.num_wrap_arounds -= 1;
        }
        self.prev_timestamp = Some(timestamp);
    }

    fn delay_change_detection(&mut self, error: f64) -> bool {
        let error = error.clamp(-ALARM_THRESHOLD, ALARM_THRESHOLD);
        if error > 0.0 {
            self.detector_accumulator_pos =
                (self.detector_accumulator_pos + error - ACC_DRIFT).max(0.0);
        } else {
            self.detector_accumulator_neg =
                (self.detector_accumulator_neg + error + ACC_DRIFT).min(0.0);
        }
        if self.detector_accumulator_pos > ACC_MAX_ERROR
            || self.detector_accumulator_neg < -ACC_MAX_ERROR
        {
            self.detector_accumulator_pos = 0.0;
            self.detector_accumulator_neg = 0.0;
            return true;
        }
        false
    }
}
