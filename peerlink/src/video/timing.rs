//! Render-time computation for decoded frames.

use std::sync::Arc;

use shared::units::{TimeDelta, Timestamp};
use shared::Clock;

use super::timestamp_extrapolator::TimestampExtrapolator;

const DEFAULT_RENDER_DELAY: TimeDelta = TimeDelta::from_millis(10);

/// The render-timing oracle of one receive stream: capture-time
/// extrapolation plus the delays the pipeline needs downstream.
pub struct Timing {
    clock: Arc<dyn Clock>,
    extrapolator: TimestampExtrapolator,
    jitter_delay: TimeDelta,
    decode_delay: TimeDelta,
    render_delay: TimeDelta,
    min_playout_delay: TimeDelta,
    current_delay: TimeDelta,
}

impl Timing {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let start = clock.now();
        Timing {
            clock,
            extrapolator: TimestampExtrapolator::new(start),
            jitter_delay: TimeDelta::ZERO,
            decode_delay: TimeDelta::from_millis(10),
            render_delay: DEFAULT_RENDER_DELAY,
            min_playout_delay: TimeDelta::ZERO,
            current_delay: TimeDelta::ZERO,
        }
    }

    pub fn reset(&mut self) {
        let now = self.clock.now();
        self.extrapolator.reset(now);
        self.current_delay = TimeDelta::ZERO;
    }

    /// Feed every arriving timestamp so the extrapolator tracks the remote
    /// clock.
    pub fn incoming_timestamp(&mut self, rtp_timestamp: u32, arrival: Timestamp) {
        self.extrapolator.update(arrival, rtp_timestamp);
    }

    pub fn set_jitter_delay(&mut self, delay: TimeDelta) {
        self.jitter_delay = delay;
    }

    pub fn set_min_playout_delay(&mut self, delay: TimeDelta) {
        self.min_playout_delay = delay;
    }

    pub fn set_decode_delay(&mut self, delay: TimeDelta) {
        self.decode_delay = delay;
    }

    /// Moves the enforced delay towards the target without jumping.
    pub fn update_current_delay(&mut self) {
        let target = self.target_delay();
        if self.current_delay.is_zero() {
            self.current_delay = target;
        } else {
            // Step at most 100 ms per update towards the target.
            let step = (target - self.current_delay)
                .clamp(TimeDelta::from_millis(-100), TimeDelta::from_millis(100));
            self.current_delay += step;
        }
    }

    pub fn target_delay(&self) -> TimeDelta {
        (self.jitter_delay + self.decode_delay + self.render_delay)
            .max(self.min_playout_delay)
    }

    pub fn current_delay(&self) -> TimeDelta {
        self.current_delay
    }

    /// Local time at which a frame with `rtp_timestamp` should render.
    pub fn render_time(&self, rtp_timestamp: u32, now: Timestamp) -> Timestamp {
        let estimated_capture = self
            .extrapolator
            .extrapolate_local_time(rtp_timestamp)
            .unwrap_or(now);
        let delay = self.current_delay.max(self.min_playout_delay);
        estimated_capture + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::SimulatedClock;

    #[test]
    fn test_render_time_adds_current_delay() {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(1000)));
        let mut timing = Timing::new(Arc::clone(&clock) as Arc<dyn Clock>);
        timing.incoming_timestamp(90_000, clock.now());
        timing.set_jitter_delay(TimeDelta::from_millis(50));
        timing.update_current_delay();

        let render = timing.render_time(90_000, clock.now());
        let expected = Timestamp::from_millis(1000) + timing.target_delay();
        assert_eq!(render, expected);
    }

    #[test]
    fn test_target_delay_respects_minimum() {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(0)));
        let mut timing = Timing::new(clock as Arc<dyn Clock>);
        timing.set_min_playout_delay(TimeDelta::from_millis(400));
        assert_eq!(timing.target_delay(), TimeDelta::from_millis(400));
    }

    #[test]
    fn test_current_delay_moves_gradually() {
        let clock = Arc::new(SimulatedClock::new(Timestamp::from_millis(0)));
        let mut timing = Timing::new(clock as Arc<dyn Clock>);
        timing.set_jitter_delay(TimeDelta::from_millis(30));
        timing.update_current_delay();
        let first = timing.current_delay();
        timing.set_jitter_delay(TimeDelta::from_millis(500));
        timing.update_current_delay();
        // One step of at most 100 ms, not a jump to the full target.
        assert_eq!(timing.current_delay(), first + TimeDelta::from_millis(100));
    }
}
