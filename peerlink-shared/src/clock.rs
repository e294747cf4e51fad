use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::units::{NtpTime, TimeDelta, Timestamp};

/// Monotonic wall time source.
///
/// Components take a `Arc<dyn Clock>` so tests can substitute a
/// [`SimulatedClock`] and step time by hand.
pub trait Clock: Send + Sync {
    /// Current time since the unix epoch.
    fn now(&self) -> Timestamp;

    fn now_ms(&self) -> i64 {
        self.now().ms()
    }

    fn now_ntp(&self) -> NtpTime {
        NtpTime::from_timestamp(self.now())
    }
}

/// Clock backed by the OS wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::from_micros(since_epoch.as_micros() as i64)
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct SimulatedClock {
    now_us: AtomicI64,
}

impl SimulatedClock {
    pub fn new(start: Timestamp) -> Self {
        SimulatedClock {
            now_us: AtomicI64::new(start.us()),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        debug_assert!(delta >= TimeDelta::ZERO);
        self.now_us.fetch_add(delta.us(), Ordering::Relaxed);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(TimeDelta::from_millis(ms));
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.now_us.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_advances() {
        let clock = SimulatedClock::new(Timestamp::from_millis(1000));
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(TimeDelta::from_millis(20));
        assert_eq!(clock.now_ms(), 1020);
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_ntp_now_is_past_1970() {
        let clock = SystemClock::new();
        assert!(clock.now_ntp().seconds() as i64 > crate::units::ntp_time::NTP_JAN_1970_SECONDS);
    }
}
