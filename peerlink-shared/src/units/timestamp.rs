use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use super::TimeDelta;

/// Absolute time with microsecond resolution.
///
/// The epoch is whatever the producing [`Clock`](crate::clock::Clock) uses;
/// only differences between timestamps from the same clock are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    us: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { us: 0 };
    pub const PLUS_INFINITY: Timestamp = Timestamp { us: i64::MAX };
    pub const MINUS_INFINITY: Timestamp = Timestamp { us: i64::MIN };

    pub const fn from_seconds(seconds: i64) -> Self {
        Timestamp {
            us: seconds * 1_000_000,
        }
    }

    pub const fn from_millis(millis: i64) -> Self {
        Timestamp { us: millis * 1000 }
    }

    pub const fn from_micros(us: i64) -> Self {
        Timestamp { us }
    }

    pub const fn us(&self) -> i64 {
        self.us
    }

    pub const fn ms(&self) -> i64 {
        self.us / 1000
    }

    pub const fn seconds(&self) -> i64 {
        self.us / 1_000_000
    }

    pub fn seconds_f64(&self) -> f64 {
        self.us as f64 * 1e-6
    }

    pub const fn is_finite(&self) -> bool {
        self.us != i64::MAX && self.us != i64::MIN
    }

    pub const fn is_plus_infinity(&self) -> bool {
        self.us == i64::MAX
    }

    pub const fn is_minus_infinity(&self) -> bool {
        self.us == i64::MIN
    }

    pub fn max(self, other: Timestamp) -> Timestamp {
        if self > other { self } else { other }
    }

    pub fn min(self, other: Timestamp) -> Timestamp {
        if self < other { self } else { other }
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: TimeDelta) -> Timestamp {
        if !self.is_finite() {
            return self;
        }
        if !rhs.is_finite() {
            return if rhs.is_plus_infinity() {
                Timestamp::PLUS_INFINITY
            } else {
                Timestamp::MINUS_INFINITY
            };
        }
        Timestamp {
            us: self.us + rhs.us(),
        }
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: TimeDelta) -> Timestamp {
        self + (-rhs)
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;

    fn sub(self, rhs: Timestamp) -> TimeDelta {
        if self.is_plus_infinity() || rhs.is_minus_infinity() {
            return TimeDelta::PLUS_INFINITY;
        }
        if self.is_minus_infinity() || rhs.is_plus_infinity() {
            return TimeDelta::MINUS_INFINITY;
        }
        TimeDelta::from_micros(self.us - rhs.us)
    }
}

impl AddAssign<TimeDelta> for Timestamp {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl SubAssign<TimeDelta> for Timestamp {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_plus_infinity() {
            write!(f, "+inf")
        } else if self.is_minus_infinity() {
            write!(f, "-inf")
        } else {
            write!(f, "{} us", self.us)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_is_delta() {
        let a = Timestamp::from_millis(100);
        let b = Timestamp::from_millis(130);
        assert_eq!(b - a, TimeDelta::from_millis(30));
        assert_eq!(a - b, TimeDelta::from_millis(-30));
    }

    #[test]
    fn test_offset_by_delta() {
        let t = Timestamp::from_millis(100) + TimeDelta::from_millis(25);
        assert_eq!(t.ms(), 125);
        assert_eq!((t - TimeDelta::from_millis(25)).ms(), 100);
    }

    #[test]
    fn test_infinity_ordering() {
        assert!(Timestamp::PLUS_INFINITY > Timestamp::from_seconds(1 << 40));
        assert!(Timestamp::MINUS_INFINITY < Timestamp::ZERO);
        assert!((Timestamp::PLUS_INFINITY - Timestamp::ZERO).is_plus_infinity());
    }
}
