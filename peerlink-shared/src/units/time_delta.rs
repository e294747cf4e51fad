use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::time::Duration;

/// Relative time with microsecond resolution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeDelta {
    us: i64,
}

impl TimeDelta {
    pub const ZERO: TimeDelta = TimeDelta { us: 0 };
    pub const PLUS_INFINITY: TimeDelta = TimeDelta { us: i64::MAX };
    pub const MINUS_INFINITY: TimeDelta = TimeDelta { us: i64::MIN };

    pub const fn from_seconds(seconds: i64) -> Self {
        TimeDelta {
            us: seconds * 1_000_000,
        }
    }

    pub const fn from_millis(millis: i64) -> Self {
        TimeDelta { us: millis * 1000 }
    }

    pub const fn from_micros(us: i64) -> Self {
        TimeDelta { us }
    }

    pub fn from_seconds_f64(seconds: f64) -> Self {
        TimeDelta {
            us: (seconds * 1e6).round() as i64,
        }
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

    pub fn ms_f64(&self) -> f64 {
        self.us as f64 * 1e-3
    }

    pub const fn is_zero(&self) -> bool {
        self.us == 0
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

    pub fn max(self, other: TimeDelta) -> TimeDelta {
        if self > other { self } else { other }
    }

    pub fn min(self, other: TimeDelta) -> TimeDelta {
        if self < other { self } else { other }
    }

    pub fn clamp(self, lo: TimeDelta, hi: TimeDelta) -> TimeDelta {
        self.max(lo).min(hi)
    }

    pub fn abs(self) -> TimeDelta {
        if self.us < 0 && self.is_finite() {
            TimeDelta { us: -self.us }
        } else {
            self
        }
    }

    /// Converts to a `std::time::Duration`, `None` for non-positive or
    /// infinite deltas.
    pub fn to_duration(self) -> Option<Duration> {
        if self.us <= 0 || !self.is_finite() {
            return None;
        }
        Some(Duration::from_micros(self.us as u64))
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;

    fn add(self, rhs: TimeDelta) -> TimeDelta {
        if !self.is_finite() {
            debug_assert!(rhs.is_finite() || rhs == self, "inf + -inf is undefined");
            return self;
        }
        if !rhs.is_finite() {
            return rhs;
        }
        TimeDelta {
            us: self.us + rhs.us,
        }
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        if !self.is_finite() {
            return self;
        }
        if rhs.is_plus_infinity() {
            return TimeDelta::MINUS_INFINITY;
        }
        if rhs.is_minus_infinity() {
            return TimeDelta::PLUS_INFINITY;
        }
        TimeDelta {
            us: self.us - rhs.us,
        }
    }
}

impl AddAssign for TimeDelta {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl SubAssign for TimeDelta {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl Neg for TimeDelta {
    type Output = TimeDelta;

    fn neg(self) -> TimeDelta {
        if self.is_plus_infinity() {
            TimeDelta::MINUS_INFINITY
        } else if self.is_minus_infinity() {
            TimeDelta::PLUS_INFINITY
        } else {
            TimeDelta { us: -self.us }
        }
    }
}

impl Mul<i64> for TimeDelta {
    type Output = TimeDelta;

    fn mul(self, rhs: i64) -> TimeDelta {
        if !self.is_finite() {
            return self;
        }
        TimeDelta { us: self.us * rhs }
    }
}

impl Mul<f64> for TimeDelta {
    type Output = TimeDelta;

    fn mul(self, rhs: f64) -> TimeDelta {
        if !self.is_finite() {
            return self;
        }
        TimeDelta {
            us: (self.us as f64 * rhs).round() as i64,
        }
    }
}

impl Div<i64> for TimeDelta {
    type Output = TimeDelta;

    fn div(self, rhs: i64) -> TimeDelta {
        if !self.is_finite() {
            return self;
        }
        TimeDelta { us: self.us / rhs }
    }
}

impl Div for TimeDelta {
    type Output = f64;

    fn div(self, rhs: TimeDelta) -> f64 {
        self.us as f64 / rhs.us as f64
    }
}

impl fmt::Display for TimeDelta {
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
