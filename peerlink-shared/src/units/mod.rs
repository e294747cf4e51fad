//! Strong-typed time and rate arithmetic.
//!
//! All units are 64-bit integers at micro-level resolution with
//! plus/minus-infinity carried in-band, so the special values survive
//! arithmetic and comparisons without a separate option type.

pub mod data_rate;
pub mod ntp_time;
pub mod time_delta;
pub mod timestamp;

pub use data_rate::DataRate;
pub use ntp_time::NtpTime;
pub use time_delta::TimeDelta;
pub use timestamp::Timestamp;
