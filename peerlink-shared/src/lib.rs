#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod buffer;
pub mod clock;
pub mod error;
pub mod numerics;
pub mod task_queue;
pub mod units;

pub use buffer::CopyOnWriteBuffer;
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use task_queue::{RepeatingTaskHandle, TaskQueue};
pub use units::{DataRate, NtpTime, TimeDelta, Timestamp};
