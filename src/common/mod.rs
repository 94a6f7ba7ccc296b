pub mod timestamp;

pub use timestamp::{now_ms, Clock, ManualClock, SystemClock, TimestampMs};
