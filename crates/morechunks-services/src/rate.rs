//! Send pacing: how long a connection waits after each delivered chunk.
//!
//! The client asks for a rate, the operator caps it. Whichever is lower
//! wins, and anything below 1/s is treated as 1/s.

use std::time::Duration;

/// `min(requested, max)`, never below 1.
pub fn effective_rate(requested: u32, max: u32) -> u32 {
    requested.min(max).max(1)
}

/// `floor(1000 / effective_rate)` milliseconds.
pub fn send_interval(requested: u32, max: u32) -> Duration {
    Duration::from_millis(1000 / u64::from(effective_rate(requested, max)))
}
