//! Millisecond clock helpers.
//!
//! The transport keeps a coarse wall-clock in milliseconds: the UDP service
//! advances its `time_now` from here once per tick, and timed waits register
//! deadlines in the same unit.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// A clock set before the epoch yields 0 rather than failing; scheduling
/// comparisons remain monotone enough for tick purposes.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
