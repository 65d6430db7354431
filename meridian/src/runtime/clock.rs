//! Wall-clock time shared between processes.
//!
//! Durations inside one process use [`minstant::Instant`]; values written to
//! shared memory or onto the wire need a clock every process agrees on.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
#[must_use]
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
