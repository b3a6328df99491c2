//! Wall-clock helpers.
//!
//! Query timestamps are milliseconds since the Unix epoch so they survive the
//! dehydrate/hydrate serialization boundary, unlike [`std::time::Instant`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
