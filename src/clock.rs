use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the first call in this process. Never 0 after
/// the first call returns, so 0 can mean "never".
#[inline]
pub fn mono_ns() -> u64 {
    ORIGIN.elapsed().as_nanos() as u64 + 1
}

/// Wall-clock nanoseconds since the Unix epoch, for stamping reports.
pub fn unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
