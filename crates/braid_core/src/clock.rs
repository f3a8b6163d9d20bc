//! Process-relative monotonic clock in fractional seconds.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Seconds since the first call in this process. Monotonic; used for rate
/// windows, coalesce timers and queue-age bookkeeping.
pub fn now_seconds() -> f64 {
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_secs_f64()
}
