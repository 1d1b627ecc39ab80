//! Time sources shared by the runners and the sampler.
//!
//! Operation timing uses a monotonic clock expressed in nanoseconds since a
//! process-wide origin; interval boundaries use wall-clock milliseconds since
//! the Unix epoch.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the first call to this function in the process.
pub fn monotonic_nanos() -> u64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Milliseconds since the Unix epoch. A clock set before the epoch reads as 0.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Round `ts_ms` down to the closest multiple of `bucket_ms`.
pub fn align_down(ts_ms: u64, bucket_ms: u64) -> u64 {
    if bucket_ms == 0 {
        return ts_ms;
    }
    ts_ms - ts_ms % bucket_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_back() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }

    #[test]
    fn align_down_to_bucket() {
        assert_eq!(align_down(12_345, 1000), 12_000);
        assert_eq!(align_down(12_000, 1000), 12_000);
        assert_eq!(align_down(999, 1000), 0);
        assert_eq!(align_down(42, 0), 42);
    }
}
