//! Time utilities for event-wallet
//!
//! Wall-clock helpers plus the clock-seeded counter used for request ids
//! and session nonces.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock reads before the Unix epoch.
///
/// # Examples
/// ```
/// use ew_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Get the current Unix timestamp in seconds.
pub fn current_time_secs() -> u64 {
    current_time_millis() / 1000
}

/// Unix seconds `ttl` from now
pub fn expiry_after(ttl: Duration) -> u64 {
    current_time_secs().saturating_add(ttl.as_secs())
}

/// Strictly increasing ids seeded from the wall clock.
///
/// Each call returns `max(now_ms, previous + 1)`, so ids stay unique within
/// a process even when called many times per millisecond, and stay ahead of
/// ids issued by an earlier run of the same process.
#[derive(Debug, Default)]
pub struct MonotonicIds {
    last: AtomicU64,
}

impl MonotonicIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id
    pub fn next_id(&self) -> u64 {
        let now = current_time_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
