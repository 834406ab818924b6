//! Per-object retry delays for controller error policies

use crate::error::Error;
use kube::runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(300);

/// A failing object retries at least every `MAX_DELAY`; entries quiet for
/// longer belong to deleted objects
const STALE_AFTER: Duration = Duration::from_secs(2 * 300);

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    last: Instant,
}

/// Exponential backoff keyed by object (`namespace/name`)
///
/// The delay starts at 1s, doubles on each consecutive failure and is capped
/// at 5 minutes. A successful reconcile resets the object's counter, and so
/// does a NotFound error. Counters of objects that stopped failing without
/// a success (deleted while failing) are dropped once stale.
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    failures: Mutex<HashMap<String, Failures>>,
}

#[inline]
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Backoff lock poisoned, recovering");
        poisoned.into_inner()
    })
}

impl ErrorBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay for the next retry of `key`, counting this failure
    pub fn next_delay(&self, key: &str) -> Duration {
        self.next_delay_at(key, Instant::now())
    }

    fn next_delay_at(&self, key: &str, now: Instant) -> Duration {
        let mut failures = safe_lock(&self.failures);
        failures.retain(|_, f| now.saturating_duration_since(f.last) <= STALE_AFTER);

        let entry = failures
            .entry(key.to_string())
            .or_insert(Failures { count: 0, last: now });
        let delay = BASE_DELAY
            .checked_mul(1u32 << entry.count.min(16))
            .map_or(MAX_DELAY, |d| d.min(MAX_DELAY));
        entry.count = entry.count.saturating_add(1);
        entry.last = now;
        delay
    }

    /// Number of objects with a failure streak
    pub fn tracked(&self) -> usize {
        safe_lock(&self.failures).len()
    }

    pub fn reset(&self, key: &str) {
        safe_lock(&self.failures).remove(key);
    }

    /// Requeue action for `error` on `key`.
    ///
    /// Errors with a fixed delay do not advance the exponential counter.
    pub fn action_for(&self, key: &str, error: &Error) -> Action {
        if error.is_not_found() {
            debug!("{} is gone, dropping its backoff", key);
            self.reset(key);
            return Action::await_change();
        }
        let delay = error
            .fixed_requeue()
            .unwrap_or_else(|| self.next_delay(key));
        Action::requeue(delay)
    }
}
