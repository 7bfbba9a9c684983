use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Minimum spacing between full sweeps of idle identities.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Sliding-window command throttle keyed by transport identity.
pub struct RateLimiter {
    inner: Mutex<Windows>,
}

struct Windows {
    hits: HashMap<i64, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Windows {
                hits: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Record an attempt if `identity` is under `max_per_window` in the
    /// trailing window. Refused attempts are not recorded.
    pub fn allow(&self, identity: i64, max_per_window: usize) -> bool {
        let now = Instant::now();
        let mut windows = self.lock();

        if now.duration_since(windows.last_sweep) >= SWEEP_INTERVAL {
            windows.sweep(now);
        }

        let hits = windows.hits.entry(identity).or_default();
        prune(hits, now);

        if hits.len() >= max_per_window {
            if hits.is_empty() {
                windows.hits.remove(&identity);
            }
            debug!(identity, max_per_window, "Rate limit hit");
            return false;
        }

        hits.push_back(now);
        true
    }

    /// How many more attempts `identity` may make in the current window.
    pub fn remaining(&self, identity: i64, max_per_window: usize) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let used = match windows.hits.get_mut(&identity) {
            Some(hits) => {
                prune(hits, now);
                hits.len()
            }
            None => 0,
        };
        max_per_window.saturating_sub(used)
    }

    /// Drop identities whose window has emptied. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.lock().sweep(now)
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.lock().hits.len()
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        // The map is a cache; a panic elsewhere never leaves it inconsistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Windows {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.hits.len();
        self.hits.retain(|_, hits| {
            prune(hits, now);
            !hits.is_empty()
        });
        self.last_sweep = now;
        before - self.hits.len()
    }
}

fn prune(hits: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = hits.front() {
        if now.duration_since(*oldest) >= WINDOW {
            hits.pop_front();
        } else {
            break;
        }
    }
}
