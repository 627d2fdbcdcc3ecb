//! Backoff jitter sources.
//!
//! Jitter only spreads rate-limit retries in time; it never touches candle data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

pub trait JitterSource: Send + Sync + 'static {
    /// A duration in `[min, max]` (inclusive, millisecond resolution).
    fn next_jitter(&self, min: Duration, max: Duration) -> Duration;
}

/// Hashes wall-clock nanos, a process-wide counter and the thread id, so callers
/// woken in the same instant still draw different delays.
#[derive(Debug, Default)]
pub struct ClockHashJitter {
    counter: AtomicU64,
}

impl ClockHashJitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_u64(&self) -> u64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let count = self.counter.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(nanos.to_le_bytes());
        hasher.update(count.to_le_bytes());
        hasher.update(format!("{:?}", std::thread::current().id()).as_bytes());
        let digest = hasher.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }
}

impl JitterSource for ClockHashJitter {
    fn next_jitter(&self, min: Duration, max: Duration) -> Duration {
        let (lo, hi) = ordered_millis(min, max);
        let span = hi - lo + 1;
        Duration::from_millis(lo + self.next_u64() % span)
    }
}

/// Always returns the lower bound; for deterministic tests and tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedJitter;

impl JitterSource for FixedJitter {
    fn next_jitter(&self, min: Duration, max: Duration) -> Duration {
        Duration::from_millis(ordered_millis(min, max).0)
    }
}

fn ordered_millis(min: Duration, max: Duration) -> (u64, u64) {
    let a = min.as_millis().min(u128::from(u64::MAX)) as u64;
    let b = max.as_millis().min(u128::from(u64::MAX)) as u64;
    (a.min(b), a.max(b))
}
