//! Token-bucket limiter for outbound request weight.
//!
//! `acquire` never fails: when the bucket is empty the caller sleeps for a
//! jittered backoff and retries. The window rolls over either on the periodic
//! refill task or lazily on the first `acquire` after the window has elapsed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::entropy::JitterSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_tokens: u32,
    pub window_ms: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1_200,
            window_ms: 60_000,
            backoff_min_ms: 1_000,
            backoff_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub tokens_remaining: u32,
    pub max_tokens: u32,
    pub requests_in_window: u64,
    pub window_elapsed_ms: u64,
    pub is_limited: bool,
    pub delayed_acquisitions: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    window_started_at: Instant,
    requests_in_window: u64,
    is_limited: bool,
}

pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<BucketState>,
    jitter: Arc<dyn JitterSource>,
    delayed_acquisitions: AtomicU64,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig, jitter: Arc<dyn JitterSource>) -> Self {
        let state = BucketState {
            tokens: cfg.max_tokens,
            window_started_at: Instant::now(),
            requests_in_window: 0,
            is_limited: false,
        };

        Self {
            cfg,
            state: Mutex::new(state),
            jitter,
            delayed_acquisitions: AtomicU64::new(0),
        }
    }

    /// Suspends until `weight` tokens are debited; returns how long the caller waited.
    pub async fn acquire(&self, weight: u32) -> Duration {
        let weight = self.effective_weight(weight);
        let started = Instant::now();
        let mut delayed = false;

        loop {
            if self.try_debit(weight, Instant::now()) {
                let waited = started.elapsed();
                if delayed {
                    self.delayed_acquisitions.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        component = "rate_limiter",
                        event = "rate_limit.acquired_after_wait",
                        weight,
                        waited_ms = waited.as_millis() as u64
                    );
                }
                return waited;
            }

            if !delayed {
                warn!(
                    component = "rate_limiter",
                    event = "rate_limit.exhausted",
                    weight,
                    max_tokens = self.cfg.max_tokens
                );
                delayed = true;
            }

            let backoff = self.jitter.next_jitter(
                Duration::from_millis(self.cfg.backoff_min_ms),
                Duration::from_millis(self.cfg.backoff_max_ms),
            );
            sleep(backoff).await;
        }
    }

    /// Starts a fresh window with a full bucket.
    pub fn refill(&self) {
        let mut state = self
            .state
            .lock()
            .expect("rate limiter lock should not be poisoned");
        self.reset_window(&mut state, Instant::now());
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let state = self
            .state
            .lock()
            .expect("rate limiter lock should not be poisoned");

        RateLimiterSnapshot {
            tokens_remaining: state.tokens,
            max_tokens: self.cfg.max_tokens,
            requests_in_window: state.requests_in_window,
            window_elapsed_ms: state.window_started_at.elapsed().as_millis() as u64,
            is_limited: state.is_limited,
            delayed_acquisitions: self.delayed_acquisitions.load(Ordering::Relaxed),
        }
    }

    /// Refills on a fixed cadence of one window until the handle is aborted.
    pub fn spawn_refill_task(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = Duration::from_millis(self.cfg.window_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.refill();
            }
        })
    }

    fn effective_weight(&self, weight: u32) -> u32 {
        let max = self.cfg.max_tokens.max(1);
        if weight > max {
            warn!(
                component = "rate_limiter",
                event = "rate_limit.weight_clamped",
                requested = weight,
                max_tokens = max
            );
        }
        weight.clamp(1, max)
    }

    fn try_debit(&self, weight: u32, now: Instant) -> bool {
        let mut state = self
            .state
            .lock()
            .expect("rate limiter lock should not be poisoned");

        let window = Duration::from_millis(self.cfg.window_ms);
        if now.saturating_duration_since(state.window_started_at) >= window {
            self.reset_window(&mut state, now);
        }

        if state.tokens >= weight {
            state.tokens -= weight;
            state.requests_in_window += 1;
            true
        } else {
            state.is_limited = true;
            false
        }
    }

    fn reset_window(&self, state: &mut BucketState, now: Instant) {
        state.tokens = self.cfg.max_tokens;
        state.window_started_at = now;
        state.requests_in_window = 0;
        if state.is_limited {
            state.is_limited = false;
            info!(
                component = "rate_limiter",
                event = "rate_limit.reset",
                max_tokens = self.cfg.max_tokens
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::FixedJitter;

    fn limiter(max_tokens: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            RateLimiterConfig {
                max_tokens,
                window_ms: 60_000,
                backoff_min_ms: 1_000,
                backoff_max_ms: 5_000,
            },
            Arc::new(FixedJitter),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn one_more_than_capacity_yields_exactly_one_delayed_grant() {
        let limiter = limiter(3);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire(1).await })
            })
            .collect();

        let mut waits = Vec::new();
        for handle in handles {
            waits.push(handle.await.expect("acquire task should not panic"));
        }

        let immediate = waits.iter().filter(|w| w.is_zero()).count();
        let delayed: Vec<_> = waits.iter().filter(|w| !w.is_zero()).collect();
        assert_eq!(immediate, 3);
        assert_eq!(delayed.len(), 1);
        assert!(*delayed[0] >= Duration::from_secs(1));
        assert_eq!(limiter.snapshot().delayed_acquisitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_caller_is_released_by_refill() {
        let limiter = limiter(1);
        assert!(limiter.acquire(1).await.is_zero());

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(1).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(limiter.snapshot().is_limited);
        limiter.refill();

        let waited = waiter.await.expect("acquire task should not panic");
        assert!(waited >= Duration::from_millis(1_000));
        assert!(waited < Duration::from_secs(60));
        assert!(!limiter.snapshot().is_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn weight_is_debited_and_clamped_to_capacity() {
        let limiter = limiter(10);
        limiter.acquire(4).await;
        assert_eq!(limiter.snapshot().tokens_remaining, 6);

        // An oversized weight cannot ever fit; it is clamped to a full bucket.
        limiter.refill();
        limiter.acquire(50).await;
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.tokens_remaining, 0);
        assert_eq!(snapshot.requests_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_task_restores_tokens_each_window() {
        let limiter = limiter(2);
        limiter.acquire(2).await;
        assert_eq!(limiter.snapshot().tokens_remaining, 0);

        let task = limiter.spawn_refill_task();
        tokio::time::sleep(Duration::from_millis(60_001)).await;
        assert_eq!(limiter.snapshot().tokens_remaining, 2);
        task.abort();
    }
}
