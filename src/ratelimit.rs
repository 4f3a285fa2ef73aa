use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Interval between two attempts of a single worker so that `concurrency`
/// workers together approach `qps`. `None` means unlimited.
pub fn worker_interval(qps: u32, concurrency: usize) -> Option<Duration> {
    if qps == 0 || concurrency == 0 {
        return None;
    }
    let micros = (1_000_000 / u64::from(qps)).checked_mul(concurrency as u64)?;
    if micros == 0 {
        return None;
    }
    Some(Duration::from_micros(micros))
}

/// Per-worker pacing. Each attempt consumes one permit.
pub struct Throttle {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    interval: Option<Duration>,
}

impl Throttle {
    pub fn new(qps: u32, concurrency: usize) -> Self {
        Self::with_interval(worker_interval(qps, concurrency))
    }

    pub fn with_interval(interval: Option<Duration>) -> Self {
        let limiter = interval
            .and_then(Quota::with_period)
            .map(RateLimiter::direct);
        Self { limiter, interval }
    }

    pub fn unlimited() -> Self {
        Self::with_interval(None)
    }

    pub fn is_active(&self) -> bool {
        self.limiter.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait for the next permit. Returns immediately when unlimited.
    pub async fn tick(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}
