//! Admission control and failure isolation for provider endpoints.
//!
//! Every provider call passes through an [`EndpointGuard`] for its
//! [`EndpointClass`]: a token bucket limits the request rate and a circuit
//! breaker fails calls fast while the endpoint is known to be unhealthy.
//! Reads and writes are tracked separately since providers grant separate
//! quotas for them.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use crate::core::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EndpointClass {
    Read,
    Write,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket admitting up to `rate_per_sec` calls per second with a burst
/// of `capacity`.
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        let rate_per_sec = rate_per_sec.max(0.001);
        let capacity = capacity.max(1.0);
        Self {
            rate_per_sec,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available, otherwise return how long until
    /// the next one is.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64(
                (1.0 - bucket.tokens) / self.rate_per_sec,
            ))
        }
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Opens after `threshold` consecutive failures and rejects calls for
/// `cooldown`. After the cool-down a single trial call is let through; its
/// outcome closes the breaker or re-opens it for another cool-down.
pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.opened_at {
            None => BreakerState::Closed,
            Some(opened_at) if opened_at.elapsed() < self.cooldown => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
        }
    }

    /// Admit a call, or return `None` when it must fail fast. The returned
    /// [`Admission`] must be settled with the call's outcome; dropping it
    /// unsettled releases a half-open trial slot without changing state.
    pub fn allow(&self) -> Option<Admission<'_>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let trial = match inner.opened_at {
            None => false,
            Some(opened_at) if opened_at.elapsed() < self.cooldown => return None,
            Some(_) if inner.trial_in_flight => return None,
            Some(_) => {
                inner.trial_in_flight = true;
                true
            }
        };
        Some(Admission {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.opened_at.is_some() {
            tracing::info!("Circuit {} closed after successful trial call", self.name);
        }
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if inner.trial_in_flight {
            inner.trial_in_flight = false;
            inner.opened_at = Some(Instant::now());
            tracing::warn!("Circuit {} trial call failed, re-opening", self.name);
        } else if inner.opened_at.is_none() && inner.consecutive_failures >= self.threshold {
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                "Circuit {} opened after {} consecutive failures, cooling down for {:?}",
                self.name,
                inner.consecutive_failures,
                self.cooldown
            );
        }
    }
}

/// A call admitted by a [`CircuitBreaker`].
#[must_use = "an admission must be settled with the call's outcome"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.trial_in_flight = false;
            tracing::debug!("Circuit {} trial call abandoned", self.breaker.name);
        }
    }
}

/// Exponential backoff with "equal jitter": the delay for attempt `n` is
/// drawn uniformly from `[d/2, d]` where `d = min(max, base * 2^n)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(jittered)
    }
}

pub struct EndpointGuard {
    pub limiter: RateLimiter,
    pub breaker: CircuitBreaker,
}

/// One guard per endpoint class.
pub struct Guards {
    read: EndpointGuard,
    write: EndpointGuard,
}

impl Guards {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            read: EndpointGuard {
                limiter: RateLimiter::new(config.read_rate_per_sec, config.read_rate_per_sec),
                breaker: CircuitBreaker::new(
                    "read",
                    config.breaker_failure_threshold,
                    config.breaker_cooldown,
                ),
            },
            write: EndpointGuard {
                limiter: RateLimiter::new(config.write_rate_per_sec, config.write_rate_per_sec),
                breaker: CircuitBreaker::new(
                    "write",
                    config.breaker_failure_threshold,
                    config.breaker_cooldown,
                ),
            },
        }
    }

    pub fn for_class(&self, class: EndpointClass) -> &EndpointGuard {
        match class {
            EndpointClass::Read => &self.read,
            EndpointClass::Write => &self.write,
        }
    }
}
