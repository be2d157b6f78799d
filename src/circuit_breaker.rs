//! Per-provider circuit breaker.
//!
//! Counts consecutive failures against one provider and fails fast once the
//! threshold is reached. There is no separate half-open state: once the reset
//! timeout has elapsed, the next `is_open` check closes the breaker and lets
//! that caller through as the probe. The probe's outcome decides whether it
//! trips again.
//!
//! State lives in atomics. Concurrent updates are last-write-wins, which is
//! enough for the breaker to trend open under sustained failure and closed
//! after recovery.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::types::Provider;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens. At least 1.
    pub failure_threshold: u32,
    /// How long the breaker stays open after the last failure.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Point-in-time view of a breaker, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub provider: Provider,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

pub struct CircuitBreaker {
    provider: Provider,
    config: CircuitBreakerConfig,
    failures: AtomicU32,
    /// Milliseconds since the epoch; 0 means no failure recorded.
    last_failure_ms: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(provider: Provider, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            config,
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(0),
            clock,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Whether calls must fail fast right now.
    ///
    /// When the breaker is tripped but the reset timeout has elapsed, this
    /// resets it and returns `false` so the caller acts as the probe.
    pub fn is_open(&self) -> bool {
        let failures = self.failures.load(Ordering::Acquire);
        if failures < self.config.failure_threshold {
            return false;
        }

        let last = self.last_failure_ms.load(Ordering::Acquire);
        let now = self.clock.now().timestamp_millis();
        let elapsed = now.saturating_sub(last);

        if elapsed >= self.reset_timeout_ms() {
            self.failures.store(0, Ordering::Release);
            self.last_failure_ms.store(0, Ordering::Release);
            tracing::info!(
                target: "circuit_breaker",
                provider = %self.provider,
                "Reset timeout elapsed, letting probe request through"
            );
            return false;
        }

        true
    }

    pub fn record_success(&self) {
        let previous = self.failures.swap(0, Ordering::AcqRel);
        self.last_failure_ms.store(0, Ordering::Release);
        if previous > 0 {
            tracing::debug!(
                target: "circuit_breaker",
                provider = %self.provider,
                previous_failures = previous,
                "Failure count reset after success"
            );
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now().timestamp_millis();
        self.last_failure_ms.store(now, Ordering::Release);
        let count = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);

        if count == self.config.failure_threshold {
            tracing::warn!(
                target: "circuit_breaker",
                provider = %self.provider,
                failure_count = count,
                threshold = self.config.failure_threshold,
                "Circuit breaker opened due to consecutive failures"
            );
        }
    }

    /// Snapshot without side effects; an elapsed breaker reports closed.
    pub fn status(&self) -> CircuitStatus {
        let failures = self.failures.load(Ordering::Acquire);
        let last = self.last_failure_ms.load(Ordering::Acquire);
        let now = self.clock.now().timestamp_millis();

        let tripped = failures >= self.config.failure_threshold
            && now.saturating_sub(last) < self.reset_timeout_ms();

        CircuitStatus {
            provider: self.provider,
            state: if tripped {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            failure_count: failures,
            last_failure_at: (last != 0)
                .then(|| Utc.timestamp_millis_opt(last).single())
                .flatten(),
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
        }
    }

    fn reset_timeout_ms(&self) -> i64 {
        i64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Process-wide set of breakers, one per provider, built at startup.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<BTreeMap<Provider, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let breakers = Provider::ALL
            .into_iter()
            .map(|p| {
                (
                    p,
                    Arc::new(CircuitBreaker::new(p, config.clone(), clock.clone())),
                )
            })
            .collect();
        Self {
            breakers: Arc::new(breakers),
        }
    }

    pub fn get(&self, provider: Provider) -> Arc<CircuitBreaker> {
        // Every provider is inserted in `new`.
        self.breakers[&provider].clone()
    }

    pub fn statuses(&self) -> Vec<CircuitStatus> {
        self.breakers.values().map(|b| b.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(threshold: u32, reset_ms: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_reset_timeout(Duration::from_millis(reset_ms));
        (
            CircuitBreaker::new(Provider::Calendly, config, clock.clone()),
            clock,
        )
    }

    #[test]
    fn opens_at_threshold() {
        let (cb, _) = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
        assert_eq!(cb.status().state, CircuitState::Open);
    }

    #[test]
    fn stays_open_until_timeout() {
        let (cb, clock) = breaker(2, 1_000);
        cb.record_failure();
        cb.record_failure();
        clock.advance(chrono::Duration::milliseconds(999));
        assert!(cb.is_open());
    }

    #[test]
    fn auto_resets_after_timeout_and_reopens_only_at_threshold() {
        let (cb, clock) = breaker(2, 1_000);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_open());

        clock.advance(chrono::Duration::milliseconds(1_000));
        assert!(!cb.is_open(), "probe should be let through");
        assert_eq!(cb.failure_count(), 0);

        // A single failed probe does not reopen a threshold-2 breaker.
        cb.record_failure();
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
    }

    #[test]
    fn success_resets_failures() {
        let (cb, _) = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.status().last_failure_at.is_none());
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[test]
    fn status_reports_elapsed_breaker_closed_without_resetting() {
        let (cb, clock) = breaker(1, 500);
        cb.record_failure();
        clock.advance(chrono::Duration::milliseconds(600));
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 1);
    }

    #[test]
    fn registry_isolates_providers() {
        let clock = Arc::new(ManualClock::default());
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
            clock,
        );
        registry.get(Provider::Zoom).record_failure();
        assert!(registry.get(Provider::Zoom).is_open());
        assert!(!registry.get(Provider::Calcom).is_open());
        assert_eq!(registry.statuses().len(), Provider::ALL.len());
    }

    #[test]
    fn concurrent_failures_trip_the_breaker() {
        let clock = Arc::new(ManualClock::default());
        let cb = Arc::new(CircuitBreaker::new(
            Provider::Stripe,
            CircuitBreakerConfig::default().with_failure_threshold(10),
            clock,
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cb.is_open());
    }
}
