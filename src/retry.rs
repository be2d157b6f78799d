//! Retry with exponential backoff and jitter for outbound provider calls.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::ProviderError;

/// Fraction of the computed delay used as the jitter range (±).
const JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt; elapsed attempts count as retryable
    /// failures.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

/// One failed attempt inside a single outbound call. Only used for logging.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay: Duration,
    pub last_error: ProviderError,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Same timeout, no retries. For calls that must not be repeated.
    pub fn single_attempt(&self) -> Self {
        Self {
            config: RetryConfig {
                max_retries: 0,
                ..self.config.clone()
            },
        }
    }

    /// `attempt` is the zero-based index of the attempt that just failed.
    pub fn should_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }
        error.retryable
    }

    /// `min(max_delay, base_delay * 2^attempt)`, jittered by a uniform ±20%.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
        self.backoff_with_jitter(attempt, jitter)
    }

    /// `jitter` in `[-1.0, 1.0]` scales the ±20% offset.
    fn backoff_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        let exp = base * 2f64.powi(attempt.min(62) as i32);
        let delay = exp.min(max);
        let offset = delay * JITTER_RATIO * jitter.clamp(-1.0, 1.0);
        Duration::from_millis((delay + offset).max(0.0).floor() as u64)
    }

    /// Terminal hook once retries are exhausted.
    pub fn handle_max_retries(&self, error: &ProviderError) {
        tracing::error!(
            target: "retry",
            provider = %error.provider,
            max_retries = self.config.max_retries,
            error = %error,
            "Giving up after exhausting retries"
        );
    }

    /// Run `op` behind the breaker, retrying retryable failures.
    ///
    /// `op` receives the zero-based attempt number. Every attempt is bounded
    /// by `attempt_timeout`. Only retryable failures count against the
    /// breaker; a terminal answer such as a revoked token says nothing about
    /// the provider's health.
    pub async fn run<T, F, Fut>(&self, breaker: &CircuitBreaker, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let provider = breaker.provider();
        let mut attempt = 0;

        loop {
            if breaker.is_open() {
                tracing::warn!(
                    target: "retry",
                    provider = %provider,
                    attempt,
                    "Circuit open, skipping provider call"
                );
                return Err(ProviderError::unavailable(provider));
            }

            let outcome = match tokio::time::timeout(self.config.attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(provider, self.config.attempt_timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.retryable {
                breaker.record_failure();
            }

            if !self.should_retry(&err, attempt) {
                if err.retryable {
                    self.handle_max_retries(&err);
                }
                return Err(err);
            }

            let retry = RetryAttempt {
                attempt,
                delay: self.backoff(attempt),
                last_error: err,
            };
            tracing::debug!(
                target: "retry",
                provider = %provider,
                attempt = retry.attempt,
                delay_ms = retry.delay.as_millis() as u64,
                error = %retry.last_error,
                "Retrying provider call"
            );
            tokio::time::sleep(retry.delay).await;
            attempt += 1;
        }
    }
}
