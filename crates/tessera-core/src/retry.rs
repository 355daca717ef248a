//! Bounded retry with failure and retry hooks.
//!
//! Wraps fallible async operations in an n-attempt loop with a capped linear
//! backoff. The dispatcher runs every outbound send through one of these.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorCode, ExchangeError, ExchangeResult};

/// Hook invoked with the error of each failed attempt.
pub type FailedAttemptHook = Arc<dyn Fn(&ExchangeError) + Send + Sync>;
/// Hook invoked with the 1-based number of the attempt about to run.
pub type RetryHook = Arc<dyn Fn(u32) + Send + Sync>;

/// An n-attempt retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    on_failed_attempt: Option<FailedAttemptHook>,
    on_retry: Option<RetryHook>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_cap", &self.backoff_cap)
            .finish()
    }
}

impl RetryPolicy {
    /// Create a policy that runs an operation at most `max_attempts` times.
    ///
    /// `max_attempts` of zero is treated as one attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(5),
            on_failed_attempt: None,
            on_retry: None,
        }
    }

    /// Set the backoff base and cap. The wait before attempt `n + 1` is
    /// `min(n * base, cap)`.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Set the hook invoked with each attempt's error.
    pub fn on_failed_attempt<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExchangeError) + Send + Sync + 'static,
    {
        self.on_failed_attempt = Some(Arc::new(hook));
        self
    }

    /// Set the hook invoked before each retry with the upcoming attempt
    /// number.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// The configured attempt cap.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff interval after `attempt` failures.
    pub fn backoff_interval(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(attempt)
            .min(self.backoff_cap)
    }

    /// Run `op` until it succeeds or the attempt cap is reached, surfacing
    /// the last error.
    pub async fn execute<F, Fut, T>(&self, mut op: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(hook) = &self.on_failed_attempt {
                        hook(&err);
                    }
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    attempt += 1;
                    if let Some(hook) = &self.on_retry {
                        hook(attempt);
                    }
                    tokio::time::sleep(self.backoff_interval(attempt - 1)).await;
                }
            }
        }
    }
}

/// Reconnect backoff for the broker connection: `min(attempt * 50ms, cap)`
/// with an optional cap on the number of attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_interval: Duration,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Base wait multiplied by the attempt number.
    pub const BASE_INTERVAL: Duration = Duration::from_millis(50);

    /// Create a reconnect policy.
    pub fn new(max_interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            max_interval,
            max_attempts,
        }
    }

    /// Wait before the given 1-based attempt.
    pub fn interval(&self, attempt: u32) -> Duration {
        Self::BASE_INTERVAL
            .saturating_mul(attempt)
            .min(self.max_interval)
    }

    /// Error when the attempt counter has passed the configured cap.
    pub fn check_attempts(&self, attempt: u32) -> ExchangeResult<()> {
        match self.max_attempts {
            Some(cap) if attempt > cap => Err(ExchangeError::new(
                ErrorCode::RetryAttemptsExceeded,
                format!("broker reconnect abandoned after {} attempts", cap),
            )),
            _ => Ok(()),
        }
    }
}
