//! Bounded retry policy for venue calls.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{ExchangeError, ExchangeResult};

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Exponential backoff with a hard attempt cap.
///
/// Delay before retry `n` (1-based) is `min(base * 2^(n-1), max)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Test helper.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `op`, retrying errors for which `retryable` holds.
    pub async fn run_with<T, F, Fut, P>(&self, what: &str, retryable: P, mut op: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
        P: Fn(&ExchangeError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        what,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Venue call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `op` with every attempt bounded by `timeout`, retrying transient
    /// errors.
    ///
    /// A timed-out attempt surfaces as [`ExchangeError::Timeout`] and is not
    /// retried: the venue may have acted on it. Returns the result together
    /// with the number of attempts made.
    pub async fn run_timed<T, F, Fut>(
        &self,
        what: &str,
        timeout: Duration,
        mut op: F,
    ) -> (ExchangeResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let mut attempts = 0;
        let result = self
            .run_with(
                what,
                |e: &ExchangeError| e.is_retryable() && !matches!(e, ExchangeError::Timeout),
                || {
                    attempts += 1;
                    let call = op();
                    async move {
                        tokio::time::timeout(timeout, call)
                            .await
                            .unwrap_or(Err(ExchangeError::Timeout))
                    }
                },
            )
            .await;
        (result, attempts)
    }

    /// Run `op`, retrying transient errors.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        self.run_with(what, ExchangeError::is_retryable, op).await
    }
}
