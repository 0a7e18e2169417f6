//! Bounded exponential-backoff retries
//!
//! [`RetryExecutor::execute`] runs an operation up to `max_attempts` times.
//! Before every retry it removes the operation's output artifact (and its
//! `.partial` sibling) so a half-written file is never taken for a complete
//! one. Transient and capacity failures are retried, data validation failures
//! are retried within the same bound but logged separately, and everything
//! else fails fast.

use crate::config::RetryConfig;
use crate::error::{ErrorClass, Result, SyncError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// Delay after the `failures`-th consecutive failure (1-based): `base * 2^(failures-1)`, capped
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Path of the in-progress sibling of an artifact (`<file>.partial`)
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Remove an artifact and its in-progress sibling, ignoring missing files
pub async fn discard_artifact(path: &Path) -> Result<()> {
    for candidate in [path.to_path_buf(), partial_path(path)] {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => debug!(path = %candidate.display(), "Discarded partial artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// `op` receives the 1-based attempt number. `artifact` is the file the
    /// operation writes, if any; it is removed after every failed attempt.
    /// Returns [`SyncError::Exhausted`] once retryable failures use up the
    /// attempt budget, and [`SyncError::Cancelled`] if shutdown is requested
    /// while waiting.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        artifact: Option<&Path>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let Some(path) = artifact {
                discard_artifact(path).await?;
            }

            let class = err.class();
            if !class.is_retryable() {
                debug!(operation, attempt, class = %class, error = %err, "Not retrying");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, class = %class, error = %err, "Retries exhausted");
                return Err(SyncError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(attempt);
            if class == ErrorClass::DataValidation {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    failure = "structural",
                    error = %err,
                    "Payload failed validation, retrying"
                );
            } else {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    class = %class,
                    error = %err,
                    "Attempt failed, retrying"
                );
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}
