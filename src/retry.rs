//! Conflict-aware retry for revisioned updates.
//!
//! The document store resolves concurrent writers by rejecting whoever
//! presents a stale revision. [`RevisionedUpdateProcessor`] re-runs an
//! update when, and only when, it fails with [`RasError::Conflict`],
//! sleeping a jittered backoff after every conflict, and gives up with
//! [`RasError::RetryExhausted`] once the attempt ceiling is reached.
//!
//! # Retry Strategy
//!
//! - Conflict → back off, then retry
//! - Any other error → returned immediately
//! - Default backoff: uniformly random 1000–4000 ms
//! - An interrupted sleep is logged and the next attempt starts at once

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{error, warn};

use ras_core::{RasError, Result};

use crate::config::RetryConfig;

/// Decides how long to wait after the given (1-based) failed attempt.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Uniformly random delay in `[min, max]`.
#[derive(Debug, Clone)]
pub struct RandomBackoff {
    min: Duration,
    max: Duration,
}

impl RandomBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }
}

impl Default for RandomBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(4000))
    }
}

impl BackoffPolicy for RandomBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// The same delay every time.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl BackoffPolicy for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// A sleep that was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration) -> std::result::Result<(), Interrupted>;
}

/// Tokio sleep that wakes early when [`interrupt`](Self::interrupt) is called.
#[derive(Debug, Default)]
pub struct InterruptibleSleeper {
    wake: Notify,
}

impl InterruptibleSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every sleep currently in progress.
    pub fn interrupt(&self) {
        self.wake.notify_waiters();
    }
}

#[async_trait]
impl Sleeper for InterruptibleSleeper {
    async fn sleep(&self, duration: Duration) -> std::result::Result<(), Interrupted> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.wake.notified() => Err(Interrupted),
        }
    }
}

/// Runs an update operation with bounded, jittered conflict retry.
#[derive(Clone)]
pub struct RevisionedUpdateProcessor {
    max_attempts: u32,
    backoff: Arc<dyn BackoffPolicy>,
    sleeper: Arc<dyn Sleeper>,
}

impl RevisionedUpdateProcessor {
    pub fn new(max_attempts: u32, backoff: Arc<dyn BackoffPolicy>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            sleeper,
        }
    }

    pub fn from_config(config: &RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        let backoff = RandomBackoff::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        );
        Self::new(config.max_attempts, Arc::new(backoff), sleeper)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` with the configured attempt ceiling.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        self.retry_with_limit(self.max_attempts, operation).await
    }

    /// Run `operation` with an explicit attempt ceiling.
    pub async fn retry_with_limit<T, F, Fut>(&self, max_attempts: u32, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            match operation(attempts).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_conflict() => {
                    let delay = self.backoff.delay(attempts);
                    warn!(
                        "{} (attempt {}/{}), retrying in {:?}",
                        err, attempts, max_attempts, delay
                    );
                    if self.sleeper.sleep(delay).await.is_err() {
                        warn!("backoff sleep interrupted, continuing early");
                    }
                }
                Err(err) => return Err(err),
            }
        }
        error!("update still conflicting after {} attempts", max_attempts);
        Err(RasError::RetryExhausted {
            attempts: max_attempts,
        })
    }
}
