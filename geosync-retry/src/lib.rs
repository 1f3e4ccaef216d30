//! Exponential backoff with jitter.
//!
//! [`Retrier`] runs any fallible async operation up to `max_retries + 1`
//! times. Between attempts it sleeps for
//! `min(initial_delay * backoff_factor^(attempt-1), max_delay)`, optionally
//! perturbed by up to `±jitter_factor` of that delay so independent callers
//! do not retry in lockstep.
//!
//! Retry delays are cancellable through a [`CancellationToken`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use geosync_core::RetryConfig;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Hooks invoked by [`Retrier::execute`]. All methods default to no-ops and
/// every error counts as retryable.
pub trait RetryObserver<E>: Send + Sync {
    /// Decide whether `error` warrants another attempt.
    fn is_retryable(&self, _error: &E) -> bool {
        true
    }

    /// Called once per scheduled retry, before the delay starts.
    fn on_retry(&self, _attempt: u32, _error: &E, _delay: Duration) {}

    /// Called once, with the attempt number that succeeded.
    fn on_success(&self, _attempt: u32) {}

    /// Called once, right before [`RetryError::Exhausted`] is returned.
    fn on_exhausted(&self, _attempts: u32, _error: &E) {}
}

/// Observer that keeps every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl<E> RetryObserver<E> for NoopObserver {}

/// Terminal outcome of a retried operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    #[error("Max retries exceeded after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The observer declared the error non-retryable.
    #[error("{0}")]
    Rejected(E),

    #[error("Retry cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Underlying error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Rejected(err) => Some(err),
            Self::Cancelled => None,
        }
    }
}

/// Backoff executor. Configuration is fixed at construction.
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Delay in ms before retry number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = (self.config.initial_delay_ms as f64 * self.config.backoff_factor.powi(exponent))
            .min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter {
            let spread = base * self.config.jitter_factor;
            if spread > 0.0 {
                base + rand::rng().random_range(-spread..=spread)
            } else {
                base
            }
        } else {
            base
        };

        delay.max(0.0).round() as u64
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_delay(attempt))
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut, O>(&self, op: F, observer: &O) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        O: RetryObserver<E> + ?Sized,
    {
        self.execute_cancellable(op, observer, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), but a pending delay is abandoned
    /// as soon as `cancel` fires.
    pub async fn execute_cancellable<T, E, F, Fut, O>(
        &self,
        mut op: F,
        observer: &O,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        O: RetryObserver<E> + ?Sized,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    observer.on_success(attempt);
                    return Ok(value);
                }
                Err(err) => {
                    if !observer.is_retryable(&err) {
                        debug!(attempt, error = %err, "Non-retryable failure");
                        return Err(RetryError::Rejected(err));
                    }

                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %err, "Giving up after retries");
                        observer.on_exhausted(attempt, &err);
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, backing off"
                    );
                    observer.on_retry(attempt, &err, delay);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
