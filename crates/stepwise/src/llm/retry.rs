//! Bounded retry for model calls.
//!
//! Every attempt runs under the per-attempt timeout; failures are logged and
//! followed by a fixed wait (no jitter, no backoff), so the worst case is
//! `max_attempts * (timeout + wait)`.
//!
//! A timed-out attempt is cancelled by dropping its future. Work that does
//! not yield to the runtime (a blocking call inside the future, or a task it
//! spawned) keeps running after the wrapper has given up.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::RetryConfig;

/// A successful call and what it took to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    /// The call's result.
    pub value: T,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Elapsed time of the successful attempt.
    pub elapsed: Duration,
}

impl<T> Retried<T> {
    /// Failed attempts before the successful one.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Why a retried call gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The final attempt timed out.
    #[error("{label}: gave up after {attempts} attempt(s), last one timed out after {timeout:?}")]
    Exhausted {
        /// Label of the call.
        label: String,
        /// Attempts made.
        attempts: u32,
        /// Per-attempt timeout.
        timeout: Duration,
    },
    /// The final attempt failed with this error.
    #[error("{0}")]
    Failed(E),
}

impl<E> RetryError<E> {
    /// The application error, if the final attempt produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Failed(error) => Some(error),
            RetryError::Exhausted { .. } => None,
        }
    }
}

/// Call `attempt` until it succeeds or `config.max_attempts` attempts have failed.
///
/// A timeout on the final attempt becomes [`RetryError::Exhausted`]; an
/// application error on the final attempt is returned unchanged as
/// [`RetryError::Failed`].
pub async fn call<T, E, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut attempt: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut number = 0;

    loop {
        number += 1;
        let started = Instant::now();
        let last = number >= max_attempts;

        match tokio::time::timeout(config.timeout, attempt()).await {
            Ok(Ok(value)) => {
                return Ok(Retried {
                    value,
                    attempts: number,
                    elapsed: started.elapsed(),
                });
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    call = %label,
                    attempt = number,
                    max_attempts,
                    error = %error,
                    "call failed"
                );
                if last {
                    return Err(RetryError::Failed(error));
                }
            }
            Err(_) => {
                tracing::warn!(
                    call = %label,
                    attempt = number,
                    max_attempts,
                    timeout_ms = config.timeout.as_millis() as u64,
                    "call timed out"
                );
                if last {
                    return Err(RetryError::Exhausted {
                        label: label.to_string(),
                        attempts: number,
                        timeout: config.timeout,
                    });
                }
            }
        }

        tokio::time::sleep(config.wait).await;
    }
}
