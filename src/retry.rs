//! Retry logic with exponential backoff.
//!
//! This module provides configurable retry logic for transient failures.
//! It implements exponential backoff with optional jitter to prevent thundering herd.
//!
//! # Example
//!
//! ```no_run
//! use can_telemetry_agent::retry::{IsRetryable, retry_with_backoff};
//! use can_telemetry_agent::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let result = retry_with_backoff(&config, || async {
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, UploadError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not.
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (authentication failed, missing bucket, malformed request) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried.
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Upload(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Config, reader, batcher and shutdown errors are never retried by
            // this generic helper — each of those has its own recovery path
            // (reconnect loop, fatal abort, cooperative exit).
            Error::Config(_) | Error::Reader(_) | Error::Batch(_) | Error::ShuttingDown => false,
        }
    }
}

impl IsRetryable for UploadError {
    fn is_retryable(&self) -> bool {
        match self {
            // Transport-level failures (DNS, connection refused/reset, TLS handshake,
            // request timeout) are transient by nature.
            UploadError::Transport(_) => true,
            // Explicit transient classification from the service (5xx, throttling).
            UploadError::Transient { .. } => true,
            // Auth failures, missing bucket, malformed requests: no amount of
            // retrying fixes these without operator intervention.
            UploadError::Terminal { .. } => false,
            // A multipart abort already represents the end of the retry loop
            // for that upload; the caller should not retry again on this error
            // directly (the file will be retried whole from pending instead).
            UploadError::MultipartAborted(_) => false,
            // A failed rename indicates filesystem corruption, not a remote issue.
            UploadError::StateTransition { .. } => false,
            UploadError::Sidecar { .. } => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic.
///
/// Makes up to `config.max_attempts` total attempts (not `max_attempts + 1`).
/// Returns the successful result or the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered_delay = if config.jitter { add_jitter(delay) } else { delay };
                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Like [`retry_with_backoff`], but also resolves early when `cancelled` fires,
/// satisfying the requirement that shutdown must not block for a full backoff wait.
pub async fn retry_with_backoff_cancellable<F, Fut, T, E>(
    config: &RetryConfig,
    cancelled: &tokio_util::sync::CancellationToken,
    mut operation: F,
) -> Option<Result<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        if cancelled.is_cancelled() {
            return None;
        }

        match operation().await {
            Ok(result) => return Some(Ok(result)),
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered_delay = if config.jitter { add_jitter(delay) } else { delay };
                tokio::select! {
                    _ = tokio::time::sleep(jittered_delay) => {}
                    _ = cancelled.cancelled() => return None,
                }

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd.
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
