//! Error taxonomy and retry logic
//!
//! `SyncError` covers every failure the sync core can report. Transport
//! failures on the client side are retried with [`RetryPolicy`]; invariant
//! violations are never retried silently.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::hub::HubError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Requested range lies (partly) outside the retained log.
    #[error("operations {from}..={to} of session '{session_id}' are not retained (oldest {oldest}, head {head})")]
    RangeUnavailable {
        session_id: String,
        from: u64,
        to: u64,
        oldest: u64,
        head: u64,
    },

    #[error("invalid range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },

    /// The authoritative log broke contiguity (duplicate or skipped seq).
    #[error("sequence invariant violated: expected seq {expected}, found {found}")]
    InvariantViolation { expected: u64, found: u64 },

    #[error("session '{0}' is halted pending investigation")]
    SessionHalted(String),

    #[error("sync service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// WebSocket connect, read or write failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::RangeUnavailable { .. } => ErrorCategory::Retention,
            SyncError::InvalidRange { .. } | SyncError::Config(_) | SyncError::Encode(_) => {
                ErrorCategory::Validation
            }
            SyncError::InvariantViolation { .. } | SyncError::SessionHalted(_) => {
                ErrorCategory::Invariant
            }
            SyncError::ShuttingDown => ErrorCategory::Lifecycle,
            SyncError::Hub(HubError::Backpressure) => ErrorCategory::Backpressure,
            SyncError::Hub(_) => ErrorCategory::Lifecycle,
            SyncError::Transport(_) => ErrorCategory::Transport,
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        SyncError::Transport(err.to_string())
    }
}

/// Categorized error kinds for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection loss or I/O (retryable)
    Transport,

    /// Data evicted by retention; recover with a full resync
    Retention,

    /// A consumer could not keep up and was dropped
    Backpressure,

    /// Authoritative log invariant broken (never retried silently)
    Invariant,

    /// Service or connection is closing
    Lifecycle,

    /// Caller supplied bad input (not retryable)
    Validation,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transport | ErrorCategory::Retention | ErrorCategory::Backpressure
        )
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= policy.max_attempts {
                    return Err(anyhow::anyhow!(
                        "operation failed after {} attempts: {}",
                        attempts,
                        e
                    ));
                }

                let delay = policy.delay_for(attempts);
                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "attempt failed: {e}; retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_error_categorization() {
        let gone = SyncError::RangeUnavailable {
            session_id: "s".into(),
            from: 1,
            to: 4,
            oldest: 10,
            head: 20,
        };
        assert_eq!(gone.category(), ErrorCategory::Retention);
        assert!(gone.category().is_retryable());

        let broken = SyncError::InvariantViolation { expected: 3, found: 5 };
        assert_eq!(broken.category(), ErrorCategory::Invariant);
        assert!(!broken.category().is_retryable());

        let full = SyncError::Hub(HubError::Backpressure);
        assert_eq!(full.category(), ErrorCategory::Backpressure);

        let dropped = SyncError::transport("connection reset by peer");
        assert_eq!(dropped.category(), ErrorCategory::Transport);
        assert!(dropped.category().is_retryable());
        assert!(dropped.to_string().contains("connection reset"));

        let garbled = match serde_json::from_str::<u64>("{") {
            Err(e) => SyncError::from(e),
            Ok(_) => unreachable!(),
        };
        assert_eq!(garbled.category(), ErrorCategory::Validation);
        assert!(!garbled.category().is_retryable());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(30), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_with_retry_gives_up() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("refused") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let value = with_retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }
}
