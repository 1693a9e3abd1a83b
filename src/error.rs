//! Error taxonomy and retry logic
//!
//! Every fallible operation in the sync path returns [`SyncError`]. Only
//! transient transport failures are retried; everything else is surfaced
//! (connection establishment) or logged and dropped (per-notification work).

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::object::ValueKind;

/// Errors produced by transports, the sync manager and the relay.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The manager or transport is not in an active session
    #[error("not connected")]
    NotConnected,

    /// Connected to the relay but no session has been joined
    #[error("not joined to any session")]
    NotJoined,

    /// Terminal: the relay could not be reached after every configured attempt
    #[error("connection failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Transient send/receive failure on an established link
    #[error("transport error: {0}")]
    Transport(String),

    #[error("outbound queue is full")]
    QueueFull,

    #[error("property '{property}' not found on object {object_id}")]
    UnknownProperty { object_id: String, property: String },

    #[error("cannot convert value for '{property}' to {expected:?}: {reason}")]
    Conversion {
        property: String,
        expected: ValueKind,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("object has been disposed")]
    Disposed,

    #[error("no tokio runtime available on this thread")]
    NoRuntime,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether a failed operation may succeed when attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Timeout(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_cbor::Error> for SyncError {
    fn from(err: serde_cbor::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
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

    /// Create an aggressive retry policy
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(3),
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Run an async operation, retrying retryable failures with exponential backoff.
///
/// Non-retryable errors are returned immediately. After `max_attempts`
/// the last error is returned unchanged.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempts < max_attempts => {
                let delay = policy.delay_for(attempts);
                tracing::warn!(
                    attempt = attempts,
                    max_attempts,
                    ?delay,
                    error = %err,
                    "operation failed, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
