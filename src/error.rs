use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, FloodControlError>;

/// Failures surfaced by the flood control engine and its window stores.
///
/// None of these is ever turned into an admission verdict by the engine;
/// callers decide whether an outage fails open or closed.
#[derive(Debug, thiserror::Error)]
pub enum FloodControlError {
    #[error("window store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store call `{operation}` exceeded its {timeout:?} deadline")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("corrupt queue entry {token:?}: {reason}")]
    CorruptEntry { token: String, reason: String },

    #[error("occupancy invariant violated for user {user_id}: {detail}")]
    InvariantViolation { user_id: i64, detail: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FloodControlError {
    /// Transport failures and deadlines may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FloodControlError::StoreUnavailable(_) | FloodControlError::DeadlineExceeded { .. }
        )
    }
}

impl From<redis::RedisError> for FloodControlError {
    fn from(err: redis::RedisError) -> Self {
        FloodControlError::StoreUnavailable(err.to_string())
    }
}

impl From<mobc::Error<redis::RedisError>> for FloodControlError {
    fn from(err: mobc::Error<redis::RedisError>) -> Self {
        match err {
            mobc::Error::Inner(e) => e.into(),
            mobc::Error::Timeout => {
                FloodControlError::StoreUnavailable("connection pool checkout timed out".into())
            }
            other => FloodControlError::StoreUnavailable(format!("{:?}", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
