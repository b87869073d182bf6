//! Error types for intakeq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or invalid payload. Never retried.
    #[error("structural error: {0}")]
    Structural(String),

    /// Temporarily failed operation. Retried with backoff up to a cap.
    #[error("transient error: {0}")]
    Transient(String),

    /// Enqueue could not durably persist the entry. Surfaced to the
    /// caller synchronously; nothing was queued.
    #[error("enqueue durability error: {0}")]
    Durability(String),

    #[error("report not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when retrying later could succeed. Structural failures and
    /// lookups that missed never become true on a retry.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Error::Structural(_) | Error::NotFound(_) | Error::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
