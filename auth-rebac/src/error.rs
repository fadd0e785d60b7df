use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Depth budget of {budget} exhausted")]
    DepthExceeded { budget: u32 },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Write conflict on tenant {0}")]
    Conflict(String),

    #[error("Snapshot {requested} is no longer retained (oldest retained is {oldest})")]
    StaleSnapshot { requested: u64, oldest: u64 },

    #[error("Check deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::InvalidTuple(_) | Self::Config(_) => {
                ErrorKind::InvalidArgument
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::SchemaMismatch(_) | Self::InvalidSchema(_) => ErrorKind::SchemaMismatch,
            Self::DepthExceeded { .. } => ErrorKind::DepthExceeded,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::StaleSnapshot { .. } => ErrorKind::StaleSnapshot,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Transport-agnostic classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    SchemaMismatch,
    DepthExceeded,
    StoreUnavailable,
    Conflict,
    StaleSnapshot,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    /// Transient storage failures; writes are idempotent so a retry is safe.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::Conflict)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::SchemaMismatch => "schema_mismatch",
            Self::DepthExceeded => "depth_exceeded",
            Self::StoreUnavailable => "store_unavailable",
            Self::Conflict => "conflict",
            Self::StaleSnapshot => "stale_snapshot",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
