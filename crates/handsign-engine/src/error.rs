use std::time::Duration;

use thiserror::Error;

/// Failure of a chat transport call, classified for the retry executor.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Bad request, forbidden, not found: retrying cannot help.
    #[error("transport rejected the call ({status}): {description}")]
    Client { status: u16, description: String },

    /// Rate limiting, server errors, network trouble.
    #[error("transient transport failure: {description}")]
    Transient {
        description: String,
        retry_after: Option<Duration>,
    },

    #[error("transport call timed out")]
    Timeout,

    #[error("transport call cancelled")]
    Cancelled,
}

impl TransportError {
    /// Classify an HTTP-style status code. 429 and 5xx are transient, other 4xx are not.
    pub fn from_status(
        status: u16,
        description: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let description = description.into();
        match status {
            429 => Self::Transient { description, retry_after },
            400..=499 => Self::Client { status, description },
            _ => Self::Transient { description, retry_after },
        }
    }

    pub fn transient(description: impl Into<String>) -> Self {
        Self::Transient {
            description: description.into(),
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint refused the write.
    #[error("conflicting record: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reasons a submitted photo is refused before it touches storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhotoError {
    #[error("photo is too small ({size} bytes, minimum {min})")]
    TooSmall { size: usize, min: usize },

    #[error("photo is too large ({size} bytes, maximum {max})")]
    TooLarge { size: usize, max: usize },

    #[error("unsupported image format")]
    UnsupportedFormat,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid photo: {0}")]
    InvalidPhoto(#[from] PhotoError),

    #[error("no pending verification request")]
    NoPendingRequest,

    #[error("user not found")]
    UserNotFound,

    #[error("verification request not found")]
    RequestNotFound,

    #[error("not a reviewer")]
    NotReviewer,

    #[error("rejection reason must not be empty")]
    EmptyReason,

    /// The request is pending but no photo has been attached yet.
    #[error("no photo has been submitted for this request")]
    NoPhotoSubmitted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("photo storage failed: {0}")]
    PhotoStorage(anyhow::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// Errors caused by the caller's input rather than by the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPhoto(_)
                | Self::NoPendingRequest
                | Self::EmptyReason
                | Self::NoPhotoSubmitted
        )
    }
}
