use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::store::StoreError;

/// Failures surfaced by admission and by the pack worker.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("{message}")]
    InvalidRequest {
        message: String,
        url: Option<String>,
    },
    #[error("not found")]
    NotFound,
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid extension: {0}")]
    InvalidExtension(String),
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to enqueue pack job: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("archive error in {url}: {reason}")]
    Archive { url: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("pack cancelled")]
    Cancelled,
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        PackError::InvalidRequest {
            message: message.into(),
            url: None,
        }
    }

    pub fn invalid_url(message: impl Into<String>, url: &str) -> Self {
        PackError::InvalidRequest {
            message: message.into(),
            url: Some(url.to_string()),
        }
    }

    pub fn store(context: &'static str, source: StoreError) -> Self {
        PackError::Store { context, source }
    }

    /// Errors the caller caused, as opposed to storage or network trouble.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PackError::InvalidRequest { .. }
                | PackError::NotFound
                | PackError::InvalidStatus(_)
                | PackError::InvalidPath(_)
                | PackError::InvalidExtension(_)
                | PackError::InvalidLocation(_)
        )
    }
}
