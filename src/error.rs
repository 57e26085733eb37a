//! Error types shared by the transport, poller and controller.

use crate::model::DownloadKind;
use thiserror::Error;

/// Failure of a single call to the remote job service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote answered with HTTP {status}")]
    Http { status: u16 },

    #[error("resource not found on remote")]
    NotFound,

    #[error("malformed response: {0}")]
    BadResponse(String),
}

impl TransportError {
    /// Connection failures and 5xx answers are transient; everything else is a resolved condition.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Http { status } => (500..600).contains(status),
            TransportError::NotFound | TransportError::BadResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return TransportError::BadResponse(err.to_string());
        }
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::NOT_FOUND {
                return TransportError::NotFound;
            }
            return TransportError::Http {
                status: status.as_u16(),
            };
        }
        TransportError::Network(err.to_string())
    }
}

/// Rejected controller operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("no finished job to download from")]
    NotDone,

    #[error("the remote did not name a {} file for this job", .0.label())]
    NoFile(DownloadKind),
}
