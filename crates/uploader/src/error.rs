//! Upload error types.

use mule_protocol::ProtocolError;
use mule_transfer::TransferError;

use crate::config::ConfigError;
use crate::events::{ErrorInfo, Operation};
use crate::session::SessionState;
use crate::signing::SigningError;
use crate::transport::TransportError;

/// Errors produced by the upload coordinator.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{operation} returned HTTP {status}")]
    Status {
        operation: Operation,
        status: u16,
        body: String,
    },

    #[error("chunk {chunk} stalled")]
    Stalled { chunk: u32 },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("byte source error: {0}")]
    Source(#[source] TransferError),

    #[error("{operation} failed after exhausting retries: {source}")]
    RetryLimitExceeded {
        operation: Operation,
        chunk: Option<u32>,
        #[source]
        source: Box<UploadError>,
    },

    #[error("file rejected: {0}")]
    Validation(#[source] TransferError),

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("completion failed: {message}")]
    CompletionFailed {
        status: Option<u16>,
        message: String,
    },

    #[error("no file selected")]
    NoFileSelected,

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl UploadError {
    /// Whether the retry policy should try again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UploadError::Transport(_)
                | UploadError::Status { .. }
                | UploadError::Stalled { .. }
                | UploadError::Protocol(_)
                | UploadError::Signing(_)
                | UploadError::Source(_)
        )
    }

    /// HTTP status behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Status { status, .. } => Some(*status),
            UploadError::Signing(SigningError::Status { status, .. }) => Some(*status),
            UploadError::CompletionFailed { status, .. } => *status,
            UploadError::RetryLimitExceeded { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Context for the error observer.
    pub fn info(&self) -> ErrorInfo {
        let (operation, chunk) = match self {
            UploadError::RetryLimitExceeded {
                operation, chunk, ..
            } => (Some(*operation), *chunk),
            UploadError::Status { operation, .. } => (Some(*operation), None),
            UploadError::Stalled { chunk } => (Some(Operation::UploadChunk), Some(*chunk)),
            UploadError::Signing(_) => (Some(Operation::Sign), None),
            UploadError::Validation(_) => (Some(Operation::Select), None),
            UploadError::CompletionFailed { .. } => (Some(Operation::Complete), None),
            UploadError::InvalidState { .. } | UploadError::NoFileSelected => {
                (Some(Operation::Start), None)
            }
            _ => (None, None),
        };
        ErrorInfo {
            operation,
            chunk,
            status: self.status(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(UploadError::Stalled { chunk: 1 }.is_transient());
        assert!(UploadError::Transport(TransportError::Timeout).is_transient());
        assert!(!UploadError::Cancelled.is_transient());
        assert!(!UploadError::NoFileSelected.is_transient());
        assert!(!UploadError::Validation(TransferError::EmptyFile).is_transient());
    }

    #[test]
    fn info_unwraps_retry_exhaustion() {
        let err = UploadError::RetryLimitExceeded {
            operation: Operation::UploadChunk,
            chunk: Some(3),
            source: Box::new(UploadError::Status {
                operation: Operation::UploadChunk,
                status: 503,
                body: String::new(),
            }),
        };
        let info = err.info();
        assert_eq!(info.operation, Some(Operation::UploadChunk));
        assert_eq!(info.chunk, Some(3));
        assert_eq!(info.status, Some(503));
        assert!(info.message.contains("exhausting retries"));
    }
}
