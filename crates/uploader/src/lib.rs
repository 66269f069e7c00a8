//! Resumable multipart uploads to S3-style object storage.
//!
//! This crate is the **coordinator**: it owns the session state machine,
//! the chunk scheduler, retry and stall handling, resume reconciliation and
//! the completion handshake. Network access goes through two seams the
//! embedding application provides: a [`Transport`] for storage requests and
//! a [`SigningService`] that authorizes them.
//!
//! # Lifecycle
//!
//! 1. **Select**: validate the file and build its chunk registry
//! 2. **Prepare**: initiate a multipart upload or reconcile an existing one
//! 3. **Upload**: send chunks through a bounded pool of workers
//! 4. **Finish**: re-list parts and submit the completion manifest

pub mod config;
pub mod error;
pub mod events;
pub mod signing;
pub mod transport;
pub mod uploader;

mod completion;
mod reconcile;
mod retry;
mod s3;
mod scheduler;
mod session;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, UploaderConfig};
pub use error::UploadError;
pub use events::{ErrorInfo, Operation, SelectFilter, UploadEvent};
pub use session::SessionState;
pub use signing::{SignFuture, SignatureCache, SigningError, SigningParams, SigningService};
pub use transport::{
    HttpRequest, HttpResponse, Method, ProgressSender, SendFuture, Transport, TransportError,
};
pub use uploader::{Selection, UploadOutcome, Uploader};
