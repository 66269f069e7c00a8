//! Events emitted to the embedding application.

use std::fmt;

use mule_protocol::FileIdentity;

use crate::session::SessionState;

/// Backend operation an error or retry relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Start,
    Sign,
    Initiate,
    UploadChunk,
    ListParts,
    Complete,
    HeadObject,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Select => "select",
            Operation::Start => "start",
            Operation::Sign => "sign",
            Operation::Initiate => "initiate",
            Operation::UploadChunk => "upload chunk",
            Operation::ListParts => "list parts",
            Operation::Complete => "complete",
            Operation::HeadObject => "head object",
        };
        f.write_str(name)
    }
}

/// What the error observer receives: enough to drive a manual recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub operation: Option<Operation>,
    pub chunk: Option<u32>,
    /// HTTP status of the underlying failure, when there was one.
    pub status: Option<u16>,
    pub message: String,
}

/// Events sent on the channel returned by `Uploader::take_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// The uploader was constructed.
    Initialized,
    /// Chunk uploads began for this file; sent once per session.
    Started { file: FileIdentity },
    /// Aggregate bytes uploaded out of the file size.
    Progress { loaded: u64, total: u64 },
    ChunkProgress { index: u32, loaded: u64, length: u64 },
    ChunkUploaded { index: u32 },
    Completed { key: String, upload_id: String },
    /// A terminal error; the session stays in its current state.
    Error(ErrorInfo),
    StateChanged { state: SessionState },
}

/// Decides whether a selected file should be taken; `false` declines it.
pub type SelectFilter = Box<dyn Fn(&FileIdentity) -> bool + Send + Sync>;
