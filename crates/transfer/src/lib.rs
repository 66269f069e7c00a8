//! Chunked multipart transfer: file layout, per-chunk state and byte sources.
//!
//! A file is cut into fixed-size chunks (the last one may be shorter). The
//! [`ChunkRegistry`] is the single table of which chunks are pending,
//! uploading or uploaded, and how many bytes of each have been sent.

mod registry;
mod source;
mod validation;

pub use registry::{
    ChunkLayout, ChunkProgress, ChunkRegistry, ChunkStatus, ConfirmedChunk, ProgressObserver,
};
pub use source::{ByteSource, FileSource, MemorySource, SliceFuture};
pub use validation::validate_file;

/// Default chunk size: 6 MiB.
///
/// Comfortably above the backend's 5 MiB minimum for every part but the last.
pub const DEFAULT_CHUNK_SIZE: u64 = 6 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file is empty")]
    EmptyFile,

    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("file is {size} bytes, the limit is {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("extension {extension:?} is not accepted")]
    ExtensionNotAccepted { extension: String },

    #[error("file needs {count} parts, the backend accepts at most {max}")]
    TooManyParts { count: u64, max: u32 },

    #[error("byte range {start}..{end} is outside a {size}-byte file")]
    OutOfRange { start: u64, end: u64, size: u64 },
}
