//! Wire types shared by the uploader and its collaborators.
//!
//! Two wire formats meet here: the JSON spoken by the signing service
//! ([`messages`]) and the XML documents of the S3 multipart-upload API
//! ([`xml`]). Plain data types used on both sides live in [`types`].

pub mod messages;
pub mod types;
pub mod xml;

pub use types::{
    Acl, FileIdentity, InitGrant, ManifestEntry, PartInfo, PartsPage, ResumeHint, Signature,
    SignatureBundle, SignatureKind, chunk_index, part_number,
};
pub use xml::S3ErrorCode;

/// Largest part count the backend accepts for one multipart upload.
pub const MAX_PARTS: u32 = 10_000;

/// Smallest part size the backend accepts for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced while decoding wire documents.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing <{0}> element")]
    MissingElement(&'static str),

    #[error("invalid <{tag}> value: {value}")]
    InvalidValue { tag: &'static str, value: String },

    #[error("body is not valid UTF-8")]
    NotUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
