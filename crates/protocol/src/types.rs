use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a file selected for upload.
///
/// Name, size and modification time together identify a file across
/// sessions; the signing service uses them to find unfinished uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIdentity {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
}

impl FileIdentity {
    /// Modification time as milliseconds since the Unix epoch.
    pub fn last_modified_millis(&self) -> i64 {
        self.last_modified.timestamp_millis()
    }

    /// Lower-cased text after the final `.` of the name, if any.
    pub fn extension(&self) -> Option<String> {
        let (_, ext) = self.name.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }
}

/// Canned ACL applied to the assembled object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Acl {
    Private,
    #[default]
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
    LogDeliveryWrite,
}

impl Acl {
    /// Header value for `x-amz-acl`.
    pub fn as_str(self) -> &'static str {
        match self {
            Acl::Private => "private",
            Acl::PublicRead => "public-read",
            Acl::PublicReadWrite => "public-read-write",
            Acl::AuthenticatedRead => "authenticated-read",
            Acl::BucketOwnerRead => "bucket-owner-read",
            Acl::BucketOwnerFullControl => "bucket-owner-full-control",
            Acl::LogDeliveryWrite => "log-delivery-write",
        }
    }
}

/// An opaque request signature and the request date it was computed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signature: String,
    pub date: String,
}

/// Operation a signature authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    Init,
    /// Upload of one part, by 1-indexed part number.
    Chunk(u32),
    List,
    Finish,
}

/// Signatures for every operation of one upload, fetched in a single round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureBundle {
    /// Keyed by 1-indexed part number.
    pub chunks: HashMap<u32, Signature>,
    pub list: Option<Signature>,
    pub finish: Option<Signature>,
}

impl SignatureBundle {
    /// Flattens the bundle into cache entries.
    pub fn into_entries(self) -> Vec<(SignatureKind, Signature)> {
        let mut entries: Vec<_> = self
            .chunks
            .into_iter()
            .map(|(part, sig)| (SignatureKind::Chunk(part), sig))
            .collect();
        if let Some(sig) = self.list {
            entries.push((SignatureKind::List, sig));
        }
        if let Some(sig) = self.finish {
            entries.push((SignatureKind::Finish, sig));
        }
        entries
    }
}

/// An unfinished upload of the same file that the signing service knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeHint {
    pub upload_id: String,
    pub key: String,
    /// 1-indexed part numbers the service recorded as uploaded.
    pub parts: Vec<u32>,
}

/// Result of asking the signing service to initiate an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitGrant {
    pub signature: Signature,
    pub resume: Option<ResumeHint>,
}

/// One part as recorded by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// One page of a part listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartsPage {
    pub parts: Vec<PartInfo>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// One entry of the completion manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub part_number: u32,
    pub etag: String,
}

impl From<&PartInfo> for ManifestEntry {
    fn from(part: &PartInfo) -> Self {
        Self {
            part_number: part.part_number,
            etag: part.etag.clone(),
        }
    }
}

/// Backend part number (1-indexed) of a chunk index (0-indexed).
pub fn part_number(index: u32) -> u32 {
    index + 1
}

/// Chunk index of a backend part number; `None` for part number 0.
pub fn chunk_index(part_number: u32) -> Option<u32> {
    part_number.checked_sub(1)
}
