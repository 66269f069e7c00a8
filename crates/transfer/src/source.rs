use std::fs::File;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mule_protocol::FileIdentity;

use crate::TransferError;

/// Future returned by [`ByteSource::slice`].
pub type SliceFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + 'a>>;

/// Random-access bytes of the file being uploaded.
pub trait ByteSource: Send + Sync {
    /// Name, size, modification time and MIME type of the file.
    fn identity(&self) -> &FileIdentity;

    /// Reads the bytes in `range` (end exclusive).
    fn slice(&self, range: Range<u64>) -> SliceFuture<'_>;
}

fn check_range(range: &Range<u64>, size: u64) -> Result<(), TransferError> {
    if range.start > range.end || range.end > size {
        return Err(TransferError::OutOfRange {
            start: range.start,
            end: range.end,
            size,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// A byte source held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    identity: FileIdentity,
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<u8>, last_modified: DateTime<Utc>) -> Self {
        Self {
            identity: FileIdentity {
                name: name.into(),
                size: data.len() as u64,
                last_modified,
                mime_type: String::new(),
            },
            data: Arc::new(data),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.identity.mime_type = mime_type.into();
        self
    }
}

impl ByteSource for MemorySource {
    fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    fn slice(&self, range: Range<u64>) -> SliceFuture<'_> {
        Box::pin(async move {
            check_range(&range, self.identity.size)?;
            Ok(self.data[range.start as usize..range.end as usize].to_vec())
        })
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A byte source backed by a file on disk.
///
/// Reads run on the blocking pool; concurrent slices share one handle and
/// take turns seeking.
#[derive(Debug, Clone)]
pub struct FileSource {
    identity: FileIdentity,
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl FileSource {
    /// Opens `path` and captures its identity from the file metadata.
    pub fn open(path: &Path, mime_type: Option<&str>) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            identity: FileIdentity {
                name,
                size: metadata.len(),
                last_modified,
                mime_type: mime_type.unwrap_or_default().to_string(),
            },
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    fn slice(&self, range: Range<u64>) -> SliceFuture<'_> {
        let file = Arc::clone(&self.file);
        let size = self.identity.size;
        Box::pin(async move {
            check_range(&range, size)?;
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>, TransferError> {
                let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
                file.seek(SeekFrom::Start(range.start))?;
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.read_exact(&mut buf)?;
                Ok(buf)
            })
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
        })
    }
}
