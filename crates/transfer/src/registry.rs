use std::ops::Range;

use mule_protocol::MAX_PARTS;

use crate::TransferError;

// ---------------------------------------------------------------------------
// ChunkLayout
// ---------------------------------------------------------------------------

/// How a file of a given size is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    file_size: u64,
    chunk_size: u64,
    count: u32,
}

impl ChunkLayout {
    /// Computes the layout for `file_size` bytes in `chunk_size` pieces.
    ///
    /// Fails for an empty file, a zero chunk size, or a layout with more
    /// parts than the backend accepts.
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::ZeroChunkSize);
        }
        if file_size == 0 {
            return Err(TransferError::EmptyFile);
        }
        let count = file_size.div_ceil(chunk_size);
        if count > u64::from(MAX_PARTS) {
            return Err(TransferError::TooManyParts {
                count,
                max: MAX_PARTS,
            });
        }
        Ok(Self {
            file_size,
            chunk_size,
            count: count as u32,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks, `ceil(file_size / chunk_size)`; always at least 1.
    pub fn chunk_count(&self) -> u32 {
        self.count
    }

    /// Byte range of chunk `index`, end exclusive.
    ///
    /// Indices past the last chunk yield an empty range at the end of the file.
    pub fn chunk_range(&self, index: u32) -> Range<u64> {
        let start = (u64::from(index) * self.chunk_size).min(self.file_size);
        let end = (start + self.chunk_size).min(self.file_size);
        start..end
    }

    pub fn chunk_len(&self, index: u32) -> u64 {
        let range = self.chunk_range(index);
        range.end - range.start
    }

    pub fn is_last(&self, index: u32) -> bool {
        index + 1 == self.count
    }
}

// ---------------------------------------------------------------------------
// Chunk state
// ---------------------------------------------------------------------------

/// Status of one chunk, derived from its `uploading` and `uploaded` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Uploaded,
}

#[derive(Debug, Clone, Default)]
struct ChunkState {
    uploading: bool,
    uploaded: bool,
    bytes_transferred: u64,
    remote_etag: Option<String>,
}

impl ChunkState {
    fn eligible(&self) -> bool {
        !self.uploaded && !self.uploading
    }
}

/// A byte-count change of one chunk, with the aggregate it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub index: u32,
    pub loaded: u64,
    pub length: u64,
    pub total_loaded: u64,
    pub total_size: u64,
}

/// Callback invoked on every [`ChunkRegistry::set_bytes_transferred`].
pub type ProgressObserver = Box<dyn Fn(ChunkProgress) + Send + Sync>;

/// A chunk the backend has confirmed, as found by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedChunk {
    pub index: u32,
    pub etag: Option<String>,
}

// ---------------------------------------------------------------------------
// ChunkRegistry
// ---------------------------------------------------------------------------

/// Authoritative table of chunk status and transferred bytes.
///
/// The running total is adjusted by each change's delta, so reading it is
/// O(1) and it always equals the sum of every chunk's `bytes_transferred`.
pub struct ChunkRegistry {
    layout: ChunkLayout,
    chunks: Vec<ChunkState>,
    total_loaded: u64,
    observer: Option<ProgressObserver>,
}

impl std::fmt::Debug for ChunkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRegistry")
            .field("layout", &self.layout)
            .field("chunks", &self.chunks)
            .field("total_loaded", &self.total_loaded)
            .finish_non_exhaustive()
    }
}

impl ChunkRegistry {
    /// Creates a registry with every chunk pending.
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout,
            chunks: vec![ChunkState::default(); layout.chunk_count() as usize],
            total_loaded: 0,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: ProgressObserver) {
        self.observer = Some(observer);
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn chunk_count(&self) -> u32 {
        self.layout.chunk_count()
    }

    pub fn chunk_range(&self, index: u32) -> Range<u64> {
        self.layout.chunk_range(index)
    }

    pub fn chunk_len(&self, index: u32) -> u64 {
        self.layout.chunk_len(index)
    }

    pub fn status(&self, index: u32) -> Option<ChunkStatus> {
        self.chunks.get(index as usize).map(|c| {
            if c.uploaded {
                ChunkStatus::Uploaded
            } else if c.uploading {
                ChunkStatus::Uploading
            } else {
                ChunkStatus::Pending
            }
        })
    }

    pub fn bytes_transferred(&self, index: u32) -> u64 {
        self.chunks
            .get(index as usize)
            .map_or(0, |c| c.bytes_transferred)
    }

    pub fn remote_etag(&self, index: u32) -> Option<&str> {
        self.chunks
            .get(index as usize)
            .and_then(|c| c.remote_etag.as_deref())
    }

    /// Sum of every chunk's transferred bytes.
    pub fn total_loaded(&self) -> u64 {
        self.total_loaded
    }

    pub fn total_size(&self) -> u64 {
        self.layout.file_size()
    }

    /// Number of chunks currently flagged as uploading.
    pub fn uploading_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.uploading).count()
    }

    /// Indices of uploaded chunks, ascending.
    pub fn uploaded_indices(&self) -> Vec<u32> {
        (0..self.chunk_count())
            .filter(|&i| self.chunks[i as usize].uploaded)
            .collect()
    }

    fn apply_bytes(&mut self, index: u32, bytes: u64) -> u64 {
        let len = self.layout.chunk_len(index);
        let Some(chunk) = self.chunks.get_mut(index as usize) else {
            return 0;
        };
        let bytes = bytes.min(len);
        let old = chunk.bytes_transferred;
        chunk.bytes_transferred = bytes;
        if bytes >= old {
            self.total_loaded += bytes - old;
        } else {
            self.total_loaded -= old - bytes;
        }
        bytes
    }

    /// Records `bytes` sent for chunk `index` (clamped to the chunk length)
    /// and notifies the observer. Passing 0 resets the chunk after a failure.
    pub fn set_bytes_transferred(&mut self, index: u32, bytes: u64) -> Option<ChunkProgress> {
        if index >= self.chunk_count() {
            return None;
        }
        let loaded = self.apply_bytes(index, bytes);
        let progress = ChunkProgress {
            index,
            loaded,
            length: self.layout.chunk_len(index),
            total_loaded: self.total_loaded,
            total_size: self.layout.file_size(),
        };
        if let Some(observer) = &self.observer {
            observer(progress);
        }
        Some(progress)
    }

    pub fn mark_uploading(&mut self, index: u32) {
        if let Some(chunk) = self.chunks.get_mut(index as usize) {
            chunk.uploading = true;
        }
    }

    /// Clears the uploading flag; the uploaded flag is left as is.
    pub fn clear_uploading(&mut self, index: u32) {
        if let Some(chunk) = self.chunks.get_mut(index as usize) {
            chunk.uploading = false;
        }
    }

    /// Marks chunk `index` uploaded with its full length transferred.
    pub fn mark_uploaded(&mut self, index: u32, etag: Option<String>) {
        if index >= self.chunk_count() {
            return;
        }
        self.apply_bytes(index, u64::MAX);
        let chunk = &mut self.chunks[index as usize];
        chunk.uploaded = true;
        chunk.uploading = false;
        chunk.remote_etag = etag;
    }

    /// Returns chunk `index` to pending with nothing transferred.
    pub fn mark_pending(&mut self, index: u32) {
        if index >= self.chunk_count() {
            return;
        }
        self.apply_bytes(index, 0);
        let chunk = &mut self.chunks[index as usize];
        chunk.uploaded = false;
        chunk.uploading = false;
        chunk.remote_etag = None;
    }

    /// Next chunk that is neither uploaded nor uploading.
    ///
    /// `preferred` wins when it is eligible; otherwise the lowest eligible
    /// index is returned.
    pub fn next_eligible(&self, preferred: Option<u32>) -> Option<u32> {
        if let Some(p) = preferred
            && self.chunks.get(p as usize).is_some_and(ChunkState::eligible)
        {
            return Some(p);
        }
        self.chunks
            .iter()
            .position(ChunkState::eligible)
            .map(|i| i as u32)
    }

    /// True iff every chunk is uploaded and none is uploading.
    pub fn all_uploaded(&self) -> bool {
        self.chunks.iter().all(|c| c.uploaded && !c.uploading)
    }

    /// Makes the registry match the backend's confirmed chunks.
    ///
    /// Confirmed chunks become uploaded with their full length; every other
    /// chunk, including one flagged as uploading, returns to pending.
    pub fn reconcile(&mut self, confirmed: &[ConfirmedChunk]) {
        let mut keep: Vec<Option<Option<String>>> = vec![None; self.chunks.len()];
        for c in confirmed {
            if let Some(slot) = keep.get_mut(c.index as usize) {
                *slot = Some(c.etag.clone());
            }
        }
        for (index, slot) in keep.into_iter().enumerate() {
            let index = index as u32;
            match slot {
                Some(etag) => self.mark_uploaded(index, etag),
                None => self.mark_pending(index),
            }
        }
    }

    /// Resets every in-flight chunk to pending with 0 bytes; returns their indices.
    pub fn abort_in_flight(&mut self) -> Vec<u32> {
        let in_flight: Vec<u32> = (0..self.chunk_count())
            .filter(|&i| self.chunks[i as usize].uploading)
            .collect();
        for &index in &in_flight {
            self.clear_uploading(index);
            self.apply_bytes(index, 0);
        }
        in_flight
    }

    /// Returns every chunk to pending and the total to zero.
    pub fn reset(&mut self) {
        self.chunks.fill(ChunkState::default());
        self.total_loaded = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn registry(size: u64, chunk: u64) -> ChunkRegistry {
        ChunkRegistry::new(ChunkLayout::new(size, chunk).unwrap())
    }

    fn sum(reg: &ChunkRegistry) -> u64 {
        (0..reg.chunk_count()).map(|i| reg.bytes_transferred(i)).sum()
    }

    #[test]
    fn ten_mib_in_six_mib_chunks() {
        let layout = ChunkLayout::new(10 * MIB, 6 * MIB).unwrap();
        assert_eq!(layout.chunk_count(), 2);
        assert_eq!(layout.chunk_len(0), 6 * MIB);
        assert_eq!(layout.chunk_len(1), 4 * MIB);
        assert_eq!(layout.chunk_range(1), 6 * MIB..10 * MIB);
        assert!(layout.is_last(1));
        assert!(!layout.is_last(0));
    }

    #[test]
    fn last_chunk_length_is_in_bounds() {
        for size in 1..=50u64 {
            for chunk in 1..=12u64 {
                let layout = ChunkLayout::new(size, chunk).unwrap();
                let n = layout.chunk_count() as u64;
                assert_eq!(n, size.div_ceil(chunk));
                let last = layout.chunk_len(layout.chunk_count() - 1);
                assert_eq!(last, size - chunk * (n - 1));
                assert!(last > 0 && last <= chunk);
            }
        }
    }

    #[test]
    fn exact_multiple_has_full_last_chunk() {
        let layout = ChunkLayout::new(12 * MIB, 6 * MIB).unwrap();
        assert_eq!(layout.chunk_count(), 2);
        assert_eq!(layout.chunk_len(1), 6 * MIB);
    }

    #[test]
    fn layout_rejects_degenerate_input() {
        assert!(matches!(ChunkLayout::new(0, 10), Err(TransferError::EmptyFile)));
        assert!(matches!(ChunkLayout::new(10, 0), Err(TransferError::ZeroChunkSize)));
        assert!(matches!(
            ChunkLayout::new(10_001, 1),
            Err(TransferError::TooManyParts { count: 10_001, .. })
        ));
        assert!(ChunkLayout::new(10_000, 1).is_ok());
    }

    #[test]
    fn next_eligible_prefers_then_scans() {
        let mut reg = registry(40, 10);
        assert_eq!(reg.next_eligible(None), Some(0));
        assert_eq!(reg.next_eligible(Some(2)), Some(2));

        reg.mark_uploading(0);
        reg.mark_uploaded(1, None);
        assert_eq!(reg.next_eligible(None), Some(2));
        assert_eq!(reg.next_eligible(Some(0)), Some(2));
        assert_eq!(reg.next_eligible(Some(1)), Some(2));
        assert_eq!(reg.next_eligible(Some(99)), Some(2));
    }

    #[test]
    fn next_eligible_none_when_everything_done_or_busy() {
        let mut reg = registry(30, 10);
        reg.mark_uploaded(0, None);
        reg.mark_uploading(1);
        reg.mark_uploading(2);
        assert_eq!(reg.next_eligible(None), None);
        assert!(!reg.all_uploaded());

        reg.mark_uploaded(1, None);
        reg.mark_uploaded(2, None);
        assert_eq!(reg.next_eligible(None), None);
        assert!(reg.all_uploaded());
    }

    #[test]
    fn all_uploaded_requires_no_uploading_flag() {
        let mut reg = registry(10, 10);
        reg.mark_uploaded(0, None);
        reg.mark_uploading(0);
        assert!(!reg.all_uploaded());
        reg.clear_uploading(0);
        assert!(reg.all_uploaded());
    }

    #[test]
    fn total_tracks_sum_and_drops_on_failure() {
        let mut reg = registry(25, 10);
        reg.set_bytes_transferred(0, 7);
        reg.set_bytes_transferred(1, 4);
        reg.set_bytes_transferred(2, 100);
        assert_eq!(reg.bytes_transferred(2), 5);
        assert_eq!(reg.total_loaded(), 16);
        assert_eq!(reg.total_loaded(), sum(&reg));

        let before = reg.total_loaded();
        let prior = reg.bytes_transferred(1);
        reg.set_bytes_transferred(1, 0);
        assert_eq!(reg.total_loaded(), before - prior);
        assert_eq!(reg.total_loaded(), sum(&reg));

        reg.mark_uploaded(0, Some("\"e\"".into()));
        assert_eq!(reg.total_loaded(), 15);
        assert_eq!(reg.remote_etag(0), Some("\"e\""));
    }

    #[test]
    fn observer_sees_every_update() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut reg = registry(15, 10);
        reg.set_observer(Box::new(move |p| sink.lock().unwrap().push(p)));

        reg.set_bytes_transferred(1, 3);
        reg.set_bytes_transferred(1, 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            ChunkProgress {
                index: 1,
                loaded: 3,
                length: 5,
                total_loaded: 3,
                total_size: 15,
            }
        );
        assert_eq!(seen[1].total_loaded, 0);
    }

    #[test]
    fn uploading_flag_does_not_touch_uploaded() {
        let mut reg = registry(20, 10);
        reg.mark_uploaded(0, None);
        reg.mark_uploading(0);
        reg.clear_uploading(0);
        assert_eq!(reg.status(0), Some(ChunkStatus::Uploaded));
        reg.mark_uploading(1);
        assert_eq!(reg.status(1), Some(ChunkStatus::Uploading));
        assert_eq!(reg.status(2), None);
    }

    #[test]
    fn reconcile_with_identical_list_changes_nothing() {
        let mut reg = registry(30, 10);
        reg.mark_uploaded(0, Some("a".into()));
        reg.mark_uploaded(2, Some("c".into()));
        let confirmed = vec![
            ConfirmedChunk {
                index: 0,
                etag: Some("a".into()),
            },
            ConfirmedChunk {
                index: 2,
                etag: Some("c".into()),
            },
        ];
        reg.reconcile(&confirmed);
        assert_eq!(reg.uploaded_indices(), vec![0, 2]);
        assert_eq!(reg.status(1), Some(ChunkStatus::Pending));
        assert_eq!(reg.total_loaded(), 20);
    }

    #[test]
    fn reconcile_reverts_missing_chunks() {
        let mut reg = registry(30, 10);
        for i in 0..3 {
            reg.mark_uploaded(i, None);
        }
        reg.reconcile(&[
            ConfirmedChunk { index: 0, etag: None },
            ConfirmedChunk { index: 2, etag: None },
            ConfirmedChunk { index: 7, etag: None },
        ]);
        assert_eq!(reg.status(1), Some(ChunkStatus::Pending));
        assert_eq!(reg.bytes_transferred(1), 0);
        assert_eq!(reg.next_eligible(None), Some(1));
        assert_eq!(reg.total_loaded(), sum(&reg));
    }

    #[test]
    fn abort_in_flight_resets_only_uploading() {
        let mut reg = registry(40, 10);
        reg.mark_uploaded(0, None);
        reg.mark_uploading(1);
        reg.set_bytes_transferred(1, 6);
        reg.mark_uploading(3);
        reg.set_bytes_transferred(3, 2);

        assert_eq!(reg.abort_in_flight(), vec![1, 3]);
        assert_eq!(reg.uploading_count(), 0);
        assert_eq!(reg.total_loaded(), 10);
        assert_eq!(reg.status(0), Some(ChunkStatus::Uploaded));
    }

    #[test]
    fn reset_clears_everything() {
        let mut reg = registry(20, 10);
        reg.mark_uploaded(0, None);
        reg.mark_uploading(1);
        reg.reset();
        assert_eq!(reg.total_loaded(), 0);
        assert_eq!(reg.next_eligible(None), Some(0));
        assert!(reg.uploaded_indices().is_empty());
    }
}
