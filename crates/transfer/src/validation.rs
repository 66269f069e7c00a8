use mule_protocol::FileIdentity;

use crate::TransferError;
use crate::registry::ChunkLayout;

/// Checks that a file may be uploaded and returns its chunk layout.
///
/// Rejects:
/// - Empty files
/// - Files larger than `max_file_size` (0 means no limit)
/// - Extensions outside `accepted_extensions` (empty means any; compared
///   case-insensitively, without the leading dot)
/// - Layouts with more parts than the backend accepts
pub fn validate_file(
    identity: &FileIdentity,
    chunk_size: u64,
    max_file_size: u64,
    accepted_extensions: &[String],
) -> Result<ChunkLayout, TransferError> {
    if identity.size == 0 {
        return Err(TransferError::EmptyFile);
    }

    if max_file_size > 0 && identity.size > max_file_size {
        return Err(TransferError::TooLarge {
            size: identity.size,
            max: max_file_size,
        });
    }

    if !accepted_extensions.is_empty() {
        let extension = identity.extension().unwrap_or_default();
        let accepted = accepted_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&extension));
        if !accepted {
            return Err(TransferError::ExtensionNotAccepted { extension });
        }
    }

    ChunkLayout::new(identity.size, chunk_size)
}
