//! Storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live.  Every path is scoped by `(owner, filename)`:
//! finalized files live at `<owner>/<filename>` and the in-progress
//! staging file for the same name at `<owner>/.staging/<filename>.part`.

pub mod backend;
pub mod local;
pub mod memory;

use tracing::{debug, warn};

use self::backend::StorageBackend;

/// Reserved per-owner directory holding staging files.
pub const STAGING_DIR: &str = ".staging";

/// Suffix appended to a filename to form its staging file name.
pub const STAGING_SUFFIX: &str = ".part";

/// Longest owner id or filename accepted, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Check that `name` is usable as a single path component under the
/// storage root.
///
/// Owner ids and filenames are joined onto the root verbatim, so anything
/// that could escape the owner's subtree or collide with the staging
/// directory is rejected.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name exceeds {MAX_NAME_LEN} bytes"));
    }
    if name == "." || name == ".." || name == STAGING_DIR {
        return Err(format!("'{name}' is a reserved name"));
    }
    if name.contains(|c: char| matches!(c, '/' | '\\' | '\0')) {
        return Err(format!("'{name}' must not contain path separators"));
    }
    Ok(())
}

/// Delete the staging file for `(owner, filename)`, logging instead of
/// propagating failures.
pub async fn discard_best_effort(storage: &dyn StorageBackend, owner: &str, filename: &str) {
    match storage.discard(owner, filename).await {
        Ok(()) => debug!(owner, filename, "staging file discarded"),
        Err(e) => warn!(owner, filename, error = %e, "failed to discard staging file"),
    }
}

/// Read a whole finalized file into memory.
#[cfg(test)]
pub(crate) async fn read_all(
    storage: &dyn StorageBackend,
    owner: &str,
    filename: &str,
) -> anyhow::Result<Option<bytes::Bytes>> {
    use tokio::io::AsyncReadExt;

    let Some(mut file) = storage.open(owner, filename).await? else {
        return Ok(None);
    };
    let mut data = Vec::new();
    file.reader.read_to_end(&mut data).await?;
    Ok(Some(data.into()))
}

/// Reader over an in-memory buffer.
#[cfg(test)]
pub(crate) fn reader(data: impl Into<bytes::Bytes>) -> backend::ByteReader {
    Box::pin(std::io::Cursor::new(data.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_accepts_plain_names() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(validate_name(".bashrc").is_ok());
        assert!(validate_name("with spaces and ümlauts.txt").is_ok());
    }

    #[test]
    fn test_validate_name_rejects_traversal() {
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("nul\0byte").is_err());
        assert!(validate_name(STAGING_DIR).is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
