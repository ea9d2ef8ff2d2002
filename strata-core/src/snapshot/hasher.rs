//! File fingerprints for change detection and cache keys.

use crate::config::SnapshotMode;
use crate::error::{Result, StrataError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Fingerprint function selected by `--snapshot-mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hasher {
    /// Metadata plus full contents. Catches every change.
    Full,
    /// Metadata plus mtime only; contents are never read. Faster, and wrong
    /// exactly when a tool rewrites a file without touching its mtime.
    Time,
}

impl From<SnapshotMode> for Hasher {
    fn from(mode: SnapshotMode) -> Self {
        match mode {
            SnapshotMode::Full => Hasher::Full,
            SnapshotMode::Time => Hasher::Time,
        }
    }
}

impl Hasher {
    /// Fingerprint `path` without following symlinks.
    pub fn hash(&self, path: &Path) -> Result<String> {
        match self {
            Hasher::Full => hash_with(path, true, true),
            Hasher::Time => hash_with(path, true, false),
        }
    }
}

/// Full-mode fingerprint with mtime excluded. Stable across rebuilds that
/// leave content untouched; used for the cache-key filesystem projection.
pub fn ignore_mtime_hash(path: &Path) -> Result<String> {
    hash_with(path, false, true)
}

fn hash_with(path: &Path, with_mtime: bool, with_contents: bool) -> Result<String> {
    let meta = fs::symlink_metadata(path)
        .map_err(|source| StrataError::Hash { path: path.to_path_buf(), source })?;

    let mut hasher = Sha256::new();
    hasher.update(meta.mode().to_le_bytes());
    hasher.update(meta.uid().to_le_bytes());
    hasher.update(meta.gid().to_le_bytes());
    hasher.update(meta.size().to_le_bytes());
    if with_mtime {
        hasher.update(meta.mtime().to_le_bytes());
        hasher.update(meta.mtime_nsec().to_le_bytes());
    }

    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)
            .map_err(|source| StrataError::Hash { path: path.to_path_buf(), source })?;
        hasher.update(target.as_os_str().as_encoded_bytes());
    } else if with_contents && meta.file_type().is_file() {
        let mut file = fs::File::open(path)
            .map_err(|source| StrataError::Hash { path: path.to_path_buf(), source })?;
        io::copy(&mut file, &mut hasher)
            .map_err(|source| StrataError::Hash { path: path.to_path_buf(), source })?;
    }

    Ok(format!("{:x}", hasher.finalize()))
}
