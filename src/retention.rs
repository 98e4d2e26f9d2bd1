//! Local Retention
//!
//! Decides which archives stay in the output directory after an upload.
//!
//! An archive counts as confirmed only when it has an upload receipt, a JSON
//! sidecar written right after the destination acknowledged the object.
//! Pruning never touches an archive without one, so an archive whose upload
//! failed (this cycle or any earlier one, across restarts) stays on disk until
//! a later cycle uploads it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::{parse_archive_name, ArchiveArtifact};

// =============================================================================
// Constants
// =============================================================================

/// Suffix appended to an archive path to form its receipt path
pub const RECEIPT_SUFFIX: &str = ".receipt.json";

// =============================================================================
// Policy
// =============================================================================

/// What to do with local archives once their upload is confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never delete anything
    KeepAll,
    /// Delete every archive whose upload is confirmed
    Purge,
    /// Keep the newest N confirmed archives per target
    KeepLatest(usize),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepLatest(1)
    }
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" | "all" => Ok(Self::KeepAll),
            "purge" => Ok(Self::Purge),
            other => match other.parse::<usize>() {
                Ok(0) => Ok(Self::Purge),
                Ok(n) => Ok(Self::KeepLatest(n)),
                Err(_) => Err(format!("unknown retention policy: {s}")),
            },
        }
    }
}

// =============================================================================
// Receipts
// =============================================================================

/// Proof that an archive reached the destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub target: String,
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadReceipt {
    pub fn new(
        artifact: &ArchiveArtifact,
        bucket: &str,
        key: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target: artifact.target.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256.clone(),
            created_at: artifact.created_at,
            uploaded_at,
        }
    }
}

/// Receipt path for an archive path
pub fn receipt_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.as_os_str().to_os_string();
    name.push(RECEIPT_SUFFIX);
    PathBuf::from(name)
}

/// Persist a receipt next to the archive it describes.
pub fn write_receipt(
    archive_path: &Path,
    receipt: &UploadReceipt,
) -> Result<PathBuf, RetentionError> {
    let path = receipt_path(archive_path);
    let bytes = serde_json::to_vec_pretty(receipt)?;
    fs::write(&path, bytes).map_err(|source| RetentionError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Load the receipt for an archive, if one exists.
pub fn read_receipt(archive_path: &Path) -> Result<Option<UploadReceipt>, RetentionError> {
    let path = receipt_path(archive_path);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RetentionError::Io { path, source }),
    }
}

fn is_confirmed(archive_path: &Path) -> bool {
    receipt_path(archive_path).is_file()
}

// =============================================================================
// Pruning
// =============================================================================

/// Apply `policy` to `target`'s archives after `uploaded` was confirmed.
///
/// Returns the archive paths that were deleted.
pub fn apply(
    policy: RetentionPolicy,
    output_dir: &Path,
    target: &str,
    uploaded: &Path,
) -> Result<Vec<PathBuf>, RetentionError> {
    let doomed = match policy {
        RetentionPolicy::KeepAll => Vec::new(),
        RetentionPolicy::Purge => confirmed_archives(output_dir, target, uploaded)?,
        RetentionPolicy::KeepLatest(keep) => {
            let mut confirmed = confirmed_archives(output_dir, target, uploaded)?;
            let excess = confirmed.len().saturating_sub(keep);
            confirmed.truncate(excess);
            confirmed
        }
    };

    let mut removed = Vec::with_capacity(doomed.len());
    for path in doomed {
        remove_archive(&path)?;
        tracing::debug!(target_name = target, path = %path.display(), "Pruned local archive");
        removed.push(path);
    }
    Ok(removed)
}

/// Archives of `target` without a receipt, oldest first.
pub fn unconfirmed_archives(
    output_dir: &Path,
    target: &str,
) -> Result<Vec<PathBuf>, RetentionError> {
    Ok(archives_of(output_dir, target)?
        .into_iter()
        .filter(|path| !is_confirmed(path))
        .collect())
}

/// Confirmed archives of `target`, oldest first. `uploaded` is treated as
/// confirmed even if writing its receipt failed.
fn confirmed_archives(
    output_dir: &Path,
    target: &str,
    uploaded: &Path,
) -> Result<Vec<PathBuf>, RetentionError> {
    Ok(archives_of(output_dir, target)?
        .into_iter()
        .filter(|path| path == uploaded || is_confirmed(path))
        .collect())
}

/// Every finished archive of `target`, oldest first
fn archives_of(output_dir: &Path, target: &str) -> Result<Vec<PathBuf>, RetentionError> {
    let io_err = |source| RetentionError::Io {
        path: output_dir.to_path_buf(),
        source,
    };

    let mut found = Vec::new();
    for entry in fs::read_dir(output_dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(order) = parse_archive_name(target, &file_name) {
            found.push((order, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

fn remove_archive(path: &Path) -> Result<(), RetentionError> {
    let remove = |p: &Path| match fs::remove_file(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RetentionError::Io {
            path: p.to_path_buf(),
            source,
        }),
    };
    // Archive first; a receipt left without its archive is ignored.
    remove(path)?;
    remove(&receipt_path(path))
}

// =============================================================================
// Errors
// =============================================================================

/// Retention errors; logged, never fatal to a cycle
#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("receipt serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =============================================================================
// Tests
// =============================================================================
