//! Object Store
//!
//! The upload seam. The coordinator only needs "put this local file under this
//! key and tell me whether the endpoint confirmed it".
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      ObjectStore Trait       │
//! └──────────────────────────────┘
//!        ↑                 ↑
//! ┌──────┴──────┐   ┌──────┴──────┐
//! │   S3Store   │   │ MemoryStore │
//! │ (production)│   │  (testing)  │
//! └─────────────┘   └─────────────┘
//! ```

mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Destination for archive uploads
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `path` under `key`.
    ///
    /// `Ok` means the endpoint acknowledged the object; nothing weaker.
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), UploadError>;

    /// Human-readable destination, for logs
    fn describe(&self) -> String;
}

/// Object key for an archive: `prefix/target/file_name`, skipping an empty
/// prefix and collapsing stray slashes.
pub fn object_key(prefix: &str, target: &str, file_name: &str) -> String {
    [prefix, target, file_name]
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// Errors
// =============================================================================

/// Upload errors; the local archive is always retained when one occurs
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} for {key} failed: {reason}")]
    Request {
        operation: &'static str,
        key: String,
        reason: String,
    },

    #[error("destination rejected {key}: {reason}")]
    Rejected { key: String, reason: String },
}
