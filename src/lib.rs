//! volume-backup - Periodic Docker volume backups to S3-compatible storage
//!
//! Runs as a container's foreground process. Every interval it archives each
//! configured source directory to `<target>-<timestamp>.tar.gz`, uploads the
//! archive to `S3_PREFIX/<target>/`, and prunes confirmed local archives.
//!
//! ```text
//! Config ──► Scheduler ──► Coordinator ──┬──► archive   (tar + gzip)
//!                                        ├──► store     (S3 PUT)
//!                                        └──► retention (receipts, pruning)
//! ```

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod retention;
pub mod scheduler;
pub mod store;

pub use archive::{ArchiveArtifact, ArchiveError};
pub use config::{BackupTarget, Config, ConfigError, UploadDestination};
pub use coordinator::{Coordinator, CycleReport, TargetOutcome};
pub use retention::{RetentionPolicy, UploadReceipt};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, ObjectStore, S3Store, UploadError};

/// Application name
pub const APP_NAME: &str = "volume-backup";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log file written inside the output directory
pub const LOG_FILE_NAME: &str = "backup.log";
