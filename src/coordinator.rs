//! Backup-Cycle Coordinator
//!
//! One cycle is a sequential pass over every configured target:
//!
//! 1. re-upload archives left unconfirmed by earlier cycles, oldest first
//! 2. archive the source directory into the output directory
//! 3. upload the archive to `prefix/target/file_name`
//! 4. on confirmation, write the receipt and apply local retention
//!
//! Any failure is contained to its target. The cycle logs it and moves on, so
//! one broken volume never stops the others from being backed up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::archive::{self, ArchiveArtifact, ArchiveError};
use crate::config::{BackupTarget, Config};
use crate::retention::{self, RetentionPolicy, UploadReceipt};
use crate::store::{object_key, ObjectStore, UploadError};

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to one target during a cycle
#[derive(Debug)]
pub enum TargetOutcome {
    /// Archived, uploaded and confirmed
    Uploaded {
        artifact: ArchiveArtifact,
        key: String,
        /// Local archives deleted by retention afterwards
        pruned: Vec<PathBuf>,
        /// Keys of earlier archives uploaded again this cycle
        resent: Vec<String>,
    },
    /// Archived, but the upload failed; the local file is retained
    UploadFailed {
        artifact: ArchiveArtifact,
        key: String,
        error: UploadError,
    },
    /// No archive was produced
    ArchiveFailed { error: ArchiveError },
    /// Shutdown was requested before this target was reached
    Skipped,
}

impl TargetOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, Self::Uploaded { .. })
    }

    /// The archive produced for the target, if any
    pub fn artifact(&self) -> Option<&ArchiveArtifact> {
        match self {
            Self::Uploaded { artifact, .. } | Self::UploadFailed { artifact, .. } => Some(artifact),
            Self::ArchiveFailed { .. } | Self::Skipped => None,
        }
    }
}

/// Per-target results of one cycle, in processing order
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(String, TargetOutcome)>,
}

impl CycleReport {
    pub fn uploaded_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_uploaded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| {
                matches!(
                    o,
                    TargetOutcome::UploadFailed { .. } | TargetOutcome::ArchiveFailed { .. }
                )
            })
            .count()
    }

    /// True when every target was uploaded
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_uploaded())
    }

    pub fn outcome(&self, target: &str) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|(name, _)| name == target).map(|(_, o)| o)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs backup cycles against a fixed configuration and object store
pub struct Coordinator {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
}

impl Coordinator {
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one full cycle over every target.
    ///
    /// Never fails as a whole; per-target errors are logged and reported.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_until(|| false).await
    }

    /// Like [`run_cycle`](Self::run_cycle), checking `stop` before each target.
    /// Targets not started when `stop` returns true are reported as skipped.
    pub async fn run_cycle_until<F>(&self, stop: F) -> CycleReport
    where
        F: Fn() -> bool,
    {
        let started = Utc::now();
        tracing::info!(
            targets = self.config.targets.len(),
            destination = %self.store.describe(),
            "Backup started at {}",
            started.format(archive::TIMESTAMP_FORMAT)
        );

        self.clean_partials().await;

        let mut report = CycleReport::default();
        for target in &self.config.targets {
            let outcome = if stop() {
                TargetOutcome::Skipped
            } else {
                self.back_up(target).await
            };
            report.outcomes.push((target.name.clone(), outcome));
        }

        tracing::info!(
            uploaded = report.uploaded_count(),
            failed = report.failed_count(),
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "Backup finished at {}",
            Utc::now().format(archive::TIMESTAMP_FORMAT)
        );
        report
    }

    async fn back_up(&self, target: &BackupTarget) -> TargetOutcome {
        let resent = self.resend_unconfirmed(target).await;

        let artifact = match self.archive(target).await {
            Ok(artifact) => artifact,
            Err(error) => {
                if error.is_source_access() {
                    tracing::warn!(
                        target_name = %target.name,
                        "Skipping target, source unavailable: {error}"
                    );
                } else {
                    tracing::error!(
                        target_name = %target.name,
                        "Skipping target, archive failed: {error}"
                    );
                }
                return TargetOutcome::ArchiveFailed { error };
            }
        };
        tracing::info!(
            target_name = %target.name,
            path = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            "Archived {}",
            target.source_dir.display()
        );

        let destination = &self.config.destination;
        let key = object_key(&destination.prefix, &target.name, artifact.file_name());
        tracing::info!(
            target_name = %target.name,
            key = %key,
            "Uploading to bucket {}",
            destination.bucket
        );

        if let Err(error) = self.store.put_file(&key, &artifact.path).await {
            tracing::error!(
                target_name = %target.name,
                key = %key,
                path = %artifact.path.display(),
                "Upload failed, keeping local archive: {error}"
            );
            return TargetOutcome::UploadFailed { artifact, key, error };
        }
        tracing::info!(
            target_name = %target.name,
            key = %key,
            sha256 = %artifact.sha256,
            "Upload successful"
        );

        let pruned = self.after_upload(target, &artifact, &key);
        TargetOutcome::Uploaded {
            artifact,
            key,
            pruned,
            resent,
        }
    }

    /// Upload archives of `target` that never got a receipt. Stops at the
    /// first failure; the rest wait for the next cycle.
    async fn resend_unconfirmed(&self, target: &BackupTarget) -> Vec<String> {
        let pending = match retention::unconfirmed_archives(&self.config.output_dir, &target.name) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(target_name = %target.name, "Cannot list unconfirmed archives: {e}");
                return Vec::new();
            }
        };
        if !pending.is_empty() {
            tracing::info!(
                target_name = %target.name,
                count = pending.len(),
                "Re-uploading unconfirmed archives"
            );
        }

        let mut resent = Vec::new();
        for path in pending {
            let artifact = match self.load(target, &path).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    tracing::warn!(
                        target_name = %target.name,
                        path = %path.display(),
                        "Cannot read archive: {e}"
                    );
                    continue;
                }
            };
            let key = object_key(
                &self.config.destination.prefix,
                &target.name,
                artifact.file_name(),
            );
            if let Err(error) = self.store.put_file(&key, &artifact.path).await {
                tracing::warn!(target_name = %target.name, key = %key, "Re-upload failed: {error}");
                break;
            }
            tracing::info!(
                target_name = %target.name,
                key = %key,
                sha256 = %artifact.sha256,
                "Re-upload successful"
            );
            self.after_upload(target, &artifact, &key);
            resent.push(key);
        }
        resent
    }

    async fn archive(&self, target: &BackupTarget) -> Result<ArchiveArtifact, ArchiveError> {
        let target = target.clone();
        let output_dir = self.config.output_dir.clone();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || archive::create_archive(&target, &output_dir, now))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))?
    }

    async fn load(
        &self,
        target: &BackupTarget,
        path: &Path,
    ) -> Result<ArchiveArtifact, ArchiveError> {
        let name = target.name.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            archive::load_artifact(&name, &path)
                .map_err(|source| ArchiveError::Write { path, source })
        })
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
    }

    /// Receipt plus retention. Failures here are logged only; the upload
    /// already succeeded.
    fn after_upload(
        &self,
        target: &BackupTarget,
        artifact: &ArchiveArtifact,
        key: &str,
    ) -> Vec<PathBuf> {
        let bucket = &self.config.destination.bucket;
        let receipt = UploadReceipt::new(artifact, bucket, key, Utc::now());
        if let Err(e) = retention::write_receipt(&artifact.path, &receipt) {
            tracing::warn!(target_name = %target.name, "Failed to write upload receipt: {e}");
        }

        if self.config.retention == RetentionPolicy::KeepAll {
            return Vec::new();
        }
        let output_dir = &self.config.output_dir;
        match retention::apply(self.config.retention, output_dir, &target.name, &artifact.path) {
            Ok(pruned) => {
                if !pruned.is_empty() {
                    tracing::info!(
                        target_name = %target.name,
                        count = pruned.len(),
                        "Pruned local archives"
                    );
                }
                pruned
            }
            Err(e) => {
                tracing::warn!(target_name = %target.name, "Retention failed: {e}");
                Vec::new()
            }
        }
    }

    async fn clean_partials(&self) {
        let output_dir = self.config.output_dir.clone();
        let result =
            tokio::task::spawn_blocking(move || archive::remove_partial_files(&output_dir)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Failed to clean interrupted archives: {e}"),
            Err(e) => tracing::warn!("Cleanup task failed: {e}"),
        }
    }
}
