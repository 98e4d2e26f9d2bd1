//! Archive Creation
//!
//! Packs one target's source directory into a gzip-compressed tar file in the
//! output directory. Entries are stored under the target name, so extracting
//! `app-20240101-000000.tar.gz` yields an `app/` directory.
//!
//! Writes go to a `.partial` file that is renamed into place only after the
//! gzip stream is finished and synced. A process killed mid-write leaves the
//! `.partial` behind, and nothing else ever treats it as an artifact.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use tar::{Builder, Header};
use walkdir::WalkDir;

use crate::config::BackupTarget;

// =============================================================================
// Constants
// =============================================================================

/// Extension of finished archives
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Extension of archives still being written
pub const PARTIAL_EXTENSION: &str = ".partial";

/// Timestamp layout embedded in archive file names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Upper bound on `-N` suffixes tried for a single name
const NAME_COLLISIONS_COUNT_MAX: u32 = 1000;

const DIGEST_BUFFER_BYTES: usize = 64 * 1024;

// =============================================================================
// Types
// =============================================================================

/// One compressed archive of one target at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the archive file
    pub sha256: String,
}

impl ArchiveArtifact {
    /// File name component of the local path
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Archive file name for a target at `now`, before collision handling.
pub fn archive_file_name(target: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}{}", target, now.format(TIMESTAMP_FORMAT), ARCHIVE_EXTENSION)
}

/// Ordering key parsed from an archive file name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchiveName {
    /// `YYYYmmdd-HHMMSS`, sorts chronologically as text
    pub timestamp: String,
    /// Collision suffix, 0 when absent
    pub sequence: u32,
}

impl ArchiveName {
    /// Creation time encoded in the name
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|t| t.and_utc())
    }
}

/// Parse `file_name` as a finished archive of `target`.
pub fn parse_archive_name(target: &str, file_name: &str) -> Option<ArchiveName> {
    let stem = file_name.strip_suffix(ARCHIVE_EXTENSION)?;
    let rest = stem.strip_prefix(target)?.strip_prefix('-')?;

    // `<date>-<time>` optionally followed by `-<n>`
    let mut parts = rest.split('-');
    let date = parts.next().filter(|d| is_digits(d, 8))?;
    let time = parts.next().filter(|t| is_digits(t, 6))?;
    let sequence = match parts.next() {
        None => 0,
        Some(n) => n.parse::<u32>().ok().filter(|_| is_digits(n, n.len()))?,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ArchiveName {
        timestamp: format!("{date}-{time}"),
        sequence,
    })
}

/// Whether `file_name` is a finished archive belonging to `target`.
pub fn is_archive_of(target: &str, file_name: &str) -> bool {
    parse_archive_name(target, file_name).is_some()
}

fn is_digits(s: &str, len: usize) -> bool {
    !s.is_empty() && s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

// =============================================================================
// Archiving
// =============================================================================

/// Create a `.tar.gz` of `target` inside `output_dir`.
///
/// Blocking; callers on an async runtime should run this on the blocking pool.
pub fn create_archive(
    target: &BackupTarget,
    output_dir: &Path,
    now: DateTime<Utc>,
) -> Result<ArchiveArtifact, ArchiveError> {
    check_source(&target.source_dir)?;
    fs::create_dir_all(output_dir).map_err(|source| ArchiveError::Write {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let final_path = unused_archive_path(output_dir, &target.name, now)?;
    let partial_path = partial_path_for(&final_path);

    tracing::debug!(
        target_name = %target.name,
        source = %target.source_dir.display(),
        path = %final_path.display(),
        "Writing archive"
    );

    let result = write_tar_gz(&target.name, &target.source_dir, &partial_path)
        .and_then(|skipped| {
            fs::rename(&partial_path, &final_path).map_err(|source| ArchiveError::Write {
                path: final_path.clone(),
                source,
            })?;
            Ok(skipped)
        });
    let skipped = match result {
        Ok(skipped) => skipped,
        Err(e) => {
            let _ = fs::remove_file(&partial_path);
            return Err(e);
        }
    };
    if skipped > 0 {
        tracing::warn!(target_name = %target.name, skipped, "Some entries could not be archived");
    }

    let size_bytes = fs::metadata(&final_path)
        .map_err(|source| ArchiveError::Write {
            path: final_path.clone(),
            source,
        })?
        .len();
    let sha256 = sha256_file(&final_path).map_err(|source| ArchiveError::Write {
        path: final_path.clone(),
        source,
    })?;

    Ok(ArchiveArtifact {
        target: target.name.clone(),
        created_at: now,
        path: final_path,
        size_bytes,
        sha256,
    })
}

/// Describe an archive already sitting in the output directory.
///
/// Size and digest are recomputed from the file. The creation time comes from
/// the name, or the file's mtime when the name does not carry a valid one.
pub fn load_artifact(target: &str, path: &Path) -> io::Result<ArchiveArtifact> {
    let metadata = fs::metadata(path)?;
    let created_at = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| parse_archive_name(target, n))
        .and_then(|name| name.created_at());
    let created_at = match created_at {
        Some(t) => t,
        None => DateTime::<Utc>::from(metadata.modified()?),
    };
    Ok(ArchiveArtifact {
        target: target.to_string(),
        created_at,
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        sha256: sha256_file(path)?,
    })
}

/// Remove `.partial` leftovers from interrupted runs.
///
/// Returns the number of files removed.
pub fn remove_partial_files(output_dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let is_partial = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.ends_with(PARTIAL_EXTENSION));
        if is_partial && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            tracing::info!(path = %entry.path().display(), "Removed interrupted archive");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUFFER_BYTES];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn check_source(source_dir: &Path) -> Result<(), ArchiveError> {
    let access = |source| ArchiveError::SourceAccess {
        path: source_dir.to_path_buf(),
        source,
    };
    let metadata = fs::metadata(source_dir).map_err(access)?;
    if !metadata.is_dir() {
        return Err(access(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a directory",
        )));
    }
    // Listing catches directories we can stat but not read.
    fs::read_dir(source_dir).map_err(access)?;
    Ok(())
}

/// First name not taken by a finished or in-progress archive.
fn unused_archive_path(
    output_dir: &Path,
    target: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf, ArchiveError> {
    let base = archive_file_name(target, now);
    let stem = base.trim_end_matches(ARCHIVE_EXTENSION);
    let taken = |p: &Path| p.exists() || partial_path_for(p).exists();

    let candidate = output_dir.join(&base);
    if !taken(&candidate) {
        return Ok(candidate);
    }
    for n in 1..=NAME_COLLISIONS_COUNT_MAX {
        let candidate = output_dir.join(format!("{stem}-{n}{ARCHIVE_EXTENSION}"));
        if !taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ArchiveError::NameExhausted(base))
}

fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_EXTENSION);
    PathBuf::from(name)
}

/// Stream the tree into `dest`. Returns the count of entries skipped.
fn write_tar_gz(name: &str, source_dir: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let write_err = |source| ArchiveError::Write {
        path: dest.to_path_buf(),
        source,
    };

    let file = File::create(dest).map_err(write_err)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut skipped = 0;
    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(archive = name, "Skipping unreadable entry: {err}");
                skipped += 1;
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        let entry_name = Path::new(name).join(relative);

        if entry.file_type().is_socket_like() {
            tracing::debug!(path = %entry.path().display(), "Skipping socket");
            skipped += 1;
            continue;
        }

        if entry.file_type().is_file() {
            // Nothing is written for a file that cannot be opened.
            let opened = File::open(entry.path()).and_then(|file| {
                let metadata = file.metadata()?;
                Ok((file, metadata))
            });
            let (file, metadata) = match opened {
                Ok(opened) => opened,
                Err(err) => {
                    tracing::warn!(
                        archive = name,
                        path = %entry.path().display(),
                        "Skipping unreadable file: {err}"
                    );
                    skipped += 1;
                    continue;
                }
            };
            // Once the header is out, any failure leaves the stream unusable.
            append_file(&mut builder, &entry_name, file, &metadata).map_err(|source| {
                ArchiveError::Entry {
                    path: entry.path().to_path_buf(),
                    source,
                }
            })?;
            continue;
        }

        // Directories and links fail on metadata, before their header is written.
        if let Err(err) = builder.append_path_with_name(entry.path(), &entry_name) {
            if entry.depth() == 0 {
                return Err(ArchiveError::SourceAccess {
                    path: source_dir.to_path_buf(),
                    source: err,
                });
            }
            tracing::warn!(
                archive = name,
                path = %entry.path().display(),
                "Skipping entry: {err}"
            );
            skipped += 1;
        }
    }

    let encoder = builder.into_inner().map_err(write_err)?;
    let writer = encoder.finish().map_err(write_err)?;
    let file = writer.into_inner().map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)?;
    Ok(skipped)
}

/// Append a regular file whose header size comes from `metadata`.
///
/// Bytes past that size are ignored; running out early is an error.
fn append_file<W: Write>(
    builder: &mut Builder<W>,
    entry_name: &Path,
    file: File,
    metadata: &fs::Metadata,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    builder.append_data(&mut header, entry_name, ExactLen::new(file, metadata.len()))
}

/// Reader that yields exactly `len` bytes or fails with `UnexpectedEof`
struct ExactLen<R> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> ExactLen<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactLen<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Sockets cannot be represented in tar.
trait SocketLike {
    fn is_socket_like(&self) -> bool;
}

impl SocketLike for fs::FileType {
    #[cfg(unix)]
    fn is_socket_like(&self) -> bool {
        use std::os::unix::fs::FileTypeExt;
        self.is_socket()
    }

    #[cfg(not(unix))]
    fn is_socket_like(&self) -> bool {
        false
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Archive creation errors, all recoverable at target granularity
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("source {} is not accessible: {source}", path.display())]
    SourceAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write archive {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to archive {}: {source}", path.display())]
    Entry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no free archive name left for {0}")]
    NameExhausted(String),

    #[error("archive task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    /// Whether the failure came from the source side rather than the output
    pub fn is_source_access(&self) -> bool {
        matches!(self, Self::SourceAccess { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================
