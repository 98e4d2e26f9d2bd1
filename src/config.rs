//! Runtime Configuration
//!
//! Everything the coordinator needs is read once at startup into an immutable
//! [`Config`] and passed explicitly from there on. The process environment is
//! never consulted again after [`Config::from_env`] returns.
//!
//! Keys (all optional except `S3_BUCKET`):
//! - `BACKUP_DIR`, `OUTPUT_DIR`, `BACKUP_TARGETS`
//! - `S3_ENDPOINT`, `S3_BUCKET`, `S3_ACCESS_KEY`, `S3_SECRET_KEY`, `S3_PREFIX`,
//!   `S3_REGION`, `S3_VERIFY_BUCKET`
//! - `SECOND_INTERVAL`, `RUN_ON_START`, `LOCAL_RETENTION`

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retention::RetentionPolicy;

// =============================================================================
// Constants
// =============================================================================

/// Interval used when `SECOND_INTERVAL` is absent or zero
pub const INTERVAL_SECS_DEFAULT: u64 = 3600;

/// Default root of the mounted source volumes
pub const BACKUP_DIR_DEFAULT: &str = "/backup";

/// Default staging directory for produced archives
pub const OUTPUT_DIR_DEFAULT: &str = "/output";

/// Region used for request signing when `S3_REGION` is unset
pub const S3_REGION_DEFAULT: &str = "us-east-1";

/// Maximum target name length in bytes
pub const TARGET_NAME_BYTES_MAX: usize = 128;

// =============================================================================
// Types
// =============================================================================

/// One named source directory to be backed up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    /// Target name, used in archive file names and object keys
    pub name: String,
    /// Directory whose contents are archived
    pub source_dir: PathBuf,
}

impl BackupTarget {
    pub fn new(name: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_dir: source_dir.into(),
        }
    }
}

/// Static access key pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Where archives are uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDestination {
    pub bucket: String,
    /// Key prefix, without leading or trailing slashes
    pub prefix: String,
    /// Custom endpoint URL; `None` means the public AWS endpoint
    pub endpoint: Option<String>,
    pub region: String,
    /// `None` falls back to the default AWS provider chain
    pub credentials: Option<Credentials>,
    /// Probe the bucket with `HeadBucket` before the first cycle
    pub verify_bucket: bool,
}

/// Immutable configuration captured at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub backup_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Targets in processing order
    pub targets: Vec<BackupTarget>,
    pub destination: UploadDestination,
    pub interval: Duration,
    pub run_on_start: bool,
    pub retention: RetentionPolicy,
}

/// Source of target names before the filesystem has been looked at
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetSelection {
    /// Explicit, ordered list from `BACKUP_TARGETS`
    Named(Vec<String>),
    /// Every subdirectory of `BACKUP_DIR`, sorted by name
    Discover,
}

impl Config {
    /// Capture configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Build configuration from arbitrary key/value pairs.
    ///
    /// Empty values are treated the same as absent ones.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string());

        let backup_dir =
            expand_path(&get("BACKUP_DIR").unwrap_or_else(|| BACKUP_DIR_DEFAULT.into()));
        let output_dir =
            expand_path(&get("OUTPUT_DIR").unwrap_or_else(|| OUTPUT_DIR_DEFAULT.into()));

        let bucket = get("S3_BUCKET").ok_or(ConfigError::Missing("S3_BUCKET"))?;
        let credentials = match (get("S3_ACCESS_KEY"), get("S3_SECRET_KEY")) {
            (Some(access_key), Some(secret_key)) => Some(Credentials {
                access_key,
                secret_key,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("S3_SECRET_KEY")),
            (None, Some(_)) => return Err(ConfigError::Missing("S3_ACCESS_KEY")),
        };

        let destination = UploadDestination {
            bucket,
            prefix: get("S3_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_default(),
            endpoint: get("S3_ENDPOINT"),
            region: get("S3_REGION").unwrap_or_else(|| S3_REGION_DEFAULT.into()),
            credentials,
            verify_bucket: parse_bool("S3_VERIFY_BUCKET", get("S3_VERIFY_BUCKET"), false)?,
        };

        let interval_secs = match get("SECOND_INTERVAL") {
            None => INTERVAL_SECS_DEFAULT,
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => INTERVAL_SECS_DEFAULT,
                Ok(secs) => secs,
                Err(_) => {
                    return Err(ConfigError::Invalid {
                        key: "SECOND_INTERVAL",
                        value: raw,
                        expected: "a non-negative number of seconds",
                    })
                }
            },
        };

        let retention = match get("LOCAL_RETENTION") {
            None => RetentionPolicy::default(),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "LOCAL_RETENTION",
                value: raw,
                expected: "`keep`, `purge`, or a positive count",
            })?,
        };

        let selection = match get("BACKUP_TARGETS") {
            Some(raw) => TargetSelection::Named(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            None => TargetSelection::Discover,
        };
        let targets = resolve_targets(&backup_dir, selection)?;

        Ok(Self {
            backup_dir,
            output_dir,
            targets,
            destination,
            interval: Duration::from_secs(interval_secs),
            run_on_start: parse_bool("RUN_ON_START", get("RUN_ON_START"), true)?,
            retention,
        })
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            expected: "a boolean",
        }),
    }
}

/// Turn the target selection into concrete targets, fixed for the process
/// lifetime. Named targets are not required to exist yet; a missing source is
/// a per-cycle error, not a startup one.
fn resolve_targets(
    backup_dir: &Path,
    selection: TargetSelection,
) -> Result<Vec<BackupTarget>, ConfigError> {
    let names = match selection {
        TargetSelection::Named(names) => names,
        TargetSelection::Discover => discover_targets(backup_dir)?,
    };

    if names.is_empty() {
        return Err(ConfigError::NoTargets(backup_dir.to_path_buf()));
    }

    let mut targets: Vec<BackupTarget> = Vec::with_capacity(names.len());
    for name in names {
        validate_target_name(&name)?;
        if targets.iter().any(|t| t.name == name) {
            return Err(ConfigError::DuplicateTarget(name));
        }
        let source_dir = backup_dir.join(&name);
        targets.push(BackupTarget::new(name, source_dir));
    }
    Ok(targets)
}

/// Subdirectory names of `backup_dir`, sorted.
fn discover_targets(backup_dir: &Path) -> Result<Vec<String>, ConfigError> {
    let entries = std::fs::read_dir(backup_dir).map_err(|source| ConfigError::BackupDir {
        path: backup_dir.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    backup_dir = %backup_dir.display(),
                    "Skipping unreadable entry: {e}"
                );
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => tracing::warn!(
                path = %entry.path().display(),
                "Skipping volume {:?}: name is not valid UTF-8, list targets in BACKUP_TARGETS",
                raw
            ),
        }
    }
    names.sort();
    Ok(names)
}

/// Names end up in file names and object keys, so path syntax is rejected.
fn validate_target_name(name: &str) -> Result<(), ConfigError> {
    let ok = name.len() <= TARGET_NAME_BYTES_MAX
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidTargetName(name.to_string()))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} (expected {expected})")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("cannot read backup directory {}: {source}", path.display())]
    BackupDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no backup targets found under {}", .0.display())]
    NoTargets(PathBuf),

    #[error("invalid target name: {0:?}")]
    InvalidTargetName(String),

    #[error("target {0:?} listed more than once")]
    DuplicateTarget(String),

    #[error("cannot prepare output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("destination bucket {bucket} is not reachable: {reason}")]
    Destination { bucket: String, reason: String },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn base_vars(backup_dir: &Path) -> Vec<(String, String)> {
        vec![
            ("BACKUP_DIR".into(), backup_dir.display().to_string()),
            ("OUTPUT_DIR".into(), "/tmp/out".into()),
            ("S3_BUCKET".into(), "backups".into()),
        ]
    }

    fn with(mut vars: Vec<(String, String)>, key: &str, value: &str) -> Vec<(String, String)> {
        vars.push((key.into(), value.into()));
        vars
    }

    #[test]
    fn test_discovers_subdirectories_sorted() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app1")).unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("notes.txt"), "not a target").unwrap();

        let config = Config::from_vars(base_vars(dir.path())).unwrap();

        let names: Vec<_> = config.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["app", "app1"]);
        assert_eq!(config.targets[1].source_dir, dir.path().join("app1"));
    }

    #[test]
    fn test_named_targets_keep_declared_order() {
        let dir = tempdir().unwrap();
        let vars = with(base_vars(dir.path()), "BACKUP_TARGETS", "zeta, alpha ,,mid");

        let config = Config::from_vars(vars).unwrap();

        let names: Vec<_> = config.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_interval_defaults_when_zero_or_absent() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();

        let absent = Config::from_vars(base_vars(dir.path())).unwrap();
        assert_eq!(absent.interval, Duration::from_secs(INTERVAL_SECS_DEFAULT));

        let zero = Config::from_vars(with(base_vars(dir.path()), "SECOND_INTERVAL", "0")).unwrap();
        assert_eq!(zero.interval, Duration::from_secs(INTERVAL_SECS_DEFAULT));

        let set = Config::from_vars(with(base_vars(dir.path()), "SECOND_INTERVAL", "60")).unwrap();
        assert_eq!(set.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_malformed_interval_is_fatal() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();

        let vars = with(base_vars(dir.path()), "SECOND_INTERVAL", "soon");
        let err = Config::from_vars(vars).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SECOND_INTERVAL", .. }));
    }

    #[test]
    fn test_missing_bucket_is_fatal() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        let vars = vec![
            ("BACKUP_DIR".to_string(), dir.path().display().to_string()),
            ("S3_BUCKET".to_string(), "   ".to_string()),
        ];

        let err = Config::from_vars(vars).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("S3_BUCKET")));
    }

    #[test]
    fn test_half_set_credentials_are_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();

        let vars = with(base_vars(dir.path()), "S3_ACCESS_KEY", "AKIA");
        let err = Config::from_vars(vars).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("S3_SECRET_KEY")));
    }

    #[test]
    fn test_destination_fields() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        let mut vars = base_vars(dir.path());
        vars.push(("S3_PREFIX".into(), "/nightly/".into()));
        vars.push(("S3_ENDPOINT".into(), "http://minio:9000".into()));
        vars.push(("S3_ACCESS_KEY".into(), "minio".into()));
        vars.push(("S3_SECRET_KEY".into(), "minio123".into()));

        let config = Config::from_vars(vars).unwrap();

        let dest = &config.destination;
        assert_eq!(dest.prefix, "nightly");
        assert_eq!(dest.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(dest.region, S3_REGION_DEFAULT);
        assert!(!dest.verify_bucket);
        let creds = dest.credentials.as_ref().unwrap();
        assert!(!format!("{creds:?}").contains("minio123"));
    }

    #[test]
    fn test_empty_backup_dir_has_no_targets() {
        let dir = tempdir().unwrap();

        let err = Config::from_vars(base_vars(dir.path())).unwrap_err();
        assert!(matches!(err, ConfigError::NoTargets(_)));
    }

    #[test]
    fn test_target_names_are_validated() {
        let dir = tempdir().unwrap();

        let vars = with(base_vars(dir.path()), "BACKUP_TARGETS", "app,../etc");
        let err = Config::from_vars(vars).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTargetName(_)));

        let vars = with(base_vars(dir.path()), "BACKUP_TARGETS", "app,app");
        let err = Config::from_vars(vars).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTarget(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_discovery_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        fs::create_dir(dir.path().join(OsStr::from_bytes(b"vol\xff"))).unwrap();

        let config = Config::from_vars(base_vars(dir.path())).unwrap();

        let names: Vec<_> = config.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["app"]);
    }

    #[test]
    fn test_retention_and_run_on_start() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();

        let config = Config::from_vars(base_vars(dir.path())).unwrap();
        assert_eq!(config.retention, RetentionPolicy::KeepLatest(1));
        assert!(config.run_on_start);

        let mut vars = base_vars(dir.path());
        vars.push(("LOCAL_RETENTION".into(), "purge".into()));
        vars.push(("RUN_ON_START".into(), "false".into()));
        let config = Config::from_vars(vars).unwrap();
        assert_eq!(config.retention, RetentionPolicy::Purge);
        assert!(!config.run_on_start);

        let vars = with(base_vars(dir.path()), "LOCAL_RETENTION", "forever");
        let err = Config::from_vars(vars).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LOCAL_RETENTION", .. }));
    }
}
