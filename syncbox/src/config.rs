//! Configuration management for syncbox.
//!
//! Loads a run configuration from a TOML file; the binary merges command line
//! flags over it and calls [`SyncConfig::validate`] before handing it to
//! [`crate::sync::run`].

use crate::utils::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default manifest file name, stored in the source directory.
pub const DEFAULT_CHECKSUM_FILE: &str = ".syncbox.json.gz";

/// S3 rejects multipart parts (other than the last) below 5 MiB.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sync: SyncConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local source root
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Manifest location; relative paths resolve against `directory`
    #[serde(default = "default_checksum_file")]
    pub checksum_file: String,

    /// Plan and persist the manifest without transferring anything
    #[serde(default)]
    pub checksum_only: bool,

    /// Plan and report without transferring or persisting
    #[serde(default)]
    pub dry_run: bool,

    /// Treat a corrupt manifest as empty (full resync)
    #[serde(default)]
    pub force: bool,

    /// Number of concurrent transfer workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Files at or above this size (bytes) are fingerprinted by content hash
    #[serde(default = "default_file_size_threshold")]
    pub file_size_threshold: u64,

    /// Never delete remote files that disappeared locally
    #[serde(default)]
    pub skip_removal: bool,

    /// Upload the persisted manifest to the target after a run
    #[serde(default)]
    pub publish_manifest: bool,

    /// Extra file or directory names excluded from the scan
    #[serde(default)]
    pub exclude: Vec<String>,

    pub target: TransportTarget,
}

/// Where the synchronized tree is written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportTarget {
    Local { root: PathBuf },
    Ftp(FtpTarget),
    ObjectStorage(ObjectStorageTarget),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpTarget {
    pub host: String,

    #[serde(default = "default_ftp_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Remote directory all paths are scoped to
    #[serde(default = "default_ftp_directory")]
    pub directory: String,

    /// Upgrade control and data channels to explicit TLS
    #[serde(default)]
    pub use_tls: bool,

    /// Socket read/write timeout in seconds
    #[serde(default = "default_ftp_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageTarget {
    pub bucket: String,

    pub region: String,

    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,

    pub access_key: String,

    pub secret_key: String,

    #[serde(default = "default_storage_class")]
    pub storage_class: String,

    /// Key prefix all paths are scoped to
    #[serde(default)]
    pub prefix: String,

    /// Files larger than this use multipart upload
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Size of each multipart part in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_s3_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_checksum_file() -> String {
    DEFAULT_CHECKSUM_FILE.to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_file_size_threshold() -> u64 {
    1024 * 1024 // 1MB
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_directory() -> String {
    "/".to_string()
}

fn default_ftp_timeout() -> u64 {
    30
}

fn default_storage_class() -> String {
    "STANDARD".to_string()
}

fn default_multipart_threshold() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_part_size() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_s3_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }
}

impl SyncConfig {
    /// A configuration with defaults for everything but the source and target.
    pub fn new(directory: impl Into<PathBuf>, target: TransportTarget) -> Self {
        Self {
            directory: directory.into(),
            checksum_file: default_checksum_file(),
            checksum_only: false,
            dry_run: false,
            force: false,
            concurrency: default_concurrency(),
            file_size_threshold: default_file_size_threshold(),
            skip_removal: false,
            publish_manifest: false,
            exclude: Vec::new(),
            target,
        }
    }

    /// Absolute or source-relative location of the manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        let path = Path::new(&self.checksum_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.directory.join(path)
        }
    }

    /// Reject option combinations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(SyncError::Config("concurrency must be at least 1".into()));
        }
        if self.checksum_only && self.dry_run {
            return Err(SyncError::Config(
                "checksum_only and dry_run are mutually exclusive".into(),
            ));
        }
        if self.checksum_file.trim().is_empty() {
            return Err(SyncError::Config("checksum_file must not be empty".into()));
        }

        match &self.target {
            TransportTarget::Local { root } => {
                if root.as_os_str().is_empty() {
                    return Err(SyncError::Config("local target root must not be empty".into()));
                }
                let (root_abs, directory_abs) = (resolved(root), resolved(&self.directory));
                if root_abs.starts_with(&directory_abs) || directory_abs.starts_with(&root_abs) {
                    return Err(SyncError::Config(format!(
                        "local target {} overlaps source directory {}",
                        root.display(),
                        self.directory.display()
                    )));
                }
            }
            TransportTarget::Ftp(ftp) => {
                if ftp.host.trim().is_empty() {
                    return Err(SyncError::Config("ftp host must not be empty".into()));
                }
                if ftp.user.trim().is_empty() {
                    return Err(SyncError::Config("ftp user must not be empty".into()));
                }
            }
            TransportTarget::ObjectStorage(s3) => {
                if s3.bucket.trim().is_empty() {
                    return Err(SyncError::Config("bucket must not be empty".into()));
                }
                if s3.part_size < MIN_PART_SIZE {
                    return Err(SyncError::Config(format!(
                        "part_size must be at least {} bytes",
                        MIN_PART_SIZE
                    )));
                }
                if s3.multipart_threshold < s3.part_size {
                    return Err(SyncError::Config(
                        "multipart_threshold must not be smaller than part_size".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Absolute form of `path`, with symlinks resolved as far as it exists.
fn resolved(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |path: PathBuf, name| path.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> SyncConfig {
        SyncConfig::new(
            "/data/site",
            TransportTarget::Local {
                root: PathBuf::from("/mnt/mirror"),
            },
        )
    }

    #[test]
    fn test_defaults_from_toml() {
        let config = Config::from_toml(
            r#"
[sync]
directory = "/data/site"

[sync.target]
type = "ftp"
host = "ftp.example.com"
user = "deploy"
password = "secret"
"#,
        )
        .unwrap();

        let sync = &config.sync;
        assert_eq!(sync.checksum_file, ".syncbox.json.gz");
        assert_eq!(sync.concurrency, 1);
        assert_eq!(sync.file_size_threshold, 1024 * 1024);
        assert!(!sync.dry_run);
        assert_eq!(config.log.level, "info");

        match &sync.target {
            TransportTarget::Ftp(ftp) => {
                assert_eq!(ftp.port, 21);
                assert_eq!(ftp.directory, "/");
                assert!(!ftp.use_tls);
            }
            other => panic!("unexpected target: {:?}", other),
        }
    }

    #[test]
    fn test_object_storage_from_toml() {
        let config = Config::from_toml(
            r#"
[sync]
concurrency = 4

[sync.target]
type = "object_storage"
bucket = "backups"
region = "eu-central-1"
access_key = "AKIA"
secret_key = "s3cr3t"
storage_class = "GLACIER_IR"
"#,
        )
        .unwrap();

        assert_eq!(config.sync.concurrency, 4);
        match &config.sync.target {
            TransportTarget::ObjectStorage(s3) => {
                assert_eq!(s3.storage_class, "GLACIER_IR");
                assert_eq!(s3.part_size, 16 * 1024 * 1024);
                assert!(s3.endpoint.is_none());
            }
            other => panic!("unexpected target: {:?}", other),
        }
        config.sync.validate().unwrap();
    }

    #[test]
    fn test_unknown_target_rejected() {
        let result = Config::from_toml(
            r#"
[sync.target]
type = "gopher"
"#,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_manifest_path_resolution() {
        let mut config = local_config();
        assert_eq!(
            config.manifest_path(),
            PathBuf::from("/data/site/.syncbox.json.gz")
        );

        config.checksum_file = "/var/lib/syncbox/site.json.gz".into();
        assert_eq!(
            config.manifest_path(),
            PathBuf::from("/var/lib/syncbox/site.json.gz")
        );
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = local_config();
        config.concurrency = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_checksum_only_with_dry_run() {
        let mut config = local_config();
        config.checksum_only = true;
        config.dry_run = true;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_overlapping_local_target() {
        let config = SyncConfig::new(
            "/data/site",
            TransportTarget::Local {
                root: PathBuf::from("/data/site/mirror"),
            },
        );
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_relative_overlap() {
        let config = SyncConfig::new(
            ".",
            TransportTarget::Local {
                root: PathBuf::from("mirror"),
            },
        );
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let cwd = std::env::current_dir().unwrap();
        let config = SyncConfig::new(
            ".",
            TransportTarget::Local {
                root: cwd.join("mirror"),
            },
        );
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_sees_through_dot_segments() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::new(
            dir.path().join("site"),
            TransportTarget::Local {
                root: dir.path().join("site").join(".").join("mirror"),
            },
        );
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_accepts_sibling_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::new(
            dir.path().join("site"),
            TransportTarget::Local {
                root: dir.path().join("site-mirror"),
            },
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_small_parts() {
        let config = SyncConfig::new(
            "/data/site",
            TransportTarget::ObjectStorage(ObjectStorageTarget {
                bucket: "b".into(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key: "a".into(),
                secret_key: "s".into(),
                storage_class: default_storage_class(),
                prefix: String::new(),
                multipart_threshold: default_multipart_threshold(),
                part_size: 1024,
                timeout_secs: default_s3_timeout(),
            }),
        );
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        local_config().validate().unwrap();
    }
}
