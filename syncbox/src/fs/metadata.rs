//! File entries and fingerprints.
//!
//! A [`FileEntry`] is what the scanner produces for every regular file and
//! what the manifest remembers about it. Files at or above the configured size
//! threshold additionally carry a SHA-256 content hash; smaller files are
//! compared by size and modification time only.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::time::SystemTime;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata for a single synchronized file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the source root, always '/'-separated
    #[serde(rename = "path")]
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    #[serde(rename = "mtime")]
    pub modified_time: i64,

    /// Lower-case hex SHA-256, present only at or above the size threshold
    #[serde(rename = "hash", default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// What two entries are compared by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint<'a> {
    Content(&'a str),
    Metadata { size: u64, modified_time: i64 },
}

impl FileEntry {
    /// Read metadata (and the content hash when `size >= threshold`) for `path`.
    ///
    /// `path` is followed if it is a symlink, so the entry describes the target.
    pub fn from_path(path: &Path, relative_path: String, threshold: u64) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let size = metadata.len();
        let modified_time = unix_seconds(metadata.modified()?);
        let content_hash = if size >= threshold {
            Some(hash_file(path)?)
        } else {
            None
        };

        Ok(Self {
            relative_path,
            size,
            modified_time,
            content_hash,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint<'_> {
        match &self.content_hash {
            Some(hash) => Fingerprint::Content(hash),
            None => Fingerprint::Metadata {
                size: self.size,
                modified_time: self.modified_time,
            },
        }
    }

    /// Whether this entry and `other` describe the same content.
    ///
    /// Returns false when only one side is hashed: a file that crossed the
    /// threshold is never considered unchanged on metadata alone.
    pub fn same_content(&self, other: &FileEntry) -> bool {
        match (self.fingerprint(), other.fingerprint()) {
            (Fingerprint::Content(a), Fingerprint::Content(b)) => a == b,
            (a @ Fingerprint::Metadata { .. }, b @ Fingerprint::Metadata { .. }) => a == b,
            _ => false,
        }
    }
}

/// Stream a file through SHA-256 and return the lower-case hex digest.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(before_epoch) => -(before_epoch.duration().as_secs() as i64),
    }
}
