//! Persisted checksum manifest.
//!
//! A manifest records every file of the last successful synchronization with
//! its size, mtime and (above the threshold) content hash, allowing the next
//! run to diff against it and only transfer changed files. On disk it is a
//! gzip-compressed JSON document:
//!
//! ```json
//! {"version": 1, "entries": [{"path": "a.txt", "size": 8, "mtime": 1700000000}]}
//! ```

use crate::fs::FileEntry;
use crate::utils::errors::{Result, SyncError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::{info, warn};

/// Format version written by this build.
pub const MANIFEST_VERSION: u32 = 1;

/// Last synchronized state of a target, keyed by relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    entries: BTreeMap<String, FileEntry>,
}

/// Wire representation: entries as a path-sorted list.
#[derive(Serialize, Deserialize)]
struct ManifestDocument {
    version: u32,
    entries: Vec<FileEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FileEntry>) -> Self {
        let mut manifest = Self::new();
        for entry in entries {
            manifest.insert(entry);
        }
        manifest
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Insert or replace the entry for its path.
    pub fn insert(&mut self, entry: FileEntry) -> Option<FileEntry> {
        self.entries.insert(entry.relative_path.clone(), entry)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.entries.remove(path)
    }

    /// Entries in path order
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Serialize to gzip-compressed JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let document = ManifestDocument {
            version: self.version,
            entries: self.entries.values().cloned().collect(),
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, &document)?;
        Ok(encoder.finish()?)
    }

    /// Parse gzip-compressed JSON.
    ///
    /// # Errors
    /// [`SyncError::CorruptManifest`] if the data does not decompress, does not
    /// parse, repeats a path, or was written by a newer format version.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoder = GzDecoder::new(bytes);
        let document: ManifestDocument = serde_json::from_reader(decoder)
            .map_err(|e| SyncError::CorruptManifest(e.to_string()))?;

        if document.version > MANIFEST_VERSION {
            return Err(SyncError::CorruptManifest(format!(
                "format version {} is newer than supported version {}",
                document.version, MANIFEST_VERSION
            )));
        }

        let mut entries = BTreeMap::new();
        for entry in document.entries {
            if entry.relative_path.is_empty() {
                return Err(SyncError::CorruptManifest("entry with empty path".into()));
            }
            let path = entry.relative_path.clone();
            if entries.insert(path.clone(), entry).is_some() {
                return Err(SyncError::CorruptManifest(format!(
                    "duplicate entry for {}",
                    path
                )));
            }
        }

        Ok(Self {
            version: MANIFEST_VERSION,
            entries,
        })
    }

    /// Load the manifest stored at `path`.
    ///
    /// A missing file is an empty manifest (first run). With `force`, a corrupt
    /// file is also treated as empty, which makes every current file a Create.
    ///
    /// # Errors
    /// I/O failures other than a missing file, and corruption without `force`.
    pub fn load(path: &Path, force: bool) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No manifest at {}, starting from scratch", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        match Self::decode(&bytes) {
            Ok(manifest) => {
                info!(
                    "Loaded manifest: {} files, {} bytes",
                    manifest.len(),
                    manifest.total_bytes()
                );
                Ok(manifest)
            }
            Err(SyncError::CorruptManifest(reason)) if force => {
                warn!(
                    "Ignoring corrupt manifest {} ({}), doing a full resync",
                    path.display(),
                    reason
                );
                Ok(Self::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the manifest at `path`.
    ///
    /// The document is written to a `{name}.*.tmp` sibling, flushed to disk and
    /// renamed over the destination.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.encode()?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(&format!("{}.", file_name))
            .suffix(".tmp")
            .tempfile_in(parent)?;
        temp_file.write_all(&bytes)?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(path).map_err(|e| e.error)?;

        info!(
            "Saved manifest: {} files, {} bytes -> {}",
            self.len(),
            self.total_bytes(),
            path.display()
        );
        Ok(())
    }
}
