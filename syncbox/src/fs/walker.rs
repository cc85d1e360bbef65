//! Directory traversal producing the current state of the source tree.
//!
//! The scan is deterministic: entries come back sorted by their '/'-separated
//! relative path. Problems with individual files are collected next to the
//! entries instead of aborting the walk; only an unusable root is fatal.

use super::metadata::FileEntry;
use crate::sync::report::FileError;
use crate::utils::errors::Result;
use std::fs;
use std::io;
use std::path::{Component, Path};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Per-directory ignore file, one excluded name per line.
pub const IGNORE_FILE: &str = ".syncboxignore";

/// Options for a scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Files at or above this size get a content hash
    pub threshold: u64,

    /// File or directory names excluded wherever they appear
    pub exclude_names: Vec<String>,

    /// Relative paths excluded together with their `{name}.*.tmp` siblings
    pub exclude_files: Vec<String>,
}

impl ScanOptions {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            exclude_names: vec![".git".to_string(), IGNORE_FILE.to_string()],
            exclude_files: Vec::new(),
        }
    }

    /// Exclude a single file (and the temp files written next to it).
    pub fn exclude_file(mut self, relative_path: impl Into<String>) -> Self {
        self.exclude_files.push(relative_path.into());
        self
    }

    pub fn exclude_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_names.extend(names.into_iter().map(Into::into));
        self
    }

    fn is_excluded_name(&self, name: &str) -> bool {
        self.exclude_names.iter().any(|n| n == name)
    }

    fn is_excluded_file(&self, relative_path: &str) -> bool {
        self.exclude_files.iter().any(|excluded| {
            if excluded == relative_path {
                return true;
            }
            let (dir, name) = split_parent(excluded);
            let (candidate_dir, candidate_name) = split_parent(relative_path);
            dir == candidate_dir
                && candidate_name.starts_with(&format!("{}.", name))
                && candidate_name.ends_with(".tmp")
        })
    }
}

/// Result of scanning a source tree
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Entries sorted by relative path
    pub entries: Vec<FileEntry>,

    /// Paths that could not be read
    pub errors: Vec<FileError>,
}

impl ScanOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Walk `root` and describe every regular file below it.
///
/// Symbolic links are not traversed. A link to a regular file is reported
/// with the metadata and content of its target; links to directories and
/// broken links are skipped.
///
/// # Errors
/// Returns an I/O error if `root` is missing, not a directory or unreadable.
pub fn scan(root: &Path, options: &ScanOptions) -> Result<ScanOutcome> {
    let root_metadata = fs::metadata(root)?;
    if !root_metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )
        .into());
    }
    // Surface an unreadable root as fatal rather than as a per-file error.
    fs::read_dir(root)?;

    let options = with_ignore_file(root, options);
    let mut outcome = ScanOutcome::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, &options));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| display_relative(p, root))
                    .unwrap_or_default();
                warn!("Failed to read {}: {}", path, e);
                outcome.errors.push(FileError::new(path, e.to_string()));
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let relative_path = match relative_path(entry.path(), root) {
            Some(rel) => rel,
            None => {
                let path = display_relative(entry.path(), root);
                warn!("Skipping non UTF-8 path: {}", path);
                outcome
                    .errors
                    .push(FileError::new(path, "path is not valid UTF-8"));
                continue;
            }
        };

        if options.is_excluded_file(&relative_path) {
            debug!("Excluded {}", relative_path);
            continue;
        }

        if entry.file_type().is_symlink() {
            match fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => {}
                Ok(_) => {
                    debug!("Skipping symlink to directory: {}", relative_path);
                    continue;
                }
                Err(_) => {
                    debug!("Skipping broken symlink: {}", relative_path);
                    continue;
                }
            }
        } else if !entry.file_type().is_file() {
            debug!("Skipping special file: {}", relative_path);
            continue;
        }

        match FileEntry::from_path(entry.path(), relative_path.clone(), options.threshold) {
            Ok(file_entry) => outcome.entries.push(file_entry),
            Err(e) => {
                warn!("Failed to read {}: {}", relative_path, e);
                outcome.errors.push(FileError::new(relative_path, e.to_string()));
            }
        }
    }

    outcome
        .entries
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    outcome.errors.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(outcome)
}

/// Merge the names listed in the root's ignore file into `options`.
fn with_ignore_file(root: &Path, options: &ScanOptions) -> ScanOptions {
    let mut options = options.clone();
    match fs::read_to_string(root.join(IGNORE_FILE)) {
        Ok(content) => {
            let names = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string);
            options.exclude_names.extend(names);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to read {}: {}", IGNORE_FILE, e),
    }
    options
}

/// Check if a directory entry should be excluded based on its name
fn should_exclude(entry: &DirEntry, options: &ScanOptions) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| options.is_excluded_name(name))
        .unwrap_or(false)
}

/// '/'-joined path of `path` below `root`, or None if not valid UTF-8.
fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}
