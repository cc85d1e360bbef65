//! Local filesystem backend.
//!
//! Mirrors the tree into another directory. Uploads stream into a temp file
//! next to the destination and rename over it, so a reader never sees a
//! partially copied file. Deleting a file also removes parent directories
//! that became empty.

use super::{parent_dirs, segments, RemoteEntry, Transport, TransportResult};
use crate::transfer::progress::format_bytes;
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::utils::errors::TransportError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use walkdir::WalkDir;

pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Open `root` as the target, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> TransportResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| unreachable_root(&root, e))?;
        Self::inspect(root).await
    }

    /// Open `root` without creating anything. A root that does not exist
    /// yet is accepted; one that exists must be a directory.
    pub async fn inspect(root: impl Into<PathBuf>) -> TransportResult<Self> {
        let root = root.into();
        match tokio::fs::metadata(&root).await {
            Ok(metadata) if metadata.is_dir() => Ok(Self { root }),
            Ok(_) => Err(TransportError::connection(format!(
                "{} is not a directory",
                root.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist yet", root.display());
                Ok(Self { root })
            }
            Err(e) => Err(unreachable_root(&root, e)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote_path: &str) -> TransportResult<PathBuf> {
        let mut path = self.root.clone();
        let mut any = false;
        for segment in segments(remote_path) {
            if segment == ".." {
                return Err(TransportError::permission_denied(format!(
                    "{} escapes the target root",
                    remote_path
                )));
            }
            path.push(segment);
            any = true;
        }
        if !any {
            return Err(TransportError::not_found(format!(
                "empty remote path: {:?}",
                remote_path
            )));
        }
        Ok(path)
    }

    async fn copy(
        &self,
        source: tokio::fs::File,
        destination: &Path,
        remote_path: &str,
    ) -> io::Result<u64> {
        let temp_path = temp_sibling(destination);
        let mut target = tokio::fs::File::create(&temp_path).await?;

        let label = remote_path.to_string();
        let callback: ProgressCallback = Arc::new(move |bytes| {
            debug!("{}: {} written", label, format_bytes(bytes));
        });
        let mut stream = ProgressStream::new(ReaderStream::new(source), callback);

        let result = async {
            while let Some(chunk) = stream.next().await {
                target.write_all(&chunk?).await?;
            }
            target.flush().await?;
            target.sync_all().await?;
            drop(target);
            tokio::fs::rename(&temp_path, destination).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(stream.bytes_transferred())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn list(&self, prefix: &str) -> TransportResult<Vec<RemoteEntry>> {
        let base = if segments(prefix).next().is_none() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };
        let root = self.root.clone();

        let entries = tokio::task::spawn_blocking(move || -> io::Result<Vec<RemoteEntry>> {
            if !base.exists() {
                return Ok(Vec::new());
            }
            let mut entries = Vec::new();
            for entry in WalkDir::new(&base).follow_links(false) {
                let entry = entry.map_err(io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                let path = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push(RemoteEntry {
                    path,
                    size: entry.metadata().map_err(io::Error::from)?.len(),
                });
            }
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(entries)
        })
        .await
        .map_err(|e| TransportError::connection(format!("list task failed: {}", e)))?
        .map_err(|e| TransportError::from_io(&e, prefix))?;

        Ok(entries)
    }

    async fn exists(&self, path: &str) -> TransportResult<bool> {
        let full_path = self.resolve(path)?;
        match tokio::fs::metadata(&full_path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TransportError::from_io(&e, path)),
        }
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> TransportResult<u64> {
        let destination = self.resolve(remote_path)?;
        let source = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| TransportError::from_source_io(&e, local_path.display()))?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::from_io(&e, remote_path))?;
        }

        self.copy(source, &destination, remote_path)
            .await
            .map_err(|e| TransportError::from_io(&e, remote_path))
    }

    async fn delete(&self, remote_path: &str) -> TransportResult<()> {
        let full_path = self.resolve(remote_path)?;
        tokio::fs::remove_file(&full_path)
            .await
            .map_err(|e| TransportError::from_io(&e, remote_path))?;

        // Prune now-empty parents, innermost first; stop at the first non-empty one.
        for dir in parent_dirs(remote_path).iter().rev() {
            let dir_path = self.resolve(dir)?;
            if tokio::fs::remove_dir(&dir_path).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn unreachable_root(root: &Path, err: io::Error) -> TransportError {
    TransportError::connection(format!("{}: {}", root.display(), err))
}

fn temp_sibling(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{}.partial", name, std::process::id()))
}
