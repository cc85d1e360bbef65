//! Storage backends a source tree can be synchronized to.
//!
//! Every backend implements [`Transport`] and reports failures through the
//! shared [`TransportError`] taxonomy, so the executor treats them uniformly.
//! Remote paths are always '/'-separated and relative to the backend's
//! configured root (local directory, FTP directory or key prefix).

pub mod ftp;
pub mod local;
pub mod s3;

use crate::config::TransportTarget;
use crate::utils::errors::TransportError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub use ftp::FtpTransport;
pub use local::LocalTransport;
pub use s3::ObjectStorageTransport;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A file stored on the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub size: u64,
}

/// Capability interface implemented by every backend.
///
/// Implementations must be safe to call from several workers at once; a
/// backend that cannot share one connection pools or serializes internally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Files below `prefix` ("" for everything), sorted by path
    async fn list(&self, prefix: &str) -> TransportResult<Vec<RemoteEntry>>;

    async fn exists(&self, path: &str) -> TransportResult<bool>;

    /// Upload `local_path` to `remote_path`, replacing it; returns bytes sent
    async fn upload(&self, local_path: &Path, remote_path: &str) -> TransportResult<u64>;

    async fn delete(&self, remote_path: &str) -> TransportResult<()>;

    /// Release connections. Called once at the end of a run.
    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// Connect the backend selected by `target`.
///
/// `concurrency` sizes connection pools for backends that need one.
pub async fn connect(
    target: &TransportTarget,
    concurrency: usize,
) -> TransportResult<Arc<dyn Transport>> {
    open(target, concurrency, true).await
}

/// Like [`connect`], but leaves the target untouched: a local root that does
/// not exist yet is not created. Used by dry runs.
pub async fn connect_read_only(
    target: &TransportTarget,
    concurrency: usize,
) -> TransportResult<Arc<dyn Transport>> {
    open(target, concurrency, false).await
}

async fn open(
    target: &TransportTarget,
    concurrency: usize,
    create_root: bool,
) -> TransportResult<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match target {
        TransportTarget::Local { root } if create_root => Arc::new(LocalTransport::open(root).await?),
        TransportTarget::Local { root } => Arc::new(LocalTransport::inspect(root).await?),
        TransportTarget::Ftp(ftp) => Arc::new(FtpTransport::connect(ftp.clone(), concurrency).await?),
        TransportTarget::ObjectStorage(s3) => {
            Arc::new(ObjectStorageTransport::connect(s3.clone()).await?)
        }
    };
    Ok(transport)
}

/// Split a relative remote path into its non-empty '/'-separated segments.
pub(crate) fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Parent directories of `path`, outermost first ("a/b/c.txt" → ["a", "a/b"]).
pub(crate) fn parent_dirs(path: &str) -> Vec<String> {
    let parts: Vec<&str> = segments(path).collect();
    (1..parts.len()).map(|i| parts[..i].join("/")).collect()
}
