//! FTP / FTPS backend.
//!
//! suppaftp is blocking, so every command runs on the blocking thread pool.
//! Up to `concurrency` logged-in control connections are kept; a worker
//! checks one out for the duration of a single operation and hands it back
//! unless the connection itself failed.

use super::{parent_dirs, segments, RemoteEntry, Transport, TransportResult};
use crate::config::FtpTarget;
use crate::utils::errors::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use suppaftp::list::File as ListedFile;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

type FtpStream = NativeTlsFtpStream;

pub struct FtpTransport {
    config: FtpTarget,
    idle: Mutex<Vec<FtpStream>>,
    permits: Semaphore,
}

impl FtpTransport {
    /// Log in once up front so bad credentials or an unreachable host fail
    /// the run before any work is dispatched.
    pub async fn connect(config: FtpTarget, concurrency: usize) -> TransportResult<Self> {
        let probe_config = config.clone();
        let stream = tokio::task::spawn_blocking(move || open(&probe_config))
            .await
            .map_err(|e| TransportError::connection(format!("ftp connect task failed: {}", e)))??;

        info!(
            "Connected to ftp{}://{}:{}{}",
            if config.use_tls { "s" } else { "" },
            config.host,
            config.port,
            config.directory
        );

        Ok(Self {
            config,
            idle: Mutex::new(vec![stream]),
            permits: Semaphore::new(concurrency.max(1)),
        })
    }

    /// Run `op` on a pooled connection, opening a new one if none is idle.
    async fn with_connection<T, F>(&self, op: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> TransportResult<T> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::connection("ftp connection pool closed"))?;

        let idle = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let config = self.config.clone();

        let (stream, result) = tokio::task::spawn_blocking(move || {
            let mut stream = match idle {
                Some(stream) => stream,
                None => open(&config)?,
            };
            let result = op(&mut stream);
            Ok::<_, TransportError>((stream, result))
        })
        .await
        .map_err(|e| TransportError::connection(format!("ftp task failed: {}", e)))??;

        match &result {
            Err(e) if !reusable_after(e) => {
                debug!("Dropping ftp connection after error: {}", e);
            }
            _ => {
                if let Ok(mut idle) = self.idle.lock() {
                    idle.push(stream);
                }
            }
        }
        result
    }
}

#[async_trait]
impl Transport for FtpTransport {
    async fn list(&self, prefix: &str) -> TransportResult<Vec<RemoteEntry>> {
        let base = segments(prefix).collect::<Vec<_>>().join("/");
        self.with_connection(move |stream| {
            let mut entries = Vec::new();
            match walk(stream, &base, &mut entries) {
                Ok(()) => {}
                Err(e) if e.kind == TransportErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(entries)
        })
        .await
    }

    async fn exists(&self, path: &str) -> TransportResult<bool> {
        let remote = normalize(path);
        self.with_connection(move |stream| match stream.size(&remote) {
            Ok(_) => Ok(true),
            Err(e) => match map_ftp_error(e, &remote) {
                err if err.kind == TransportErrorKind::NotFound => Ok(false),
                err => Err(err),
            },
        })
        .await
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> TransportResult<u64> {
        let remote = normalize(remote_path);
        let local: PathBuf = local_path.to_path_buf();
        self.with_connection(move |stream| {
            let mut file = std::fs::File::open(&local)
                .map_err(|e| TransportError::from_source_io(&e, local.display()))?;

            for dir in parent_dirs(&remote) {
                match stream.mkdir(&dir) {
                    Ok(()) => debug!("Created remote directory {}", dir),
                    // Already exists, or the server refuses; put_file reports the real problem.
                    Err(FtpError::UnexpectedResponse(_)) => {}
                    Err(e) => return Err(map_ftp_error(e, &dir)),
                }
            }

            stream
                .put_file(&remote, &mut file)
                .map_err(|e| map_ftp_error(e, &remote))
        })
        .await
    }

    async fn delete(&self, remote_path: &str) -> TransportResult<()> {
        let remote = normalize(remote_path);
        self.with_connection(move |stream| {
            stream.rm(&remote).map_err(|e| map_ftp_error(e, &remote))?;

            for dir in parent_dirs(&remote).iter().rev() {
                if stream.rmdir(dir).is_err() {
                    break;
                }
                debug!("Removed empty remote directory {}", dir);
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) -> TransportResult<()> {
        let streams: Vec<FtpStream> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if streams.is_empty() {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || {
            for mut stream in streams {
                if let Err(e) = stream.quit() {
                    warn!("Failed to close ftp connection cleanly: {}", e);
                }
            }
        })
        .await
        .map_err(|e| TransportError::connection(format!("ftp close task failed: {}", e)))
    }
}

/// Open, optionally secure, log in and enter the configured directory.
fn open(config: &FtpTarget) -> TransportResult<FtpStream> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let address = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::connection(format!("cannot resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| TransportError::connection(format!("no address for {}", config.host)))?;

    let mut stream =
        FtpStream::connect_timeout(address, timeout).map_err(|e| map_ftp_error(e, &config.host))?;
    stream
        .get_ref()
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.get_ref().set_write_timeout(Some(timeout)))
        .map_err(|e| TransportError::connection(format!("{}: {}", config.host, e)))?;

    if config.use_tls {
        let connector = TlsConnector::new()
            .map_err(|e| TransportError::connection(format!("tls setup failed: {}", e)))?;
        stream = stream
            .into_secure(NativeTlsConnector::from(connector), &config.host)
            .map_err(|e| map_ftp_error(e, &config.host))?;
    }

    stream
        .login(&config.user, &config.password)
        .map_err(|e| map_ftp_error(e, &config.user))?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|e| map_ftp_error(e, &config.host))?;

    if !config.directory.is_empty() {
        stream.cwd(&config.directory).map_err(|e| {
            TransportError::connection(format!(
                "cannot enter remote directory {}: {}",
                config.directory, e
            ))
        })?;
    }

    Ok(stream)
}

fn walk(stream: &mut FtpStream, dir: &str, out: &mut Vec<RemoteEntry>) -> TransportResult<()> {
    let lines = stream
        .list(if dir.is_empty() { None } else { Some(dir) })
        .map_err(|e| map_ftp_error(e, dir))?;

    for line in lines {
        let file = match line.parse::<ListedFile>() {
            Ok(file) => file,
            Err(_) => {
                debug!("Skipping unparseable LIST line: {}", line);
                continue;
            }
        };
        let name = file.name();
        if name == "." || name == ".." {
            continue;
        }
        let path = if dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", dir, name)
        };

        if file.is_directory() {
            walk(stream, &path, out)?;
        } else if file.is_file() {
            out.push(RemoteEntry {
                path,
                size: file.size() as u64,
            });
        }
    }
    Ok(())
}

fn normalize(path: &str) -> String {
    segments(path).collect::<Vec<_>>().join("/")
}

/// Translate a suppaftp error into the shared taxonomy.
fn map_ftp_error(err: FtpError, context: &str) -> TransportError {
    match err {
        FtpError::ConnectionError(io) => match io.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                TransportError::timeout(format!("{}: {}", context, io))
            }
            _ => TransportError::connection(format!("{}: {}", context, io)),
        },
        FtpError::UnexpectedResponse(response) => {
            let code = response.status.code();
            let message = format!(
                "{}: {} {}",
                context,
                code,
                String::from_utf8_lossy(&response.body).trim()
            );
            let kind = match code {
                530 => TransportErrorKind::AuthFailed,
                421 => TransportErrorKind::ConnectionFailed,
                450 | 550 => TransportErrorKind::NotFound,
                532 | 553 => TransportErrorKind::PermissionDenied,
                // Any other refusal concerns this file only.
                _ => TransportErrorKind::PermissionDenied,
            };
            TransportError::new(kind, message)
        }
        other => TransportError::connection(format!("{}: {}", context, other)),
    }
}

/// Whether a connection can serve another command after `err`. A timed out
/// command may still get its reply later, which would answer the next one.
fn reusable_after(err: &TransportError) -> bool {
    !err.is_fatal() && err.kind != TransportErrorKind::Timeout
}
