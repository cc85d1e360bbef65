//! Error types shared by the scanner, manifest codec, transports and executor.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Backend-independent classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    ConnectionFailed,
    AuthFailed,
    NotFound,
    PermissionDenied,
    Timeout,
}

impl TransportErrorKind {
    /// Fatal kinds abort the remainder of a run; the others only fail one path.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::AuthFailed)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionFailed => "connection failed",
            Self::AuthFailed => "authentication failed",
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::Timeout => "timed out",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionFailed, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AuthFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::PermissionDenied, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// Classify a filesystem error on one target path.
    ///
    /// Never fatal: a path that is a directory, already exists or cannot be
    /// replaced fails that action only. Failures on the target root itself
    /// are reported with [`TransportError::connection`] by the caller.
    pub fn from_io(err: &std::io::Error, context: impl fmt::Display) -> Self {
        use std::io::ErrorKind;

        let message = format!("{}: {}", context, err);
        match err.kind() {
            ErrorKind::NotFound => Self::not_found(message),
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::timeout(message),
            _ => Self::permission_denied(message),
        }
    }

    /// Classify a failure to read a source file. These concern one file
    /// only and never abort the run.
    pub fn from_source_io(err: &std::io::Error, context: impl fmt::Display) -> Self {
        let message = format!("reading {}: {}", context, err);
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(message),
            std::io::ErrorKind::TimedOut => Self::timeout(message),
            _ => Self::permission_denied(message),
        }
    }
}
