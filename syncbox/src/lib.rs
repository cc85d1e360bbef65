//! Syncbox Library
//!
//! Checksum-driven one-way directory synchronization to a local directory,
//! an FTP server or S3-compatible object storage.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod sync;
pub mod transfer;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, SyncConfig, TransportTarget};
pub use sync::{run, run_with_cancel, run_with_transport, SyncReport};
pub use utils::errors::{Result, SyncError};
