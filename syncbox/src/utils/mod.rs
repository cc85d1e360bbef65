//! Utility modules for syncbox.

pub mod errors;
pub mod logger;

pub use errors::{Result, SyncError, TransportError, TransportErrorKind};
