//! Local source tree access: scanning and file fingerprints.

pub mod metadata;
pub mod walker;

pub use metadata::{FileEntry, Fingerprint};
pub use walker::{scan, ScanOptions, ScanOutcome};
