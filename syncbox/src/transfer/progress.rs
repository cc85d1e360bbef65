//! Byte-level progress tracking for transfers.
//!
//! Workers add to shared atomic counters as bytes leave the machine; the
//! executor samples them periodically for speed and completion logging.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Shared counters updated by transfer workers
#[derive(Debug)]
pub struct TransferProgress {
    total_bytes: u64,
    total_actions: usize,
    transferred_bytes: AtomicU64,
    completed_actions: AtomicUsize,
    started: Instant,
}

/// Point-in-time view of [`TransferProgress`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub completed_actions: usize,
    pub total_actions: usize,
    pub bytes_per_second: u64,
    pub percent_complete: f64,
}

impl TransferProgress {
    pub fn new(total_bytes: u64, total_actions: usize) -> Self {
        Self {
            total_bytes,
            total_actions,
            transferred_bytes: AtomicU64::new(0),
            completed_actions: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn complete_action(&self) {
        self.completed_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let transferred_bytes = self.transferred_bytes();
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_second = if elapsed > 0.0 {
            (transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        };
        let percent_complete = if self.total_bytes > 0 {
            ((transferred_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else if self.total_actions == 0 {
            100.0
        } else {
            0.0
        };

        ProgressSnapshot {
            transferred_bytes,
            total_bytes: self.total_bytes,
            completed_actions: self.completed_actions.load(Ordering::Relaxed),
            total_actions: self.total_actions,
            bytes_per_second,
            percent_complete,
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
