//! Structured result of a synchronization run.

use super::plan::{Action, ActionKind};
use crate::transfer::progress::{format_bytes, format_duration};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Overall outcome of a run, for exit status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Done,
    Failed,
}

/// A problem with one path that did not abort the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub message: String,
}

impl FileError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// An action that was planned but intentionally not executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    pub kind: ActionKind,
    pub path: String,
}

impl From<&Action> for PlannedAction {
    fn from(action: &Action) -> Self {
        Self {
            kind: action.kind(),
            path: action.path().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub outcome: RunOutcome,

    /// Why the run failed, if it did
    pub failure: Option<String>,

    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
    pub errored: Vec<FileError>,

    /// Actions a dry run or checksum-only run would have executed
    pub would_execute: Vec<PlannedAction>,

    /// Actions never started because the run was aborted
    pub not_attempted: Vec<String>,

    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            outcome: RunOutcome::Done,
            failure: None,
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            skipped: Vec::new(),
            errored: Vec::new(),
            would_execute: Vec::new(),
            not_attempted: Vec::new(),
            bytes_transferred: 0,
            started_at,
            duration: Duration::ZERO,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.outcome = RunOutcome::Failed;
        self.failure = Some(reason.into());
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == RunOutcome::Failed
    }

    pub fn has_errors(&self) -> bool {
        !self.errored.is_empty()
    }

    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn errored_count(&self) -> usize {
        self.errored.len()
    }

    /// 0 for a clean run, 1 for a completed run with per-file errors, 2 for an aborted run.
    pub fn exit_code(&self) -> i32 {
        match (self.outcome, self.has_errors()) {
            (RunOutcome::Failed, _) => 2,
            (RunOutcome::Done, true) => 1,
            (RunOutcome::Done, false) => 0,
        }
    }

    /// Sort all path lists so reports are reproducible regardless of worker order.
    pub(crate) fn normalize(&mut self) {
        self.created.sort();
        self.updated.sort();
        self.deleted.sort();
        self.skipped.sort();
        self.not_attempted.sort();
        self.errored.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged, {} errors; {} in {}",
            self.created_count(),
            self.updated_count(),
            self.deleted_count(),
            self.skipped_count(),
            self.errored_count(),
            format_bytes(self.bytes_transferred),
            format_duration(self.duration.as_secs()),
        )?;
        if let Some(reason) = &self.failure {
            write!(f, " (failed: {})", reason)?;
        }
        Ok(())
    }
}
