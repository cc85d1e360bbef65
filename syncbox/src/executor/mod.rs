//! Plan executor - applies an action plan against a transport.
//!
//! Transfers run on a bounded pool of workers: one semaphore permit per
//! in-flight action, tasks joined through a `JoinSet`. Each successful
//! action is recorded in the shared manifest straight away, so an aborted
//! run still knows exactly what reached the target.

pub mod manifest;

use crate::sync::plan::{Action, PlanSummary};
use crate::sync::report::{FileError, PlannedAction};
use crate::transfer::progress::{format_bytes, format_speed, TransferProgress};
use crate::transport::Transport;
use crate::utils::errors::{TransportError, TransportErrorKind};
use manifest::Manifest;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// What happened to each action of a plan
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
    pub errored: Vec<FileError>,
    pub would_execute: Vec<PlannedAction>,
    pub not_attempted: Vec<String>,
    pub bytes_transferred: u64,
    /// Error that aborted execution, if any
    pub fatal: Option<TransportError>,
}

impl ExecutionOutcome {
    fn record_success(&mut self, action: &Action) {
        let path = action.path().to_string();
        match action {
            Action::Create(_) => self.created.push(path),
            Action::Update(_) => self.updated.push(path),
            Action::Delete(_) => self.deleted.push(path),
            Action::Skip(_) => self.skipped.push(path),
        }
    }
}

pub struct Executor {
    transport: Arc<dyn Transport>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(transport: Arc<dyn Transport>, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            transport,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Apply `plan` to the target, recording completed actions in `manifest`.
    ///
    /// In dry-run mode nothing is sent and the manifest is left untouched;
    /// every non-skip action is reported as would-execute instead.
    pub async fn execute(
        &self,
        plan: Vec<Action>,
        root: &Path,
        manifest: &mut Manifest,
        dry_run: bool,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        let summary = PlanSummary::of(&plan);

        if dry_run {
            for action in &plan {
                match action {
                    Action::Skip(_) => outcome.skipped.push(action.path().to_string()),
                    _ => outcome.would_execute.push(PlannedAction::from(action)),
                }
            }
            info!("Dry run: {}", summary);
            return outcome;
        }

        let (skips, transfers): (Vec<Action>, Vec<Action>) =
            plan.into_iter().partition(|action| !action.is_transfer());
        for action in &skips {
            action.apply_to(manifest);
            outcome.record_success(action);
        }

        let total_bytes: u64 = transfers
            .iter()
            .map(|action| match action {
                Action::Create(entry) | Action::Update(entry) => entry.size,
                _ => 0,
            })
            .sum();
        info!(
            "Executing plan: {} ({} to send, {} workers)",
            summary,
            format_bytes(total_bytes),
            self.concurrency
        );

        let progress = Arc::new(TransferProgress::new(total_bytes, transfers.len()));
        let shared = Arc::new(Mutex::new(std::mem::take(manifest)));
        let reporter_done = CancellationToken::new();
        let reporter = spawn_progress_reporter(Arc::clone(&progress), reporter_done.clone());
        let started = Instant::now();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut pending = transfers.into_iter();

        for action in pending.by_ref() {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        outcome.not_attempted.push(action.path().to_string());
                        break;
                    }
                },
                _ = self.cancel.cancelled() => {
                    outcome.not_attempted.push(action.path().to_string());
                    break;
                }
            };
            if self.cancel.is_cancelled() {
                outcome.not_attempted.push(action.path().to_string());
                break;
            }

            let transport = Arc::clone(&self.transport);
            let manifest = Arc::clone(&shared);
            let progress = Arc::clone(&progress);
            let cancel = self.cancel.clone();
            let local_path = local_path(root, action.path());

            workers.spawn(async move {
                let _permit = permit;
                let result = apply(transport.as_ref(), &action, &local_path).await;

                match &result {
                    Ok(bytes) => {
                        if let Ok(mut manifest) = manifest.lock() {
                            action.apply_to(&mut manifest);
                        }
                        progress.add_bytes(*bytes);
                        progress.complete_action();
                    }
                    Err(e) if e.is_fatal() => {
                        error!("Aborting after {} of {}: {}", action.kind(), action.path(), e);
                        cancel.cancel();
                    }
                    Err(e) => {
                        warn!("Failed to {} {}: {}", action.kind(), action.path(), e);
                        progress.complete_action();
                    }
                }
                (action, result)
            });
        }
        outcome
            .not_attempted
            .extend(pending.map(|action| action.path().to_string()));

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((action, Ok(bytes))) => {
                    debug!("{} {} ({})", action.kind(), action.path(), format_bytes(bytes));
                    outcome.bytes_transferred += bytes;
                    outcome.record_success(&action);
                }
                Ok((action, Err(e))) => {
                    outcome
                        .errored
                        .push(FileError::new(action.path(), e.to_string()));
                    if e.is_fatal() && outcome.fatal.is_none() {
                        outcome.fatal = Some(e);
                    }
                }
                Err(e) => {
                    error!("Worker task failed: {}", e);
                    outcome
                        .errored
                        .push(FileError::new("<worker>", format!("worker task failed: {}", e)));
                }
            }
        }

        reporter_done.cancel();
        let _ = reporter.await;

        *manifest = match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
            Err(shared) => match shared.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
        };

        let snapshot = progress.snapshot();
        info!(
            "Execution finished in {:.1}s: {} sent, {} actions done, {} failed, {} not attempted",
            started.elapsed().as_secs_f64(),
            format_bytes(snapshot.transferred_bytes),
            snapshot.completed_actions,
            outcome.errored.len(),
            outcome.not_attempted.len()
        );
        outcome
    }
}

/// Perform one transfer action; returns the bytes sent.
async fn apply(
    transport: &dyn Transport,
    action: &Action,
    local_path: &Path,
) -> Result<u64, TransportError> {
    match action {
        Action::Create(_) | Action::Update(_) => transport.upload(local_path, action.path()).await,
        Action::Delete(path) => match transport.delete(path).await {
            // Already gone is the state a delete asks for.
            Err(e) if e.kind == TransportErrorKind::NotFound => {
                warn!("{} was already missing from the target: {}", path, e);
                Ok(0)
            }
            result => result.map(|_| 0),
        },
        Action::Skip(_) => Ok(0),
    }
}

fn local_path(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

fn spawn_progress_reporter(
    progress: Arc<TransferProgress>,
    done: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_LOG_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = done.cancelled() => break,
            }

            let snapshot = progress.snapshot();
            info!(
                "Progress: {}/{} actions, {} of {} ({:.1}%), {}",
                snapshot.completed_actions,
                snapshot.total_actions,
                format_bytes(snapshot.transferred_bytes),
                format_bytes(snapshot.total_bytes),
                snapshot.percent_complete,
                format_speed(snapshot.bytes_per_second)
            );
        }
    })
}
