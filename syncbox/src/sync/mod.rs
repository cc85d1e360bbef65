//! One synchronization run: scan, load manifest, plan, execute, persist.

pub mod plan;
pub mod report;

use crate::config::SyncConfig;
use crate::executor::manifest::Manifest;
use crate::executor::{ExecutionOutcome, Executor};
use crate::fs::{scan, ScanOptions};
use crate::transport::Transport;
use crate::utils::errors::{Result, SyncError, TransportError};
use chrono::Utc;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use plan::{plan, Action, ActionKind, PlanSummary};
pub use report::{FileError, PlannedAction, RunOutcome, SyncReport};

/// Synchronize `config.directory` to its target.
///
/// Never returns an error: fatal problems end up as a `Failed` report.
pub async fn run(config: &SyncConfig) -> SyncReport {
    run_with_cancel(config, CancellationToken::new()).await
}

/// Like [`run`], aborting dispatch of new work once `cancel` fires.
pub async fn run_with_cancel(config: &SyncConfig, cancel: CancellationToken) -> SyncReport {
    drive(config, None, cancel).await
}

/// Run against an already connected transport instead of `config.target`.
pub async fn run_with_transport(
    config: &SyncConfig,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) -> SyncReport {
    drive(config, Some(transport), cancel).await
}

async fn drive(
    config: &SyncConfig,
    transport: Option<Arc<dyn Transport>>,
    cancel: CancellationToken,
) -> SyncReport {
    let clock = Instant::now();
    let mut report = SyncReport::new(Utc::now());

    if let Err(e) = sync_into(config, transport, &cancel, &mut report).await {
        error!("Synchronization failed: {}", e);
        report.fail(e.to_string());
    }

    report.normalize();
    report.duration = clock.elapsed();
    info!("{}", report);
    report
}

async fn sync_into(
    config: &SyncConfig,
    transport: Option<Arc<dyn Transport>>,
    cancel: &CancellationToken,
    report: &mut SyncReport,
) -> Result<()> {
    config.validate()?;

    let manifest_path = config.manifest_path();
    let options = scan_options(config, &manifest_path);
    let root = config.directory.clone();

    info!("Scanning {}", root.display());
    let scanned = tokio::task::spawn_blocking(move || scan(&root, &options))
        .await
        .map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
    info!(
        "Scanned {} files ({} bytes), {} unreadable",
        scanned.entries.len(),
        scanned.total_bytes(),
        scanned.errors.len()
    );

    let mut manifest = Manifest::load(&manifest_path, config.force)?;

    let mut actions = plan(&manifest, &scanned.entries, config.skip_removal);
    // A path we failed to read is not a path that was removed.
    actions.retain(|action| {
        !matches!(action, Action::Delete(path) if shadowed_by_scan_error(path, &scanned.errors))
    });
    report.errored.extend(scanned.errors);

    let summary = PlanSummary::of(&actions);
    info!("Plan: {}", summary);

    if config.checksum_only {
        for action in &actions {
            match action {
                Action::Skip(_) => report.skipped.push(action.path().to_string()),
                _ => report.would_execute.push(PlannedAction::from(action)),
            }
            action.apply_to(&mut manifest);
        }
        manifest.save(&manifest_path)?;
        info!("Checksum-only run: manifest written to {}", manifest_path.display());
        return Ok(());
    }

    let transport = match transport {
        Some(transport) => transport,
        None if config.dry_run => {
            crate::transport::connect_read_only(&config.target, config.concurrency).await?
        }
        None => crate::transport::connect(&config.target, config.concurrency).await?,
    };
    let executor = Executor::new(Arc::clone(&transport), config.concurrency, cancel.clone());
    let outcome = executor
        .execute(actions, &config.directory, &mut manifest, config.dry_run)
        .await;
    let fatal = merge_outcome(report, outcome);

    if config.dry_run {
        close(transport.as_ref()).await;
        return Ok(());
    }

    // Persist whatever completed, even when the run is about to fail.
    manifest.save(&manifest_path)?;
    info!(
        "Manifest written to {} ({} files)",
        manifest_path.display(),
        manifest.len()
    );

    if let Some(fatal) = fatal {
        close(transport.as_ref()).await;
        return Err(fatal.into());
    }
    if cancel.is_cancelled() {
        close(transport.as_ref()).await;
        report.fail("interrupted");
        return Ok(());
    }

    if config.publish_manifest {
        publish(transport.as_ref(), &manifest_path, &config.checksum_file, report).await;
    }
    close(transport.as_ref()).await;
    Ok(())
}

fn scan_options(config: &SyncConfig, manifest_path: &Path) -> ScanOptions {
    let mut options =
        ScanOptions::new(config.file_size_threshold).exclude_names(config.exclude.iter().cloned());

    if let Ok(relative) = manifest_path.strip_prefix(&config.directory) {
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !relative.is_empty() {
            options = options.exclude_file(relative);
        }
    }
    options
}

fn shadowed_by_scan_error(path: &str, errors: &[FileError]) -> bool {
    errors.iter().any(|error| {
        !error.path.is_empty()
            && (error.path == path || path.starts_with(&format!("{}/", error.path)))
    })
}

/// Fold an execution outcome into the report, handing back the fatal error.
fn merge_outcome(
    report: &mut SyncReport,
    outcome: ExecutionOutcome,
) -> Option<TransportError> {
    report.created.extend(outcome.created);
    report.updated.extend(outcome.updated);
    report.deleted.extend(outcome.deleted);
    report.skipped.extend(outcome.skipped);
    report.errored.extend(outcome.errored);
    report.would_execute.extend(outcome.would_execute);
    report.not_attempted.extend(outcome.not_attempted);
    report.bytes_transferred += outcome.bytes_transferred;
    outcome.fatal
}

async fn publish(
    transport: &dyn Transport,
    manifest_path: &Path,
    checksum_file: &str,
    report: &mut SyncReport,
) {
    let remote_name = Path::new(checksum_file)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| checksum_file.to_string());

    match transport.upload(manifest_path, &remote_name).await {
        Ok(bytes) => info!("Published manifest as {} ({} bytes)", remote_name, bytes),
        Err(e) => {
            warn!("Failed to publish manifest: {}", e);
            report
                .errored
                .push(FileError::new(remote_name, format!("publishing manifest: {}", e)));
        }
    }
}

async fn close(transport: &dyn Transport) {
    if let Err(e) = transport.close().await {
        warn!("Failed to close transport: {}", e);
    }
}
