//! End-to-end runs against the local backend and a scripted in-memory target.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use syncbox::config::{SyncConfig, TransportTarget};
use syncbox::executor::manifest::Manifest;
use syncbox::sync::{ActionKind, RunOutcome};
use syncbox::transport::{RemoteEntry, Transport, TransportResult};
use syncbox::utils::errors::{TransportError, TransportErrorKind};
use syncbox::{run, run_with_transport};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MANIFEST: &str = ".syncbox.json.gz";

struct Fixture {
    source: TempDir,
    target: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            source: TempDir::new().unwrap(),
            target: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(
            self.source.path(),
            TransportTarget::Local {
                root: self.target.path().to_path_buf(),
            },
        );
        config.file_size_threshold = 16;
        config.concurrency = 4;
        config
    }

    fn write(&self, relative: &str, content: &[u8]) {
        let path = self.source.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn remove(&self, relative: &str) {
        fs::remove_file(self.source.path().join(relative)).unwrap();
    }

    fn remote(&self, relative: &str) -> Option<Vec<u8>> {
        fs::read(self.target.path().join(relative)).ok()
    }

    fn manifest_path(&self) -> std::path::PathBuf {
        self.source.path().join(MANIFEST)
    }

    fn manifest(&self) -> Manifest {
        Manifest::load(&self.manifest_path(), false).unwrap()
    }
}

fn set_mtime(path: &Path, secs: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[tokio::test]
async fn test_first_run_creates_small_file_without_hash() {
    let fx = Fixture::new();
    fx.write("a.txt", b"8 bytes!");

    let report = run(&fx.config()).await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.created, vec!["a.txt"]);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(fx.remote("a.txt").unwrap(), b"8 bytes!");

    let manifest = fx.manifest();
    assert_eq!(manifest.len(), 1);
    let entry = manifest.get("a.txt").unwrap();
    assert_eq!(entry.size, 8);
    assert!(entry.content_hash.is_none());
}

#[tokio::test]
async fn test_second_run_without_changes_does_nothing() {
    let fx = Fixture::new();
    fx.write("a.txt", b"8 bytes!");
    fx.write("dir/b.txt", b"a file large enough to be hashed");

    let first = run(&fx.config()).await;
    assert_eq!(first.created_count(), 2);

    let second = run(&fx.config()).await;
    assert_eq!(second.outcome, RunOutcome::Done);
    assert!(second.created.is_empty());
    assert!(second.updated.is_empty());
    assert!(second.deleted.is_empty());
    assert_eq!(second.skipped, vec!["a.txt", "dir/b.txt"]);
    assert_eq!(second.bytes_transferred, 0);
}

#[tokio::test]
async fn test_growing_past_threshold_updates_with_hash() {
    let fx = Fixture::new();
    fx.write("a.txt", b"8 bytes!");
    run(&fx.config()).await;

    fx.write("a.txt", b"now well beyond the sixteen byte threshold");
    let report = run(&fx.config()).await;

    assert_eq!(report.updated, vec!["a.txt"]);
    assert_eq!(
        fx.remote("a.txt").unwrap(),
        b"now well beyond the sixteen byte threshold"
    );
    let manifest = fx.manifest();
    let hash = manifest.get("a.txt").and_then(|e| e.content_hash.clone());
    assert_eq!(hash.map(|h| h.len()), Some(64));
}

#[tokio::test]
async fn test_small_file_compared_by_size_and_mtime() {
    let fx = Fixture::new();
    fx.write("a.txt", b"aaaa");
    set_mtime(&fx.source.path().join("a.txt"), 1_600_000_000);
    run(&fx.config()).await;

    // Same size and mtime: invisible below the threshold.
    fx.write("a.txt", b"bbbb");
    set_mtime(&fx.source.path().join("a.txt"), 1_600_000_000);
    let report = run(&fx.config()).await;
    assert_eq!(report.skipped, vec!["a.txt"]);

    set_mtime(&fx.source.path().join("a.txt"), 1_600_000_100);
    let report = run(&fx.config()).await;
    assert_eq!(report.updated, vec!["a.txt"]);
    assert_eq!(fx.remote("a.txt").unwrap(), b"bbbb");
}

#[tokio::test]
async fn test_large_file_compared_by_hash() {
    let fx = Fixture::new();
    let path = fx.source.path().join("big.bin");
    fx.write("big.bin", b"0123456789abcdef0123456789abcdef");
    set_mtime(&path, 1_600_000_000);
    run(&fx.config()).await;

    // Touching without changing content is not a change.
    set_mtime(&path, 1_700_000_000);
    let report = run(&fx.config()).await;
    assert_eq!(report.skipped, vec!["big.bin"]);

    // Same size and mtime, different bytes: caught by the hash.
    fx.write("big.bin", b"fedcba9876543210fedcba9876543210");
    set_mtime(&path, 1_700_000_000);
    let report = run(&fx.config()).await;
    assert_eq!(report.updated, vec!["big.bin"]);
}

#[tokio::test]
async fn test_removed_file_deleted_remotely() {
    let fx = Fixture::new();
    fx.write("a.txt", b"keep");
    fx.write("old/b.txt", b"drop");
    run(&fx.config()).await;
    assert!(fx.remote("old/b.txt").is_some());

    fx.remove("old/b.txt");
    let report = run(&fx.config()).await;

    assert_eq!(report.deleted, vec!["old/b.txt"]);
    assert!(fx.remote("old/b.txt").is_none());
    assert!(!fx.target.path().join("old").exists());
    assert!(!fx.manifest().contains("old/b.txt"));
}

#[tokio::test]
async fn test_skip_removal_keeps_remote_and_manifest_entry() {
    let fx = Fixture::new();
    fx.write("a.txt", b"keep");
    fx.write("b.txt", b"stay");
    run(&fx.config()).await;

    fx.remove("b.txt");
    let mut config = fx.config();
    config.skip_removal = true;
    let report = run(&config).await;

    assert!(report.deleted.is_empty());
    assert_eq!(report.skipped, vec!["a.txt"]);
    assert!(fx.remote("b.txt").is_some());
    assert!(fx.manifest().contains("b.txt"));

    // Without the flag the carried-forward entry is finally removed.
    let report = run(&fx.config()).await;
    assert_eq!(report.deleted, vec!["b.txt"]);
}

#[tokio::test]
async fn test_corrupt_manifest_fails_without_force() {
    let fx = Fixture::new();
    fx.write("a.txt", b"content");
    fs::write(fx.manifest_path(), b"\x1f\x8b truncated").unwrap();

    let report = run(&fx.config()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.exit_code(), 2);
    assert!(report
        .failure
        .as_deref()
        .unwrap_or_default()
        .contains("Corrupt manifest"));
    assert_eq!(fs::read(fx.manifest_path()).unwrap(), b"\x1f\x8b truncated");
    assert!(fx.remote("a.txt").is_none());
}

#[tokio::test]
async fn test_corrupt_manifest_with_force_resyncs_everything() {
    let fx = Fixture::new();
    fx.write("a.txt", b"content");
    fx.write("b/c.txt", b"more content");
    fs::write(fx.manifest_path(), b"not gzip at all").unwrap();

    let mut config = fx.config();
    config.force = true;
    let report = run(&config).await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.created, vec!["a.txt", "b/c.txt"]);
    assert_eq!(fx.manifest().len(), 2);
}

#[tokio::test]
async fn test_dry_run_transfers_and_persists_nothing() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");
    fx.write("b.txt", b"two");

    let mut config = fx.config();
    config.dry_run = true;
    let report = run(&config).await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert!(report.created.is_empty());
    let planned: Vec<_> = report
        .would_execute
        .iter()
        .map(|a| (a.kind, a.path.as_str()))
        .collect();
    assert_eq!(
        planned,
        vec![(ActionKind::Create, "a.txt"), (ActionKind::Create, "b.txt")]
    );
    assert!(!fx.manifest_path().exists());
    assert!(fx.remote("a.txt").is_none());
}

#[tokio::test]
async fn test_checksum_only_records_without_transfer() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");

    let mut config = fx.config();
    config.checksum_only = true;
    let report = run(&config).await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.would_execute.len(), 1);
    assert!(fx.remote("a.txt").is_none());
    assert!(fx.manifest().contains("a.txt"));

    // The manifest now claims the file is in sync.
    let report = run(&fx.config()).await;
    assert_eq!(report.skipped, vec!["a.txt"]);
}

#[tokio::test]
async fn test_missing_source_directory_fails() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.directory = fx.source.path().join("does-not-exist");

    let report = run(&config).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn test_invalid_config_fails() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.concurrency = 0;

    let report = run(&config).await;
    assert_eq!(report.outcome, RunOutcome::Failed);
}

#[tokio::test]
async fn test_excluded_names_are_not_synced() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");
    fx.write(".git/HEAD", b"ref: refs/heads/main");
    fx.write("build/out.o", b"object");
    fx.write("cache/tmp.bin", b"cache");
    fx.write(".syncboxignore", b"# generated\nbuild\n");

    let mut config = fx.config();
    config.exclude = vec!["cache".to_string()];
    let report = run(&config).await;

    assert_eq!(report.created, vec!["a.txt"]);
    assert!(fx.remote(".git/HEAD").is_none());
    assert!(fx.remote(MANIFEST).is_none());
}

#[tokio::test]
async fn test_publish_manifest_uploads_it() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");

    let mut config = fx.config();
    config.publish_manifest = true;
    let report = run(&config).await;

    assert_eq!(report.outcome, RunOutcome::Done);
    let published = fx.remote(MANIFEST).unwrap();
    let manifest = Manifest::decode(&published).unwrap();
    assert!(manifest.contains("a.txt"));
}

#[tokio::test]
async fn test_manifest_outside_source_directory() {
    let fx = Fixture::new();
    let state = TempDir::new().unwrap();
    fx.write("a.txt", b"one");

    let mut config = fx.config();
    let manifest_path = state.path().join("state/manifest.json.gz");
    config.checksum_file = manifest_path.display().to_string();
    run(&config).await;

    assert!(!fx.manifest_path().exists());
    assert!(Manifest::load(&manifest_path, false).unwrap().contains("a.txt"));
}

/// In-memory target whose uploads fail on command.
#[derive(Default)]
struct ScriptedTransport {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, TransportErrorKind>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn failing(path: &str, kind: TransportErrorKind) -> Self {
        let transport = Self::default();
        transport
            .failures
            .lock()
            .unwrap()
            .insert(path.to_string(), kind);
        transport
    }

    fn stored(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    fn check(&self, path: &str) -> TransportResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().get(path) {
            Some(kind) => Err(TransportError::new(*kind, format!("scripted failure of {}", path))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn list(&self, prefix: &str) -> TransportResult<Vec<RemoteEntry>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, data)| RemoteEntry {
                path: path.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn exists(&self, path: &str) -> TransportResult<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> TransportResult<u64> {
        self.check(remote_path)?;
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| TransportError::from_source_io(&e, local_path.display()))?;
        let size = data.len() as u64;
        self.files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), data);
        Ok(size)
    }

    async fn delete(&self, remote_path: &str) -> TransportResult<()> {
        self.check(remote_path)?;
        match self.files.lock().unwrap().remove(remote_path) {
            Some(_) => Ok(()),
            None => Err(TransportError::not_found(remote_path)),
        }
    }
}

#[tokio::test]
async fn test_per_file_failure_completes_with_errors() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");
    fx.write("b.txt", b"two");
    fx.write("c.txt", b"three");

    let transport = Arc::new(ScriptedTransport::failing(
        "b.txt",
        TransportErrorKind::PermissionDenied,
    ));
    let report = run_with_transport(&fx.config(), transport.clone(), CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.created, vec!["a.txt", "c.txt"]);
    assert_eq!(report.errored.len(), 1);
    assert_eq!(report.errored[0].path, "b.txt");
    assert_eq!(transport.stored(), vec!["a.txt", "c.txt"]);

    // The failed file is retried on the next run and nothing else is.
    let retry = Arc::new(ScriptedTransport::default());
    let report = run_with_transport(&fx.config(), retry.clone(), CancellationToken::new()).await;
    assert_eq!(report.created, vec!["b.txt"]);
    assert_eq!(report.skipped, vec!["a.txt", "c.txt"]);
    assert_eq!(retry.stored(), vec!["b.txt"]);
}

#[tokio::test]
async fn test_fatal_error_aborts_but_persists_completed_work() {
    let fx = Fixture::new();
    for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
        fx.write(name, name.as_bytes());
    }

    let mut config = fx.config();
    config.concurrency = 1;
    let transport = Arc::new(ScriptedTransport::failing(
        "b.txt",
        TransportErrorKind::ConnectionFailed,
    ));
    let report = run_with_transport(&config, transport.clone(), CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.created, vec!["a.txt"]);
    assert_eq!(report.errored[0].path, "b.txt");
    assert_eq!(report.not_attempted, vec!["c.txt", "d.txt"]);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

    let manifest = fx.manifest();
    assert_eq!(manifest.len(), 1);
    assert!(manifest.contains("a.txt"));
}

#[tokio::test]
async fn test_auth_failure_is_fatal() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");

    let transport = Arc::new(ScriptedTransport::failing(
        "a.txt",
        TransportErrorKind::AuthFailed,
    ));
    let report = run_with_transport(&fx.config(), transport, CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(fx.manifest().is_empty());
}

#[tokio::test]
async fn test_interrupted_run_is_failed() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let transport = Arc::new(ScriptedTransport::default());
    let report = run_with_transport(&fx.config(), transport.clone(), cancel).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.not_attempted, vec!["a.txt"]);
    assert!(transport.stored().is_empty());
}

#[tokio::test]
async fn test_delete_of_missing_remote_file_settles() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");
    run_with_transport(
        &fx.config(),
        Arc::new(ScriptedTransport::default()),
        CancellationToken::new(),
    )
    .await;

    fx.remove("a.txt");
    // A fresh target never received a.txt.
    let report = run_with_transport(
        &fx.config(),
        Arc::new(ScriptedTransport::default()),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.exit_code(), 0);
    assert!(report.errored.is_empty());
    assert_eq!(report.deleted, vec!["a.txt"]);
    assert!(!fx.manifest().contains("a.txt"));

    let again = run_with_transport(
        &fx.config(),
        Arc::new(ScriptedTransport::default()),
        CancellationToken::new(),
    )
    .await;
    assert!(again.deleted.is_empty());
    assert_eq!(again.exit_code(), 0);
}

#[tokio::test]
async fn test_directory_replaced_by_file_recovers() {
    let fx = Fixture::new();
    fx.write("a/x.txt", b"inside");
    fx.write("z.txt", b"last");
    run(&fx.config()).await;

    fs::remove_dir_all(fx.source.path().join("a")).unwrap();
    fx.write("a", b"a plain file now");
    fx.write("z.txt", b"last, edited");

    let second = run(&fx.config()).await;
    assert_eq!(second.outcome, RunOutcome::Done);
    assert!(second.not_attempted.is_empty());
    assert_eq!(second.updated, vec!["z.txt"]);
    assert_eq!(fx.remote("z.txt").unwrap(), b"last, edited");

    // Whatever could not be placed in the second run lands in the third.
    let third = run(&fx.config()).await;
    assert_eq!(third.exit_code(), 0);
    assert_eq!(fx.remote("a").unwrap(), b"a plain file now");
    assert!(!fx.manifest().contains("a/x.txt"));
}

#[tokio::test]
async fn test_file_replaced_by_directory_recovers() {
    let fx = Fixture::new();
    fx.write("a", b"a plain file");
    run(&fx.config()).await;

    fx.remove("a");
    fx.write("a/x.txt", b"inside");

    let second = run(&fx.config()).await;
    assert_eq!(second.outcome, RunOutcome::Done);

    let third = run(&fx.config()).await;
    assert_eq!(third.exit_code(), 0);
    assert_eq!(fx.remote("a/x.txt").unwrap(), b"inside");
}

#[tokio::test]
async fn test_dry_run_does_not_create_target_root() {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");

    let mut config = fx.config();
    config.dry_run = true;
    config.target = TransportTarget::Local {
        root: fx.target.path().join("fresh/mirror"),
    };
    let report = run(&config).await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.would_execute.len(), 1);
    assert!(!fx.target.path().join("fresh").exists());
}
