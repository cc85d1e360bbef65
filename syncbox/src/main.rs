//! Syncbox - Main entry point
//!
//! One-shot synchronization of a directory to a local, FTP or S3 target.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use syncbox::config::{Config, FtpTarget, LogConfig, ObjectStorageTarget, SyncConfig};
use syncbox::daemon::shutdown::ShutdownCoordinator;
use syncbox::{run_with_cancel, utils, TransportTarget};

const MB: u64 = 1024 * 1024;

/// Exit status for an unusable configuration; 0-2 come from the report.
const EXIT_CONFIG: u8 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Source directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Manifest file, relative to the source directory unless absolute
    #[arg(long, value_name = "FILE")]
    checksum_file: Option<String>,

    /// Only rebuild the manifest from the source; transfer nothing
    #[arg(long)]
    checksum_only: bool,

    /// Show what would be transferred without doing it
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Treat a corrupt manifest as empty instead of failing
    #[arg(short, long)]
    force: bool,

    /// Number of concurrent transfers
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Hash files of at least this many megabytes
    #[arg(long, value_name = "MB")]
    threshold: Option<u64>,

    /// Never delete remote files missing from the source
    #[arg(long)]
    skip_removal: bool,

    /// Upload the manifest next to the synchronized files
    #[arg(long)]
    publish_manifest: bool,

    /// File or directory name to exclude (repeatable)
    #[arg(short, long, value_name = "NAME")]
    exclude: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    target: Option<TargetCommand>,
}

/// Where to synchronize to (overrides the config file target)
#[derive(Subcommand, Debug)]
enum TargetCommand {
    /// Another local directory
    Local {
        /// Target directory
        root: PathBuf,
    },
    /// An FTP or FTPS server
    Ftp(FtpArgs),
    /// An S3-compatible bucket
    S3(S3Args),
}

#[derive(ClapArgs, Debug)]
struct FtpArgs {
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 21)]
    port: u16,

    #[arg(long, env = "SYNCBOX_FTP_USER")]
    user: String,

    #[arg(long, env = "SYNCBOX_FTP_PASSWORD", hide_env_values = true, default_value = "")]
    password: String,

    /// Remote directory
    #[arg(long, default_value = "/")]
    remote_dir: String,

    /// Use explicit FTPS
    #[arg(long)]
    tls: bool,

    /// Socket timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(ClapArgs, Debug)]
struct S3Args {
    #[arg(long)]
    bucket: String,

    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Endpoint of an S3-compatible store
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key: String,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_key: String,

    #[arg(long, default_value = "STANDARD")]
    storage_class: String,

    /// Key prefix
    #[arg(long, default_value = "")]
    prefix: String,

    /// Use multipart upload from this many megabytes
    #[arg(long, value_name = "MB", default_value_t = 100)]
    multipart_threshold: u64,

    /// Multipart part size in megabytes
    #[arg(long, value_name = "MB", default_value_t = 16)]
    part_size: u64,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

impl From<TargetCommand> for TransportTarget {
    fn from(command: TargetCommand) -> Self {
        match command {
            TargetCommand::Local { root } => TransportTarget::Local { root },
            TargetCommand::Ftp(ftp) => TransportTarget::Ftp(FtpTarget {
                host: ftp.host,
                port: ftp.port,
                user: ftp.user,
                password: ftp.password,
                directory: ftp.remote_dir,
                use_tls: ftp.tls,
                timeout_secs: ftp.timeout,
            }),
            TargetCommand::S3(s3) => TransportTarget::ObjectStorage(ObjectStorageTarget {
                bucket: s3.bucket,
                region: s3.region,
                endpoint: s3.endpoint,
                access_key: s3.access_key,
                secret_key: s3.secret_key,
                storage_class: s3.storage_class,
                prefix: s3.prefix,
                multipart_threshold: s3.multipart_threshold * MB,
                part_size: s3.part_size * MB,
                timeout_secs: s3.timeout,
            }),
        }
    }
}

/// Merge command line flags over the optional config file.
fn build_config(args: Args) -> Result<(SyncConfig, LogConfig)> {
    let cli_target: Option<TransportTarget> = args.target.map(Into::into);

    let (mut sync, mut log) = match &args.config {
        Some(path) => {
            let config = Config::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            (config.sync, config.log)
        }
        None => {
            let target = cli_target
                .clone()
                .context("no target given: pass --config or a target subcommand")?;
            let directory = args.directory.clone().unwrap_or_else(|| PathBuf::from("."));
            (SyncConfig::new(directory, target), LogConfig::default())
        }
    };

    if let Some(target) = cli_target {
        sync.target = target;
    }
    if let Some(directory) = args.directory {
        sync.directory = directory;
    }
    if let Some(checksum_file) = args.checksum_file {
        sync.checksum_file = checksum_file;
    }
    if let Some(concurrency) = args.concurrency {
        sync.concurrency = concurrency;
    }
    if let Some(threshold) = args.threshold {
        sync.file_size_threshold = threshold * MB;
    }
    sync.checksum_only |= args.checksum_only;
    sync.dry_run |= args.dry_run;
    sync.force |= args.force;
    sync.skip_removal |= args.skip_removal;
    sync.publish_manifest |= args.publish_manifest;
    sync.exclude.extend(args.exclude);
    if let Some(level) = args.log_level {
        log.level = level;
    }

    sync.validate()?;
    Ok((sync, log))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let json = args.json;

    let (config, log) = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    // Initialize logging
    utils::logger::init(&log.level)?;

    tracing::info!(
        "Starting syncbox v{}: {} -> {}",
        env!("CARGO_PKG_VERSION"),
        config.directory.display(),
        describe(&config.target)
    );

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.spawn();

    let report = run_with_cancel(&config, shutdown.token()).await;
    listener.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}

fn describe(target: &TransportTarget) -> String {
    match target {
        TransportTarget::Local { root } => root.display().to_string(),
        TransportTarget::Ftp(ftp) => format!("ftp://{}@{}:{}{}", ftp.user, ftp.host, ftp.port, ftp.directory),
        TransportTarget::ObjectStorage(s3) => format!("s3://{}/{}", s3.bucket, s3.prefix),
    }
}
