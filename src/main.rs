//! snapvault — slice a snapshot stream into volumes, fan them out to every
//! configured destination, and persist a resumable manifest of the run.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use snapvault::backend::{Backend, FsBackend};
use snapvault::config::Config;
use snapvault::daemon::shutdown::ShutdownCoordinator;
use snapvault::manifest::{JobInfo, ManifestStore};
use snapvault::pipeline::coordinator::{self, Destination, RunOptions};
use snapvault::planner;
use snapvault::progress::ProgressTracker;
use snapvault::resume;
use snapvault::snapshot::{SnapshotSource, ZfsSnapshotSource};
use snapvault::utils;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Source snapshot dataset (overrides config)
    #[arg(long)]
    volume: Option<String>,

    /// Destination URI; may be repeated to chain destinations in order
    /// (overrides config)
    #[arg(long = "destination")]
    destinations: Vec<String>,

    /// Working directory for staging and the manifest cache (overrides config)
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Target volume size in MiB (overrides config)
    #[arg(long)]
    volume_size_mib: Option<u64>,

    /// Buffered volumes in flight; 0 selects pipe mode (overrides config)
    #[arg(long)]
    max_file_buffer: Option<usize>,

    /// Concurrent upload bound across the destination chain (overrides config)
    #[arg(long)]
    max_parallel_uploads: Option<usize>,

    /// Force a full backup (overrides config)
    #[arg(long)]
    full: bool,

    /// Force an incremental backup (overrides config)
    #[arg(long)]
    incremental: bool,

    /// Force a full backup once the last comparable backup is this many
    /// hours old (overrides config)
    #[arg(long)]
    full_if_older_than_hours: Option<i64>,

    /// Resume the prior run for this volume/destination pair (overrides config)
    #[arg(long)]
    resume: bool,

    /// Path to the snapshot utility binary
    #[arg(long, default_value = "zfs")]
    zfs_binary: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "snapvault v{} starting for volume {}",
        env!("CARGO_PKG_VERSION"),
        config.job.volume_name
    );

    if config.job.volume_name.is_empty() {
        bail!("no volume configured: pass --volume or set job.volume_name in the config file");
    }
    if config.job.destinations.is_empty() {
        bail!("no destinations configured: pass --destination or set job.destinations");
    }
    if config.job.max_file_buffer == 0 && config.job.destinations.len() > 1 {
        bail!("pipe mode (max_file_buffer = 0) supports exactly one destination");
    }

    tokio::fs::create_dir_all(&config.job.working_dir)
        .await
        .with_context(|| format!("creating working directory {}", config.job.working_dir.display()))?;

    let shutdown_coordinator = ShutdownCoordinator::new();
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_coordinator.wait_for_signal().await;
        signal_cancel.cancel();
        shutdown_coordinator.shutdown().await;
    });

    let destinations = config
        .job
        .destinations
        .iter()
        .map(|uri| build_destination(uri))
        .collect::<Result<Vec<_>>>()?;

    let manifest_store = Arc::new(ManifestStore::new(config.job.working_dir.clone()));

    let snapshot_source = ZfsSnapshotSource {
        zfs_binary: args.zfs_binary.clone(),
    };
    let snapshots = snapshot_source
        .list_snapshots(&config.job.volume_name)
        .await
        .context("listing snapshots")?;

    let mut job = JobInfo {
        volume_name: config.job.volume_name.clone(),
        base_snapshot: None,
        incremental_snapshot: None,
        destinations: config.job.destinations.clone(),
        volume_size_mib: config.job.volume_size_mib,
        max_file_buffer: config.job.max_file_buffer,
        max_parallel_uploads: config.job.max_parallel_uploads,
        compressor: config.job.compressor.clone(),
        encrypt_to: config.job.encrypt_to.clone(),
        sign_from: config.job.sign_from.clone(),
        full: config.job.full,
        incremental: config.job.incremental,
        full_if_older_than: config.job.full_if_older_than(),
        resume: config.job.resume,
        volumes: Vec::new(),
        start_time: Some(chrono::Utc::now()),
        end_time: None,
        zfs_stream_bytes: 0,
        zfs_command_line: Vec::new(),
    };

    if job.resume {
        resume::plan_resume(&mut job, &manifest_store, &expected_command_line(&args.zfs_binary)).await?;
    }
    if job.base_snapshot.is_none() {
        let mut per_destination_manifests = Vec::with_capacity(destinations.len());
        for dest in &destinations {
            match manifest_store.sync_cache(&dest.uri, dest.backend.as_ref()).await {
                Ok(manifests) => per_destination_manifests.push(manifests),
                Err(e) => {
                    resume::warn_cache_failure(&format!("syncing manifest cache for {}", dest.uri), &e);
                    per_destination_manifests.push(manifest_store.load_all_local(&dest.uri).await?);
                }
            }
        }
        planner::plan(&mut job, &snapshots, &per_destination_manifests)?;
    }

    let stream_process = snapshot_source
        .send(&job.volume_name, job.base_snapshot.as_ref().unwrap(), job.incremental_snapshot.as_ref())
        .await
        .context("starting snapshot stream")?;

    let progress: coordinator::SharedProgress = Arc::new(Mutex::new(ProgressTracker::new(0)));
    let progress_logger = spawn_progress_logger(progress.clone(), cancel.clone());

    let finished = if job.max_file_buffer == 0 {
        let destination = destinations.into_iter().next().expect("checked non-empty above");
        coordinator::run_piped(
            job,
            stream_process,
            destination,
            manifest_store,
            config.job.working_dir.clone(),
            Some(progress.clone()),
        )
        .await?
    } else {
        let opts = RunOptions {
            working_dir: config.job.working_dir.clone(),
            progress: Some(progress.clone()),
        };
        coordinator::run_buffered(job, stream_process, destinations, manifest_store, opts, cancel.clone()).await?
    };

    progress_logger.abort();
    signal_task.abort();

    tracing::info!(
        "run complete: {} volumes, {} bytes, started {:?}, ended {:?}",
        finished.volumes.len(),
        finished.data_bytes(),
        finished.start_time,
        finished.end_time
    );

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(volume) = &args.volume {
        config.job.volume_name = volume.clone();
    }
    if !args.destinations.is_empty() {
        config.job.destinations = args.destinations.clone();
    }
    if let Some(working_dir) = &args.working_dir {
        config.job.working_dir = working_dir.clone();
    }
    if let Some(mib) = args.volume_size_mib {
        config.job.volume_size_mib = mib;
    }
    if let Some(n) = args.max_file_buffer {
        config.job.max_file_buffer = n;
    }
    if let Some(n) = args.max_parallel_uploads {
        config.job.max_parallel_uploads = n;
    }
    if args.full {
        config.job.full = true;
    }
    if args.incremental {
        config.job.incremental = true;
    }
    if args.full_if_older_than_hours.is_some() {
        config.job.full_if_older_than_hours = args.full_if_older_than_hours;
    }
    if args.resume {
        config.job.resume = true;
    }
}

/// The tool/subcommand prefix this run would invoke, compared against a
/// cached run's command line on resume. The snapshot endpoints aren't known
/// yet at this point — resume adopts them from the cached manifest instead.
fn expected_command_line(zfs_binary: &str) -> Vec<String> {
    vec![zfs_binary.to_string(), "send".to_string()]
}

fn build_destination(uri: &str) -> Result<Destination> {
    let backend: Arc<dyn Backend> = if let Some(path) = uri.strip_prefix("file://") {
        Arc::new(FsBackend::new(PathBuf::from(path)))
    } else {
        bail!("unsupported destination scheme in {uri:?}: only file:// is built in");
    };
    Ok(Destination {
        uri: uri.to_string(),
        backend,
    })
}

fn spawn_progress_logger(progress: coordinator::SharedProgress, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {}
                _ = cancel.cancelled() => return,
            }
            let (bytes, speed) = {
                let tracker = progress.lock().unwrap();
                (tracker.progress().transferred_bytes, tracker.average_speed())
            };
            tracing::info!(
                "progress: {} sent ({} average)",
                snapvault::progress::format_bytes(bytes),
                snapvault::progress::format_speed(speed)
            );
        }
    })
}
