//! Wires the source, the destination chain, and the completion/finalize
//! stages into a single backup run.
//!
//! Two execution shapes exist depending on `MaxFileBuffer`:
//!
//! - Buffered (`run_buffered`): the source fills on-disk volumes and feeds
//!   them through `stepCh` into the destination chain (each backend in
//!   turn, then the implicit [`DeleteBackend`]). A counting gate
//!   (`ManiWg`) lets a finalizer task know when every volume has cleared
//!   the chain, so it can append the final manifest and close the channel
//!   without racing the source.
//! - Piped (`run_piped`): `MaxFileBuffer == 0` restricts a job to one
//!   destination and skips the chain/delete stage entirely, streaming the
//!   snapshot straight into that destination. The final manifest is still
//!   staged as a small on-disk `Volume` so it can be uploaded and cached the
//!   same way `run_buffered`'s finalizer does.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{Backend, DeleteBackend};
use crate::manifest::{object_name, JobInfo, ManifestStore};
use crate::pipeline::source::{self, SourceConfig};
use crate::progress::ProgressTracker;
use crate::snapshot::StreamProcess;
use crate::utils::errors::Result;
use crate::volume::Volume;

/// Shared throughput tracker a caller can poll for live speed/ETA
/// reporting while a run is in flight.
pub type SharedProgress = Arc<StdMutex<ProgressTracker>>;

const CHAIN_CHANNEL_CAPACITY: usize = 16;

/// Counting gate: starts biased by one unit representing "production is
/// still running". The bridge adds one unit per volume it forwards and
/// releases its bias once the stream is exhausted; the completion sink
/// releases one unit per volume it finishes processing. A finalizer
/// waiting on the gate is released exactly when production has ended and
/// every volume it produced has drained through the tail.
struct ManiWg {
    count: AtomicI64,
    notify: Notify,
}

impl ManiWg {
    fn new() -> Self {
        Self {
            count: AtomicI64::new(1),
            notify: Notify::new(),
        }
    }

    fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_one();
        }
    }

    async fn wait(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// A configured destination: its URI (for naming/logging) and backend.
pub struct Destination {
    pub uri: String,
    pub backend: Arc<dyn Backend>,
}

pub struct RunOptions {
    pub working_dir: PathBuf,
    /// Optional live throughput tracker; the completion sink updates it
    /// after every volume so a caller can poll it for status reporting.
    pub progress: Option<SharedProgress>,
}

/// Run the buffered-mode pipeline to completion, returning the finished
/// `JobInfo` (including `EndTime` and the final manifest's volume record).
pub async fn run_buffered(
    mut job: JobInfo,
    mut stream_process: StreamProcess,
    destinations: Vec<Destination>,
    manifest_store: Arc<ManifestStore>,
    opts: RunOptions,
    cancel: CancellationToken,
) -> Result<JobInfo> {
    job.zfs_command_line = stream_process.command_line.clone();
    let stdout = source::compress_stream(stream_process.stdout(), job.compressor.as_deref());

    let staging_dir = opts.working_dir.join("staging");
    tokio::fs::create_dir_all(&staging_dir).await?;

    let file_buffer = Arc::new(Semaphore::new(job.max_file_buffer.max(1)));
    let upload_permits = Arc::new(Semaphore::new(job.max_parallel_uploads.max(1)));
    let maniwg = Arc::new(ManiWg::new());

    let (tx0, rx0) = mpsc::channel::<Volume>(CHAIN_CHANNEL_CAPACITY);
    let tx_bridge = tx0.clone();
    let tx_final = tx0;

    let (start_volume_number, skip_bytes) = job.resume_point();
    let volume_name = job.volume_name.clone();
    let base_name = job.base_snapshot.as_ref().map(|s| s.name.clone()).unwrap_or_default();
    let incremental_name = job
        .incremental_snapshot
        .as_ref()
        .map(|s| s.name.clone())
        .unwrap_or_default();

    let source_cfg = SourceConfig {
        volume_size_mib: job.volume_size_mib,
        staging_dir: staging_dir.clone(),
    };

    let bridge_maniwg = Arc::clone(&maniwg);
    let bridge = tokio::spawn(async move {
        let on_send = {
            let maniwg = Arc::clone(&bridge_maniwg);
            move || maniwg.add(1)
        };
        let result = source::run(
            stdout,
            &source_cfg,
            start_volume_number,
            skip_bytes,
            file_buffer,
            tx_bridge.clone(),
            move |n| format!("{volume_name}_{base_name}_{incremental_name}.vol{n:010}"),
            on_send,
        )
        .await;
        bridge_maniwg.done();
        drop(tx_bridge);
        stream_process.kill_and_reap().await;
        result
    });

    let job = Arc::new(AsyncMutex::new(job));

    let finalizer_job = Arc::clone(&job);
    let finalizer_maniwg = Arc::clone(&maniwg);
    let finalizer_manifest_store = Arc::clone(&manifest_store);
    let finalizer_destinations: Vec<String> = destinations.iter().map(|d| d.uri.clone()).collect();
    let finalizer_staging = staging_dir.clone();
    let finalizer: tokio::task::JoinHandle<Result<()>> = tokio::spawn(async move {
        finalizer_maniwg.wait().await;

        let mut guard = finalizer_job.lock().await;
        guard.end_time = Some(Utc::now());
        // `ZFSStreamBytes` covers every data volume plus the final manifest
        // object itself, so the manifest's own size has to be folded in
        // before it's serialized — estimate with the data-only total first,
        // then correct once the manifest's real encoded size is known.
        guard.zfs_stream_bytes = guard.data_bytes();
        let manifest_name = object_name(&guard, 0, true);
        let provisional_json = guard.to_json()?;
        guard.zfs_stream_bytes = guard.data_bytes() + provisional_json.len() as u64;
        let json = guard.to_json()?;
        drop(guard);

        let path = finalizer_staging.join("manifest-final.json");
        let manifest_volume = Volume::create_manifest(manifest_name.clone(), u64::MAX, path, &json, true).await?;

        for dest in &finalizer_destinations {
            let guard = finalizer_job.lock().await;
            finalizer_manifest_store.save_local(dest, &manifest_name, &guard).await?;
        }

        if tx_final.send(manifest_volume).await.is_err() {
            info!("destination chain closed before the final manifest could be sent");
        }
        drop(tx_final);
        Ok(())
    });

    let mut tail_rx = rx0;
    for dest in &destinations {
        tail_rx = dest
            .backend
            .clone()
            .start_upload(tail_rx, Arc::clone(&upload_permits), cancel.clone());
    }

    let delete_backend = if job.lock().await.max_file_buffer != 0 {
        let db = Arc::new(DeleteBackend::new());
        tail_rx = db
            .clone()
            .start_upload(tail_rx, Arc::clone(&upload_permits), cancel.clone());
        Some(db)
    } else {
        None
    };

    while let Some(volume) = tail_rx.recv().await {
        if volume.info.is_final_manifest {
            // Not counted by the gate (the finalizer sends it only after
            // the gate already reached zero); just let it drain.
            drop(volume);
            continue;
        }
        let mut guard = job.lock().await;
        guard.push_volume(volume.info.clone());
        for dest in &destinations {
            let manifest_name = object_name(&guard, 0, true);
            manifest_store.save_local(&dest.uri, &manifest_name, &guard).await?;
        }
        if let Some(tracker) = &opts.progress {
            tracker.lock().unwrap().update(guard.data_bytes());
        }
        drop(guard);
        maniwg.done();
        drop(volume);
    }

    for dest in &destinations {
        dest.backend.wait().await?;
        dest.backend.close().await?;
    }
    if let Some(db) = &delete_backend {
        db.wait().await?;
    }

    bridge.await.expect("bridge task panicked")?;
    finalizer.await.expect("finalizer task panicked")?;

    let job = Arc::try_unwrap(job)
        .unwrap_or_else(|arc| panic!("job still shared by {} holders at run end", Arc::strong_count(&arc)))
        .into_inner();
    Ok(job)
}

/// Run the pipe-mode pipeline: stream the snapshot directly into the
/// single configured destination, with no on-disk volume and no backend
/// chain. Still slices the stream into volume-sized pieces
/// so the resulting manifest looks the same as a buffered run's.
pub async fn run_piped(
    mut job: JobInfo,
    mut stream_process: StreamProcess,
    destination: Destination,
    manifest_store: Arc<ManifestStore>,
    working_dir: PathBuf,
    progress: Option<SharedProgress>,
) -> Result<JobInfo> {
    use tokio::io::AsyncReadExt;

    job.zfs_command_line = stream_process.command_line.clone();
    let mut stdout = source::compress_stream(stream_process.stdout(), job.compressor.as_deref());

    let threshold = job
        .volume_size_mib
        .saturating_mul(1024 * 1024)
        .saturating_sub(50 * 1024);

    let (start_volume_number, skip_bytes) = job.resume_point();
    source::skip_bytes(&mut stdout, skip_bytes).await?;

    let mut volume_number = start_volume_number;
    let mut read_buf = vec![0u8; 64 * 1024];

    loop {
        let object = format!(
            "{}_{}_{}.vol{volume_number:010}",
            job.volume_name,
            job.base_snapshot.as_ref().map(|s| s.name.as_str()).unwrap_or(""),
            job.incremental_snapshot.as_ref().map(|s| s.name.as_str()).unwrap_or(""),
        );

        let mut volume = Volume::create_piped(object.clone(), volume_number);
        let reader = volume.open_reader().await?;

        let backend = Arc::clone(&destination.backend);
        let object_for_upload = object.clone();
        let upload = tokio::spawn(async move { backend.upload_stream(&object_for_upload, reader).await });

        let mut eof = false;
        while volume.counter() < threshold {
            let want = std::cmp::min(read_buf.len() as u64, threshold - volume.counter()) as usize;
            let n = stdout.read(&mut read_buf[..want]).await?;
            if n == 0 {
                eof = true;
                break;
            }
            volume.write_all(&read_buf[..n]).await?;
        }
        volume.close().await?;

        let bytes = upload.await.expect("pipe-mode upload task panicked")?;
        volume.info.zfs_stream_bytes = bytes;
        job.push_volume(volume.info.clone());

        let manifest_name = object_name(&job, 0, true);
        manifest_store.save_local(&destination.uri, &manifest_name, &job).await?;
        if let Some(tracker) = &progress {
            tracker.lock().unwrap().update(job.data_bytes());
        }

        volume_number += 1;
        if eof {
            break;
        }
    }

    job.end_time = Some(Utc::now());
    job.zfs_stream_bytes = job.data_bytes();
    let manifest_name = object_name(&job, 0, true);
    let provisional_json = job.to_json()?;
    job.zfs_stream_bytes = job.data_bytes() + provisional_json.len() as u64;
    let json = job.to_json()?;

    let staging_dir = working_dir.join("staging");
    tokio::fs::create_dir_all(&staging_dir).await?;
    let manifest_path = staging_dir.join("manifest-final.json");
    let mut manifest_volume = Volume::create_manifest(manifest_name.clone(), u64::MAX, manifest_path, &json, true).await?;

    let manifest_reader = manifest_volume.open_reader().await?;
    destination.backend.upload_stream(&manifest_name, manifest_reader).await?;
    manifest_store.save_local(&destination.uri, &manifest_name, &job).await?;
    manifest_volume.delete_volume().await?;

    stream_process.kill_and_reap().await;
    Ok(job)
}
