//! The destination pipeline: a chain of backends, each consuming a channel
//! of completed volumes and re-emitting them after upload.
//!
//! Concrete remote backends (S3, SSH, …) are out of scope for this core,
//! but the `Backend` trait is the seam they plug into. [`FsBackend`] is the
//! reference implementation, used by tests and as a worked example.
//! [`DeleteBackend`] is the implicit terminal stage of the chain.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::utils::errors::{BackupError, Result};
use crate::volume::Volume;

/// URI scheme sentinel for the implicit delete stage.
pub const DELETE_BACKEND_PREFIX: &str = "delete";

const CHAIN_CHANNEL_CAPACITY: usize = 16;

/// Capability set every destination backend implements.
///
/// `start_upload` takes `self: Arc<Self>` rather than `&self` so a backend
/// can spawn `'static` worker tasks that keep it alive for the lifetime of
/// the upload, without the coordinator having to manage that lifetime.
#[async_trait]
pub trait Backend: Send + Sync {
    /// URI scheme this backend handles (e.g. `"file"`, `"s3"`, or the
    /// sentinel [`DELETE_BACKEND_PREFIX`]).
    fn kind(&self) -> &str;

    /// Spawn this backend's upload workers. Every volume received on `rx`
    /// is eventually re-emitted on the returned channel, after the upload
    /// (or deletion, for the delete backend) completes. `permits` bounds
    /// the number of simultaneous uploads across the *entire* chain, not
    /// just this backend.
    fn start_upload(
        self: Arc<Self>,
        rx: mpsc::Receiver<Volume>,
        permits: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Volume>;

    /// Block until every upload spawned by `start_upload` has drained,
    /// returning the first error encountered (if any).
    async fn wait(&self) -> Result<()>;

    /// Release backend resources (connections, temp state). Failures here
    /// are `CacheWarning`-class: logged, not propagated.
    async fn close(&self) -> Result<()>;

    /// List object names currently present at this destination.
    async fn list(&self) -> Result<Vec<String>>;

    /// Fetch an object's bytes (used by `syncCache`).
    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Delete an object.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Pipe-mode upload: write `reader` straight through
    /// to the destination, returning the number of bytes transferred. Pipe
    /// mode restricts a job to a single destination, so this bypasses the
    /// channel chain entirely — there is nothing to chain to.
    async fn upload_stream(
        &self,
        object_name: &str,
        reader: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
    ) -> Result<u64>;
}

/// Local-filesystem destination: copies each volume's bytes into `root`
/// under its object name. The reference concrete backend.
pub struct FsBackend {
    root: PathBuf,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl FsBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn upload_one(root: &PathBuf, volume: &mut Volume) -> Result<()> {
        tokio::fs::create_dir_all(root).await?;
        let dest = root.join(&volume.info.object_name);
        let mut reader = volume.open_reader().await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        tokio::fs::write(&dest, &buf).await?;
        debug!(
            "uploaded {} ({} bytes) to {}",
            volume.info.object_name,
            buf.len(),
            root.display()
        );
        Ok(())
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn kind(&self) -> &str {
        "file"
    }

    fn start_upload(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Volume>,
        permits: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Volume> {
        let (tx_out, rx_out) = mpsc::channel(CHAIN_CHANNEL_CAPACITY);
        let worker = Arc::clone(&self);

        let driver = tokio::spawn(async move {
            while let Some(mut volume) = rx.recv().await {
                let permit = tokio::select! {
                    p = permits.clone().acquire_owned() => p.expect("semaphore closed"),
                    _ = cancel.cancelled() => return Err(BackupError::Upload {
                        destination: "file".into(),
                        source: Box::new(BackupError::CacheWarning("cancelled".into())),
                    }),
                };

                let result = Self::upload_one(&worker.root, &mut volume).await;
                drop(permit);

                match result {
                    Ok(()) => {
                        if tx_out.send(volume).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        return Err(BackupError::Upload {
                            destination: "file".into(),
                            source: Box::new(e),
                        });
                    }
                }
            }
            Ok(())
        });

        self.tasks.lock().unwrap().push(driver);
        rx_out
    }

    async fn wait(&self) -> Result<()> {
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in handles {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(join_err) => {
                    return Err(BackupError::Upload {
                        destination: "file".into(),
                        source: Box::new(BackupError::CacheWarning(join_err.to_string())),
                    })
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.root.join(name)).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.root.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_stream(
        &self,
        object_name: &str,
        mut reader: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
    ) -> Result<u64> {
        tokio::fs::create_dir_all(&self.root).await?;
        let dest = self.root.join(object_name);
        let mut file = tokio::fs::File::create(&dest).await?;
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        debug!("streamed {bytes} bytes to {}", dest.display());
        Ok(bytes)
    }
}

/// The implicit terminal destination appended when `MaxFileBuffer != 0`:
/// deletes the local volume file after every prior destination has
/// uploaded it, reclaiming the buffer-credit slot.
pub struct DeleteBackend {
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl DeleteBackend {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Default for DeleteBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for DeleteBackend {
    fn kind(&self) -> &str {
        DELETE_BACKEND_PREFIX
    }

    fn start_upload(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Volume>,
        _permits: Arc<Semaphore>,
        _cancel: CancellationToken,
    ) -> mpsc::Receiver<Volume> {
        let (tx_out, rx_out) = mpsc::channel(CHAIN_CHANNEL_CAPACITY);
        let driver = tokio::spawn(async move {
            while let Some(volume) = rx.recv().await {
                if let Err(e) = volume.delete_volume().await {
                    warn!("failed to delete local volume {}: {e}", volume.info.object_name);
                }
                if tx_out.send(volume).await.is_err() {
                    break;
                }
            }
            Ok(())
        });
        self.tasks.lock().unwrap().push(driver);
        rx_out
    }

    async fn wait(&self) -> Result<()> {
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in handles {
            task.await.map_err(|e| BackupError::CacheWarning(e.to_string()))??;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get(&self, _name: &str) -> Result<Vec<u8>> {
        Err(BackupError::CacheWarning("delete backend has no objects".into()))
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn upload_stream(
        &self,
        _object_name: &str,
        _reader: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
    ) -> Result<u64> {
        Err(BackupError::CacheWarning(
            "delete backend does not participate in pipe-mode uploads".into(),
        ))
    }
}
