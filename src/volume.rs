//! Volume lifecycle: a bounded chunk of the snapshot stream packaged as a
//! single uploadable object.
//!
//! A volume is append-only while open (`write_all`), sealed exactly once
//! (`close`), then handed to the destination pipeline which reads it back
//! (`open_reader`) once per backend in the chain. Once sealed, a buffered
//! volume can also be `copy_to`'d elsewhere (the manifest store's cache
//! copy) before `delete_volume` reclaims its on-disk form.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;

use crate::utils::errors::Result;

/// Persisted, JSON-serializable description of a completed volume —
/// exactly the record that ends up in `JobInfo::volumes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub object_name: String,
    pub volume_number: u64,
    pub zfs_stream_bytes: u64,
    pub is_manifest: bool,
    pub is_final_manifest: bool,
}

enum Storage {
    /// `MaxFileBuffer != 0`: the volume is fully materialized on disk
    /// before any backend reads it.
    Buffered {
        path: PathBuf,
        writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
    },
    /// `MaxFileBuffer == 0` (pipe mode): the volume is never written to
    /// disk; the single backend in the chain reads concurrently with the
    /// source writing.
    Piped {
        writer: Option<tokio::io::DuplexStream>,
        reader: Option<tokio::io::DuplexStream>,
    },
}

/// A volume currently owned by whichever pipeline stage holds it.
pub struct Volume {
    pub info: VolumeInfo,
    counter: Arc<AtomicU64>,
    sealed: bool,
    storage: Storage,
    /// The `fileBuffer` credit this volume holds, if any. Acquired by the source before the volume is created, released
    /// automatically when the completion sink drops the volume after it
    /// exits the tail channel.
    credit: Option<OwnedSemaphorePermit>,
}

const PIPE_BUFFER: usize = 64 * 1024;

impl Volume {
    /// Create a volume that buffers to `path` on disk.
    pub async fn create_buffered(object_name: String, volume_number: u64, path: PathBuf) -> Result<Self> {
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            info: VolumeInfo {
                object_name,
                volume_number,
                zfs_stream_bytes: 0,
                is_manifest: false,
                is_final_manifest: false,
            },
            counter: Arc::new(AtomicU64::new(0)),
            sealed: false,
            storage: Storage::Buffered {
                path,
                writer: Some(tokio::io::BufWriter::new(file)),
            },
            credit: None,
        })
    }

    /// Create a volume backed by an in-memory duplex pipe, never touching disk.
    pub fn create_piped(object_name: String, volume_number: u64) -> Self {
        let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
        Self {
            info: VolumeInfo {
                object_name,
                volume_number,
                zfs_stream_bytes: 0,
                is_manifest: false,
                is_final_manifest: false,
            },
            counter: Arc::new(AtomicU64::new(0)),
            sealed: false,
            storage: Storage::Piped {
                writer: Some(writer),
                reader: Some(reader),
            },
            credit: None,
        }
    }

    /// Build a manifest volume directly from JSON bytes (always buffered:
    /// manifests are small and must be re-readable for local cache and
    /// every destination in the chain).
    pub async fn create_manifest(
        object_name: String,
        volume_number: u64,
        path: PathBuf,
        json: &[u8],
        is_final: bool,
    ) -> Result<Self> {
        let mut volume = Self::create_buffered(object_name, volume_number, path).await?;
        volume.write_all(json).await?;
        volume.close().await?;
        volume.info.is_manifest = true;
        volume.info.is_final_manifest = is_final;
        Ok(volume)
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.storage {
            Storage::Buffered { writer, .. } => {
                writer
                    .as_mut()
                    .expect("write after close")
                    .write_all(buf)
                    .await?;
            }
            Storage::Piped { writer, .. } => {
                writer
                    .as_mut()
                    .expect("write after close")
                    .write_all(buf)
                    .await?;
            }
        }
        self.counter.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Bytes written since open.
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Seal the volume. Records the final byte count into `info`.
    pub async fn close(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.sealed = true;
        match &mut self.storage {
            Storage::Buffered { writer, .. } => {
                if let Some(mut w) = writer.take() {
                    w.flush().await?;
                }
            }
            Storage::Piped { writer, .. } => {
                // Dropping the write half closes the pipe; the reader sees EOF.
                writer.take();
            }
        }
        self.info.zfs_stream_bytes = self.counter();
        Ok(())
    }

    /// Get a reader over the volume's bytes. May be called at most once per
    /// storage kind (buffered volumes can be reopened repeatedly; a piped
    /// volume's single reader half can only be taken once).
    pub async fn open_reader(&mut self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        match &mut self.storage {
            Storage::Buffered { path, .. } => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
            Storage::Piped { reader, .. } => {
                let r = reader.take().expect("piped volume read twice");
                Ok(Box::new(r))
            }
        }
    }

    /// Copy the volume's sealed bytes to `dest`. Buffered volumes only:
    /// a piped volume's bytes exist only transiently in the duplex pipe and
    /// can't be read back a second time.
    pub async fn copy_to(&self, dest: &Path) -> Result<()> {
        match &self.storage {
            Storage::Buffered { path, .. } => {
                tokio::fs::copy(path, dest).await?;
                Ok(())
            }
            Storage::Piped { .. } => {
                panic!("copy_to is not supported for pipe-mode volumes")
            }
        }
    }

    /// Delete the volume's backing file, if any. A no-op for piped volumes
    /// (nothing was ever written to disk) and for volumes already deleted.
    pub async fn delete_volume(&self) -> Result<()> {
        if let Storage::Buffered { path, .. } = &self.storage {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Attach a `fileBuffer` credit to this volume. Dropping the volume
    /// (after the completion sink is done with it) releases the permit.
    pub fn attach_credit(&mut self, credit: OwnedSemaphorePermit) {
        self.credit = Some(credit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn buffered_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol-0");
        let mut vol = Volume::create_buffered("obj-0".into(), 0, path).await.unwrap();
        vol.write_all(b"hello world").await.unwrap();
        vol.close().await.unwrap();
        assert_eq!(vol.info.zfs_stream_bytes, 11);

        let mut reader = vol.open_reader().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn piped_streams_concurrently() {
        let mut vol = Volume::create_piped("obj-0".into(), 0);
        let mut reader = vol.open_reader().await.unwrap();

        let write_task = tokio::spawn(async move {
            vol.write_all(b"streamed").await.unwrap();
            vol.close().await.unwrap();
            vol
        });

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        let vol = write_task.await.unwrap();

        assert_eq!(buf, b"streamed");
        assert_eq!(vol.info.zfs_stream_bytes, 8);
    }

    #[tokio::test]
    async fn copy_to_duplicates_sealed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol-0");
        let mut vol = Volume::create_buffered("obj-0".into(), 0, path).await.unwrap();
        vol.write_all(b"cached").await.unwrap();
        vol.close().await.unwrap();

        let copy_path = dir.path().join("vol-0-copy");
        vol.copy_to(&copy_path).await.unwrap();
        assert_eq!(tokio::fs::read(&copy_path).await.unwrap(), b"cached");
    }

    #[tokio::test]
    async fn delete_volume_removes_buffered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol-0");
        let mut vol = Volume::create_buffered("obj-0".into(), 0, path.clone()).await.unwrap();
        vol.close().await.unwrap();
        assert!(path.exists());
        vol.delete_volume().await.unwrap();
        assert!(!path.exists());
    }
}
