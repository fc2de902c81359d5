//! Reads the raw snapshot stream and slices it into volumes.
//!
//! Buffered mode (`MaxFileBuffer != 0`) is handled here: each volume is
//! filled to disk until it crosses the per-volume byte threshold or the
//! stream ends, then sealed and handed to the destination chain. Pipe mode
//! (`MaxFileBuffer == 0`) streams directly into a single backend instead —
//! see [`crate::pipeline::coordinator::run_piped`] — since a buffered
//! `Volume` handed off through a channel can't also stay open for a
//! concurrent writer.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use async_compression::tokio::bufread::ZstdEncoder;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, Semaphore};

use crate::utils::errors::{BackupError, Result};
use crate::volume::Volume;

/// Wrap `stream` in the requested compressor, if any. Unknown keys pass the
/// stream through unchanged — `Compressor` selects compression among
/// whatever codecs this build supports, not a required feature.
pub fn compress_stream(
    stream: impl AsyncRead + Unpin + Send + 'static,
    compressor: Option<&str>,
) -> Pin<Box<dyn AsyncRead + Send>> {
    match compressor {
        Some("zstd") => Box::pin(ZstdEncoder::new(BufReader::new(stream))),
        _ => Box::pin(stream),
    }
}

/// Bytes reserved below `VolumeSize·MiB` so a volume's on-the-wire framing
/// never pushes it over the destination's real object-size limit.
const VOLUME_HEADROOM_BYTES: u64 = 50 * 1024;

const READ_CHUNK_BYTES: usize = 64 * 1024;

pub struct SourceConfig {
    pub volume_size_mib: u64,
    pub staging_dir: PathBuf,
}

impl SourceConfig {
    fn volume_threshold_bytes(&self) -> u64 {
        self.volume_size_mib
            .saturating_mul(1024 * 1024)
            .saturating_sub(VOLUME_HEADROOM_BYTES)
    }
}

/// Drain `skip` bytes from `stream`, discarding them. Used to fast-forward
/// past the prefix a prior, interrupted run already uploaded.
pub async fn skip_bytes(stream: &mut (impl AsyncRead + Unpin), mut skip: u64) -> Result<()> {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    while skip > 0 {
        let want = std::cmp::min(skip, buf.len() as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended before the resume offset was reached",
            )));
        }
        skip -= n as u64;
    }
    Ok(())
}

/// Slice `stream` into buffered volumes and send each completed volume on
/// `out`, closing `out` once the stream is exhausted.
///
/// `start_volume_number`/`skip_offset` come from
/// [`crate::manifest::JobInfo::resume_point`] (zero/zero on a fresh run).
/// `next_name` derives the deterministic object name for a given volume
/// number. `file_buffer` is the `fileBuffer` credit gate:
/// one credit per volume currently in flight anywhere downstream.
pub async fn run(
    mut stream: impl AsyncRead + Unpin,
    cfg: &SourceConfig,
    start_volume_number: u64,
    skip_offset: u64,
    file_buffer: Arc<Semaphore>,
    out: mpsc::Sender<Volume>,
    next_name: impl Fn(u64) -> String,
    on_send: impl Fn(),
) -> Result<()> {
    skip_bytes(&mut stream, skip_offset).await?;

    let threshold = cfg.volume_threshold_bytes();
    let mut volume_number = start_volume_number;
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let credit = file_buffer
            .clone()
            .acquire_owned()
            .await
            .expect("fileBuffer semaphore closed while a volume is still being produced");

        let path = cfg.staging_dir.join(format!("vol-{volume_number:010}"));
        let mut volume = Volume::create_buffered(next_name(volume_number), volume_number, path).await?;
        volume.attach_credit(credit);

        let mut eof = false;
        while volume.counter() < threshold {
            let want = std::cmp::min(buf.len() as u64, threshold - volume.counter()) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                eof = true;
                break;
            }
            volume.write_all(&buf[..n]).await?;
        }

        volume.close().await?;
        volume_number += 1;

        if out.send(volume).await.is_err() {
            return Ok(());
        }
        on_send();
        if eof {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    fn cfg(dir: &std::path::Path, volume_size_mib: u64) -> SourceConfig {
        SourceConfig {
            volume_size_mib,
            staging_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn single_volume_when_stream_fits() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 1024];
        let file_buffer = Arc::new(Semaphore::new(2));
        let (tx, mut rx) = mpsc::channel(4);

        run(&data[..], &cfg(dir.path(), 64), 0, 0, file_buffer, tx, |n| format!("vol-{n}"), || {})
            .await
            .unwrap();

        let mut vol = rx.recv().await.unwrap();
        assert_eq!(vol.info.zfs_stream_bytes, 1024);
        let mut read_back = Vec::new();
        vol.open_reader().await.unwrap().read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, data);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn splits_into_multiple_volumes_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![3u8; 400 * 1024];
        let file_buffer = Arc::new(Semaphore::new(4));
        let (tx, mut rx) = mpsc::channel(8);

        let small_cfg = SourceConfig {
            volume_size_mib: 1, // threshold = 1MiB - 50KiB
            staging_dir: dir.path().to_path_buf(),
        };

        run(&data[..], &small_cfg, 0, 0, file_buffer, tx, |n| format!("vol-{n}"), || {})
            .await
            .unwrap();

        let mut total = 0u64;
        let mut count = 0;
        while let Some(vol) = rx.recv().await {
            total += vol.info.zfs_stream_bytes;
            count += 1;
        }
        assert_eq!(total, data.len() as u64);
        assert_eq!(count, 1); // 400KiB comfortably under a ~974KiB threshold
    }

    #[tokio::test]
    async fn compress_stream_zstd_round_trips() {
        use async_compression::tokio::bufread::ZstdDecoder;

        let data = vec![9u8; 32 * 1024];
        let mut compressed_reader = compress_stream(std::io::Cursor::new(data.clone()), Some("zstd"));
        let mut compressed = Vec::new();
        compressed_reader.read_to_end(&mut compressed).await.unwrap();
        assert!(!compressed.is_empty());

        let mut decoded = Vec::new();
        ZstdDecoder::new(BufReader::new(&compressed[..]))
            .read_to_end(&mut decoded)
            .await
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[tokio::test]
    async fn compress_stream_passthrough_for_unknown_compressor() {
        let data = b"raw bytes".to_vec();
        let mut reader = compress_stream(std::io::Cursor::new(data.clone()), None);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn resume_skips_already_uploaded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789abcdef".to_vec();
        let file_buffer = Arc::new(Semaphore::new(2));
        let (tx, mut rx) = mpsc::channel(4);

        run(&data[..], &cfg(dir.path(), 64), 1, 10, file_buffer, tx, |n| format!("vol-{n}"), || {})
            .await
            .unwrap();

        let mut vol = rx.recv().await.unwrap();
        assert_eq!(vol.info.volume_number, 1);
        let mut read_back = Vec::new();
        vol.open_reader().await.unwrap().read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"abcdef");
    }
}
