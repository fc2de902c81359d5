//! The resume planner: validates a requested resume against
//! the prior attempt's cached manifest and, on a match, adopts its volume
//! list and start time so [`crate::pipeline::source`] can skip forward.

use tracing::{info, warn};

use crate::manifest::{JobInfo, ManifestStore};
use crate::utils::errors::{BackupError, Result};

/// Validate and apply a resume request in place. `current_cmd_line` is the
/// argument vector this run would use to start the snapshot stream — it
/// must match the cached run's byte-for-byte for the resume to proceed.
///
/// Field names matter here since the comparison below is symmetric:
/// `cached_cmd_line` is what the prior run recorded, `current_cmd_line` is
/// what this run would use.
pub async fn plan_resume(
    job: &mut JobInfo,
    manifest_store: &ManifestStore,
    current_cmd_line: &[String],
) -> Result<()> {
    if !job.resume {
        return Ok(());
    }

    let destination = job
        .destinations
        .first()
        .ok_or_else(|| BackupError::Config("resume requested with no destinations configured".into()))?;

    // The cached manifest's object name embeds the interrupted run's real
    // `base_snapshot`/`incremental_snapshot`, neither of which is known yet
    // at this point (the planner hasn't run) — so the lookup can't go
    // through `object_name`. Scan every cached manifest for this
    // destination instead and adopt the most recently started one that
    // never recorded an `end_time`: the run this resume is continuing.
    let cached = manifest_store
        .load_all_local(destination)
        .await?
        .into_iter()
        .filter(|m| m.volume_name == job.volume_name && m.end_time.is_none())
        .max_by_key(|m| m.start_time);
    let cached = match cached {
        Some(cached) => cached,
        None => {
            info!("no in-progress cached manifest at {destination} for {}, starting fresh", job.volume_name);
            return Ok(());
        }
    };

    // Only the tool/subcommand prefix is compared: the trailing snapshot
    // arguments are expected to differ run-to-run and are re-derived from
    // the cached base/incremental snapshot below, not from this check.
    let cached_cmd_line = &cached.zfs_command_line;
    let prefix_len = current_cmd_line.len().min(cached_cmd_line.len());
    if cached.compressor != job.compressor
        || cached.encrypt_to != job.encrypt_to
        || cached.sign_from != job.sign_from
        || cached_cmd_line[..prefix_len] != current_cmd_line[..prefix_len]
    {
        return Err(BackupError::OptionMismatch(format!(
            "cached run used compressor={:?} encrypt_to={:?} sign_from={:?} cmd={cached_cmd_line:?}; \
             this run requests compressor={:?} encrypt_to={:?} sign_from={:?} cmd={current_cmd_line:?}",
            cached.compressor, cached.encrypt_to, cached.sign_from,
            job.compressor, job.encrypt_to, job.sign_from,
        )));
    }

    info!(
        "resuming prior run at {} volumes ({} bytes already sent)",
        cached.volumes.len(),
        cached.data_bytes()
    );
    job.volumes = cached.volumes;
    job.start_time = cached.start_time;
    job.base_snapshot = cached.base_snapshot;
    job.incremental_snapshot = cached.incremental_snapshot;
    Ok(())
}

/// Log a [`BackupError::CacheWarning`] without failing the run.
pub fn warn_cache_failure(context: &str, err: &BackupError) {
    warn!("{context}: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{object_name, FULL_IF_OLDER_THAN_UNSET};
    use crate::snapshot::SnapshotInfo;
    use chrono::Utc;

    fn sample_job(resume: bool) -> JobInfo {
        JobInfo {
            volume_name: "tank/data".into(),
            base_snapshot: None,
            incremental_snapshot: None,
            destinations: vec!["file:///tmp/a".into()],
            volume_size_mib: 64,
            max_file_buffer: 1,
            max_parallel_uploads: 1,
            compressor: Some("zstd".into()),
            encrypt_to: None,
            sign_from: None,
            full: true,
            incremental: false,
            full_if_older_than: FULL_IF_OLDER_THAN_UNSET,
            resume,
            volumes: vec![],
            start_time: None,
            end_time: None,
            zfs_stream_bytes: 0,
            zfs_command_line: vec!["zfs".into(), "send".into()],
        }
    }

    #[tokio::test]
    async fn no_cache_continues_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        let mut job = sample_job(true);
        plan_resume(&mut job, &store, &["zfs".into(), "send".into()]).await.unwrap();
        assert!(job.volumes.is_empty());
    }

    #[tokio::test]
    async fn matching_options_adopts_prior_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        // This resuming job's snapshot pair isn't known yet — the interrupted
        // run's cache entry was written once its real pair was, so the two
        // sides' `object_name`s genuinely differ.
        let mut job = sample_job(true);

        let mut cached = sample_job(false);
        cached.base_snapshot = Some(SnapshotInfo {
            name: "tank/data@auto-1".into(),
            creation_time: Utc::now(),
        });
        cached.start_time = Some(Utc::now());
        cached.volumes.push(crate::volume::VolumeInfo {
            object_name: "vol-0".into(),
            volume_number: 0,
            zfs_stream_bytes: 512,
            is_manifest: false,
            is_final_manifest: false,
        });
        let manifest_name = object_name(&cached, 0, true);
        store.save_local("file:///tmp/a", &manifest_name, &cached).await.unwrap();

        plan_resume(&mut job, &store, &["zfs".into(), "send".into()]).await.unwrap();
        assert_eq!(job.volumes.len(), 1);
        assert_eq!(job.data_bytes(), 512);
        assert_eq!(job.base_snapshot.as_ref().unwrap().name, "tank/data@auto-1");
    }

    #[tokio::test]
    async fn changed_compressor_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        let mut job = sample_job(true);

        let mut cached = sample_job(false);
        cached.base_snapshot = Some(SnapshotInfo {
            name: "tank/data@auto-1".into(),
            creation_time: Utc::now(),
        });
        cached.start_time = Some(Utc::now());
        cached.compressor = Some("gzip".into());
        let manifest_name = object_name(&cached, 0, true);
        store.save_local("file:///tmp/a", &manifest_name, &cached).await.unwrap();

        let err = plan_resume(&mut job, &store, &["zfs".into(), "send".into()]).await.unwrap_err();
        assert!(matches!(err, BackupError::OptionMismatch(_)));
    }

    #[tokio::test]
    async fn completed_run_is_not_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        let mut job = sample_job(true);

        let mut cached = sample_job(false);
        cached.base_snapshot = Some(SnapshotInfo {
            name: "tank/data@auto-1".into(),
            creation_time: Utc::now(),
        });
        cached.start_time = Some(Utc::now());
        cached.end_time = Some(Utc::now());
        let manifest_name = object_name(&cached, 0, true);
        store.save_local("file:///tmp/a", &manifest_name, &cached).await.unwrap();

        plan_resume(&mut job, &store, &["zfs".into(), "send".into()]).await.unwrap();
        assert!(job.volumes.is_empty());
    }
}
