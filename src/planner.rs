//! The smart-selection planner: picks full vs incremental
//! and the parent snapshot by reading every destination's cached manifests.

use crate::manifest::{JobInfo, FULL_IF_OLDER_THAN_UNSET};
use crate::snapshot::SnapshotInfo;
use crate::utils::errors::{BackupError, Result};

struct DestinationState {
    last_backup: Option<SnapshotInfo>,
    last_comparable: Option<SnapshotInfo>,
}

fn destination_state(job: &JobInfo, manifests: &[JobInfo]) -> DestinationState {
    let last_backup = manifests.first().and_then(|m| m.base_snapshot.clone());

    let last_comparable = if job.incremental {
        last_backup.clone()
    } else if job.full_if_older_than != FULL_IF_OLDER_THAN_UNSET {
        manifests
            .iter()
            .find(|m| m.incremental_snapshot.is_none())
            .and_then(|m| m.base_snapshot.clone())
    } else {
        None
    };

    DestinationState { last_backup, last_comparable }
}

/// Decide `job.base_snapshot`/`job.incremental_snapshot` in place.
/// `snapshots` must already be newest-first; `per_destination_manifests[i]`
/// holds destination `job.destinations[i]`'s known manifests, each list
/// sorted by base-snapshot creation time, newest first.
pub fn plan(job: &mut JobInfo, snapshots: &[SnapshotInfo], per_destination_manifests: &[Vec<JobInfo>]) -> Result<()> {
    let newest = snapshots
        .first()
        .cloned()
        .ok_or_else(|| BackupError::Config("no snapshots found for this volume".into()))?;
    job.base_snapshot = Some(newest.clone());

    if job.full {
        job.incremental_snapshot = None;
        return Ok(());
    }

    let states: Vec<DestinationState> = per_destination_manifests
        .iter()
        .map(|manifests| destination_state(job, manifests))
        .collect();

    let first_comparable = states.first().and_then(|s| s.last_comparable.clone());
    if states
        .iter()
        .any(|s| s.last_comparable != first_comparable)
    {
        return Err(BackupError::DestinationsOutOfSync);
    }

    let last_not_equal = states
        .windows(2)
        .any(|pair| pair[0].last_backup != pair[1].last_backup);

    let last_comparable = first_comparable;
    let last_backup = states.first().and_then(|s| s.last_backup.clone());

    if job.incremental {
        let parent = last_comparable.ok_or(BackupError::NoParent)?;
        if parent == newest {
            return Err(BackupError::NoNewSnapshot);
        }
        job.incremental_snapshot = Some(parent);
        return Ok(());
    }

    if job.full_if_older_than != FULL_IF_OLDER_THAN_UNSET {
        let Some(comparable) = last_comparable else {
            job.incremental_snapshot = None;
            return Ok(()); // fresh full
        };
        if newest.creation_time - comparable.creation_time > job.full_if_older_than {
            job.incremental_snapshot = None;
            return Ok(()); // stale enough to force a full
        }
        if last_not_equal {
            return Err(BackupError::DestinationsOutOfSync);
        }
        if last_backup.as_ref() == Some(&newest) {
            return Err(BackupError::NoNewSnapshot);
        }
        job.incremental_snapshot = last_backup;
        return Ok(());
    }

    job.incremental_snapshot = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn snap(name: &str, secs: i64) -> SnapshotInfo {
        SnapshotInfo {
            name: name.into(),
            creation_time: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
        }
    }

    fn base_job(full: bool, incremental: bool, full_if_older_than: chrono::Duration) -> JobInfo {
        JobInfo {
            volume_name: "tank/data".into(),
            base_snapshot: None,
            incremental_snapshot: None,
            destinations: vec!["file:///a".into(), "file:///b".into()],
            volume_size_mib: 64,
            max_file_buffer: 1,
            max_parallel_uploads: 1,
            compressor: None,
            encrypt_to: None,
            sign_from: None,
            full,
            incremental,
            full_if_older_than,
            resume: false,
            volumes: vec![],
            start_time: None,
            end_time: None,
            zfs_stream_bytes: 0,
            zfs_command_line: vec![],
        }
    }

    fn manifest_with_base(base: SnapshotInfo, incremental: Option<SnapshotInfo>) -> JobInfo {
        let mut job = base_job(false, false, FULL_IF_OLDER_THAN_UNSET);
        job.base_snapshot = Some(base);
        job.incremental_snapshot = incremental;
        job
    }

    #[test]
    fn incremental_with_no_parent_fails() {
        let mut job = base_job(false, true, FULL_IF_OLDER_THAN_UNSET);
        let snapshots = vec![snap("s1", 200)];
        let err = plan(&mut job, &snapshots, &[vec![], vec![]]).unwrap_err();
        assert!(matches!(err, BackupError::NoParent));
    }

    #[test]
    fn full_if_older_than_triggers_full_when_stale() {
        let mut job = base_job(false, false, chrono::Duration::hours(168));
        let snapshots = vec![snap("new", 10 * 86400)];
        let manifests = vec![manifest_with_base(snap("old", 0), None)];
        plan(&mut job, &snapshots, &[manifests.clone(), manifests]).unwrap();
        assert!(job.incremental_snapshot.is_none());
    }

    #[test]
    fn destinations_disagree_fails() {
        let mut job = base_job(false, false, chrono::Duration::hours(168));
        let snapshots = vec![snap("new", 100)];
        let manifests_a = vec![manifest_with_base(snap("s1", 0), None)];
        let manifests_b = vec![manifest_with_base(snap("s2", 0), None)];
        let err = plan(&mut job, &snapshots, &[manifests_a, manifests_b]).unwrap_err();
        assert!(matches!(err, BackupError::DestinationsOutOfSync));
    }

    #[test]
    fn incremental_picks_last_backup_as_parent() {
        let mut job = base_job(false, true, FULL_IF_OLDER_THAN_UNSET);
        let snapshots = vec![snap("new", 100), snap("mid", 50)];
        let manifests = vec![manifest_with_base(snap("mid", 50), None)];
        plan(&mut job, &snapshots, &[manifests.clone(), manifests]).unwrap();
        assert_eq!(job.incremental_snapshot.unwrap().name, "mid");
    }
}
