//! The run descriptor (`JobInfo`) and the manifest store that persists it.
//!
//! `JobInfo` is both the in-memory job configuration and, serialized to
//! JSON, the manifest payload uploaded alongside the data volumes. The
//! store maintains a per-destination local cache directory so an
//! interrupted run can resume and so the smart-selection planner can read
//! prior runs without round-tripping to every destination on every call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::backend::Backend;
use crate::snapshot::SnapshotInfo;
use crate::utils::errors::{BackupError, Result};
use crate::volume::{Volume, VolumeInfo};

/// Sentinel meaning "FullIfOlderThan is unset".
pub const FULL_IF_OLDER_THAN_UNSET: chrono::Duration = chrono::Duration::minutes(-1);

/// The run descriptor, also the manifest payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub volume_name: String,
    pub base_snapshot: Option<SnapshotInfo>,
    pub incremental_snapshot: Option<SnapshotInfo>,
    pub destinations: Vec<String>,
    pub volume_size_mib: u64,
    pub max_file_buffer: usize,
    pub max_parallel_uploads: usize,
    pub compressor: Option<String>,
    pub encrypt_to: Option<String>,
    pub sign_from: Option<String>,
    pub full: bool,
    pub incremental: bool,
    #[serde(with = "duration_minutes")]
    pub full_if_older_than: chrono::Duration,
    pub resume: bool,
    pub volumes: Vec<VolumeInfo>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub zfs_stream_bytes: u64,
    pub zfs_command_line: Vec<String>,
}

mod duration_minutes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &chrono::Duration, s: S) -> Result<S::Ok, S::Error> {
        d.num_minutes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<chrono::Duration, D::Error> {
        let minutes = i64::deserialize(d)?;
        Ok(chrono::Duration::minutes(minutes))
    }
}

impl JobInfo {
    /// Sum of `ZFSStreamBytes` across every completed data volume (excludes
    /// the manifest volume itself).
    pub fn data_bytes(&self) -> u64 {
        self.volumes
            .iter()
            .filter(|v| !v.is_manifest)
            .map(|v| v.zfs_stream_bytes)
            .sum()
    }

    /// The next volume number and the byte offset into the stream that has
    /// already been fully consumed by completed volumes — used by the
    /// source to skip forward on resume.
    pub fn resume_point(&self) -> (u64, u64) {
        let count = self.volumes.iter().filter(|v| !v.is_manifest).count() as u64;
        let bytes = self.data_bytes();
        (count, bytes)
    }

    /// Append a completed volume, keeping `volumes` dense and sorted by
    /// volume number. The completion sink is the single writer of this
    /// field.
    pub fn push_volume(&mut self, volume: VolumeInfo) {
        self.volumes.push(volume);
        self.volumes.sort_by_key(|v| v.volume_number);
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Deterministic object name for a volume of this job.
pub fn object_name(job: &JobInfo, volume_number: u64, is_manifest: bool) -> String {
    let incremental = job
        .incremental_snapshot
        .as_ref()
        .map(|s| s.name.as_str())
        .unwrap_or("");
    let base = job.base_snapshot.as_ref().map(|s| s.name.as_str()).unwrap_or("");
    if is_manifest {
        format!("{}_{}_{}.manifest.json", job.volume_name, base, incremental)
    } else {
        format!(
            "{}_{}_{}.vol{:010}",
            job.volume_name, base, incremental, volume_number
        )
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Manages the per-destination local manifest cache under
/// `WorkingDir/cache/<md5(destination)>/<md5(objectName)>`.
pub struct ManifestStore {
    working_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }

    fn cache_dir(&self, destination: &str) -> PathBuf {
        self.working_dir.join("cache").join(md5_hex(destination))
    }

    fn cache_path(&self, destination: &str, object_name: &str) -> PathBuf {
        self.cache_dir(destination).join(md5_hex(object_name))
    }

    /// Write `job` into the local cache for `destination`. This is the only
    /// place the completion sink needs to call after each volume append.
    ///
    /// Goes through a scratch `Volume` rather than writing the JSON bytes
    /// directly, so the cache copy uses the same sealed-then-copied path as
    /// every other manifest delivery.
    pub async fn save_local(&self, destination: &str, object_name: &str, job: &JobInfo) -> Result<()> {
        let dir = self.cache_dir(destination);
        tokio::fs::create_dir_all(&dir).await?;
        let scratch_path = dir.join(format!(".{}.tmp", md5_hex(object_name)));
        let volume = Volume::create_manifest(object_name.to_string(), 0, scratch_path, &job.to_json()?, false).await?;
        let path = self.cache_path(destination, object_name);
        volume.copy_to(&path).await?;
        volume.delete_volume().await?;
        Ok(())
    }

    /// Read a cached manifest, if present.
    pub async fn load_local(&self, destination: &str, object_name: &str) -> Result<Option<JobInfo>> {
        let path = self.cache_path(destination, object_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(JobInfo::from_json(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List every manifest currently cached for `destination`, decoded.
    pub async fn load_all_local(&self, destination: &str) -> Result<Vec<JobInfo>> {
        let dir = self.cache_dir(destination);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                if let Ok(job) = JobInfo::from_json(&bytes) {
                    out.push(job);
                }
            }
        }
        Ok(out)
    }

    /// Bring the local cache for `destination` in line with what the
    /// backend actually has: fetch any remote manifest missing locally.
    /// Returns the manifests now known to be valid (`safeManifests`) for
    /// planner consumption.
    pub async fn sync_cache(&self, destination: &str, backend: &dyn Backend) -> Result<Vec<JobInfo>> {
        let remote_names = backend.list().await.map_err(|e| {
            BackupError::CacheWarning(format!("listing {destination} failed: {e}"))
        })?;

        let mut by_object: HashMap<String, JobInfo> = HashMap::new();
        for job in self.load_all_local(destination).await? {
            // Re-derive the object name the same way the sink would have.
            let name = object_name(&job, 0, true);
            by_object.insert(name, job);
        }

        for remote_name in &remote_names {
            if !remote_name.ends_with(".manifest.json") {
                continue;
            }
            if by_object.contains_key(remote_name) {
                continue;
            }
            match backend.get(remote_name).await {
                Ok(bytes) => {
                    if let Ok(job) = JobInfo::from_json(&bytes) {
                        self.save_local(destination, remote_name, &job).await?;
                        by_object.insert(remote_name.clone(), job);
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to fetch remote manifest {remote_name}: {e}");
                }
            }
        }

        let mut manifests: Vec<JobInfo> = by_object.into_values().collect();
        manifests.sort_by_key(|j| std::cmp::Reverse(
            j.base_snapshot.as_ref().map(|s| s.creation_time).unwrap_or_default(),
        ));
        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> JobInfo {
        JobInfo {
            volume_name: "tank/data".into(),
            base_snapshot: None,
            incremental_snapshot: None,
            destinations: vec!["file:///tmp/a".into()],
            volume_size_mib: 64,
            max_file_buffer: 1,
            max_parallel_uploads: 1,
            compressor: None,
            encrypt_to: None,
            sign_from: None,
            full: true,
            incremental: false,
            full_if_older_than: FULL_IF_OLDER_THAN_UNSET,
            resume: false,
            volumes: vec![],
            start_time: None,
            end_time: None,
            zfs_stream_bytes: 0,
            zfs_command_line: vec![],
        }
    }

    #[test]
    fn push_volume_keeps_dense_sorted_order() {
        let mut job = sample_job();
        job.push_volume(VolumeInfo {
            object_name: "b".into(),
            volume_number: 1,
            zfs_stream_bytes: 10,
            is_manifest: false,
            is_final_manifest: false,
        });
        job.push_volume(VolumeInfo {
            object_name: "a".into(),
            volume_number: 0,
            zfs_stream_bytes: 20,
            is_manifest: false,
            is_final_manifest: false,
        });
        assert_eq!(job.volumes[0].volume_number, 0);
        assert_eq!(job.volumes[1].volume_number, 1);
        assert_eq!(job.data_bytes(), 30);
    }

    #[tokio::test]
    async fn save_and_load_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        let job = sample_job();

        store.save_local("file:///tmp/a", "obj.manifest.json", &job).await.unwrap();
        let loaded = store.load_local("file:///tmp/a", "obj.manifest.json").await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().volume_name, job.volume_name);
    }

    #[tokio::test]
    async fn missing_manifest_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().to_path_buf());
        let loaded = store.load_local("file:///tmp/a", "missing.manifest.json").await.unwrap();
        assert!(loaded.is_none());
    }
}
