//! Snapshot listing and streaming — the external snapshot utility boundary.
//!
//! This module is the only place that shells out to the block-device
//! snapshot tool (`zfs` by default). Everything above it deals only in
//! [`SnapshotInfo`] and raw byte streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::utils::errors::{BackupError, Result};

/// A single named snapshot of a volume, as reported by the snapshot tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub creation_time: DateTime<Utc>,
}

impl PartialEq for SnapshotInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.creation_time == other.creation_time
    }
}
impl Eq for SnapshotInfo {}

/// Sort snapshots newest-first by creation time, as every caller expects.
pub fn sort_newest_first(snapshots: &mut [SnapshotInfo]) {
    snapshots.sort_by(|a, b| b.creation_time.cmp(&a.creation_time));
}

/// A spawned snapshot-stream child process. The caller reads `stdout` and is
/// responsible for killing and reaping the child on any exit path.
pub struct StreamProcess {
    pub child: Child,
    /// The exact argument vector used to start the stream, stable across
    /// runs given the same job descriptor — required for resume equality.
    pub command_line: Vec<String>,
}

impl StreamProcess {
    pub fn stdout(&mut self) -> tokio::process::ChildStdout {
        self.child
            .stdout
            .take()
            .expect("stream process spawned without a piped stdout")
    }

    /// Kill and reap the child. Safe to call more than once.
    pub async fn kill_and_reap(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// The external snapshot utility interface.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    /// List all snapshots of `volume_name`, newest first.
    async fn list_snapshots(&self, volume_name: &str) -> Result<Vec<SnapshotInfo>>;

    /// Start a full or incremental send of `volume_name`. `base` is the
    /// parent snapshot; `incremental` (if set) is the target snapshot for
    /// an incremental send. The returned process writes the raw stream to
    /// its stdout.
    async fn send(
        &self,
        volume_name: &str,
        base: &SnapshotInfo,
        incremental: Option<&SnapshotInfo>,
    ) -> Result<StreamProcess>;
}

/// Default `SnapshotSource` backed by the `zfs` CLI.
pub struct ZfsSnapshotSource {
    pub zfs_binary: String,
}

impl Default for ZfsSnapshotSource {
    fn default() -> Self {
        Self {
            zfs_binary: "zfs".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotSource for ZfsSnapshotSource {
    async fn list_snapshots(&self, volume_name: &str) -> Result<Vec<SnapshotInfo>> {
        let output = Command::new(&self.zfs_binary)
            .args(["list", "-H", "-o", "name,creation", "-t", "snapshot", "-p"])
            .output()
            .await
            .map_err(BackupError::Io)?;

        if !output.status.success() {
            return Err(BackupError::Config(format!(
                "zfs list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let prefix = format!("{volume_name}@");
        let mut snapshots: Vec<SnapshotInfo> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| parse_snapshot_line(line, &prefix))
            .collect();

        sort_newest_first(&mut snapshots);
        Ok(snapshots)
    }

    async fn send(
        &self,
        volume_name: &str,
        base: &SnapshotInfo,
        incremental: Option<&SnapshotInfo>,
    ) -> Result<StreamProcess> {
        let mut args = vec!["send".to_string()];
        let base_full = format!("{volume_name}@{}", base.name);
        let command_line = if let Some(target) = incremental {
            let target_full = format!("{volume_name}@{}", target.name);
            args.push("-i".to_string());
            args.push(base_full.clone());
            args.push(target_full.clone());
            vec![
                self.zfs_binary.clone(),
                "send".to_string(),
                "-i".to_string(),
                base_full,
                target_full,
            ]
        } else {
            args.push(base_full.clone());
            vec![self.zfs_binary.clone(), "send".to_string(), base_full]
        };

        let child = Command::new(&self.zfs_binary)
            .args(&args[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(BackupError::Io)?;

        Ok(StreamProcess {
            child,
            command_line,
        })
    }
}

fn parse_snapshot_line(line: &str, prefix: &str) -> Option<SnapshotInfo> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next()?;
    let ts = parts.next()?.trim();

    if !name.starts_with(prefix) {
        return None;
    }

    let creation_time = DateTime::<Utc>::from_timestamp(ts.parse::<i64>().ok()?, 0)?;
    Some(SnapshotInfo {
        name: name[prefix.len()..].to_string(),
        creation_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matching_snapshot_line() {
        let snap = parse_snapshot_line("tank/data@daily-1 1700000000", "tank/data@").unwrap();
        assert_eq!(snap.name, "daily-1");
    }

    #[test]
    fn skips_lines_for_other_volumes() {
        assert!(parse_snapshot_line("tank/other@daily-1 1700000000", "tank/data@").is_none());
    }

    #[test]
    fn sorts_newest_first() {
        let mut snaps = vec![
            SnapshotInfo {
                name: "old".into(),
                creation_time: DateTime::<Utc>::from_timestamp(100, 0).unwrap(),
            },
            SnapshotInfo {
                name: "new".into(),
                creation_time: DateTime::<Utc>::from_timestamp(200, 0).unwrap(),
            },
        ];
        sort_newest_first(&mut snaps);
        assert_eq!(snaps[0].name, "new");
    }
}
