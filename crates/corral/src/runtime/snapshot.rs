//! Container snapshots.
//!
//! One JSON file per container, keyed by handle, rewritten atomically on
//! every state change and read once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_common::paths::write_atomic;
use corral_common::{CorralError, CorralResult};
use corral_network::{BandwidthLimit, NetIn, NetOut};
use serde::{Deserialize, Serialize};

use super::pools::Resources;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Running.
    Active,
    /// Stopped; jobs were told to exit but the container still exists.
    Stopped,
    /// Torn down. Terminal.
    Destroyed,
}

impl ContainerState {
    /// Whether moving to `next` is allowed. Only active containers stop,
    /// and anything may be destroyed.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Stopped) | (Self::Active | Self::Stopped, Self::Destroyed)
        )
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        })
    }
}

/// Recorded disk limits. Enforcement belongs to an external quota tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskLimits {
    /// Hard byte limit.
    pub byte_limit: u64,
    /// Hard inode limit.
    pub inode_limit: u64,
}

/// Resource limits applied to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Limits {
    /// Memory limit in bytes.
    pub memory: Option<u64>,
    /// Disk limits.
    pub disk: Option<DiskLimits>,
    /// Bandwidth limit on the host interface.
    pub bandwidth: Option<BandwidthLimit>,
    /// CPU weight.
    pub cpu: Option<u64>,
}

/// Durable record of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Format version.
    pub version: u32,
    /// Internal id, naming the depot directory.
    pub id: String,
    /// Client-visible handle.
    pub handle: String,
    /// Idle time tolerated before the container is reaped.
    pub grace_time: Duration,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Append-only event log.
    #[serde(default)]
    pub events: Vec<String>,
    /// Applied limits.
    #[serde(default)]
    pub limits: Limits,
    /// Pool leases.
    pub resources: Resources,
    /// Ids of jobs that had not exited.
    #[serde(default)]
    pub processes: Vec<u32>,
    /// Id the next job will get.
    pub next_job_id: u32,
    /// Inbound port mappings.
    #[serde(default)]
    pub net_ins: Vec<NetIn>,
    /// Egress allowances.
    #[serde(default)]
    pub net_outs: Vec<NetOut>,
    /// When the container was last used.
    pub last_active: DateTime<Utc>,
}

/// Reads and writes snapshots in one directory. Without a directory
/// every operation is a no-op.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    /// Create a store over `dir`.
    #[must_use]
    pub const fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Snapshot file of a handle.
    #[must_use]
    pub fn path(&self, handle: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{handle}.json")))
    }

    /// Write a snapshot, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, snapshot: &ContainerSnapshot) -> CorralResult<()> {
        let Some(path) = self.path(&snapshot.handle) else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&path, &json).map_err(|e| CorralError::Snapshot {
            path: path.clone(),
            message: e.to_string(),
        })?;

        tracing::debug!(handle = %snapshot.handle, path = %path.display(), "Saved snapshot");
        Ok(())
    }

    /// Delete the snapshot of a handle.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn delete(&self, handle: &str) -> CorralResult<()> {
        let Some(path) = self.path(handle) else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(handle, path = %path.display(), "Deleted snapshot");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every snapshot. Unreadable files are reported individually so
    /// one corrupt snapshot does not hide the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn load_all(&self) -> CorralResult<Vec<(PathBuf, CorralResult<ContainerSnapshot>)>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                let snapshot = load(&path);
                snapshots.push((path, snapshot));
            }
        }
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(snapshots)
    }
}

fn load(path: &Path) -> CorralResult<ContainerSnapshot> {
    let invalid = |message: String| CorralError::Snapshot {
        path: path.to_path_buf(),
        message,
    };
    let json = std::fs::read(path)?;
    let snapshot: ContainerSnapshot =
        serde_json::from_slice(&json).map_err(|e| invalid(e.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(invalid(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_network::Network;

    fn snapshot(handle: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            version: SNAPSHOT_VERSION,
            id: "0123456789a".to_string(),
            handle: handle.to_string(),
            grace_time: Duration::from_secs(30),
            state: ContainerState::Active,
            events: vec!["out of memory".to_string()],
            limits: Limits {
                memory: Some(1 << 20),
                ..Limits::default()
            },
            resources: Resources {
                uid: 10_000,
                network: Network::from_block("10.254.0.4/30".parse().unwrap()).unwrap(),
                ports: vec![61_000],
            },
            processes: vec![1, 3],
            next_job_id: 4,
            net_ins: vec![NetIn::new(61_000, 80)],
            net_outs: vec![NetOut::any().port(53)],
            last_active: Utc::now(),
        }
    }

    #[test]
    fn save_load_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(Some(dir.path().to_path_buf()));

        store.save(&snapshot("web")).unwrap();
        store.save(&snapshot("db")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        let web = loaded
            .iter()
            .find_map(|(_, s)| s.as_ref().ok().filter(|s| s.handle == "web"))
            .unwrap();
        assert_eq!(web, &snapshot("web").clone_with_time(web.last_active));

        store.delete("web").unwrap();
        store.delete("web").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_and_foreign_versions_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(Some(dir.path().to_path_buf()));

        let mut old = snapshot("old");
        old.version = 0;
        std::fs::write(dir.path().join("old.json"), serde_json::to_vec(&old).unwrap()).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{").unwrap();
        std::fs::create_dir(dir.path().join("pools")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|(_, s)| matches!(s, Err(CorralError::Snapshot { .. }))));
    }

    #[test]
    fn without_directory_nothing_is_stored() {
        let store = SnapshotStore::new(None);
        store.save(&snapshot("web")).unwrap();
        assert!(store.load_all().unwrap().is_empty());
        store.delete("web").unwrap();
    }

    #[test]
    fn state_transitions() {
        use ContainerState::{Active, Destroyed, Stopped};
        assert!(Active.can_become(Stopped));
        assert!(Stopped.can_become(Destroyed));
        assert!(!Stopped.can_become(Active));
        assert!(!Destroyed.can_become(Stopped));
        assert!(!Destroyed.can_become(Destroyed));
    }

    impl ContainerSnapshot {
        fn clone_with_time(mut self, last_active: DateTime<Utc>) -> Self {
            self.last_active = last_active;
            self
        }
    }
}
