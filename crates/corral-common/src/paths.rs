//! Standard filesystem paths for Corral.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default depot holding one directory per container.
pub static CORRAL_DEPOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CORRAL_DEPOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/corral/containers"))
});

/// Default snapshot directory.
pub static CORRAL_SNAPSHOTS: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CORRAL_SNAPSHOTS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/corral/snapshots"))
});

/// Standard paths used by the supervisor.
///
/// Snapshots are optional: without a snapshot directory nothing is
/// persisted and a restart starts from an empty fleet.
#[derive(Debug, Clone)]
pub struct CorralPaths {
    /// Depot directory (default: /var/lib/corral/containers).
    pub depot: PathBuf,
    /// Snapshot directory (default: /var/lib/corral/snapshots).
    pub snapshots: Option<PathBuf>,
}

impl CorralPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths rooted at a single directory, used by tests and
    /// single-directory deployments.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            depot: root.join("containers"),
            snapshots: Some(root.join("snapshots")),
        }
    }

    /// Replace the snapshot directory.
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: Option<PathBuf>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.depot.join(id)
    }

    /// Run directory holding barriers, the pid file and control socket.
    #[must_use]
    pub fn container_run(&self, id: &str) -> PathBuf {
        self.container(id).join("run")
    }

    /// Container root filesystem.
    #[must_use]
    pub fn container_rootfs(&self, id: &str) -> PathBuf {
        self.container(id).join("rootfs")
    }

    /// Directory holding the lifecycle hooks.
    #[must_use]
    pub fn container_lib(&self, id: &str) -> PathBuf {
        self.container(id).join("lib")
    }

    /// Directory holding the spawner, linker and stop helpers.
    #[must_use]
    pub fn container_bin(&self, id: &str) -> PathBuf {
        self.container(id).join("bin")
    }

    /// PID file written by the launcher.
    #[must_use]
    pub fn container_pid(&self, id: &str) -> PathBuf {
        self.container_run(id).join("pid")
    }

    /// Control socket of the in-container daemon.
    #[must_use]
    pub fn container_socket(&self, id: &str) -> PathBuf {
        self.container_run(id).join("ctl.sock")
    }

    /// Directory holding one directory per job.
    #[must_use]
    pub fn jobs(&self, id: &str) -> PathBuf {
        self.container(id).join("jobs")
    }

    /// Directory for a single job.
    #[must_use]
    pub fn job(&self, id: &str, job_id: u32) -> PathBuf {
        self.jobs(id).join(job_id.to_string())
    }

    /// Snapshot file for a container handle.
    #[must_use]
    pub fn snapshot(&self, handle: &str) -> Option<PathBuf> {
        self.snapshots
            .as_ref()
            .map(|dir| dir.join(format!("{handle}.json")))
    }

    /// Persisted allocation state for a named resource pool.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<PathBuf> {
        self.snapshots
            .as_ref()
            .map(|dir| dir.join("pools").join(format!("{name}.json")))
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.depot)?;
        if let Some(snapshots) = &self.snapshots {
            std::fs::create_dir_all(snapshots.join("pools"))?;
        }
        Ok(())
    }
}

impl Default for CorralPaths {
    fn default() -> Self {
        Self {
            depot: CORRAL_DEPOT.clone(),
            snapshots: Some(CORRAL_SNAPSHOTS.clone()),
        }
    }
}

/// Write `contents` to `path` atomically by renaming a sibling temp file
/// over it.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = CorralPaths::with_root("/tmp/corral-test");
        assert_eq!(
            paths.container("abc123"),
            PathBuf::from("/tmp/corral-test/containers/abc123")
        );
        assert_eq!(
            paths.job("abc123", 7),
            PathBuf::from("/tmp/corral-test/containers/abc123/jobs/7")
        );
        assert_eq!(
            paths.container_socket("abc123"),
            PathBuf::from("/tmp/corral-test/containers/abc123/run/ctl.sock")
        );
    }

    #[test]
    fn snapshot_paths() {
        let paths = CorralPaths::with_root("/tmp/corral-test");
        assert_eq!(
            paths.snapshot("web"),
            Some(PathBuf::from("/tmp/corral-test/snapshots/web.json"))
        );
        assert_eq!(
            paths.pool("uid"),
            Some(PathBuf::from("/tmp/corral-test/snapshots/pools/uid.json"))
        );

        let paths = paths.with_snapshots(None);
        assert_eq!(paths.snapshot("web"), None);
        assert_eq!(paths.pool("uid"), None);
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
