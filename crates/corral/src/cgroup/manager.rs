//! Cgroup manager implementation.

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};

/// Manages the cgroup of one container at `<root>/corral/<id>`.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Container ID.
    container_id: String,
    /// Cgroup path.
    path: PathBuf,
}

impl CgroupManager {
    /// Refer to the cgroup of a container without creating it.
    #[must_use]
    pub fn new(root: &Path, container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            path: root.join("corral").join(container_id),
        }
    }

    /// Create the cgroup directory.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PermissionDenied`] without the rights to
    /// create cgroups, or an I/O error.
    pub fn create(&self) -> CorralResult<()> {
        tracing::debug!(
            container_id = %self.container_id,
            path = %self.path.display(),
            "Creating cgroup"
        );

        std::fs::create_dir_all(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                CorralError::PermissionDenied {
                    operation: "create cgroup".to_string(),
                }
            } else {
                CorralError::Io(e)
            }
        })
    }

    /// Get the cgroup path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the cgroup exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Add a process to the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be written.
    pub fn add_process(&self, pid: u32) -> CorralResult<()> {
        std::fs::write(self.path.join("cgroup.procs"), pid.to_string())?;

        tracing::debug!(
            container_id = %self.container_id,
            pid = pid,
            "Added process to cgroup"
        );

        Ok(())
    }

    /// Set the hard memory limit in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `memory.max` cannot be written.
    pub fn set_memory_limit(&self, bytes: u64) -> CorralResult<()> {
        std::fs::write(self.path.join("memory.max"), bytes.to_string())?;
        tracing::debug!(container_id = %self.container_id, max = bytes, "Set memory.max");
        Ok(())
    }

    /// Current hard memory limit, `None` when unlimited.
    ///
    /// # Errors
    ///
    /// Returns an error if `memory.max` cannot be read.
    pub fn memory_limit(&self) -> CorralResult<Option<u64>> {
        let content = std::fs::read_to_string(self.path.join("memory.max"))?;
        Ok(content.trim().parse().ok())
    }

    /// Set the relative CPU weight (1-10000).
    ///
    /// # Errors
    ///
    /// Returns an error if `cpu.weight` cannot be written.
    pub fn set_cpu_weight(&self, weight: u64) -> CorralResult<()> {
        let weight = weight.clamp(1, 10_000);
        std::fs::write(self.path.join("cpu.weight"), weight.to_string())?;
        tracing::debug!(container_id = %self.container_id, weight, "Set CPU weight");
        Ok(())
    }

    /// Current CPU weight.
    ///
    /// # Errors
    ///
    /// Returns an error if `cpu.weight` cannot be read.
    pub fn cpu_weight(&self) -> CorralResult<Option<u64>> {
        let content = std::fs::read_to_string(self.path.join("cpu.weight"))?;
        Ok(content.trim().parse().ok())
    }

    /// Number of OOM kills recorded in `memory.events`.
    ///
    /// # Errors
    ///
    /// Returns an error if `memory.events` cannot be read.
    pub fn oom_kills(&self) -> CorralResult<u64> {
        let content = std::fs::read_to_string(self.path.join("memory.events"))?;
        Ok(content
            .lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(key, _)| *key == "oom_kill")
            .and_then(|(_, value)| value.trim().parse().ok())
            .unwrap_or(0))
    }

    /// Kill all processes in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.kill` cannot be written.
    pub fn kill_all(&self) -> CorralResult<()> {
        std::fs::write(self.path.join("cgroup.kill"), "1")?;
        tracing::debug!(container_id = %self.container_id, "Killed all processes in cgroup");
        Ok(())
    }

    /// Delete the cgroup if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn delete(&self) -> CorralResult<()> {
        if self.path.exists() {
            std::fs::remove_dir(&self.path)?;
            tracing::debug!(
                container_id = %self.container_id,
                path = %self.path.display(),
                "Deleted cgroup"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, CgroupManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = CgroupManager::new(dir.path(), "abc");
        manager.create().unwrap();
        (dir, manager)
    }

    #[test]
    fn path_layout() {
        let manager = CgroupManager::new(Path::new("/sys/fs/cgroup"), "abc");
        assert_eq!(manager.path(), Path::new("/sys/fs/cgroup/corral/abc"));
    }

    #[test]
    fn memory_limit_roundtrip() {
        let (_dir, manager) = manager();
        manager.set_memory_limit(64 * 1024 * 1024).unwrap();
        assert_eq!(manager.memory_limit().unwrap(), Some(64 * 1024 * 1024));

        std::fs::write(manager.path().join("memory.max"), "max\n").unwrap();
        assert_eq!(manager.memory_limit().unwrap(), None);
    }

    #[test]
    fn cpu_weight_is_clamped() {
        let (_dir, manager) = manager();
        manager.set_cpu_weight(0).unwrap();
        assert_eq!(manager.cpu_weight().unwrap(), Some(1));
        manager.set_cpu_weight(50_000).unwrap();
        assert_eq!(manager.cpu_weight().unwrap(), Some(10_000));
    }

    #[test]
    fn parses_oom_kills() {
        let (_dir, manager) = manager();
        std::fs::write(
            manager.path().join("memory.events"),
            "low 0\nhigh 0\nmax 4\noom 2\noom_kill 1\n",
        )
        .unwrap();
        assert_eq!(manager.oom_kills().unwrap(), 1);
    }

    #[test]
    fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CgroupManager::new(dir.path(), "gone");
        assert!(!manager.exists());
        manager.delete().unwrap();
    }
}
