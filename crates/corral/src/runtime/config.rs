//! Backend configuration.

use std::path::PathBuf;
use std::time::Duration;

use corral_common::CorralPaths;
use corral_network::Ipv4Block;

use super::pools::PoolConfig;
use crate::cgroup::CGROUP_ROOT;

/// Backend configuration options.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Depot and snapshot locations.
    pub paths: CorralPaths,
    /// Directory copied into every new container directory.
    pub skeleton: PathBuf,
    /// The `corral-init` binary used to launch containers and exec into
    /// them.
    pub launcher: PathBuf,
    /// Base root filesystem handed to the hooks as `ROOTFS_BASE`.
    pub rootfs: PathBuf,
    /// Cgroup v2 mount point; limits are unsupported without one.
    pub cgroup_root: Option<PathBuf>,
    /// Pool sizing.
    pub pools: PoolConfig,
    /// Grace time for containers created without one.
    pub grace_time: Duration,
    /// How often each container's OOM counter is polled.
    pub oom_poll_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            paths: CorralPaths::new(),
            skeleton: PathBuf::from("/var/lib/corral/bin/skeleton"),
            launcher: PathBuf::from("/usr/local/bin/corral-init"),
            rootfs: PathBuf::from("/var/lib/corral/rootfs"),
            cgroup_root: Some(PathBuf::from(CGROUP_ROOT)),
            pools: PoolConfig::default(),
            grace_time: Duration::ZERO,
            oom_poll_interval: Duration::from_secs(1),
        }
    }
}

impl BackendConfig {
    /// Keep depot and snapshots under one root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = CorralPaths::with_root(root);
        self
    }

    /// Replace the depot and snapshot paths.
    #[must_use]
    pub fn with_paths(mut self, paths: CorralPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Set the skeleton directory.
    #[must_use]
    pub fn with_skeleton(mut self, skeleton: impl Into<PathBuf>) -> Self {
        self.skeleton = skeleton.into();
        self
    }

    /// Set the launcher binary.
    #[must_use]
    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = launcher.into();
        self
    }

    /// Set the base root filesystem.
    #[must_use]
    pub fn with_rootfs(mut self, rootfs: impl Into<PathBuf>) -> Self {
        self.rootfs = rootfs.into();
        self
    }

    /// Set or clear the cgroup mount point.
    #[must_use]
    pub fn with_cgroup_root(mut self, root: Option<PathBuf>) -> Self {
        self.cgroup_root = root;
        self
    }

    /// Set the uid range.
    #[must_use]
    pub const fn with_uid_pool(mut self, start: u32, size: u32) -> Self {
        self.pools.uid_start = start;
        self.pools.uid_size = size;
        self
    }

    /// Set the block carved into container networks.
    #[must_use]
    pub const fn with_network_pool(mut self, block: Ipv4Block) -> Self {
        self.pools.network = block;
        self
    }

    /// Set the host port range.
    #[must_use]
    pub const fn with_port_pool(mut self, start: u16, size: u16) -> Self {
        self.pools.port_start = start;
        self.pools.port_size = size;
        self
    }

    /// Set the default grace time.
    #[must_use]
    pub const fn with_grace_time(mut self, grace_time: Duration) -> Self {
        self.grace_time = grace_time;
        self
    }

    /// Set the OOM poll interval.
    #[must_use]
    pub const fn with_oom_poll_interval(mut self, interval: Duration) -> Self {
        self.oom_poll_interval = interval;
        self
    }
}
