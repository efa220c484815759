//! Cgroup v2 resource limits.

mod manager;

pub use manager::CgroupManager;

/// Default cgroup v2 mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
