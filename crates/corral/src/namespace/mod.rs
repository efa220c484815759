//! Linux namespace creation.
//!
//! A container gets fresh namespaces of these kinds:
//! - Mount namespace (CLONE_NEWNS)
//! - UTS namespace (CLONE_NEWUTS)
//! - IPC namespace (CLONE_NEWIPC)
//! - PID namespace (CLONE_NEWPID)
//! - Network namespace (CLONE_NEWNET)

mod barrier;
pub mod launcher;

pub use barrier::Barrier;
pub use launcher::{LaunchConfig, continue_as_init, launch};

/// Namespaces requested for the container side of the clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct NamespaceConfig {
    /// Mount namespace.
    pub mount: bool,
    /// UTS namespace.
    pub uts: bool,
    /// IPC namespace.
    pub ipc: bool,
    /// PID namespace.
    pub pid: bool,
    /// Network namespace.
    pub net: bool,
}

impl NamespaceConfig {
    /// Every namespace a container runs in.
    #[must_use]
    pub const fn container() -> Self {
        Self {
            mount: true,
            uts: true,
            ipc: true,
            pid: true,
            net: true,
        }
    }

    /// Convert to `clone(2)` flags.
    #[must_use]
    pub const fn to_clone_flags(&self) -> libc::c_int {
        let mut flags = 0;
        if self.mount {
            flags |= libc::CLONE_NEWNS;
        }
        if self.uts {
            flags |= libc::CLONE_NEWUTS;
        }
        if self.ipc {
            flags |= libc::CLONE_NEWIPC;
        }
        if self.pid {
            flags |= libc::CLONE_NEWPID;
        }
        if self.net {
            flags |= libc::CLONE_NEWNET;
        }
        flags
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self::container()
    }
}
