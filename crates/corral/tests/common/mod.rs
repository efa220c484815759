//! Backends over stub helper executables, shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use corral::runtime::{BackendConfig, LinuxBackend};
use corral_network::DisabledController;

#[path = "../../src/test_support.rs"]
mod stubs;

/// Configuration keeping all state under `root`, with stub helpers.
pub fn config(root: &Path) -> BackendConfig {
    let (skeleton, launcher) = stubs::stub_skeleton(root);
    BackendConfig::default()
        .with_root(root.join("state"))
        .with_skeleton(skeleton)
        .with_launcher(launcher)
        .with_cgroup_root(None)
}

/// A backend over `config` that installs no host network rules.
pub fn backend(config: BackendConfig) -> LinuxBackend {
    LinuxBackend::new(config, Arc::new(DisabledController)).unwrap()
}
