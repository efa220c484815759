//! Daemon configuration: an optional TOML file overridden by flags and
//! `CORRAL_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use corral::runtime::BackendConfig;
use corral_common::CorralPaths;
use corral_network::{Ipv4Block, PortPool};
use serde::Deserialize;

use crate::server::Listen;

/// Transport the control socket listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ListenNetwork {
    /// Unix domain socket.
    #[default]
    Unix,
    /// TCP socket.
    Tcp,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Container supervisor daemon", long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(long, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Transport of the control socket
    #[arg(long, env = "CORRAL_LISTEN_NETWORK", value_enum)]
    pub listen_network: Option<ListenNetwork>,

    /// Socket path, or host:port for tcp
    #[arg(long, env = "CORRAL_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Directory holding container directories
    #[arg(long, env = "CORRAL_DEPOT")]
    pub depot: Option<PathBuf>,

    /// Directory holding container snapshots
    #[arg(long, env = "CORRAL_SNAPSHOTS")]
    pub snapshots: Option<PathBuf>,

    /// Directory holding the container skeleton
    #[arg(long, env = "CORRAL_BIN")]
    pub bin: Option<PathBuf>,

    /// Base root filesystem
    #[arg(long, env = "CORRAL_ROOTFS")]
    pub rootfs: Option<PathBuf>,

    /// The corral-init binary
    #[arg(long, env = "CORRAL_LAUNCHER")]
    pub launcher: Option<PathBuf>,

    /// Cgroup v2 mount point
    #[arg(long, env = "CORRAL_CGROUP_ROOT")]
    pub cgroup_root: Option<PathBuf>,

    /// Idle seconds before a container is destroyed, 0 to never reap
    #[arg(long, env = "CORRAL_CONTAINER_GRACE_TIME")]
    pub container_grace_time: Option<u64>,

    /// First uid handed to containers
    #[arg(long, env = "CORRAL_UID_POOL_START")]
    pub uid_pool_start: Option<u32>,

    /// Number of uids handed to containers
    #[arg(long, env = "CORRAL_UID_POOL_SIZE")]
    pub uid_pool_size: Option<u32>,

    /// Block carved into container networks
    #[arg(long, env = "CORRAL_NETWORK_POOL")]
    pub network_pool: Option<String>,

    /// First host port handed out by NetIn
    #[arg(long, env = "CORRAL_PORT_POOL_START")]
    pub port_pool_start: Option<u16>,

    /// Number of host ports handed out by NetIn
    #[arg(long, env = "CORRAL_PORT_POOL_SIZE")]
    pub port_pool_size: Option<u16>,

    /// Do not install iptables or tc rules
    #[arg(long, env = "CORRAL_DISABLE_NETWORK_RULES")]
    pub disable_network_rules: bool,

    /// Run without cgroups; memory and CPU limits become unsupported
    #[arg(long, env = "CORRAL_DISABLE_CGROUPS")]
    pub disable_cgroups: bool,

    /// Log output format
    #[arg(long, env = "CORRAL_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Effective daemon configuration. Keys of the TOML file match the
/// field names.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub listen_network: ListenNetwork,
    pub listen_addr: String,
    pub depot: PathBuf,
    pub snapshots: Option<PathBuf>,
    pub bin: PathBuf,
    pub rootfs: PathBuf,
    pub launcher: PathBuf,
    pub cgroup_root: PathBuf,
    pub container_grace_time: u64,
    pub uid_pool_start: u32,
    pub uid_pool_size: u32,
    pub network_pool: String,
    pub port_pool_start: u16,
    pub port_pool_size: u16,
    pub disable_network_rules: bool,
    pub disable_cgroups: bool,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let backend = BackendConfig::default();
        Self {
            listen_network: ListenNetwork::Unix,
            listen_addr: "/tmp/corral.sock".to_string(),
            depot: backend.paths.depot,
            snapshots: backend.paths.snapshots,
            bin: PathBuf::from("/var/lib/corral/bin"),
            rootfs: backend.rootfs,
            launcher: backend.launcher,
            cgroup_root: backend.cgroup_root.unwrap_or_default(),
            container_grace_time: backend.grace_time.as_secs(),
            uid_pool_start: backend.pools.uid_start,
            uid_pool_size: backend.pools.uid_size,
            network_pool: backend.pools.network.to_string(),
            port_pool_start: PortPool::DEFAULT_START,
            port_pool_size: PortPool::DEFAULT_SIZE,
            disable_network_rules: false,
            disable_cgroups: false,
            log_format: LogFormat::Text,
        }
    }
}

impl DaemonConfig {
    /// Read the file named by `args`, if any, and apply the flags on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(args: Args) -> anyhow::Result<Self> {
        let config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.merge(args))
    }

    /// Parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Apply flags over the file values.
    #[must_use]
    pub fn merge(mut self, args: Args) -> Self {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = args.$field {
                    self.$field = value;
                })*
            };
        }
        take!(
            listen_network,
            listen_addr,
            depot,
            bin,
            rootfs,
            launcher,
            cgroup_root,
            container_grace_time,
            uid_pool_start,
            uid_pool_size,
            network_pool,
            port_pool_start,
            port_pool_size,
            log_format,
        );
        if args.snapshots.is_some() {
            self.snapshots = args.snapshots;
        }
        self.disable_network_rules |= args.disable_network_rules;
        self.disable_cgroups |= args.disable_cgroups;
        self
    }

    /// Where the control socket listens.
    #[must_use]
    pub fn listen(&self) -> Listen {
        match self.listen_network {
            ListenNetwork::Unix => Listen::Unix(PathBuf::from(&self.listen_addr)),
            ListenNetwork::Tcp => Listen::Tcp(self.listen_addr.clone()),
        }
    }

    /// Backend settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the network pool is not a valid block.
    pub fn backend(&self) -> anyhow::Result<BackendConfig> {
        let network: Ipv4Block = self
            .network_pool
            .parse()
            .with_context(|| format!("invalid network_pool {:?}", self.network_pool))?;
        let cgroup_root = (!self.disable_cgroups).then(|| self.cgroup_root.clone());

        Ok(BackendConfig::default()
            .with_paths(CorralPaths {
                depot: self.depot.clone(),
                snapshots: self.snapshots.clone(),
            })
            .with_skeleton(self.bin.join("skeleton"))
            .with_launcher(&self.launcher)
            .with_rootfs(&self.rootfs)
            .with_cgroup_root(cgroup_root)
            .with_uid_pool(self.uid_pool_start, self.uid_pool_size)
            .with_network_pool(network)
            .with_port_pool(self.port_pool_start, self.port_pool_size)
            .with_grace_time(Duration::from_secs(self.container_grace_time)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_unix_socket() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen(), Listen::Unix(PathBuf::from("/tmp/corral.sock")));
        assert_eq!(config.container_grace_time, 0);
        assert_eq!(config.network_pool, "10.254.0.0/22");

        let backend = config.backend().unwrap();
        assert_eq!(backend.skeleton, PathBuf::from("/var/lib/corral/bin/skeleton"));
        assert!(backend.grace_time.is_zero());
    }

    #[test]
    fn file_values_are_overridden_by_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrald.toml");
        std::fs::write(
            &path,
            r#"
listen_network = "tcp"
listen_addr = "127.0.0.1:7777"
container_grace_time = 300
port_pool_start = 40000
log_format = "json"
"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "corrald",
            "--config",
            path.to_str().unwrap(),
            "--container-grace-time",
            "60",
            "--disable-cgroups",
        ]);
        let config = DaemonConfig::load(args).unwrap();

        assert_eq!(config.listen(), Listen::Tcp("127.0.0.1:7777".to_string()));
        assert_eq!(config.container_grace_time, 60);
        assert_eq!(config.port_pool_start, 40_000);
        assert_eq!(config.log_format, LogFormat::Json);

        let backend = config.backend().unwrap();
        assert!(backend.cgroup_root.is_none());
        assert_eq!(backend.grace_time, Duration::from_secs(60));
        assert_eq!(backend.pools.port_start, 40_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrald.toml");
        std::fs::write(&path, "listen_port = 1\n").unwrap();
        assert!(DaemonConfig::from_file(&path).is_err());
    }

    #[test]
    fn invalid_network_pool() {
        let config = DaemonConfig {
            network_pool: "10.0.0.0".to_string(),
            ..DaemonConfig::default()
        };
        let err = config.backend().unwrap_err();
        assert!(err.to_string().contains("network_pool"));
    }
}
