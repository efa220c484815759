//! Host-side network rule management.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use corral_common::{CorralError, CorralResult};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::network::Network;
use crate::policy::{self, NetOut};
use crate::portmap::{self, NetIn};
use crate::shaping::{self, BandwidthLimit};

/// Applies and removes the host-side rules of a container's network.
#[async_trait]
pub trait NetworkController: Send + Sync {
    /// Forward a host port to the container.
    async fn net_in(&self, id: &str, network: &Network, mapping: &NetIn) -> CorralResult<()>;

    /// Allow egress from the container.
    async fn net_out(&self, id: &str, network: &Network, allow: &NetOut) -> CorralResult<()>;

    /// Shape traffic on the container's host interface.
    async fn limit_bandwidth(&self, id: &str, limit: &BandwidthLimit) -> CorralResult<()>;

    /// Remove every rule previously applied for the container.
    async fn teardown(
        &self,
        id: &str,
        network: &Network,
        net_ins: &[NetIn],
        net_outs: &[NetOut],
    ) -> CorralResult<()>;
}

/// Controller driving the `iptables` and `tc` binaries.
#[derive(Debug, Clone)]
pub struct IptablesController {
    iptables: PathBuf,
    tc: PathBuf,
}

impl IptablesController {
    /// Use `iptables` and `tc` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            iptables: PathBuf::from("iptables"),
            tc: PathBuf::from("tc"),
        }
    }

    /// Use explicit binaries.
    #[must_use]
    pub fn with_binaries(iptables: impl Into<PathBuf>, tc: impl Into<PathBuf>) -> Self {
        Self {
            iptables: iptables.into(),
            tc: tc.into(),
        }
    }

    async fn iptables(&self, args: &[String]) -> CorralResult<()> {
        run(&self.iptables, args).await
    }

    async fn net_in_rules(&self, id: &str, ip: Ipv4Addr, mapping: &NetIn, op: &str) -> CorralResult<()> {
        for args in portmap::rules(id, ip, mapping, op) {
            self.iptables(&args).await?;
        }
        Ok(())
    }
}

impl Default for IptablesController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkController for IptablesController {
    async fn net_in(&self, id: &str, network: &Network, mapping: &NetIn) -> CorralResult<()> {
        debug!(
            id,
            host_port = mapping.host_port,
            container_port = mapping.container_port,
            container_ip = %network.container_ip,
            "Adding port mapping"
        );
        self.net_in_rules(id, network.container_ip, mapping, "-A").await
    }

    async fn net_out(&self, id: &str, network: &Network, allow: &NetOut) -> CorralResult<()> {
        debug!(id, network = ?allow.network, port = ?allow.port, "Adding egress rule");
        self.iptables(&policy::rule(id, network.container_ip, allow, "-I"))
            .await
    }

    async fn limit_bandwidth(&self, id: &str, limit: &BandwidthLimit) -> CorralResult<()> {
        let interface = Network::host_interface(id);
        debug!(id, %interface, rate = limit.rate, burst = limit.burst, "Shaping bandwidth");
        run(&self.tc, &shaping::tbf(&interface, limit)).await
    }

    async fn teardown(
        &self,
        id: &str,
        network: &Network,
        net_ins: &[NetIn],
        net_outs: &[NetOut],
    ) -> CorralResult<()> {
        for mapping in net_ins {
            for args in portmap::rules(id, network.container_ip, mapping, "-D") {
                if let Err(e) = self.iptables(&args).await {
                    warn!(id, host_port = mapping.host_port, error = %e, "Failed to remove port mapping");
                }
            }
        }

        for allow in net_outs {
            if let Err(e) = self
                .iptables(&policy::rule(id, network.container_ip, allow, "-D"))
                .await
            {
                warn!(id, error = %e, "Failed to remove egress rule");
            }
        }

        debug!(id, "Network rules removed");
        Ok(())
    }
}

/// Controller used when host network rules are disabled. Every operation
/// succeeds without touching the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledController;

#[async_trait]
impl NetworkController for DisabledController {
    async fn net_in(&self, id: &str, _network: &Network, mapping: &NetIn) -> CorralResult<()> {
        debug!(id, host_port = mapping.host_port, "Network rules disabled, skipping port mapping");
        Ok(())
    }

    async fn net_out(&self, id: &str, _network: &Network, _allow: &NetOut) -> CorralResult<()> {
        debug!(id, "Network rules disabled, skipping egress rule");
        Ok(())
    }

    async fn limit_bandwidth(&self, id: &str, _limit: &BandwidthLimit) -> CorralResult<()> {
        debug!(id, "Network rules disabled, skipping bandwidth limit");
        Ok(())
    }

    async fn teardown(
        &self,
        _id: &str,
        _network: &Network,
        _net_ins: &[NetIn],
        _net_outs: &[NetOut],
    ) -> CorralResult<()> {
        Ok(())
    }
}

async fn run(program: &Path, args: &[String]) -> CorralResult<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CorralError::Internal {
            message: format!("failed to execute {}: {e}", program.display()),
        })?;

    if !output.status.success() {
        return Err(CorralError::Internal {
            message: format!(
                "{} {} failed: {}",
                program.display(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn recorder(dir: &Path, name: &str, exit: i32) -> PathBuf {
        let path = dir.join(name);
        let log = dir.join(format!("{name}.log"));
        std::fs::write(
            &path,
            format!("#!/bin/sh\necho \"$*\" >> {}\nexit {exit}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn calls(dir: &Path, name: &str) -> Vec<String> {
        std::fs::read_to_string(dir.join(format!("{name}.log")))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn network() -> Network {
        Network::from_block("10.254.0.0/30".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn net_in_adds_both_chains() {
        let dir = tempfile::tempdir().unwrap();
        let controller = IptablesController::with_binaries(
            recorder(dir.path(), "iptables", 0),
            recorder(dir.path(), "tc", 0),
        );

        controller
            .net_in("abc", &network(), &NetIn::new(61000, 80))
            .await
            .unwrap();

        let calls = calls(dir.path(), "iptables");
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("-A PREROUTING"));
        assert!(calls[1].contains("-A OUTPUT"));
        assert!(calls[0].contains("10.254.0.2:80"));
    }

    #[tokio::test]
    async fn failing_binary_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let controller = IptablesController::with_binaries(
            recorder(dir.path(), "iptables", 1),
            recorder(dir.path(), "tc", 1),
        );

        let err = controller
            .net_out("abc", &network(), &NetOut::any())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed"));

        assert!(
            controller
                .limit_bandwidth("abc", &BandwidthLimit { rate: 1, burst: 1 })
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn teardown_removes_recorded_rules_and_ignores_failures() {
        let dir = tempfile::tempdir().unwrap();
        let controller = IptablesController::with_binaries(
            recorder(dir.path(), "iptables", 1),
            recorder(dir.path(), "tc", 0),
        );

        controller
            .teardown(
                "abc",
                &network(),
                &[NetIn::new(61000, 80)],
                &[NetOut::any().port(53)],
            )
            .await
            .unwrap();

        let calls = calls(dir.path(), "iptables");
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains("-D PREROUTING"));
        assert!(calls[1].contains("-D OUTPUT"));
        assert!(calls[2].contains("-D FORWARD"));
    }

    #[tokio::test]
    async fn limit_bandwidth_targets_host_interface() {
        let dir = tempfile::tempdir().unwrap();
        let controller = IptablesController::with_binaries(
            recorder(dir.path(), "iptables", 0),
            recorder(dir.path(), "tc", 0),
        );

        controller
            .limit_bandwidth("abc", &BandwidthLimit { rate: 100, burst: 10 })
            .await
            .unwrap();

        assert_eq!(
            calls(dir.path(), "tc"),
            vec!["qdisc replace dev c-abc-0 root tbf rate 800bit burst 10 latency 25ms"]
        );
    }
}
