//! Outbound traffic policy for containers.
//!
//! Container egress is denied by default on the host; a [`NetOut`] opens a
//! hole for a destination network and optionally a single port.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::portmap::comment;

/// An egress allowance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetOut {
    /// Destination network or address; any destination when absent.
    pub network: Option<String>,
    /// Destination port; any port when absent.
    pub port: Option<u16>,
}

impl NetOut {
    /// Allow every destination.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            network: None,
            port: None,
        }
    }

    /// Restrict to a destination network.
    #[must_use]
    pub fn to(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }

    /// Restrict to a destination port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// iptables invocation installing (`-I`) or removing (`-D`) an allowance.
#[must_use]
pub fn rule(id: &str, container_ip: Ipv4Addr, allow: &NetOut, op: &str) -> Vec<String> {
    let mut args: Vec<String> = ["-w", op, "FORWARD", "-s"]
        .into_iter()
        .map(str::to_string)
        .collect();
    args.push(container_ip.to_string());

    if let Some(network) = &allow.network {
        args.push("-d".to_string());
        args.push(network.clone());
    }

    if let Some(port) = allow.port {
        args.extend(["-p", "tcp", "--dport"].map(str::to_string));
        args.push(port.to_string());
    }

    args.extend(["-j", "ACCEPT", "-m", "comment", "--comment"].map(str::to_string));
    args.push(comment(id));
    args
}
