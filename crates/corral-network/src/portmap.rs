//! Inbound port forwarding for containers.
//!
//! A [`NetIn`] maps a host port onto a port of the container address using
//! iptables NAT rules tagged with a per-container comment.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// An inbound mapping from a host port to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetIn {
    /// Host port.
    pub host_port: u16,
    /// Container port.
    pub container_port: u16,
}

impl NetIn {
    /// Create a mapping.
    #[must_use]
    pub const fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Rule comment identifying a container's rules.
#[must_use]
pub fn comment(id: &str) -> String {
    format!("corral-{id}")
}

/// iptables invocations installing (`-A`) or removing (`-D`) a mapping.
///
/// Traffic arriving from outside is rewritten in PREROUTING, locally
/// originated traffic in OUTPUT.
#[must_use]
pub fn rules(id: &str, container_ip: Ipv4Addr, mapping: &NetIn, op: &str) -> Vec<Vec<String>> {
    let host_port = mapping.host_port.to_string();
    let dest = format!("{container_ip}:{}", mapping.container_port);
    let comment = comment(id);

    ["PREROUTING", "OUTPUT"]
        .into_iter()
        .map(|chain| {
            let mut args = vec!["-w", "-t", "nat", op, chain, "-p", "tcp"];
            if chain == "OUTPUT" {
                args.extend(["-d", "127.0.0.1"]);
            }
            args.extend([
                "--dport",
                host_port.as_str(),
                "-j",
                "DNAT",
                "--to-destination",
                dest.as_str(),
                "-m",
                "comment",
                "--comment",
                comment.as_str(),
            ]);
            args.into_iter().map(str::to_string).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnat_rules() {
        let rules = rules("abc", Ipv4Addr::new(10, 254, 0, 2), &NetIn::new(61000, 8080), "-A");
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0].join(" "),
            "-w -t nat -A PREROUTING -p tcp --dport 61000 -j DNAT \
             --to-destination 10.254.0.2:8080 -m comment --comment corral-abc"
        );
        assert!(rules[1].join(" ").contains("OUTPUT -p tcp -d 127.0.0.1 --dport 61000"));
    }

    #[test]
    fn delete_mirrors_add() {
        let ip = Ipv4Addr::new(10, 254, 0, 2);
        let mapping = NetIn::new(61000, 8080);
        let added = rules("abc", ip, &mapping, "-A");
        let deleted = rules("abc", ip, &mapping, "-D");
        for (add, del) in added.iter().zip(&deleted) {
            assert_eq!(add[3], "-A");
            assert_eq!(del[3], "-D");
            assert_eq!(add[4..], del[4..]);
        }
    }
}
