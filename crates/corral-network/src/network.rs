//! Container network addressing.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use corral_common::{CorralError, CorralResult};
use serde::{Deserialize, Serialize};

/// Prefix length of the point-to-point block leased to each container.
pub const LEASE_PREFIX: u8 = 30;

/// An IPv4 address block in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv4Block {
    /// Network address (host bits cleared).
    pub addr: Ipv4Addr,
    /// Prefix length.
    pub prefix: u8,
}

impl Ipv4Block {
    /// Create a block, clearing any host bits of `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is longer than 32 bits.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> CorralResult<Self> {
        if prefix > 32 {
            return Err(CorralError::Config {
                message: format!("invalid prefix length /{prefix}"),
            });
        }
        let addr = Ipv4Addr::from(u32::from(addr) & Self::mask(prefix));
        Ok(Self { addr, prefix })
    }

    const fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    /// Number of addresses in the block.
    #[must_use]
    pub const fn len(&self) -> u64 {
        1 << (32 - self.prefix as u32)
    }

    /// Whether the block has no addresses (never true).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Number of sub-blocks of `prefix` length this block splits into.
    #[must_use]
    pub fn subnets(&self, prefix: u8) -> u32 {
        if prefix < self.prefix || prefix > 32 {
            return 0;
        }
        u32::try_from(1u64 << (prefix - self.prefix)).unwrap_or(u32::MAX)
    }

    /// The `index`-th sub-block of `prefix` length.
    #[must_use]
    pub fn subnet(&self, prefix: u8, index: u32) -> Option<Self> {
        if index >= self.subnets(prefix) {
            return None;
        }
        let step = 1u32.checked_shl(u32::from(32 - prefix)).unwrap_or(0);
        let base = u32::from(self.addr).checked_add(index.checked_mul(step)?)?;
        Some(Self {
            addr: Ipv4Addr::from(base),
            prefix,
        })
    }

    /// Index of `sub` within this block, if it is one of its sub-blocks.
    #[must_use]
    pub fn index_of(&self, sub: &Self) -> Option<u32> {
        if sub.prefix < self.prefix || !self.contains(sub.addr) || sub.prefix == 0 {
            return None;
        }
        let offset = u32::from(sub.addr) - u32::from(self.addr);
        Some(offset >> (32 - sub.prefix))
    }

    /// Whether `addr` lies inside the block.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix) == u32::from(self.addr)
    }

    /// The `n`-th address of the block.
    #[must_use]
    pub fn nth(&self, n: u32) -> Option<Ipv4Addr> {
        if u64::from(n) >= self.len() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.addr) + n))
    }
}

impl fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Block {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CorralError::Config {
            message: format!("invalid network {s:?}, expected a.b.c.d/n"),
        };
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

/// A point-to-point network leased to one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Network {
    /// The leased sub-block.
    pub block: Ipv4Block,
    /// Address of the host side of the pair.
    pub host_ip: Ipv4Addr,
    /// Address of the container side of the pair.
    pub container_ip: Ipv4Addr,
}

impl Network {
    /// Build the point-to-point pair for a leased sub-block.
    ///
    /// Returns `None` for blocks too small to hold two hosts.
    #[must_use]
    pub fn from_block(block: Ipv4Block) -> Option<Self> {
        if block.len() < 4 {
            return None;
        }
        Some(Self {
            block,
            host_ip: block.nth(1)?,
            container_ip: block.nth(2)?,
        })
    }

    /// Subnet in CIDR notation.
    #[must_use]
    pub fn cidr(&self) -> String {
        self.block.to_string()
    }

    /// Host-side interface name for a container id.
    #[must_use]
    pub fn host_interface(id: &str) -> String {
        format!("c-{id}-0")
    }

    /// Container-side interface name for a container id.
    #[must_use]
    pub fn container_interface(id: &str) -> String {
        format!("c-{id}-1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_block() {
        let block: Ipv4Block = "10.254.0.0/22".parse().unwrap();
        assert_eq!(block.addr, Ipv4Addr::new(10, 254, 0, 0));
        assert_eq!(block.prefix, 22);
        assert_eq!(block.len(), 1024);
        assert_eq!(block.to_string(), "10.254.0.0/22");
    }

    #[test]
    fn parse_clears_host_bits() {
        let block: Ipv4Block = "10.254.1.7/22".parse().unwrap();
        assert_eq!(block.addr, Ipv4Addr::new(10, 254, 0, 0));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("10.254.0.0".parse::<Ipv4Block>().is_err());
        assert!("10.254.0.0/33".parse::<Ipv4Block>().is_err());
        assert!("not-an-ip/22".parse::<Ipv4Block>().is_err());
    }

    #[test]
    fn subnets_and_index() {
        let block: Ipv4Block = "10.254.0.0/22".parse().unwrap();
        assert_eq!(block.subnets(LEASE_PREFIX), 256);

        let sub = block.subnet(LEASE_PREFIX, 3).unwrap();
        assert_eq!(sub.to_string(), "10.254.0.12/30");
        assert_eq!(block.index_of(&sub), Some(3));

        let last = block.subnet(LEASE_PREFIX, 255).unwrap();
        assert_eq!(last.to_string(), "10.254.3.252/30");
        assert!(block.subnet(LEASE_PREFIX, 256).is_none());

        let outside: Ipv4Block = "10.255.0.0/30".parse().unwrap();
        assert_eq!(block.index_of(&outside), None);
    }

    #[test]
    fn point_to_point_pair() {
        let block: Ipv4Block = "10.254.0.4/30".parse().unwrap();
        let network = Network::from_block(block).unwrap();
        assert_eq!(network.host_ip, Ipv4Addr::new(10, 254, 0, 5));
        assert_eq!(network.container_ip, Ipv4Addr::new(10, 254, 0, 6));
        assert_eq!(network.cidr(), "10.254.0.4/30");

        let tiny: Ipv4Block = "10.254.0.4/31".parse().unwrap();
        assert!(Network::from_block(tiny).is_none());
    }

    #[test]
    fn interface_names() {
        assert_eq!(Network::host_interface("abc"), "c-abc-0");
        assert_eq!(Network::container_interface("abc"), "c-abc-1");
    }
}
