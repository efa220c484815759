//! Network and port lease pools.

use std::path::PathBuf;

use corral_common::{CorralError, CorralResult, LeasePool};
use tracing::info;

use crate::network::{Ipv4Block, LEASE_PREFIX, Network};

/// Pool of point-to-point networks carved out of one address block.
#[derive(Debug)]
pub struct NetworkPool {
    block: Ipv4Block,
    leases: LeasePool,
}

impl NetworkPool {
    /// Pool name used in errors and for its state file.
    pub const NAME: &'static str = "network";

    /// Open a pool over `block`, persisting allocation state at `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is too small to hold a single lease
    /// or the persisted state cannot be read.
    pub fn open(block: Ipv4Block, store: Option<PathBuf>) -> CorralResult<Self> {
        let size = block.subnets(LEASE_PREFIX);
        if size == 0 {
            return Err(CorralError::Config {
                message: format!("network pool {block} is smaller than /{LEASE_PREFIX}"),
            });
        }
        info!(%block, size, "Network pool ready");
        Ok(Self {
            block,
            leases: LeasePool::open(Self::NAME, size, store)?,
        })
    }

    /// The address block the pool hands out.
    #[must_use]
    pub const fn block(&self) -> Ipv4Block {
        self.block
    }

    /// Lease a network.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PoolExhausted`] when every network is leased.
    pub fn acquire(&self) -> CorralResult<Network> {
        let slot = self.leases.acquire()?;
        self.network(slot)
    }

    /// Return a network to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotLeased`] if the network is not leased from
    /// this pool.
    pub fn release(&self, network: &Network) -> CorralResult<()> {
        let slot = self.slot(network)?;
        self.leases.release(slot)
    }

    /// Mark a network restored from a snapshot as leased.
    ///
    /// # Errors
    ///
    /// Returns an error if the network lies outside the pool's block.
    pub fn reserve(&self, network: &Network) -> CorralResult<()> {
        let slot = self.slot(network)?;
        self.leases.reserve(slot)
    }

    /// Number of networks currently leased.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.leases.leased()
    }

    fn network(&self, slot: u32) -> CorralResult<Network> {
        self.block
            .subnet(LEASE_PREFIX, slot)
            .and_then(Network::from_block)
            .ok_or_else(|| CorralError::Internal {
                message: format!("network slot {slot} outside {}", self.block),
            })
    }

    fn slot(&self, network: &Network) -> CorralResult<u32> {
        if network.block.prefix != LEASE_PREFIX {
            return Err(self.not_leased(network));
        }
        self.block
            .index_of(&network.block)
            .ok_or_else(|| self.not_leased(network))
    }

    fn not_leased(&self, network: &Network) -> CorralError {
        CorralError::NotLeased {
            pool: Self::NAME,
            item: network.cidr(),
        }
    }
}

/// Pool of host ports used for inbound mappings.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    leases: LeasePool,
}

impl PortPool {
    /// Pool name used in errors and for its state file.
    pub const NAME: &'static str = "port";

    /// Default first port.
    pub const DEFAULT_START: u16 = 61000;

    /// Default number of ports, running the pool up to 65534.
    pub const DEFAULT_SIZE: u16 = 4535;

    /// Open a pool of `size` ports starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range overflows the port space or the
    /// persisted state cannot be read.
    pub fn open(start: u16, size: u16, store: Option<PathBuf>) -> CorralResult<Self> {
        if size == 0 || start.checked_add(size - 1).is_none() {
            return Err(CorralError::Config {
                message: format!("port pool {start}+{size} does not fit in the port range"),
            });
        }
        info!(start, size, "Port pool ready");
        Ok(Self {
            start,
            leases: LeasePool::open(Self::NAME, u32::from(size), store)?,
        })
    }

    /// Lease a port.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PoolExhausted`] when every port is leased.
    pub fn acquire(&self) -> CorralResult<u16> {
        let slot = self.leases.acquire()?;
        u16::try_from(slot)
            .ok()
            .and_then(|slot| self.start.checked_add(slot))
            .ok_or_else(|| CorralError::Internal {
                message: format!("port slot {slot} outside pool"),
            })
    }

    /// Return a port to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotLeased`] if the port is not leased.
    pub fn release(&self, port: u16) -> CorralResult<()> {
        let slot = self.slot(port)?;
        self.leases.release(slot)
    }

    /// Mark a port restored from a snapshot as leased.
    ///
    /// Ports outside the pool range (mapped explicitly by a client) are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool state cannot be persisted.
    pub fn reserve(&self, port: u16) -> CorralResult<()> {
        match self.slot(port) {
            Ok(slot) => self.leases.reserve(slot),
            Err(_) => Ok(()),
        }
    }

    /// Whether `port` belongs to this pool's range.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.slot(port).is_ok()
    }

    /// Number of ports currently leased.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.leases.leased()
    }

    fn slot(&self, port: u16) -> CorralResult<u32> {
        port.checked_sub(self.start)
            .map(u32::from)
            .filter(|slot| *slot < self.leases.size())
            .ok_or_else(|| CorralError::NotLeased {
                pool: Self::NAME,
                item: port.to_string(),
            })
    }
}
