//! Resource pools shared by every container.

use std::path::PathBuf;

use corral_common::{CorralError, CorralPaths, CorralResult, LeasePool};
use corral_network::{Ipv4Block, Network, NetworkPool, PortPool};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Pool of user ids containers run their jobs as.
#[derive(Debug)]
pub struct UidPool {
    start: u32,
    leases: LeasePool,
}

impl UidPool {
    /// Pool name used in errors and for its state file.
    pub const NAME: &'static str = "uid";

    /// Open a pool of `size` uids starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range overflows or the persisted state
    /// cannot be read.
    pub fn open(start: u32, size: u32, store: Option<PathBuf>) -> CorralResult<Self> {
        if size == 0 || start.checked_add(size - 1).is_none() {
            return Err(CorralError::Config {
                message: format!("uid pool {start}+{size} overflows"),
            });
        }
        Ok(Self {
            start,
            leases: LeasePool::open(Self::NAME, size, store)?,
        })
    }

    /// Lease a uid.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PoolExhausted`] when every uid is leased.
    pub fn acquire(&self) -> CorralResult<u32> {
        Ok(self.start + self.leases.acquire()?)
    }

    /// Return a uid to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotLeased`] if the uid is not leased.
    pub fn release(&self, uid: u32) -> CorralResult<()> {
        self.leases.release(self.slot(uid)?)
    }

    /// Mark a uid restored from a snapshot as leased.
    ///
    /// # Errors
    ///
    /// Returns an error if the uid lies outside the pool.
    pub fn reserve(&self, uid: u32) -> CorralResult<()> {
        self.leases.reserve(self.slot(uid)?)
    }

    /// Number of uids currently leased.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.leases.leased()
    }

    fn slot(&self, uid: u32) -> CorralResult<u32> {
        uid.checked_sub(self.start)
            .filter(|slot| *slot < self.leases.size())
            .ok_or_else(|| CorralError::NotLeased {
                pool: Self::NAME,
                item: uid.to_string(),
            })
    }
}

/// Everything a container leases from the pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// User id the container's jobs run as.
    pub uid: u32,
    /// The container's point-to-point network.
    pub network: Network,
    /// Host ports leased for inbound mappings.
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Sizing of the three pools.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// First uid.
    pub uid_start: u32,
    /// Number of uids.
    pub uid_size: u32,
    /// Block carved into container networks.
    pub network: Ipv4Block,
    /// First host port.
    pub port_start: u16,
    /// Number of host ports.
    pub port_size: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            uid_start: 10_000,
            uid_size: 256,
            network: Ipv4Block {
                addr: std::net::Ipv4Addr::new(10, 254, 0, 0),
                prefix: 22,
            },
            port_start: PortPool::DEFAULT_START,
            port_size: PortPool::DEFAULT_SIZE,
        }
    }
}

/// The UID, network and port pools.
#[derive(Debug)]
pub struct Pools {
    /// User ids.
    pub uid: UidPool,
    /// Container networks.
    pub network: NetworkPool,
    /// Host ports.
    pub port: PortPool,
}

impl Pools {
    /// Open the pools, resuming persisted state under the snapshot
    /// directory when there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if a pool is misconfigured or its state is
    /// unreadable.
    pub fn open(config: &PoolConfig, paths: &CorralPaths) -> CorralResult<Self> {
        Ok(Self {
            uid: UidPool::open(config.uid_start, config.uid_size, paths.pool(UidPool::NAME))?,
            network: NetworkPool::open(config.network, paths.pool(NetworkPool::NAME))?,
            port: PortPool::open(config.port_start, config.port_size, paths.pool(PortPool::NAME))?,
        })
    }

    /// Lease a uid and a network for a new container.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PoolExhausted`]; anything leased before the
    /// failure is released again.
    pub fn acquire(&self) -> CorralResult<Resources> {
        let uid = self.uid.acquire()?;
        let network = match self.network.acquire() {
            Ok(network) => network,
            Err(e) => {
                if let Err(release) = self.uid.release(uid) {
                    warn!(uid, error = %release, "Failed to roll back uid lease");
                }
                return Err(e);
            }
        };
        Ok(Resources {
            uid,
            network,
            ports: Vec::new(),
        })
    }

    /// Release everything a container leased. Ports anchored to the
    /// network go first, then the network, then the uid. Failures are
    /// logged and the remaining leases are still released.
    pub fn release(&self, resources: &Resources) {
        for port in &resources.ports {
            if self.port.contains(*port) {
                if let Err(e) = self.port.release(*port) {
                    warn!(port, error = %e, "Failed to release port");
                }
            }
        }
        if let Err(e) = self.network.release(&resources.network) {
            warn!(network = %resources.network.cidr(), error = %e, "Failed to release network");
        }
        if let Err(e) = self.uid.release(resources.uid) {
            warn!(uid = resources.uid, error = %e, "Failed to release uid");
        }
    }

    /// Mark the leases of a restored container as taken.
    ///
    /// # Errors
    ///
    /// Returns an error if a lease lies outside its pool.
    pub fn reserve(&self, resources: &Resources) -> CorralResult<()> {
        self.uid.reserve(resources.uid)?;
        self.network.reserve(&resources.network)?;
        for port in &resources.ports {
            self.port.reserve(*port)?;
        }
        Ok(())
    }
}
