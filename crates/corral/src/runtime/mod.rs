//! Container orchestration.
//!
//! The backend owns the resource pools and the container registry;
//! every container owns its job tracker and its snapshot file.

mod backend;
mod config;
mod container;
mod events;
mod pools;
mod snapshot;

pub use backend::{Backend, ContainerSpec, LinuxBackend};
pub use config::BackendConfig;
pub use container::{Container, ContainerInfo, OUT_OF_MEMORY, RunSpec, TOUCH_SAVE_INTERVAL};
pub use events::{EventBus, RuntimeEvent};
pub use pools::{PoolConfig, Pools, Resources, UidPool};
pub use snapshot::{
    ContainerSnapshot, ContainerState, DiskLimits, Limits, SNAPSHOT_VERSION, SnapshotStore,
};
