//! # corral-network
//!
//! Networking for Corral containers.
//!
//! This crate provides the network and port lease pools and the host-side
//! rules (port forwarding, egress policy, bandwidth shaping) applied on
//! behalf of a container.

#![warn(missing_docs)]

pub mod controller;
pub mod network;
pub mod policy;
pub mod pool;
pub mod portmap;
pub mod shaping;

pub use controller::{DisabledController, IptablesController, NetworkController};
pub use network::{Ipv4Block, Network};
pub use policy::NetOut;
pub use pool::{NetworkPool, PortPool};
pub use portmap::NetIn;
pub use shaping::BandwidthLimit;
