//! # corral-common
//!
//! Shared utilities and types for the Corral container supervisor.
//!
//! This crate provides common functionality used across all Corral crates:
//! - Container id and handle generation
//! - Standard depot and snapshot paths
//! - Persisted lease pools
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod lease;
pub mod paths;

pub use error::{CorralError, CorralResult};
pub use id::{ContainerHandle, ContainerId};
pub use lease::LeasePool;
pub use paths::CorralPaths;
