//! # Corral
//!
//! Container launcher, job tracker and backend for the Corral supervisor.
//!
//! ## Layout
//!
//! - **namespace**: the two-phase launch that turns a process into a
//!   container init behind fresh mount, UTS, IPC, PID and network
//!   namespaces
//! - **exec**: lifecycle hooks and the control socket served by the init
//! - **process**: jobs started by an external spawner and observed by an
//!   external linker, with output fanned out to any number of subscribers
//! - **runtime**: resource pools, snapshots and the [`runtime::Backend`]
//!   the daemon drives
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use corral::runtime::{Backend, BackendConfig, ContainerSpec, LinuxBackend, RunSpec};
//! use corral_network::IptablesController;
//!
//! # async fn example() -> corral_common::CorralResult<()> {
//! let backend = LinuxBackend::new(BackendConfig::default(), Arc::new(IptablesController::new()))?;
//! backend.start().await?;
//!
//! let container = backend.create(ContainerSpec::default()).await?;
//! let (job_id, mut output) = container
//!     .run(&RunSpec {
//!         script: "echo hello".to_string(),
//!         ..RunSpec::default()
//!     })
//!     .await?;
//! while let Some(event) = output.recv().await {
//!     println!("{job_id}: {event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod namespace;
pub mod process;
pub mod runtime;

#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod test_support;

pub use runtime::{Backend, Container, LinuxBackend};
