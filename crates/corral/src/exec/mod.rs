//! Command execution inside containers.
//!
//! - [`hooks`]: lifecycle hook executables run during launch
//! - [`control`]: the daemon started by the resident container init
//! - [`client`]: the client used by the host to run commands through it

pub mod client;
pub mod control;
pub mod hooks;

pub use control::{ControlDaemon, ExecFrame, ExecRequest};
pub use hooks::Hook;
