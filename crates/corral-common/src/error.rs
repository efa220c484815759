//! Common error types for Corral.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CorralError`].
pub type CorralResult<T> = Result<T, CorralError>;

/// Common errors across Corral.
#[derive(Error, Diagnostic, Debug)]
pub enum CorralError {
    /// Container not found.
    #[error("unknown handle: {handle}")]
    #[diagnostic(code(corral::container::not_found))]
    ContainerNotFound {
        /// The handle that was not found.
        handle: String,
    },

    /// A container with this handle already exists.
    #[error("handle already in use: {handle}")]
    #[diagnostic(code(corral::container::handle_in_use))]
    HandleInUse {
        /// The conflicting handle.
        handle: String,
    },

    /// Invalid container handle format.
    #[error("invalid handle: {handle}")]
    #[diagnostic(
        code(corral::container::invalid_handle),
        help("Handles must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidHandle {
        /// The invalid handle.
        handle: String,
    },

    /// Job not found in a container.
    #[error("unknown process: {id}")]
    #[diagnostic(code(corral::process::not_found))]
    ProcessNotFound {
        /// The job id that was not found.
        id: u32,
    },

    /// A resource pool has no free items left.
    #[error("{pool} pool is exhausted")]
    #[diagnostic(code(corral::pool::exhausted))]
    PoolExhausted {
        /// Name of the pool.
        pool: &'static str,
    },

    /// An item was released that is not currently leased.
    #[error("{item} is not leased from the {pool} pool")]
    #[diagnostic(code(corral::pool::not_leased))]
    NotLeased {
        /// Name of the pool.
        pool: &'static str,
        /// The offending item.
        item: String,
    },

    /// A lifecycle hook exited nonzero.
    #[error("hook {hook} failed with exit status {code}")]
    #[diagnostic(code(corral::hook))]
    Hook {
        /// Hook name.
        hook: String,
        /// Exit status (-1 when killed by a signal).
        code: i32,
    },

    /// Container launch failed.
    #[error("launch failed: {message}")]
    #[diagnostic(code(corral::launch))]
    Launch {
        /// The error message.
        message: String,
    },

    /// A rendezvous barrier could not be created or observed.
    #[error("barrier {path} failed: {source}")]
    #[diagnostic(code(corral::barrier))]
    Barrier {
        /// Barrier path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(corral::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(corral::serialization))]
    Serialization(String),

    /// A snapshot could not be read or written.
    #[error("snapshot {path}: {message}")]
    #[diagnostic(code(corral::snapshot))]
    Snapshot {
        /// Snapshot file.
        path: PathBuf,
        /// The error message.
        message: String,
    },

    /// Permission denied.
    #[error("permission denied: {operation}")]
    #[diagnostic(
        code(corral::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Feature not supported on this platform.
    #[error("feature not supported: {feature}")]
    #[diagnostic(code(corral::unsupported), help("Corral requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    #[diagnostic(code(corral::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("internal error: {message}")]
    #[diagnostic(code(corral::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for CorralError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CorralError::ContainerNotFound {
            handle: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "unknown handle: abc123");

        let err = CorralError::PoolExhausted { pool: "uid" };
        assert_eq!(err.to_string(), "uid pool is exhausted");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CorralError = io_err.into();
        assert!(matches!(err, CorralError::Io(_)));
    }
}
