//! Container handle and id generation and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CorralError, CorralResult};

/// A validated, client-visible container handle.
///
/// Handles must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
///
/// Handles double as directory and file names in the depot and snapshot
/// directories, which is why path separators are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    /// Maximum length of a handle.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new handle, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle format is invalid.
    pub fn new(handle: impl Into<String>) -> CorralResult<Self> {
        let handle = handle.into();
        Self::validate(&handle)?;
        Ok(Self(handle))
    }

    /// Derive a handle for a container created without one.
    #[must_use]
    pub fn from_id(id: &ContainerId) -> Self {
        Self(id.as_str().to_string())
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(handle: &str) -> CorralResult<()> {
        let invalid = || CorralError::InvalidHandle {
            handle: handle.to_string(),
        };

        if handle.is_empty() || handle.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !handle.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if handle
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerHandle {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Internal container id, used to name the container directory and its
/// host-side resources (cgroup, interfaces).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Generate a new random container id.
    ///
    /// The id is an 11-character hex string derived from a UUID v4, short
    /// enough that `c-<id>-0` still fits in an interface name.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let mut hex = hex::encode(&uuid.as_bytes()[..6]);
        hex.truncate(11);
        Self(hex)
    }

    /// Wrap an id read back from a snapshot.
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_handles() {
        assert!(ContainerHandle::new("abc123").is_ok());
        assert!(ContainerHandle::new("my-container").is_ok());
        assert!(ContainerHandle::new("my_container.v2").is_ok());
        assert!(ContainerHandle::new("a").is_ok());
    }

    #[test]
    fn invalid_handles() {
        assert!(ContainerHandle::new("").is_err());
        assert!(ContainerHandle::new("-starts-with-hyphen").is_err());
        assert!(ContainerHandle::new("has/slash").is_err());
        assert!(ContainerHandle::new("..").is_err());
        assert!(ContainerHandle::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generate_id() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), 11);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, ContainerId::generate());
    }

    #[test]
    fn handle_from_id() {
        let id = ContainerId::generate();
        let handle = ContainerHandle::from_id(&id);
        assert_eq!(handle.as_str(), id.as_str());
        assert!(ContainerHandle::new(handle.as_str()).is_ok());
    }

    #[test]
    fn handle_serde_is_transparent() {
        let handle = ContainerHandle::new("web-1").unwrap();
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"web-1\"");
    }
}
