//! Container lifecycle hooks.
//!
//! Hooks are executables in the container's `lib` directory. Exit code 0
//! lets creation proceed; anything else aborts it, as does a hook that
//! does not exist.

use std::fmt;
use std::path::Path;
use std::process::Command;

use corral_common::{CorralError, CorralResult};

/// Status reported for a hook that does not exist, as a shell would.
pub const MISSING_HOOK_STATUS: i32 = 127;

/// Points in the launch sequence where a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Host side, after unsharing the mount namespace.
    ParentBeforeClone,
    /// Container side, before the root filesystem swap.
    ChildBeforePivot,
    /// Container side, after the root filesystem swap.
    ChildAfterPivot,
    /// Host side, once the child pid is known.
    ParentAfterClone,
}

impl Hook {
    /// File name of the hook executable.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::ParentBeforeClone => "hook-parent-before-clone",
            Self::ChildBeforePivot => "hook-child-before-pivot",
            Self::ChildAfterPivot => "hook-child-after-pivot",
            Self::ParentAfterClone => "hook-parent-after-clone",
        }
    }

    /// Run the hook found in `lib`, with extra environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Hook`] if the hook is missing or exits
    /// nonzero, or an I/O error if it cannot be started.
    pub fn run(self, lib: &Path, envs: &[(&str, String)]) -> CorralResult<()> {
        let path = lib.join(self.file_name());
        if !path.exists() {
            tracing::warn!(hook = %self, path = %path.display(), "Hook not present");
            return Err(CorralError::Hook {
                hook: self.file_name().to_string(),
                code: MISSING_HOOK_STATUS,
            });
        }

        tracing::debug!(hook = %self, path = %path.display(), "Running hook");
        let status = Command::new(&path)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .status()?;

        if !status.success() {
            return Err(CorralError::Hook {
                hook: self.file_name().to_string(),
                code: status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_hook(dir: &Path, hook: Hook, body: &str) {
        let path = dir.join(hook.file_name());
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn missing_hook_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let err = Hook::ParentBeforeClone.run(dir.path(), &[]).unwrap_err();
        assert!(matches!(
            err,
            CorralError::Hook { ref hook, code: MISSING_HOOK_STATUS } if hook == "hook-parent-before-clone"
        ));
    }

    #[test]
    fn hook_sees_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pid");
        write_hook(
            dir.path(),
            Hook::ParentAfterClone,
            &format!("echo \"$PID\" > {}", out.display()),
        );

        Hook::ParentAfterClone
            .run(dir.path(), &[("PID", "4242".to_string())])
            .unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "4242");
    }

    #[test]
    fn nonzero_exit_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), Hook::ChildBeforePivot, "exit 3");

        let err = Hook::ChildBeforePivot.run(dir.path(), &[]).unwrap_err();
        assert!(matches!(err, CorralError::Hook { code: 3, .. }));
        assert_eq!(
            err.to_string(),
            "hook hook-child-before-pivot failed with exit status 3"
        );
    }
}
