#![allow(unsafe_code)]
//! pivot_root implementation.

use std::path::Path;

use corral_common::{CorralError, CorralResult};

/// Execute pivot_root to change the root filesystem.
///
/// This replaces the old root with the new root, placing the old root
/// at put_old (relative to new_root). Unlike chroot the old root stays
/// reachable only through put_old.
///
/// # Errors
///
/// Returns an error if either path contains a NUL byte or the syscall
/// fails.
pub fn pivot_root(new_root: &Path, put_old: &Path) -> CorralResult<()> {
    tracing::debug!(
        new_root = %new_root.display(),
        put_old = %put_old.display(),
        "Executing pivot_root"
    );

    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let to_cstring = |path: &Path| {
            CString::new(path.as_os_str().as_bytes()).map_err(|e| CorralError::Internal {
                message: format!("invalid path: {e}"),
            })
        };
        let new_root_c = to_cstring(new_root)?;
        let put_old_c = to_cstring(put_old)?;

        // Safety: both pointers come from live CStrings.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pivot_root,
                new_root_c.as_ptr(),
                put_old_c.as_ptr(),
            )
        };

        if ret != 0 {
            return Err(CorralError::Io(std::io::Error::last_os_error()));
        }

        tracing::debug!("pivot_root successful");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(CorralError::Unsupported {
            feature: "pivot_root".to_string(),
        })
    }
}
