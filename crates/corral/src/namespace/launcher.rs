#![allow(unsafe_code)]
//! Two-phase container launch.
//!
//! The parent side unshares its mount namespace, runs the pre-clone hook
//! and clones a child into new namespaces. The child waits for the parent
//! to finish host-side setup, swaps its root filesystem and re-executes
//! the init binary in continuation mode. The continuation binds the
//! control socket, tells the parent it is up, and parks.
//!
//! ```text
//! parent                               child
//! ------                               -----
//! unshare(NEWNS)
//! hook-parent-before-clone
//! clone ------------------------------> wait parent-barrier
//! write <run>/pid                       .
//! hook-parent-after-clone               .
//! signal parent-barrier --------------> hook-child-before-pivot
//!                                       pivot_root
//!                                       hook-child-after-pivot
//!                                       exec init continue
//!                                       setsid, bind ctl.sock
//! wait child-barrier <----------------- signal child-barrier
//! exit 0                                park
//! ```

use std::convert::Infallible;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use corral_common::{CorralError, CorralResult};

use super::{Barrier, NamespaceConfig};
use crate::exec::{ControlDaemon, Hook};
use crate::filesystem::pivot_root;

/// Where the old root is mounted after the pivot, relative to the new root.
const OLD_ROOT: &str = "mnt";

/// Paths and names needed to launch one container.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Run directory for barriers, the pid file and the control socket.
    pub run: PathBuf,
    /// Root filesystem of the container.
    pub root: PathBuf,
    /// Directory holding the lifecycle hooks.
    pub lib: PathBuf,
    /// Init binary to execute, resolved inside the new root.
    pub init: PathBuf,
    /// Process title of the resident init.
    pub title: String,
}

impl LaunchConfig {
    /// Resolve every host path to an absolute, symlink-free path.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory is missing.
    pub fn canonicalize(mut self) -> CorralResult<Self> {
        std::fs::create_dir_all(&self.run)?;
        self.run = self.run.canonicalize()?;
        self.root = self.root.canonicalize()?;
        self.lib = self.lib.canonicalize()?;
        Ok(self)
    }

    fn parent_barrier(&self) -> PathBuf {
        self.run.join("parent-barrier")
    }

    fn child_barrier(&self) -> PathBuf {
        self.run.join("child-barrier")
    }
}

/// Translate a host path to where it is visible after the pivot.
#[must_use]
pub fn under_old_root(path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    Path::new("/").join(OLD_ROOT).join(relative)
}

/// Launch a container, returning the pid of its init once it is up.
///
/// # Errors
///
/// Returns an error if any hook fails, the clone fails, or the child dies
/// before signalling readiness. Namespaces already created are abandoned.
pub fn launch(config: LaunchConfig) -> CorralResult<i32> {
    let config = config.canonicalize()?;

    unshare_mount_namespace()?;
    Hook::ParentBeforeClone.run(&config.lib, &[])?;

    let parent_barrier = Barrier::new(config.parent_barrier())?;
    let child_barrier = Barrier::new(config.child_barrier())?;

    let pid = clone_container(NamespaceConfig::container())?;

    if pid == 0 {
        let err = match run_child(&config, &parent_barrier) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        tracing::error!(error = %err, "Container setup failed");
        eprintln!("corral-init: {err}");
        std::process::exit(1);
    }

    tracing::info!(pid, root = %config.root.display(), "Cloned container init");

    std::fs::write(config.run.join("pid"), pid.to_string())?;
    Hook::ParentAfterClone.run(&config.lib, &[("PID", pid.to_string())])?;

    parent_barrier.signal()?;
    child_barrier.wait_with(|| ensure_alive(pid))?;

    tracing::info!(pid, "Container is up");
    Ok(pid)
}

fn unshare_mount_namespace() -> CorralResult<()> {
    // Safety: the launcher is single-threaded at this point.
    unsafe {
        rustix::thread::unshare_unsafe(rustix::thread::UnshareFlags::NEWNS).map_err(|e| {
            CorralError::Launch {
                message: format!("failed to unshare mount namespace: {e}"),
            }
        })?;
    }
    tracing::debug!("Unshared mount namespace");
    Ok(())
}

fn clone_container(namespaces: NamespaceConfig) -> CorralResult<i32> {
    let flags = namespaces.to_clone_flags() | libc::SIGCHLD;

    // Safety: with a null stack clone behaves like fork. The child only
    // touches its own copy of the address space before exec.
    let null: libc::c_long = 0;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::c_long::from(flags),
            null,
            null,
            null,
            null,
        )
    };

    if ret < 0 {
        return Err(CorralError::Launch {
            message: format!(
                "failed to clone namespaces: {}",
                std::io::Error::last_os_error()
            ),
        });
    }

    i32::try_from(ret).map_err(|_| CorralError::Internal {
        message: format!("clone returned out-of-range pid {ret}"),
    })
}

fn ensure_alive(pid: i32) -> CorralResult<()> {
    let mut status = 0;
    // Safety: status points to a live c_int.
    let ret = unsafe { libc::waitpid(pid, &raw mut status, libc::WNOHANG) };
    if ret == pid {
        return Err(CorralError::Launch {
            message: format!("container init {pid} exited before it was up"),
        });
    }
    Ok(())
}

fn run_child(config: &LaunchConfig, parent_barrier: &Barrier) -> CorralResult<Infallible> {
    parent_barrier.wait()?;

    Hook::ChildBeforePivot.run(&config.lib, &[])?;

    std::env::set_current_dir(&config.root)?;
    std::fs::create_dir_all(OLD_ROOT)?;
    pivot_root(Path::new("."), Path::new(OLD_ROOT))?;
    std::env::set_current_dir("/")?;

    Hook::ChildAfterPivot.run(&under_old_root(&config.lib), &[])?;

    let err = Command::new(&config.init)
        .arg("continue")
        .arg("--run")
        .arg(under_old_root(&config.run))
        .arg("--title")
        .arg(&config.title)
        .env_clear()
        .exec();

    Err(CorralError::Launch {
        message: format!("failed to exec {}: {err}", config.init.display()),
    })
}

/// Become the resident init of a container whose namespaces are set up.
///
/// Binds the control socket before signalling the child barrier, so the
/// parent only reports success once commands can be executed. Never
/// returns on success.
///
/// # Errors
///
/// Returns an error if the session, socket or barrier cannot be set up.
pub fn continue_as_init(run: &Path, title: &str) -> CorralResult<Infallible> {
    rustix::process::setsid().map_err(|e| CorralError::Launch {
        message: format!("setsid failed: {e}"),
    })?;
    set_title(title);

    let daemon = ControlDaemon::bind(run.join("ctl.sock"))?;
    Barrier::open(run.join("child-barrier")).signal()?;

    detach_stdio()?;
    daemon.start()?;

    // All work happens on the control daemon's threads.
    loop {
        std::thread::park();
    }
}

fn set_title(title: &str) {
    let name: Vec<u8> = title.bytes().filter(|b| *b != 0).take(15).collect();
    let Ok(name) = std::ffi::CString::new(name) else {
        return;
    };
    // Safety: PR_SET_NAME reads a NUL-terminated string of at most 16 bytes.
    if unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr()) } != 0 {
        tracing::debug!(error = %std::io::Error::last_os_error(), "Failed to set process title");
    }
}

fn detach_stdio() -> CorralResult<()> {
    use std::os::fd::AsRawFd;

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        // Safety: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
            return Err(CorralError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_under_old_root() {
        assert_eq!(
            under_old_root(Path::new("/var/lib/corral/containers/abc/lib")),
            PathBuf::from("/mnt/var/lib/corral/containers/abc/lib")
        );
        assert_eq!(under_old_root(Path::new("run")), PathBuf::from("/mnt/run"));
    }

    #[test]
    fn canonicalize_creates_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rootfs")).unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();

        let config = LaunchConfig {
            run: dir.path().join("run"),
            root: dir.path().join("rootfs"),
            lib: dir.path().join("lib"),
            init: PathBuf::from("/sbin/corral-init"),
            title: "corral test".to_string(),
        }
        .canonicalize()
        .unwrap();

        assert!(config.run.is_absolute());
        assert!(config.run.is_dir());
        assert!(config.parent_barrier().ends_with("run/parent-barrier"));
    }

    #[test]
    fn canonicalize_requires_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let config = LaunchConfig {
            run: dir.path().join("run"),
            root: dir.path().join("missing"),
            lib: dir.path().to_path_buf(),
            init: PathBuf::from("/sbin/corral-init"),
            title: String::new(),
        };
        assert!(config.canonicalize().is_err());
    }

    #[test]
    fn dead_child_is_detected() {
        let child = Command::new("/bin/true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        let mut result = Ok(());
        for _ in 0..50 {
            result = ensure_alive(pid);
            if result.is_err() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(matches!(result, Err(CorralError::Launch { .. })));
    }
}
