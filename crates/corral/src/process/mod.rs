//! Job supervision inside a container.
//!
//! Jobs are started by an external spawner and observed by an external
//! linker, both living in the container's `bin` directory:
//!
//! - `iomux-spawn <job-dir> <argv...>` registers the command in the job
//!   directory, prints one line once registered and a second once the
//!   command runs, and detaches it from the caller.
//! - `iomux-link -w <job-dir>/cursors <job-dir>` replays the command's
//!   output from a persisted cursor and exits with the command's status.
//!
//! Because the command outlives the linker, a restarted supervisor can
//! link again and continue where the previous linker stopped.

mod dispatch;
mod job;
mod tracker;

pub use dispatch::Dispatcher;
pub use job::{Process, SpawnSignals};
pub use tracker::{Attachment, ProcessTracker};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Exit status reported when the linker was killed by a signal.
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// An event on a job's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStream {
    /// A chunk of output.
    Output {
        /// Originating stream.
        source: StreamSource,
        /// Raw bytes.
        data: Bytes,
    },
    /// The job exited. Always the last event.
    Exit {
        /// Exit status.
        status: u32,
    },
}

/// Send `signal` to `pid`.
#[allow(unsafe_code)]
pub(crate) fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // Safety: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
