//! Filesystem rendezvous between the two sides of a namespace clone.
//!
//! After `clone(2)` the parent and child share no memory, so each side
//! announces progress by creating a marker file the other side polls for.

use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_common::{CorralError, CorralResult};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A named rendezvous point backed by a marker file.
#[derive(Debug, Clone)]
pub struct Barrier {
    path: PathBuf,
}

impl Barrier {
    /// Create a barrier at `path`, clearing any mark left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or a
    /// stale mark cannot be removed.
    pub fn new(path: impl Into<PathBuf>) -> CorralResult<Self> {
        let path = path.into();
        let barrier_err = |source| CorralError::Barrier {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(barrier_err)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(barrier_err(e)),
        }

        Ok(Self { path })
    }

    /// Refer to a barrier created by another process, without clearing it.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the marker file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the barrier as reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker file cannot be created.
    pub fn signal(&self) -> CorralResult<()> {
        std::fs::File::create(&self.path)
            .and_then(|file| file.sync_all())
            .map_err(|source| CorralError::Barrier {
                path: self.path.clone(),
                source,
            })?;
        tracing::debug!(path = %self.path.display(), "Signalled barrier");
        Ok(())
    }

    /// Whether the barrier has been reached.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.path.exists()
    }

    /// Block until the barrier is reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be observed.
    pub fn wait(&self) -> CorralResult<()> {
        self.wait_with(|| Ok(()))
    }

    /// Block until the barrier is reached, running `check` between polls.
    ///
    /// An error from `check` abandons the wait, so the caller can stop
    /// waiting on a peer that died before signalling.
    ///
    /// # Errors
    ///
    /// Returns the first error from `check`, or an error if the marker
    /// cannot be observed.
    pub fn wait_with(&self, mut check: impl FnMut() -> CorralResult<()>) -> CorralResult<()> {
        loop {
            match self.path.try_exists() {
                Ok(true) => {
                    tracing::debug!(path = %self.path.display(), "Barrier reached");
                    return Ok(());
                }
                Ok(false) => {}
                Err(source) => {
                    return Err(CorralError::Barrier {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
            check()?;
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn signal_then_wait_returns() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Barrier::new(dir.path().join("run").join("parent-barrier")).unwrap();
        assert!(!barrier.is_signalled());

        barrier.signal().unwrap();
        assert!(barrier.is_signalled());
        barrier.wait().unwrap();
    }

    #[test]
    fn new_clears_stale_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("child-barrier");
        std::fs::write(&path, b"").unwrap();

        let barrier = Barrier::new(&path).unwrap();
        assert!(!barrier.is_signalled());
    }

    #[test]
    fn wait_blocks_until_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("child-barrier");
        let barrier = Barrier::new(&path).unwrap();
        let signalled = Arc::new(AtomicBool::new(false));

        let signaller = {
            let signalled = Arc::clone(&signalled);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                signalled.store(true, Ordering::SeqCst);
                Barrier::open(path).signal().unwrap();
            })
        };

        barrier.wait().unwrap();
        assert!(signalled.load(Ordering::SeqCst));
        signaller.join().unwrap();
    }

    #[test]
    fn wait_with_abandons_on_check_error() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Barrier::new(dir.path().join("child-barrier")).unwrap();
        let mut polls = 0;

        let err = barrier
            .wait_with(|| {
                polls += 1;
                if polls == 3 {
                    Err(CorralError::Launch {
                        message: "child exited".to_string(),
                    })
                } else {
                    Ok(())
                }
            })
            .unwrap_err();

        assert!(matches!(err, CorralError::Launch { .. }));
        assert_eq!(polls, 3);
    }
}
