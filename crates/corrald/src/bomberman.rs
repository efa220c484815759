//! Idle-container reaper.
//!
//! Every container handle gets its own countdown. A countdown that runs
//! out without being reset fires the reap callback once. Live streams
//! pause the countdown; when the last one ends it starts over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Called with the handle of a container whose grace time ran out.
pub type Reaper = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
struct Fuse {
    grace: Duration,
    generation: u64,
    paused: usize,
    timer: Option<JoinHandle<()>>,
}

impl Fuse {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct Fuses {
    by_handle: HashMap<String, Fuse>,
    next_generation: u64,
    shut_down: bool,
}

/// Per-handle idle countdowns.
#[derive(Clone)]
pub struct Bomberman {
    fuses: Arc<Mutex<Fuses>>,
    reaper: Reaper,
}

impl std::fmt::Debug for Bomberman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bomberman")
            .field("fuses", &self.fuses)
            .finish_non_exhaustive()
    }
}

impl Bomberman {
    /// Create a bomberman calling `reaper` for idle containers.
    #[must_use]
    pub fn new(reaper: Reaper) -> Self {
        Self {
            fuses: Arc::new(Mutex::new(Fuses::default())),
            reaper,
        }
    }

    /// Start, or restart, the countdown of `handle`. `idle_for` is how long
    /// the container has already been idle and is taken off the first
    /// countdown. A zero grace time disables reaping.
    pub fn strap(&self, handle: &str, grace: Duration, idle_for: Duration) {
        let mut fuses = self.fuses.lock();
        if fuses.shut_down {
            return;
        }
        if let Some(mut old) = fuses.by_handle.remove(handle) {
            old.cancel();
        }
        if grace.is_zero() {
            debug!(handle, "Grace time is zero, never reaping");
            return;
        }

        fuses.by_handle.insert(
            handle.to_string(),
            Fuse {
                grace,
                generation: 0,
                paused: 0,
                timer: None,
            },
        );
        self.light(&mut fuses, handle, grace.saturating_sub(idle_for));
    }

    /// Restart the countdown of `handle` at its full grace time.
    pub fn reset(&self, handle: &str) {
        let mut fuses = self.fuses.lock();
        let Some(fuse) = fuses.by_handle.get_mut(handle) else {
            return;
        };
        if fuse.paused > 0 {
            return;
        }
        let grace = fuse.grace;
        self.light(&mut fuses, handle, grace);
    }

    /// Hold the countdown of `handle` while a stream is live.
    pub fn pause(&self, handle: &str) {
        if let Some(fuse) = self.fuses.lock().by_handle.get_mut(handle) {
            fuse.paused += 1;
            fuse.cancel();
        }
    }

    /// Release one hold on `handle`; the last release restarts the
    /// countdown at its full grace time.
    pub fn unpause(&self, handle: &str) {
        let mut fuses = self.fuses.lock();
        let Some(fuse) = fuses.by_handle.get_mut(handle) else {
            return;
        };
        fuse.paused = fuse.paused.saturating_sub(1);
        if fuse.paused == 0 {
            let grace = fuse.grace;
            self.light(&mut fuses, handle, grace);
        }
    }

    /// Cancel the countdown of `handle` for good.
    pub fn defuse(&self, handle: &str) {
        if let Some(mut fuse) = self.fuses.lock().by_handle.remove(handle) {
            fuse.cancel();
        }
    }

    /// Cancel every countdown without firing any, and ignore later straps.
    pub fn shutdown(&self) {
        let mut fuses = self.fuses.lock();
        fuses.shut_down = true;
        for (_, mut fuse) in fuses.by_handle.drain() {
            fuse.cancel();
        }
    }

    /// Whether `handle` has a countdown.
    #[cfg(test)]
    #[must_use]
    pub fn is_armed(&self, handle: &str) -> bool {
        self.fuses.lock().by_handle.contains_key(handle)
    }

    fn light(&self, fuses: &mut Fuses, handle: &str, delay: Duration) {
        fuses.next_generation += 1;
        let generation = fuses.next_generation;
        let Some(fuse) = fuses.by_handle.get_mut(handle) else {
            return;
        };
        fuse.cancel();
        fuse.generation = generation;

        let state = Arc::clone(&self.fuses);
        let reaper = Arc::clone(&self.reaper);
        let handle = handle.to_string();
        let grace = fuse.grace;
        fuse.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut fuses = state.lock();
                let current = fuses
                    .by_handle
                    .get(&handle)
                    .is_some_and(|fuse| fuse.generation == generation && fuse.paused == 0);
                if !current {
                    return;
                }
                fuses.by_handle.remove(&handle);
            }
            info!(%handle, grace = ?grace, "Reaping idle container");
            reaper(handle).await;
        }));
    }
}
