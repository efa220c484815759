//! Bounded lease pools with persisted allocation state.
//!
//! A [`LeasePool`] hands out slot indices `0..size`. Concrete pools (UIDs,
//! network blocks, ports) map indices onto their own item type.
//!
//! Allocation prefers never-issued slots (tracked by a high-water mark)
//! over recycled ones, and recycled slots are reused oldest-first. Together
//! with persisting the state on every mutation this means a slot in use
//! before a restart is never handed out again unless its release was
//! recorded first.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CorralError, CorralResult};
use crate::paths::write_atomic;

/// Durable allocation state of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    /// First slot that has never been issued.
    pub next_fresh: u32,
    /// Released slots in release order.
    pub recycled: VecDeque<u32>,
    /// Slots currently leased.
    pub leased: BTreeSet<u32>,
}

/// A bounded pool of slot indices.
#[derive(Debug)]
pub struct LeasePool {
    name: &'static str,
    size: u32,
    store: Option<PathBuf>,
    state: Mutex<PoolState>,
}

impl LeasePool {
    /// Create an in-memory pool with `size` slots.
    #[must_use]
    pub fn new(name: &'static str, size: u32) -> Self {
        Self {
            name,
            size,
            store: None,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Open a pool persisted at `store`, loading its previous state if the
    /// file exists.
    ///
    /// Recycled slots outside the current size are dropped so a shrunk
    /// pool never issues them; leased slots are kept so they are released
    /// cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file exists but cannot be parsed.
    pub fn open(name: &'static str, size: u32, store: Option<PathBuf>) -> CorralResult<Self> {
        let mut state = match &store {
            Some(path) if path.exists() => Self::load(path)?,
            _ => PoolState::default(),
        };
        state.recycled.retain(|slot| *slot < size);

        debug!(
            pool = name,
            size,
            next_fresh = state.next_fresh,
            leased = state.leased.len(),
            "Opened lease pool"
        );

        Ok(Self {
            name,
            size,
            store,
            state: Mutex::new(state),
        })
    }

    fn load(path: &Path) -> CorralResult<PoolState> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| CorralError::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Pool name used in errors and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Number of slots in the pool.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Number of slots currently leased.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.state.lock().leased.len()
    }

    /// Snapshot of the allocation state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.state.lock().clone()
    }

    /// Lease an unused slot.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PoolExhausted`] if every slot is leased, or an
    /// I/O error if the new state cannot be persisted (the lease is then
    /// rolled back).
    pub fn acquire(&self) -> CorralResult<u32> {
        let mut state = self.state.lock();
        let before = state.clone();

        let slot = loop {
            if state.next_fresh < self.size {
                let slot = state.next_fresh;
                state.next_fresh += 1;
                if !state.leased.contains(&slot) {
                    break slot;
                }
            } else if let Some(slot) = state.recycled.pop_front() {
                if !state.leased.contains(&slot) {
                    break slot;
                }
            } else {
                return Err(CorralError::PoolExhausted { pool: self.name });
            }
        };
        state.leased.insert(slot);

        if let Err(e) = self.persist(&state) {
            *state = before;
            return Err(e);
        }

        debug!(pool = self.name, slot, "Leased slot");
        Ok(slot)
    }

    /// Return a leased slot to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotLeased`] if the slot is not currently
    /// leased, or an I/O error if the new state cannot be persisted.
    pub fn release(&self, slot: u32) -> CorralResult<()> {
        let mut state = self.state.lock();
        if !state.leased.remove(&slot) {
            return Err(CorralError::NotLeased {
                pool: self.name,
                item: slot.to_string(),
            });
        }
        if slot < self.size {
            state.recycled.push_back(slot);
        }

        if let Err(e) = self.persist(&state) {
            state.recycled.retain(|s| *s != slot);
            state.leased.insert(slot);
            return Err(e);
        }

        debug!(pool = self.name, slot, "Released slot");
        Ok(())
    }

    /// Mark a slot as leased without allocating it, used when restoring
    /// containers from snapshots. Reserving a leased slot is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the new state cannot be persisted.
    pub fn reserve(&self, slot: u32) -> CorralResult<()> {
        let mut state = self.state.lock();
        if !state.leased.insert(slot) {
            return Ok(());
        }
        state.recycled.retain(|s| *s != slot);
        if slot >= self.size {
            warn!(pool = self.name, slot, "Reserved slot outside pool range");
        }
        self.persist(&state)
    }

    fn persist(&self, state: &PoolState) -> CorralResult<()> {
        let Some(path) = &self.store else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(state)?;
        write_atomic(path, &data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn acquire_until_exhausted() {
        let pool = LeasePool::new("test", 3);
        let mut slots = vec![
            pool.acquire().unwrap(),
            pool.acquire().unwrap(),
            pool.acquire().unwrap(),
        ];
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2]);

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, CorralError::PoolExhausted { pool: "test" }));
    }

    #[test]
    fn release_requires_lease() {
        let pool = LeasePool::new("test", 3);
        assert!(matches!(
            pool.release(1),
            Err(CorralError::NotLeased { .. })
        ));

        let slot = pool.acquire().unwrap();
        pool.release(slot).unwrap();
        assert!(pool.release(slot).is_err());
    }

    #[test]
    fn fresh_slots_before_recycled() {
        let pool = LeasePool::new("test", 3);
        let first = pool.acquire().unwrap();
        pool.release(first).unwrap();

        assert_eq!(pool.acquire().unwrap(), 1);
        assert_eq!(pool.acquire().unwrap(), 2);
        assert_eq!(pool.acquire().unwrap(), first);
    }

    #[test]
    fn recycled_in_release_order() {
        let pool = LeasePool::new("test", 3);
        for _ in 0..3 {
            pool.acquire().unwrap();
        }
        pool.release(2).unwrap();
        pool.release(0).unwrap();

        assert_eq!(pool.acquire().unwrap(), 2);
        assert_eq!(pool.acquire().unwrap(), 0);
    }

    #[test]
    fn reserve_skips_slot() {
        let pool = LeasePool::new("test", 3);
        pool.reserve(0).unwrap();
        pool.reserve(0).unwrap();

        assert_eq!(pool.acquire().unwrap(), 1);
        assert_eq!(pool.acquire().unwrap(), 2);
        assert!(pool.acquire().is_err());
        assert_eq!(pool.leased(), 3);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("pools").join("test.json");

        let pool = LeasePool::open("test", 4, Some(store.clone())).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a).unwrap();
        drop(pool);

        let pool = LeasePool::open("test", 4, Some(store)).unwrap();
        let c = pool.acquire().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
        assert!(pool.release(b).is_ok());
    }

    #[test]
    fn unreleased_slots_never_reissued_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("test.json");

        let pool = LeasePool::open("test", 2, Some(store.clone())).unwrap();
        let held = pool.acquire().unwrap();
        drop(pool);

        let pool = LeasePool::open("test", 2, Some(store)).unwrap();
        let other = pool.acquire().unwrap();
        assert_ne!(other, held);
        assert!(pool.acquire().is_err());
    }

    proptest! {
        #[test]
        fn leased_slots_are_distinct(size in 1u32..64, ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let pool = LeasePool::new("prop", size);
            let mut held: Vec<u32> = Vec::new();

            for acquire in ops {
                if acquire || held.is_empty() {
                    match pool.acquire() {
                        Ok(slot) => {
                            prop_assert!(slot < size);
                            prop_assert!(!held.contains(&slot));
                            held.push(slot);
                        }
                        Err(_) => prop_assert_eq!(held.len(), size as usize),
                    }
                } else {
                    let slot = held.remove(0);
                    pool.release(slot).unwrap();
                }
            }

            prop_assert_eq!(pool.leased(), held.len());
        }
    }
}
