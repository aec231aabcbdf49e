//! In-memory replica store for testing.

use crate::error::{StorageError, StorageResult};
use crate::store::{Entries, ReplicaStore};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Shared {
    snapshot: RwLock<Option<Entries>>,
    locked: AtomicBool,
    failing_saves: AtomicU32,
    saves: AtomicU64,
}

/// An in-memory replica store.
///
/// Suitable for:
/// - Unit and integration tests
/// - Ephemeral mirrors that don't need persistence
///
/// Handles created with [`InMemoryReplica::reopen`] share one "artifact", so
/// a test can simulate a second process opening the same replica.
#[derive(Debug, Default)]
pub struct InMemoryReplica {
    shared: Arc<Shared>,
    holding: Mutex<bool>,
}

impl InMemoryReplica {
    /// Creates a new empty in-memory replica.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a replica whose artifact already holds `entries`.
    #[must_use]
    pub fn with_entries(entries: Entries) -> Self {
        let replica = Self::new();
        *replica.shared.snapshot.write() = Some(entries);
        replica
    }

    /// Returns a second handle onto the same artifact.
    #[must_use]
    pub fn reopen(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            holding: Mutex::new(false),
        }
    }

    /// Makes the next `count` saves fail with an I/O error.
    pub fn fail_next_saves(&self, count: u32) {
        self.shared.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves across all handles.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.shared.saves.load(Ordering::SeqCst)
    }

    /// Returns a copy of the persisted snapshot, if any.
    #[must_use]
    pub fn persisted(&self) -> Option<Entries> {
        self.shared.snapshot.read().clone()
    }
}

impl ReplicaStore for InMemoryReplica {
    fn try_load(&self) -> StorageResult<Option<Entries>> {
        Ok(self.shared.snapshot.read().clone())
    }

    fn save(&self, entries: &Entries) -> StorageResult<()> {
        let failing = self
            .shared
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected save failure",
            )));
        }

        *self.shared.snapshot.write() = Some(entries.clone());
        self.shared.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn acquire_exclusive(&self) -> StorageResult<()> {
        let mut holding = self.holding.lock();
        if *holding {
            return Ok(());
        }
        if self
            .shared
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StorageError::Locked);
        }
        *holding = true;
        Ok(())
    }

    fn release(&self) {
        let mut holding = self.holding.lock();
        if *holding {
            self.shared.locked.store(false, Ordering::SeqCst);
            *holding = false;
        }
    }

    fn is_acquired(&self) -> bool {
        *self.holding.lock()
    }

    fn wipe(&self) -> StorageResult<()> {
        *self.shared.snapshot.write() = None;
        Ok(())
    }
}

impl Drop for InMemoryReplica {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_empty() {
        let replica = InMemoryReplica::new();
        assert!(replica.try_load().unwrap().is_none());
        assert!(replica.load().is_empty());
    }

    #[test]
    fn reopen_sees_saved_snapshot() {
        let replica = InMemoryReplica::new();
        let mut entries = Entries::new();
        entries.insert("a".into(), json!(1));
        replica.save(&entries).unwrap();

        let other = replica.reopen();
        assert_eq!(other.load(), entries);
        assert_eq!(other.save_count(), 1);
    }

    #[test]
    fn injected_failures_leave_snapshot_untouched() {
        let replica = InMemoryReplica::with_entries(Entries::new());
        replica.fail_next_saves(1);

        let mut entries = Entries::new();
        entries.insert("a".into(), json!(1));
        assert!(replica.save(&entries).is_err());
        assert_eq!(replica.persisted(), Some(Entries::new()));

        replica.save(&entries).unwrap();
        assert_eq!(replica.persisted(), Some(entries));
    }

    #[test]
    fn exclusivity_is_shared_between_handles() {
        let replica = InMemoryReplica::new();
        let other = replica.reopen();

        replica.acquire_exclusive().unwrap();
        replica.acquire_exclusive().unwrap();
        assert!(matches!(other.acquire_exclusive(), Err(StorageError::Locked)));

        drop(replica);
        other.acquire_exclusive().unwrap();
        assert!(other.is_acquired());
    }

    #[test]
    fn wipe_clears_artifact() {
        let replica = InMemoryReplica::with_entries(Entries::new());
        replica.acquire_exclusive().unwrap();
        replica.wipe().unwrap();
        assert!(replica.persisted().is_none());
        assert!(replica.is_acquired());
    }
}
