//! Replica store trait definition.

use crate::error::StorageResult;
use serde_json::Value;
use std::collections::BTreeMap;

/// The replicated key/value mapping, ordered by key.
pub type Entries = BTreeMap<String, Value>;

/// Durable storage for one mirrored namespace.
///
/// Stores persist **whole snapshots**. They do not know about events, merge
/// policies or the remote side.
///
/// # Invariants
///
/// - After `save` returns `Ok`, a later `load` (from any instance) returns
///   exactly the saved mapping
/// - A crash during `save` leaves either the previous or the new snapshot,
///   never a mix of both
/// - `load` never fails; unreadable state is treated as empty
/// - `wipe` works whether or not the exclusivity handle is held
///
/// # Implementors
///
/// - [`super::InMemoryReplica`] - For testing
/// - [`super::FileReplica`] - For persistent storage
pub trait ReplicaStore: Send + Sync {
    /// Reads the persisted snapshot, failing on missing or damaged state.
    ///
    /// Returns `Ok(None)` when nothing has been saved yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact exists but cannot be read or validated.
    fn try_load(&self) -> StorageResult<Option<Entries>>;

    /// Reads the persisted snapshot, degrading to empty on any failure.
    fn load(&self) -> Entries {
        match self.try_load() {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "replica unreadable, starting empty");
                Entries::new()
            }
        }
    }

    /// Atomically replaces the persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be made durable. The
    /// previously saved snapshot is left in place.
    fn save(&self, entries: &Entries) -> StorageResult<()>;

    /// Takes the advisory exclusivity handle.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Locked`] if another owner holds it.
    fn acquire_exclusive(&self) -> StorageResult<()>;

    /// Gives the exclusivity handle back. Releasing twice is harmless.
    fn release(&self);

    /// Returns true while this instance holds the exclusivity handle.
    fn is_acquired(&self) -> bool;

    /// Removes the persisted artifact entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact exists but could not be removed.
    fn wipe(&self) -> StorageResult<()>;
}
