//! # firemirror storage
//!
//! Durable key/value replica storage for the firemirror engine.
//!
//! A replica store keeps the last fully committed merge result of a mirrored
//! namespace. The engine owns all merge semantics; stores only load, save,
//! lock and wipe whole snapshots.
//!
//! ## Design Principles
//!
//! - `save` replaces the persisted snapshot atomically (write-new-then-swap)
//! - `load` never fails the caller: missing or corrupt state reads as empty
//! - Exclusivity is advisory: one engine instance writes a replica at a time
//! - Stores must be `Send + Sync` for concurrent access
//!
//! ## Available Stores
//!
//! - [`InMemoryReplica`] - For testing and ephemeral mirrors
//! - [`FileReplica`] - Crash-safe file artifact with a lock file
//!
//! ## Example
//!
//! ```rust
//! use firemirror_storage::{Entries, InMemoryReplica, ReplicaStore};
//! use serde_json::json;
//!
//! let store = InMemoryReplica::new();
//! let mut entries = Entries::new();
//! entries.insert("dino1".to_string(), json!({"height": 1}));
//! store.save(&entries).unwrap();
//! assert_eq!(store.load(), entries);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
pub mod format;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileReplica;
pub use memory::InMemoryReplica;
pub use store::{Entries, ReplicaStore};
