//! # firemirror engine
//!
//! Offline-first mirroring of a remote key-value namespace.
//!
//! This crate provides:
//! - The reconciliation engine ([`MirrorEngine`])
//! - A reconnecting change-stream reader ([`StreamDecoder`])
//! - Event fan-out to subscribers ([`EventBus`])
//! - The remote collaborator boundary ([`Remote`]) and an in-memory remote
//!
//! ## Architecture
//!
//! Three sources feed one replica:
//! 1. The persisted local replica, loaded first
//! 2. A one-shot remote snapshot, merged by the [`PullStrategy`]
//! 3. The live change stream, if [`StreamingOptions`] asks for one
//!
//! Local writes, hydration and stream changes all pass through a single
//! commit path: mutate a draft, save it, then publish events. Readers only
//! ever see committed maps.
//!
//! ## Key Invariants
//!
//! - A change is saved before any subscriber hears about it
//! - Per-key event order follows commit order
//! - Forwarding failures never roll back a local commit
//! - Every retry loop is bounded

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod cancel;
mod config;
mod engine;
mod error;
mod forward;
mod memory;
mod reconcile;
mod remote;
mod state;
mod stream;

pub use bus::{Delivery, EventBus, StreamFailure, Subscription};
pub use cancel::CancelToken;
pub use config::{MirrorConfig, PullStrategy, RetryConfig, StreamingOptions};
pub use engine::MirrorEngine;
pub use error::{EngineError, EngineResult};
pub use forward::{ForwardOp, WriteHandle};
pub use memory::{MemoryRemote, RecordedWrite};
pub use reconcile::{apply_change, reconcile, snapshot_entries, Mutation, SnapshotPolicy};
pub use remote::{ByteStream, Remote, RemoteError, RemoteResult};
pub use state::{EngineState, HydrationReport, MirrorStats};
pub use stream::{StreamDecoder, StreamItem};
