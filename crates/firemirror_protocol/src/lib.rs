//! # firemirror protocol
//!
//! Wire-level and value-level types shared by the firemirror crates.
//!
//! This crate provides:
//! - Chronologically sortable push ids ([`PushIdGenerator`])
//! - Mirror events ([`FirebaseEvent`]) with their source and type tags
//! - Server-push frame decoding into [`ChangeEvent`]s
//! - Path helpers for applying nested changes to JSON values
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod frame;
pub mod path;
mod push_id;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{Entry, EventSource, EventType, FirebaseEvent};
pub use frame::{ChangeEvent, ChangeKind, FrameDecoder, RawFrame};
pub use push_id::{
    decode_timestamp, generate_push_id, is_push_id, PushIdGenerator, PUSH_CHARS, PUSH_ID_LEN,
};
