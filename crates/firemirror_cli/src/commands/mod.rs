//! CLI command implementations.

pub mod inspect;
pub mod keygen;
pub mod verify;
pub mod wipe;
