//! Verify command implementation.

use crate::error::{CliError, CliResult};
use firemirror_storage::{FileReplica, ReplicaStore, StorageError};
use std::path::Path;

/// Outcome of verifying one replica.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// No replica on disk.
    Missing,
    /// Replica decoded with this many entries.
    Valid(usize),
    /// Replica failed validation.
    Corrupted(String),
}

/// Runs the verify command. Corruption is reported as an error so the
/// process exits nonzero.
pub fn run(dir: &Path, namespace: &str) -> CliResult<()> {
    let replica = FileReplica::open(dir, namespace)?;
    println!("Verifying replica at {}", replica.replica_path().display());
    println!();

    match verify(&replica)? {
        Verdict::Missing => {
            println!("Replica file not found (this is normal before the first sync)");
            Ok(())
        }
        Verdict::Valid(count) => {
            println!("  Entries: {count}");
            println!();
            println!("✓ Replica verification passed");
            Ok(())
        }
        Verdict::Corrupted(reason) => {
            println!("  Error: {reason}");
            println!();
            println!("✗ Replica verification failed");
            Err(CliError::Verification(reason))
        }
    }
}

/// Loads the replica and classifies the result.
pub fn verify(replica: &FileReplica) -> CliResult<Verdict> {
    if replica.staging_path().exists() {
        tracing::warn!(path = %replica.staging_path().display(), "stale staging file present");
    }
    match replica.try_load() {
        Ok(None) => Ok(Verdict::Missing),
        Ok(Some(entries)) => Ok(Verdict::Valid(entries.len())),
        Err(StorageError::Corrupted(reason)) => Ok(Verdict::Corrupted(reason)),
        Err(e) => Err(e.into()),
    }
}
