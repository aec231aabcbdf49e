//! Wipe command implementation.

use crate::error::CliResult;
use firemirror_storage::{FileReplica, ReplicaStore};
use std::path::Path;

/// Runs the wipe command.
///
/// Without `force` the replica lock is taken first, so a replica owned by a
/// running engine is left alone.
pub fn run(dir: &Path, namespace: &str, force: bool) -> CliResult<()> {
    let replica = FileReplica::open(dir, namespace)?;
    if !replica.exists() {
        println!("Nothing to wipe at {}", replica.replica_path().display());
        return Ok(());
    }

    if !force {
        replica.acquire_exclusive()?;
    }
    let size = replica.size()?;
    replica.wipe()?;
    replica.release();

    println!("Wiped {} ({size} bytes)", replica.replica_path().display());
    Ok(())
}
