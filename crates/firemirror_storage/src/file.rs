//! File-based replica store.
//!
//! Layout for a namespace `dinos` under `<dir>`:
//!
//! ```text
//! <dir>/
//! ├─ dinos.replica       # Last committed snapshot
//! ├─ dinos.replica.tmp   # Staging file for atomic replacement
//! └─ dinos.lock          # Advisory lock for single-writer
//! ```

use crate::error::{StorageError, StorageResult};
use crate::format;
use crate::store::{Entries, ReplicaStore};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const REPLICA_EXT: &str = "replica";
const STAGING_EXT: &str = "replica.tmp";
const LOCK_EXT: &str = "lock";

/// A replica persisted to a single file with crash-safe replacement.
///
/// # Durability
///
/// `save` writes the new snapshot to a staging file, syncs it, renames it
/// over the replica file and syncs the directory, so a crash leaves either
/// the old or the new snapshot on disk.
///
/// # Exclusivity
///
/// `acquire_exclusive` takes a non-blocking lock on a sibling lock file.
/// The lock is advisory: it keeps two engines from writing the same artifact
/// but gives no cross-machine guarantees.
///
/// # Example
///
/// ```no_run
/// use firemirror_storage::{FileReplica, ReplicaStore};
/// use std::path::Path;
///
/// let replica = FileReplica::open(Path::new("mirror-data"), "dinos").unwrap();
/// replica.acquire_exclusive().unwrap();
/// let entries = replica.load();
/// replica.save(&entries).unwrap();
/// replica.release();
/// ```
#[derive(Debug)]
pub struct FileReplica {
    dir: PathBuf,
    stem: String,
    lock: Mutex<Option<File>>,
}

impl FileReplica {
    /// Opens the replica for `namespace` under `dir`, creating `dir` if needed.
    ///
    /// Nothing is read or locked yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path, namespace: &str) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            stem: sanitize(namespace),
            lock: Mutex::new(None),
        })
    }

    /// Returns the path of the replica file.
    #[must_use]
    pub fn replica_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{REPLICA_EXT}", self.stem))
    }

    /// Returns the path of the staging file used by `save`.
    #[must_use]
    pub fn staging_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{STAGING_EXT}", self.stem))
    }

    /// Returns the path of the lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{LOCK_EXT}", self.stem))
    }

    /// Returns true if a replica file exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.replica_path().exists()
    }

    /// Size of the replica file in bytes, or 0 if absent.
    pub fn size(&self) -> StorageResult<u64> {
        match fs::metadata(self.replica_path()) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journaling covers rename durability
        Ok(())
    }
}

impl ReplicaStore for FileReplica {
    fn try_load(&self) -> StorageResult<Option<Entries>> {
        let mut file = match File::open(self.replica_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        format::decode(&data).map(Some)
    }

    fn save(&self, entries: &Entries) -> StorageResult<()> {
        let data = format::encode(entries)?;
        let staging = self.staging_path();

        let mut file = File::create(&staging)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&staging, self.replica_path())?;
        self.sync_directory()?;

        tracing::trace!(path = %self.replica_path().display(), entries = entries.len(), "replica saved");
        Ok(())
    }

    fn acquire_exclusive(&self) -> StorageResult<()> {
        let mut held = self.lock.lock();
        if held.is_some() {
            return Ok(());
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        *held = Some(lock_file);
        Ok(())
    }

    fn release(&self) {
        if let Some(lock_file) = self.lock.lock().take() {
            if let Err(e) = FileExt::unlock(&lock_file) {
                tracing::warn!(error = %e, "failed to unlock replica");
            }
        }
    }

    fn is_acquired(&self) -> bool {
        self.lock.lock().is_some()
    }

    fn wipe(&self) -> StorageResult<()> {
        for path in [self.replica_path(), self.staging_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        // The lock file stays: another instance may hold a lock on it.
        self.sync_directory()?;
        tracing::info!(path = %self.replica_path().display(), "replica wiped");
        Ok(())
    }
}

impl Drop for FileReplica {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maps a namespace path onto a file-name stem.
///
/// Leading and trailing slashes are ignored. Every other byte outside
/// `[A-Za-z0-9-]` is written as `_xx` (lowercase hex), so distinct
/// namespaces never share a stem.
fn sanitize(namespace: &str) -> String {
    let trimmed = namespace.trim_matches('/');
    if trimmed.is_empty() {
        return "_root".to_string();
    }
    let mut stem = String::with_capacity(trimmed.len());
    for byte in trimmed.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => stem.push(char::from(byte)),
            _ => stem.push_str(&format!("_{byte:02x}")),
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn entries(pairs: &[(&str, serde_json::Value)]) -> Entries {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        assert!(replica.try_load().unwrap().is_none());
        assert!(replica.load().is_empty());
        assert!(!replica.exists());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let data = entries(&[("dino1", json!({"height": 1})), ("dino2", json!(2))]);

        {
            let replica = FileReplica::open(dir.path(), "dinos").unwrap();
            replica.save(&data).unwrap();
            assert!(!replica.staging_path().exists());
        }

        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        assert_eq!(replica.load(), data);
        assert!(replica.size().unwrap() > 0);
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        replica.save(&entries(&[("a", json!(1))])).unwrap();
        replica.save(&entries(&[("b", json!(2))])).unwrap();
        assert_eq!(replica.load(), entries(&[("b", json!(2))]));
    }

    #[test]
    fn stale_staging_file_is_ignored() {
        let dir = tempdir().unwrap();
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        let data = entries(&[("a", json!(1))]);
        replica.save(&data).unwrap();

        // Simulate a crash between writing the staging file and renaming it.
        fs::write(replica.staging_path(), b"half-written").unwrap();
        assert_eq!(replica.load(), data);
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        fs::write(replica.replica_path(), b"FMRP garbage").unwrap();

        assert!(matches!(replica.try_load(), Err(StorageError::Corrupted(_))));
        assert!(replica.load().is_empty());
    }

    #[test]
    fn lock_prevents_second_owner() {
        let dir = tempdir().unwrap();
        let first = FileReplica::open(dir.path(), "dinos").unwrap();
        let second = FileReplica::open(dir.path(), "dinos").unwrap();

        first.acquire_exclusive().unwrap();
        assert!(first.is_acquired());
        assert!(matches!(
            second.acquire_exclusive(),
            Err(StorageError::Locked)
        ));

        first.release();
        assert!(!first.is_acquired());
        second.acquire_exclusive().unwrap();
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let replica = FileReplica::open(dir.path(), "dinos").unwrap();
            replica.acquire_exclusive().unwrap();
        }
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        replica.acquire_exclusive().unwrap();
    }

    #[test]
    fn wipe_while_held_and_after_release() {
        let dir = tempdir().unwrap();
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        replica.acquire_exclusive().unwrap();
        replica.save(&entries(&[("a", json!(1))])).unwrap();

        replica.wipe().unwrap();
        assert!(!replica.exists());
        assert!(replica.load().is_empty());

        replica.save(&entries(&[("b", json!(1))])).unwrap();
        replica.release();
        replica.wipe().unwrap();
        assert!(!replica.exists());

        // Wiping nothing is fine.
        replica.wipe().unwrap();
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempdir().unwrap();
        let dinos = FileReplica::open(dir.path(), "dinos").unwrap();
        let birds = FileReplica::open(dir.path(), "zoo/birds").unwrap();
        dinos.save(&entries(&[("a", json!(1))])).unwrap();

        assert!(birds.load().is_empty());
        assert_eq!(birds.replica_path(), dir.path().join("zoo_2fbirds.replica"));
    }

    #[test]
    fn similar_namespaces_do_not_collide() {
        let dir = tempdir().unwrap();
        let slashed = FileReplica::open(dir.path(), "zoo/birds").unwrap();
        let underscored = FileReplica::open(dir.path(), "zoo_birds").unwrap();
        let dotted = FileReplica::open(dir.path(), "zoo.birds").unwrap();

        slashed.acquire_exclusive().unwrap();
        slashed.save(&entries(&[("k", json!(1))])).unwrap();

        underscored.acquire_exclusive().unwrap();
        dotted.acquire_exclusive().unwrap();
        assert!(underscored.load().is_empty());
        assert!(dotted.load().is_empty());
        assert_ne!(slashed.replica_path(), underscored.replica_path());
        assert_ne!(underscored.replica_path(), dotted.replica_path());
    }

    #[test]
    fn wipe_by_another_instance_keeps_the_lock() {
        let dir = tempdir().unwrap();
        let owner = FileReplica::open(dir.path(), "dinos").unwrap();
        owner.acquire_exclusive().unwrap();
        owner.save(&entries(&[("a", json!(1))])).unwrap();

        let wiper = FileReplica::open(dir.path(), "dinos").unwrap();
        wiper.wipe().unwrap();
        assert!(!owner.exists());
        assert!(owner.lock_path().exists());

        let third = FileReplica::open(dir.path(), "dinos").unwrap();
        assert!(owner.is_acquired());
        assert!(matches!(third.acquire_exclusive(), Err(StorageError::Locked)));

        owner.release();
        third.acquire_exclusive().unwrap();
    }

    #[test]
    fn sanitize_namespaces() {
        assert_eq!(sanitize("/dinos/"), "dinos");
        assert_eq!(sanitize(""), "_root");
        assert_ne!(sanitize("root"), sanitize(""));
        assert_eq!(sanitize("a b.c"), "a_20b_2ec");
        assert_eq!(sanitize("a_b"), "a_5fb");
        assert_eq!(sanitize("dino-1"), "dino-1");
    }
}
