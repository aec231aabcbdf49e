//! Inspect command implementation.

use crate::error::{CliError, CliResult};
use firemirror_protocol::{decode_timestamp, is_push_id};
use firemirror_storage::{FileReplica, ReplicaStore};
use serde::Serialize;
use std::path::Path;

/// Replica inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Replica file path.
    pub path: String,
    /// Replica file size in bytes.
    pub size: u64,
    /// Number of entries.
    pub entry_count: usize,
    /// Number of keys shaped like push ids.
    pub push_id_count: usize,
    /// Creation time (ms since epoch) of the oldest push id key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_push_ms: Option<u64>,
    /// Creation time (ms since epoch) of the newest push id key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_push_ms: Option<u64>,
    /// A leftover staging file exists.
    pub staging_present: bool,
    /// Every key, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// Runs the inspect command.
pub fn run(dir: &Path, namespace: &str, format: &str, show_keys: bool) -> CliResult<()> {
    let result = inspect(dir, namespace, show_keys)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        "text" => print_text_output(&result),
        other => return Err(CliError::UnknownFormat(other.to_string())),
    }
    Ok(())
}

/// Collects statistics for the replica of `namespace` under `dir`.
pub fn inspect(dir: &Path, namespace: &str, show_keys: bool) -> CliResult<InspectResult> {
    let replica = FileReplica::open(dir, namespace)?;
    let path = replica.replica_path().display().to_string();
    if !replica.exists() {
        return Err(CliError::NotFound(path));
    }

    let entries = replica.try_load()?.unwrap_or_default();
    let stamps: Vec<u64> = entries
        .keys()
        .filter(|key| is_push_id(key))
        .filter_map(|key| decode_timestamp(key))
        .collect();

    Ok(InspectResult {
        path,
        size: replica.size()?,
        entry_count: entries.len(),
        push_id_count: stamps.len(),
        oldest_push_ms: stamps.iter().copied().min(),
        newest_push_ms: stamps.iter().copied().max(),
        staging_present: replica.staging_path().exists(),
        keys: show_keys.then(|| entries.keys().cloned().collect()),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("firemirror Replica Inspection");
    println!("=============================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {}", format_size(result.size));
    if result.staging_present {
        println!("Note: stale staging file present");
    }
    println!();
    println!("Entries:");
    println!("  Total:     {}", result.entry_count);
    println!("  Push ids:  {}", result.push_id_count);
    if let (Some(oldest), Some(newest)) = (result.oldest_push_ms, result.newest_push_ms) {
        println!("  Oldest:    {oldest} ms");
        println!("  Newest:    {newest} ms");
    }

    if let Some(keys) = &result.keys {
        println!();
        println!("Keys:");
        for key in keys {
            println!("  {key}");
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firemirror_protocol::PushIdGenerator;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn missing_replica_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(inspect(dir.path(), "dinos", false), Err(CliError::NotFound(_))));
    }

    #[test]
    fn counts_entries_and_push_ids() {
        let dir = tempdir().unwrap();
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        let ids = PushIdGenerator::new();
        let first = ids.generate_at(1_000);
        let second = ids.generate_at(5_000);

        let mut entries = firemirror_storage::Entries::new();
        entries.insert("lambeosaurus".into(), json!({"height": 2.1}));
        entries.insert(first.clone(), json!(1));
        entries.insert(second.clone(), json!(2));
        replica.save(&entries).unwrap();

        let result = inspect(dir.path(), "dinos", true).unwrap();
        assert_eq!(result.entry_count, 3);
        assert_eq!(result.push_id_count, 2);
        assert_eq!(result.oldest_push_ms, Some(1_000));
        assert_eq!(result.newest_push_ms, Some(5_000));
        assert!(result.size > 0);
        assert!(!result.staging_present);
        assert_eq!(result.keys.unwrap().len(), 3);
    }

    #[test]
    fn rejects_unknown_format() {
        let dir = tempdir().unwrap();
        let replica = FileReplica::open(dir.path(), "dinos").unwrap();
        replica.save(&firemirror_storage::Entries::new()).unwrap();
        assert!(matches!(
            run(dir.path(), "dinos", "yaml", false),
            Err(CliError::UnknownFormat(_))
        ));
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(12), "12 bytes");
        assert_eq!(format_size(2048), "2.0 KB");
    }
}
