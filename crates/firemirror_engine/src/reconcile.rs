//! Pure merge logic: snapshots and stream changes against the replica.
//!
//! Nothing here touches storage or subscribers. Callers apply these
//! functions to a draft map and turn the returned mutations into events.

use firemirror_protocol::path::{is_empty_node, set_nested, ChangePath};
use firemirror_protocol::{ChangeEvent, ChangeKind, ProtocolError, ProtocolResult};
use firemirror_storage::Entries;
use serde_json::Value;

/// How a full remote snapshot is folded into the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// The replica becomes exactly the snapshot.
    Replace,
    /// Only keys absent locally are added.
    MissingOnly,
    /// Differing keys are overwritten; nothing is deleted.
    Upsert,
}

/// A change to one key of the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// The key now holds `value`.
    Upsert {
        /// Entry key.
        key: String,
        /// New value.
        value: Value,
        /// Whether the key held a value before.
        existed: bool,
    },
    /// The key was removed.
    Remove {
        /// Entry key.
        key: String,
        /// Value it held.
        previous: Value,
    },
}

impl Mutation {
    /// Key the mutation touched.
    pub fn key(&self) -> &str {
        match self {
            Mutation::Upsert { key, .. } | Mutation::Remove { key, .. } => key,
        }
    }
}

/// Turns a fetched document into entries. Empty children are skipped.
pub fn snapshot_entries(document: Option<Value>) -> Entries {
    match document {
        Some(Value::Object(map)) => map
            .into_iter()
            .filter(|(_, value)| !is_empty_node(value))
            .collect(),
        _ => Entries::new(),
    }
}

/// Folds `snapshot` into `entries` according to `policy`.
pub fn reconcile(entries: &mut Entries, snapshot: Entries, policy: SnapshotPolicy) -> Vec<Mutation> {
    let mut mutations = Vec::new();

    if policy == SnapshotPolicy::Replace {
        let stale: Vec<String> = entries
            .keys()
            .filter(|key| !snapshot.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(previous) = entries.remove(&key) {
                mutations.push(Mutation::Remove { key, previous });
            }
        }
    }

    for (key, value) in snapshot {
        let existed = match entries.get(&key) {
            None => false,
            Some(current) if *current == value => continue,
            Some(_) if policy == SnapshotPolicy::MissingOnly => continue,
            Some(_) => true,
        };
        entries.insert(key.clone(), value.clone());
        mutations.push(Mutation::Upsert {
            key,
            value,
            existed,
        });
    }

    mutations
}

/// Applies one stream change to `entries`.
///
/// A put at the root is a full snapshot and goes through [`reconcile`] with
/// `policy`. Other puts replace (or with null, remove) the value at their
/// path; a patch is the set of puts for its children applied together.
/// Changes that leave a key's value as it was produce no mutation.
pub fn apply_change(
    entries: &mut Entries,
    change: &ChangeEvent,
    policy: SnapshotPolicy,
) -> ProtocolResult<Vec<Mutation>> {
    let path = ChangePath::parse(&change.path)?;
    let data = change.data.clone().unwrap_or(Value::Null);

    let writes = match change.kind {
        ChangeKind::Put => match path {
            ChangePath::Root => {
                return Ok(reconcile(entries, snapshot_entries(Some(data)), policy));
            }
            entry => vec![(entry, data)],
        },
        ChangeKind::Patch => {
            let Value::Object(children) = data else {
                return Err(ProtocolError::InvalidData(format!(
                    "patch at {} is not an object",
                    change.path
                )));
            };
            children
                .into_iter()
                .map(|(child, value)| (path.child(&child), value))
                .collect()
        }
        ChangeKind::KeepAlive | ChangeKind::Cancel | ChangeKind::AuthRevoked => {
            return Ok(Vec::new())
        }
    };

    // First-seen value of every touched key, in touch order.
    let mut before: Vec<(String, Option<Value>)> = Vec::new();
    for (target, value) in writes {
        let ChangePath::Entry { key, fields } = target else {
            return Err(ProtocolError::InvalidPath(change.path.clone()));
        };
        if !before.iter().any(|(seen, _)| *seen == key) {
            before.push((key.clone(), entries.get(&key).cloned()));
        }

        let mut current = entries.remove(&key).unwrap_or(Value::Null);
        set_nested(&mut current, &fields, value);
        if !is_empty_node(&current) {
            entries.insert(key, current);
        }
    }

    let mutations = before
        .into_iter()
        .filter_map(|(key, previous)| match (previous, entries.get(&key)) {
            (Some(previous), None) => Some(Mutation::Remove { key, previous }),
            (previous, Some(current)) if previous.as_ref() != Some(current) => {
                Some(Mutation::Upsert {
                    value: current.clone(),
                    existed: previous.is_some(),
                    key,
                })
            }
            _ => None,
        })
        .collect();
    Ok(mutations)
}
