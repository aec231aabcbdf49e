//! Paths inside the mirrored namespace.
//!
//! Stream paths are relative to the subscribed location: `/` is the mirrored
//! root, `/key` is one entry and `/key/a/b` is a field nested inside it.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};

/// A parsed stream path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePath {
    /// The mirrored root.
    Root,
    /// An entry, optionally descending into nested fields.
    Entry {
        /// Entry key.
        key: String,
        /// Field segments below the entry (empty for the entry itself).
        fields: Vec<String>,
    },
}

impl ChangePath {
    /// Parses a `/`-separated path. Empty segments are ignored.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let mut segments = raw.split('/').filter(|s| !s.is_empty());
        let Some(key) = segments.next() else {
            return Ok(ChangePath::Root);
        };
        let fields: Vec<String> = segments.map(str::to_string).collect();
        if key.contains(['.', '#', '$', '[', ']']) {
            return Err(ProtocolError::InvalidPath(raw.to_string()));
        }
        Ok(ChangePath::Entry {
            key: key.to_string(),
            fields,
        })
    }

    /// Returns this path extended by one child segment.
    ///
    /// `segment` may itself contain `/`, as patch children sometimes do.
    pub fn child(&self, segment: &str) -> Self {
        let mut parts = segment.split('/').filter(|s| !s.is_empty()).map(str::to_string);
        match self {
            ChangePath::Root => match parts.next() {
                Some(key) => ChangePath::Entry {
                    key,
                    fields: parts.collect(),
                },
                None => ChangePath::Root,
            },
            ChangePath::Entry { key, fields } => {
                let mut fields = fields.clone();
                fields.extend(parts);
                ChangePath::Entry {
                    key: key.clone(),
                    fields,
                }
            }
        }
    }
}

/// Returns true if a value counts as "no data".
///
/// Null and empty objects both mean the node does not exist.
pub fn is_empty_node(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Writes `value` at `fields` below `target`, creating objects along the way.
///
/// A null `value` removes the field. Intermediate objects left empty by a
/// removal are pruned.
pub fn set_nested(target: &mut Value, fields: &[String], value: Value) {
    let Some((head, rest)) = fields.split_first() else {
        *target = value;
        return;
    };

    if !target.is_object() {
        if value.is_null() {
            return;
        }
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };

    if rest.is_empty() {
        if value.is_null() {
            map.remove(head);
        } else {
            map.insert(head.clone(), value);
        }
        return;
    }

    let child = map.entry(head.clone()).or_insert(Value::Null);
    set_nested(child, rest, value);
    if is_empty_node(child) {
        map.remove(head);
    }
}

/// Shallow merge of `partial` into `target`.
///
/// Object fields are replaced one by one (null removes the field). A
/// non-object target is treated as an empty object; a non-object `partial`
/// replaces the target wholesale.
pub fn merge_fields(target: &mut Value, partial: Value) {
    let Value::Object(fields) = partial else {
        *target = partial;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(existing) = target else {
        return;
    };
    for (field, value) in fields {
        if value.is_null() {
            existing.remove(&field);
        } else {
            existing.insert(field, value);
        }
    }
}
