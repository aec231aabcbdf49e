//! On-disk replica artifact format.
//!
//! ```text
//! ┌───────┬─────────┬─────────────┬──────────────────────┬──────────────┐
//! │ FMRP  │ version │ payload len │ payload (CBOR map)   │ SHA-256      │
//! │ 4 B   │ u16 LE  │ u32 LE      │ key -> JSON value    │ of payload   │
//! └───────┴─────────┴─────────────┴──────────────────────┴──────────────┘
//! ```
//!
//! The digest lets a torn or bit-rotted artifact be detected and treated as
//! empty instead of being half-applied.

use crate::error::{StorageError, StorageResult};
use crate::store::Entries;
use sha2::{Digest, Sha256};

/// Magic bytes for replica files.
pub const REPLICA_MAGIC: [u8; 4] = *b"FMRP";

/// Current replica format version.
pub const REPLICA_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 4;
const DIGEST_LEN: usize = 32;

/// Encodes a snapshot into artifact bytes.
pub fn encode(entries: &Entries) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(entries, &mut payload)
        .map_err(|e| StorageError::Encoding(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Encoding("snapshot exceeds 4 GiB".into()))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
    buf.extend_from_slice(&REPLICA_MAGIC);
    buf.extend_from_slice(&REPLICA_VERSION.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&Sha256::digest(&payload));
    Ok(buf)
}

/// Decodes artifact bytes into a snapshot.
pub fn decode(data: &[u8]) -> StorageResult<Entries> {
    if data.len() < HEADER_LEN + DIGEST_LEN {
        return Err(StorageError::corrupted("replica too short"));
    }
    if data[0..4] != REPLICA_MAGIC {
        return Err(StorageError::corrupted("invalid replica magic"));
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > REPLICA_VERSION {
        return Err(StorageError::corrupted(format!(
            "unsupported replica version: {version}"
        )));
    }

    let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    if data.len() != HEADER_LEN + len + DIGEST_LEN {
        return Err(StorageError::corrupted(format!(
            "payload length {len} does not match file size {}",
            data.len()
        )));
    }

    let payload = &data[HEADER_LEN..HEADER_LEN + len];
    let digest = &data[HEADER_LEN + len..];
    if Sha256::digest(payload).as_slice() != digest {
        return Err(StorageError::corrupted("checksum mismatch"));
    }

    ciborium::from_reader(payload).map_err(|e| StorageError::corrupted(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn sample() -> Entries {
        let mut entries = Entries::new();
        entries.insert(
            "dino2".into(),
            json!({"ds": {"height": 2, "length": 2.5, "weight": -2}}),
        );
        entries.insert("dino3".into(), json!(["a", null, true]));
        entries
    }

    #[test]
    fn encode_decode() {
        let entries = sample();
        let bytes = encode(&entries).unwrap();
        assert_eq!(&bytes[0..4], b"FMRP");
        assert_eq!(decode(&bytes).unwrap(), entries);
    }

    #[test]
    fn empty_snapshot() {
        let bytes = encode(&Entries::new()).unwrap();
        assert!(decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn detects_truncation() {
        let bytes = encode(&sample()).unwrap();
        let result = decode(&bytes[..bytes.len() - 5]);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn detects_flipped_bit() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[HEADER_LEN + 3] ^= 0x40;
        let result = decode(&bytes);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn rejects_future_version() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[4] = 9;
        let result = decode(&bytes);
        assert!(matches!(result, Err(StorageError::Corrupted(msg)) if msg.contains("version")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode(b"definitely not a replica file at all!!!!!!!!!!!").is_err());
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    proptest! {
        #[test]
        fn arbitrary_snapshots_survive(map in prop::collection::btree_map("[a-zA-Z0-9_-]{1,20}", json_leaf(), 0..20)) {
            let entries: Entries = map;
            let bytes = encode(&entries).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), entries);
        }
    }
}
