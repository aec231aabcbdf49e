//! In-process remote for tests and demos.

use crate::remote::{ByteStream, Remote, RemoteError, RemoteResult};
use firemirror_protocol::path::{is_empty_node, merge_fields};
use firemirror_protocol::{generate_push_id, ChangeEvent};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// A write received by a [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedWrite {
    /// `push(path, value)` with the key the remote generated.
    Push {
        /// Namespace path.
        path: String,
        /// Generated key.
        key: String,
        /// Stored value.
        value: Value,
    },
    /// `write(path, key, value)`.
    Write {
        /// Namespace path.
        path: String,
        /// Entry key.
        key: String,
        /// Stored value.
        value: Value,
    },
    /// `merge(path, key, partial)`.
    Merge {
        /// Namespace path.
        path: String,
        /// Entry key.
        key: String,
        /// Merged fields.
        partial: Value,
    },
    /// `remove(path, key)`.
    Remove {
        /// Namespace path.
        path: String,
        /// Entry key.
        key: String,
    },
}

impl RecordedWrite {
    /// Key the write targeted.
    pub fn key(&self) -> &str {
        match self {
            RecordedWrite::Push { key, .. }
            | RecordedWrite::Write { key, .. }
            | RecordedWrite::Merge { key, .. }
            | RecordedWrite::Remove { key, .. } => key,
        }
    }
}

enum Chunk {
    Bytes(Vec<u8>),
    Fail(String),
    Eof,
}

/// Reader side of an in-process change stream.
struct ChannelReader {
    rx: Receiver<Chunk>,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Chunk::Bytes(bytes)) => {
                    self.buf = bytes;
                    self.pos = 0;
                }
                Ok(Chunk::Fail(message)) => {
                    self.done = true;
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, message));
                }
                Ok(Chunk::Eof) | Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Default)]
struct State {
    documents: BTreeMap<String, Map<String, Value>>,
    streams: Vec<Sender<Chunk>>,
    writes: Vec<RecordedWrite>,
    failing_writes: u32,
    rejection: Option<String>,
    failing_opens: u32,
    opens: u64,
}

/// A remote database held in memory.
///
/// Each namespace path maps to one document. Change streams are fed
/// explicitly with [`MemoryRemote::send_event`]; writes are recorded and
/// applied to the document but, unless echo is enabled, not streamed back.
///
/// ```
/// use firemirror_engine::{MemoryRemote, Remote};
/// use serde_json::json;
///
/// let remote = MemoryRemote::new();
/// remote.set_snapshot("dinos", json!({"dino1": {"height": 3}}));
/// assert!(remote.fetch_snapshot("dinos").unwrap().is_some());
/// ```
pub struct MemoryRemote {
    state: Mutex<State>,
    online: AtomicBool,
    initial_snapshot: AtomicBool,
    echo: AtomicBool,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Creates an empty, online remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            online: AtomicBool::new(true),
            initial_snapshot: AtomicBool::new(true),
            echo: AtomicBool::new(false),
        }
    }

    /// Replaces the document at `path`. Non-object values clear it.
    pub fn set_snapshot(&self, path: &str, document: Value) {
        let map = match document {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.lock().documents.insert(path.to_string(), map);
    }

    /// Returns the stored document at `path`.
    pub fn document(&self, path: &str) -> Option<Value> {
        self.state
            .lock()
            .documents
            .get(path)
            .filter(|map| !map.is_empty())
            .map(|map| Value::Object(map.clone()))
    }

    /// Takes the remote on or off line. Going offline drops open streams.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.drop_streams();
        }
    }

    /// Returns true if the remote accepts requests.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether newly opened streams start with a `put /` of the document.
    pub fn set_initial_snapshot(&self, enabled: bool) {
        self.initial_snapshot.store(enabled, Ordering::SeqCst);
    }

    /// Whether accepted writes are streamed back to open streams.
    pub fn set_echo(&self, enabled: bool) {
        self.echo.store(enabled, Ordering::SeqCst);
    }

    /// Fails the next `count` writes with a retryable transport error.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// Rejects every write with `message` until cleared with `None`.
    pub fn reject_writes(&self, message: Option<&str>) {
        self.state.lock().rejection = message.map(str::to_string);
    }

    /// Fails the next `count` stream opens with a transport error.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().failing_opens = count;
    }

    /// Writes accepted so far, in arrival order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    /// Number of successfully opened streams.
    pub fn opens(&self) -> u64 {
        self.state.lock().opens
    }

    /// Number of streams still attached.
    pub fn stream_count(&self) -> usize {
        let mut state = self.state.lock();
        // Probe with an empty chunk to drop streams whose reader is gone.
        state
            .streams
            .retain(|tx| tx.send(Chunk::Bytes(Vec::new())).is_ok());
        state.streams.len()
    }

    /// Sends a change event to every open stream.
    pub fn send_event(&self, event: &ChangeEvent) {
        self.send_raw(&event.to_frame());
    }

    /// Sends raw text to every open stream.
    pub fn send_raw(&self, text: &str) {
        let mut state = self.state.lock();
        broadcast(&mut state, text);
    }

    /// Breaks every open stream with a connection-reset error.
    pub fn drop_streams(&self) {
        let mut state = self.state.lock();
        for tx in state.streams.drain(..) {
            let _ = tx.send(Chunk::Fail("connection reset".to_string()));
        }
    }

    fn check_write(&self, state: &mut State) -> RemoteResult<()> {
        if !self.is_online() {
            return Err(RemoteError::transport("remote offline"));
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(RemoteError::transport("injected write failure"));
        }
        if let Some(message) = &state.rejection {
            return Err(RemoteError::rejected(message.clone()));
        }
        Ok(())
    }

    fn echo_back(&self, state: &mut State, event: ChangeEvent) {
        if self.echo.load(Ordering::SeqCst) {
            broadcast(state, &event.to_frame());
        }
    }
}

fn broadcast(state: &mut State, text: &str) {
    let bytes = text.as_bytes();
    state
        .streams
        .retain(|tx| tx.send(Chunk::Bytes(bytes.to_vec())).is_ok());
}

impl Remote for MemoryRemote {
    fn fetch_snapshot(&self, path: &str) -> RemoteResult<Option<Value>> {
        if !self.is_online() {
            return Err(RemoteError::transport("remote offline"));
        }
        Ok(self.document(path))
    }

    fn open_change_stream(&self, path: &str) -> RemoteResult<ByteStream> {
        if !self.is_online() {
            return Err(RemoteError::transport("remote offline"));
        }
        let mut state = self.state.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(RemoteError::transport("injected open failure"));
        }

        let (tx, rx) = mpsc::channel();
        if self.initial_snapshot.load(Ordering::SeqCst) {
            let document = state
                .documents
                .get(path)
                .map(|map| Value::Object(map.clone()))
                .unwrap_or(Value::Null);
            let _ = tx.send(Chunk::Bytes(
                ChangeEvent::put("/", document).to_frame().into_bytes(),
            ));
        }
        state.streams.push(tx.clone());
        state.opens += 1;

        let reader = ChannelReader {
            rx,
            buf: Vec::new(),
            pos: 0,
            done: false,
        };
        let closer = Mutex::new(tx);
        Ok(ByteStream::new(reader, move || {
            let _ = closer.lock().send(Chunk::Eof);
        }))
    }

    fn push(&self, path: &str, value: &Value) -> RemoteResult<String> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;
        let key = generate_push_id();
        state
            .documents
            .entry(path.to_string())
            .or_default()
            .insert(key.clone(), value.clone());
        state.writes.push(RecordedWrite::Push {
            path: path.to_string(),
            key: key.clone(),
            value: value.clone(),
        });
        self.echo_back(&mut state, ChangeEvent::put(format!("/{key}"), value.clone()));
        Ok(key)
    }

    fn write(&self, path: &str, key: &str, value: &Value) -> RemoteResult<()> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;
        let document = state.documents.entry(path.to_string()).or_default();
        if is_empty_node(value) {
            document.remove(key);
        } else {
            document.insert(key.to_string(), value.clone());
        }
        state.writes.push(RecordedWrite::Write {
            path: path.to_string(),
            key: key.to_string(),
            value: value.clone(),
        });
        self.echo_back(&mut state, ChangeEvent::put(format!("/{key}"), value.clone()));
        Ok(())
    }

    fn merge(&self, path: &str, key: &str, partial: &Value) -> RemoteResult<()> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;
        let document = state.documents.entry(path.to_string()).or_default();
        let entry = document.entry(key.to_string()).or_insert(Value::Null);
        merge_fields(entry, partial.clone());
        if is_empty_node(entry) {
            document.remove(key);
        }
        state.writes.push(RecordedWrite::Merge {
            path: path.to_string(),
            key: key.to_string(),
            partial: partial.clone(),
        });
        self.echo_back(&mut state, ChangeEvent::patch(format!("/{key}"), partial.clone()));
        Ok(())
    }

    fn remove(&self, path: &str, key: &str) -> RemoteResult<()> {
        let mut state = self.state.lock();
        self.check_write(&mut state)?;
        if let Some(document) = state.documents.get_mut(path) {
            document.remove(key);
        }
        state.writes.push(RecordedWrite::Remove {
            path: path.to_string(),
            key: key.to_string(),
        });
        self.echo_back(&mut state, ChangeEvent::put(format!("/{key}"), Value::Null));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufRead, BufReader};

    fn read_frame(reader: &mut impl BufRead) -> String {
        let mut frame = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 {
                return frame;
            }
            if line == "\n" {
                return frame;
            }
            frame.push_str(&line);
        }
    }

    #[test]
    fn snapshot_fetch_and_offline() {
        let remote = MemoryRemote::new();
        assert_eq!(remote.fetch_snapshot("dinos").unwrap(), None);

        remote.set_snapshot("dinos", json!({"dino2": 2, "dino3": 3}));
        assert_eq!(
            remote.fetch_snapshot("dinos").unwrap(),
            Some(json!({"dino2": 2, "dino3": 3}))
        );

        remote.set_online(false);
        assert!(remote.fetch_snapshot("dinos").unwrap_err().is_retryable());
    }

    #[test]
    fn writes_are_recorded_and_applied() {
        let remote = MemoryRemote::new();
        remote.write("dinos", "a", &json!({"h": 1, "l": 2})).unwrap();
        remote.merge("dinos", "a", &json!({"h": 5})).unwrap();
        let key = remote.push("dinos", &json!(7)).unwrap();
        remote.remove("dinos", &key).unwrap();

        assert_eq!(remote.document("dinos"), Some(json!({"a": {"h": 5, "l": 2}})));
        let keys: Vec<String> = remote.writes().iter().map(|w| w.key().to_string()).collect();
        assert_eq!(keys, vec!["a".to_string(), "a".into(), key.clone(), key]);
    }

    #[test]
    fn injected_failures() {
        let remote = MemoryRemote::new();
        remote.fail_next_writes(1);
        assert!(remote.write("d", "a", &json!(1)).unwrap_err().is_retryable());
        remote.write("d", "a", &json!(1)).unwrap();

        remote.reject_writes(Some("permission denied"));
        let err = remote.remove("d", "a").unwrap_err();
        assert_eq!(err, RemoteError::rejected("permission denied"));
        remote.reject_writes(None);
        remote.remove("d", "a").unwrap();
    }

    #[test]
    fn stream_starts_with_snapshot_and_carries_events() {
        let remote = MemoryRemote::new();
        remote.set_snapshot("dinos", json!({"dino1": 1}));
        let (reader, shutdown) = remote.open_change_stream("dinos").unwrap().into_parts();
        let mut reader = BufReader::new(reader);

        let first = read_frame(&mut reader);
        assert!(first.starts_with("event: put\n"));
        assert!(first.contains("\"dino1\":1"));

        remote.send_event(&ChangeEvent::put("/dino2", json!(2)));
        assert!(read_frame(&mut reader).contains("/dino2"));

        assert_eq!(remote.stream_count(), 1);
        shutdown();
        assert_eq!(read_frame(&mut reader), "");
    }

    #[test]
    fn dropped_stream_reports_reset() {
        let remote = MemoryRemote::new();
        remote.set_initial_snapshot(false);
        let (mut reader, _) = remote.open_change_stream("dinos").unwrap().into_parts();
        remote.drop_streams();

        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(remote.stream_count(), 0);
    }

    #[test]
    fn echo_streams_writes_back() {
        let remote = MemoryRemote::new();
        remote.set_initial_snapshot(false);
        remote.set_echo(true);
        let (reader, _) = remote.open_change_stream("dinos").unwrap().into_parts();
        let mut reader = BufReader::new(reader);

        remote.merge("dinos", "a", &json!({"h": 1})).unwrap();
        let frame = read_frame(&mut reader);
        assert!(frame.starts_with("event: patch\n"));
    }

    #[test]
    fn failing_opens() {
        let remote = MemoryRemote::new();
        remote.fail_next_opens(1);
        assert!(remote.open_change_stream("d").is_err());
        assert!(remote.open_change_stream("d").is_ok());
        assert_eq!(remote.opens(), 1);
    }
}
