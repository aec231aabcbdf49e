//! The reconciliation engine.

use crate::bus::{EventBus, StreamFailure, Subscription};
use crate::cancel::CancelToken;
use crate::config::{MirrorConfig, PullStrategy};
use crate::error::{EngineError, EngineResult};
use crate::forward::{ForwardOp, Forwarder, WriteHandle};
use crate::reconcile::{apply_change, reconcile, snapshot_entries, Mutation, SnapshotPolicy};
use crate::remote::Remote;
use crate::state::{EngineState, HydrationReport, MirrorStats};
use crate::stream::{StreamDecoder, StreamItem};
use firemirror_protocol::path::{is_empty_node, merge_fields};
use firemirror_protocol::{generate_push_id, ChangeEvent, Entry, EventSource, FirebaseEvent};
use firemirror_storage::{Entries, ReplicaStore};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct CommitState {
    entries: Arc<Entries>,
    disposed: bool,
}

struct Inner<R: Remote, S: ReplicaStore> {
    config: MirrorConfig,
    remote: Arc<R>,
    store: S,
    state: RwLock<EngineState>,
    /// The single mutation path. Held across save and publish.
    commit: Mutex<CommitState>,
    /// Last committed map, for readers.
    snapshot: RwLock<Arc<Entries>>,
    bus: EventBus,
    forwarder: Forwarder,
    stats: Arc<RwLock<MirrorStats>>,
    stream_cancel: CancelToken,
}

/// Mirrors one remote namespace into a local replica.
///
/// Local writes commit to the replica and publish an `Offline` event before
/// returning; forwarding to the remote happens afterwards on a worker
/// thread. Stream changes go through the same commit path, so every
/// subscriber sees one sequence in commit order.
///
/// # Example
///
/// ```
/// use firemirror_engine::{MemoryRemote, MirrorConfig, MirrorEngine, StreamingOptions};
/// use firemirror_storage::InMemoryReplica;
/// use serde_json::json;
///
/// let config = MirrorConfig::new("dinosaurs").with_streaming(StreamingOptions::None);
/// let engine = MirrorEngine::new(config, MemoryRemote::new(), InMemoryReplica::new()).unwrap();
/// let events = engine.subscribe().unwrap();
///
/// let handle = engine.post(json!({"height": 3})).unwrap();
/// assert_eq!(engine.get(handle.key()), Some(json!({"height": 3})));
/// assert!(events.try_recv().is_some());
/// handle.wait().unwrap();
/// ```
pub struct MirrorEngine<R: Remote + 'static, S: ReplicaStore + 'static> {
    inner: Arc<Inner<R, S>>,
    stream: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Remote + 'static, S: ReplicaStore + 'static> MirrorEngine<R, S> {
    /// Creates an engine and takes exclusive ownership of `store`.
    ///
    /// Starts the engine as well when `config.start_immediately` is set.
    ///
    /// # Errors
    ///
    /// Fails if the replica is held by another engine, or if starting fails.
    pub fn new(config: MirrorConfig, remote: R, store: S) -> EngineResult<Self> {
        store.acquire_exclusive()?;

        let remote = Arc::new(remote);
        let stats = Arc::new(RwLock::new(MirrorStats::default()));
        let forwarder = Forwarder::spawn(
            Arc::clone(&remote),
            config.path.clone(),
            config.forward_retry.clone(),
            Arc::clone(&stats),
        )?;
        let bus = EventBus::new(config.streaming.conflates());
        let start = config.start_immediately;

        let engine = Self {
            inner: Arc::new(Inner {
                config,
                remote,
                store,
                state: RwLock::new(EngineState::Uninitialized),
                commit: Mutex::new(CommitState {
                    entries: Arc::new(Entries::new()),
                    disposed: false,
                }),
                snapshot: RwLock::new(Arc::new(Entries::new())),
                bus,
                forwarder,
                stats,
                stream_cancel: CancelToken::new(),
            }),
            stream: Mutex::new(None),
        };

        if start {
            engine.start()?;
        }
        Ok(engine)
    }

    /// Hydrates the replica and, if configured, starts streaming.
    ///
    /// # Errors
    ///
    /// Fails if the engine was already started or disposed, or if the
    /// hydrated replica cannot be saved. An unreachable remote is not an
    /// error; see [`HydrationReport::remote_error`].
    pub fn start(&self) -> EngineResult<HydrationReport> {
        self.inner.transition(EngineState::Hydrating)?;

        let report = match self.inner.hydrate() {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(path = %self.inner.config.path, error = %e, "hydration failed");
                let _ = self.inner.transition(EngineState::Uninitialized);
                return Err(e);
            }
        };
        self.inner.transition(EngineState::Live)?;

        if self.inner.config.streaming.is_streaming() {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name("firemirror-stream".to_string())
                .spawn(move || inner.run_stream())
                .map_err(|e| EngineError::transport_fatal(format!("failed to spawn stream reader: {e}")))?;
            *self.stream.lock() = Some(handle);
        }

        tracing::info!(
            path = %self.inner.config.path,
            loaded = report.loaded,
            introduced = report.introduced,
            streaming = ?self.inner.config.streaming,
            "mirror started"
        );
        Ok(report)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.inner.state.read()
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &MirrorConfig {
        &self.inner.config
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> MirrorStats {
        self.inner.stats.read().clone()
    }

    /// Subscribes to the event sequence.
    ///
    /// Subscribing before [`start`](Self::start), or right after it before any
    /// further change is committed, also yields the hydration batch.
    pub fn subscribe(&self) -> EngineResult<Subscription> {
        if self.state() == EngineState::Disposed {
            return Err(EngineError::Disposed);
        }
        Ok(self.inner.bus.subscribe())
    }

    /// The last committed map. Cheap; shares the underlying storage.
    pub fn snapshot(&self) -> Arc<Entries> {
        Arc::clone(&self.inner.snapshot.read())
    }

    /// Value stored at `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.snapshot.read().get(key).cloned()
    }

    /// Value stored at `key`, deserialized into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        self.get(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(EngineError::from)
    }

    /// Every committed entry, in key order.
    pub fn entries(&self) -> Vec<Entry> {
        self.inner
            .snapshot
            .read()
            .iter()
            .map(|(key, value)| Entry::new(key.clone(), value.clone()))
            .collect()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.snapshot.read().len()
    }

    /// Returns true if the replica holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.snapshot.read().is_empty()
    }

    /// Adds `value` under a new push id.
    pub fn post(&self, value: Value) -> EngineResult<WriteHandle> {
        self.inner.ensure_running()?;
        self.write_entry(generate_push_id(), value)
    }

    /// Serializes `value` and adds it under a new push id.
    pub fn post_as<T: Serialize>(&self, value: &T) -> EngineResult<WriteHandle> {
        self.post(serde_json::to_value(value)?)
    }

    /// Replaces the value at `key`. A null or empty value deletes the key.
    pub fn put(&self, key: &str, value: Value) -> EngineResult<WriteHandle> {
        validate_key(key)?;
        self.inner.ensure_running()?;
        self.write_entry(key.to_string(), value)
    }

    /// Serializes `value` and stores it at `key`.
    pub fn put_as<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<WriteHandle> {
        self.put(key, serde_json::to_value(value)?)
    }

    /// Merges the fields of `partial` into the entry at `key`.
    ///
    /// Null fields are removed. A missing entry is created. A non-object
    /// `partial` replaces the entry like [`put`](Self::put).
    pub fn patch(&self, key: &str, partial: Value) -> EngineResult<WriteHandle> {
        validate_key(key)?;
        self.inner.ensure_running()?;
        if !partial.is_object() {
            return self.write_entry(key.to_string(), partial);
        }

        let local_key = key.to_string();
        let fields = partial.clone();
        let op = ForwardOp::Merge {
            key: key.to_string(),
            partial,
        };
        self.inner.commit(
            move |entries| {
                let previous = entries.get(&local_key).cloned();
                let mut merged = previous.clone().unwrap_or(Value::Null);
                merge_fields(&mut merged, fields);
                Ok(local_event(entries, local_key, previous, merged))
            },
            op,
        )
    }

    /// Removes the entry at `key`.
    ///
    /// Removing a missing key publishes nothing but is still forwarded.
    pub fn delete(&self, key: &str) -> EngineResult<WriteHandle> {
        validate_key(key)?;
        self.inner.ensure_running()?;
        let local_key = key.to_string();
        self.inner.commit(
            move |entries| {
                Ok(entries
                    .remove(&local_key)
                    .map(|previous| {
                        vec![FirebaseEvent::delete(local_key, Some(previous), EventSource::Offline)]
                    })
                    .unwrap_or_default())
            },
            ForwardOp::Remove {
                key: key.to_string(),
            },
        )
    }

    /// Re-fetches the remote snapshot and applies it like a reconnect.
    ///
    /// Returns the number of corrective events published.
    pub fn refresh(&self) -> EngineResult<usize> {
        self.inner.ensure_running()?;
        let document = self.inner.remote.fetch_snapshot(&self.inner.config.path)?;
        let snapshot = snapshot_entries(document);
        let policy = self.inner.config.snapshot_policy();
        let published = self.inner.commit_silent(move |entries| {
            Ok(stream_events(reconcile(entries, snapshot, policy)))
        })?;
        tracing::debug!(path = %self.inner.config.path, published, "refreshed from remote");
        Ok(published)
    }

    /// Shuts the engine down.
    ///
    /// Waits for an in-flight commit, stops the stream, completes queued
    /// forwards with [`EngineError::Disposed`], closes subscriptions and
    /// releases the replica. Idempotent.
    pub fn dispose(&self) {
        {
            let mut commit = self.inner.commit.lock();
            if commit.disposed {
                return;
            }
            commit.disposed = true;
        }
        *self.inner.state.write() = EngineState::Disposed;

        self.inner.stream_cancel.close();
        if let Some(handle) = self.stream.lock().take() {
            if handle.join().is_err() {
                tracing::error!("stream reader panicked");
            }
        }
        self.inner.forwarder.shutdown();
        self.inner.bus.close();
        self.inner.store.release();
        tracing::info!(path = %self.inner.config.path, "mirror disposed");
    }

    fn write_entry(&self, key: String, value: Value) -> EngineResult<WriteHandle> {
        if is_empty_node(&value) {
            return self.delete(&key);
        }
        let local_key = key.clone();
        let local_value = value.clone();
        self.inner.commit(
            move |entries| {
                entries.insert(local_key.clone(), local_value.clone());
                Ok(vec![FirebaseEvent::upsert(local_key, local_value, EventSource::Offline)])
            },
            ForwardOp::Write { key, value },
        )
    }
}

impl<R: Remote + 'static, S: ReplicaStore + 'static> Drop for MirrorEngine<R, S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<R: Remote + 'static, S: ReplicaStore + 'static> Inner<R, S> {
    fn transition(&self, next: EngineState) -> EngineResult<()> {
        let mut state = self.state.write();
        if *state == EngineState::Disposed {
            return Err(EngineError::Disposed);
        }
        if !state.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: format!("{next:?}"),
            });
        }
        if *state != next {
            tracing::debug!(path = %self.config.path, from = ?*state, to = ?next, "state change");
        }
        *state = next;
        Ok(())
    }

    fn ensure_running(&self) -> EngineResult<()> {
        match *self.state.read() {
            EngineState::Live | EngineState::Reconnecting => Ok(()),
            EngineState::Disposed => Err(EngineError::Disposed),
            EngineState::Uninitialized | EngineState::Hydrating => Err(EngineError::NotStarted),
        }
    }

    /// Runs `mutate` on a draft of the committed map and publishes the result.
    ///
    /// Returns the number of events published. Nothing is saved when the
    /// mutation produces no events. A failed save leaves the committed map
    /// untouched.
    fn commit_with<F>(&self, mutate: F, forward: Option<ForwardOp>) -> EngineResult<(usize, Option<WriteHandle>)>
    where
        F: FnOnce(&mut Entries) -> EngineResult<Vec<FirebaseEvent>>,
    {
        let mut commit = self.commit.lock();
        if commit.disposed {
            return Err(EngineError::Disposed);
        }

        let mut draft = Arc::clone(&commit.entries);
        let events = mutate(Arc::make_mut(&mut draft))?;

        if !events.is_empty() {
            if let Err(e) = self.store.save(&draft) {
                tracing::error!(path = %self.config.path, error = %e, "failed to persist commit");
                self.stats.write().last_error = Some(e.to_string());
                return Err(e.into());
            }
            commit.entries = Arc::clone(&draft);
            *self.snapshot.write() = draft;
            for event in &events {
                self.bus.publish(event.clone());
            }
            self.stats.write().events_published += events.len() as u64;
        }

        let handle = forward.map(|op| self.forwarder.enqueue(op));
        Ok((events.len(), handle))
    }

    fn commit<F>(&self, mutate: F, forward: ForwardOp) -> EngineResult<WriteHandle>
    where
        F: FnOnce(&mut Entries) -> EngineResult<Vec<FirebaseEvent>>,
    {
        match self.commit_with(mutate, Some(forward))? {
            (_, Some(handle)) => Ok(handle),
            (_, None) => Err(EngineError::Disposed),
        }
    }

    fn commit_silent<F>(&self, mutate: F) -> EngineResult<usize>
    where
        F: FnOnce(&mut Entries) -> EngineResult<Vec<FirebaseEvent>>,
    {
        self.commit_with(mutate, None).map(|(published, _)| published)
    }

    fn hydrate(&self) -> EngineResult<HydrationReport> {
        let mut report = HydrationReport::default();

        let mut entries = match self.store.try_load() {
            Ok(loaded) => loaded.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %self.config.path, error = %e, "local replica unreadable, starting empty");
                report.local_load_error = Some(e.to_string());
                Entries::new()
            }
        };
        report.loaded = entries.len();

        let policy = match self.config.pull {
            PullStrategy::None => None,
            PullStrategy::MissingOnly => Some(SnapshotPolicy::MissingOnly),
            PullStrategy::Everything => Some(SnapshotPolicy::Replace),
        };
        let mut mutations = Vec::new();
        if let Some(policy) = policy {
            match self.remote.fetch_snapshot(&self.config.path) {
                Ok(document) => {
                    let snapshot = snapshot_entries(document);
                    report.fetched = Some(snapshot.len());
                    mutations = reconcile(&mut entries, snapshot, policy);
                }
                Err(e) => {
                    tracing::warn!(path = %self.config.path, error = %e, "remote snapshot unavailable, continuing offline");
                    report.remote_error = Some(e.to_string());
                }
            }
        }

        let touched: BTreeSet<&str> = mutations.iter().map(Mutation::key).collect();
        let mut batch: Vec<FirebaseEvent> = entries
            .iter()
            .filter(|(key, _)| !touched.contains(key.as_str()))
            .map(|(key, value)| FirebaseEvent::upsert(key.clone(), value.clone(), EventSource::Offline))
            .collect();
        for mutation in &mutations {
            match mutation {
                Mutation::Upsert { key, value, .. } => {
                    report.introduced += 1;
                    batch.push(FirebaseEvent::upsert(key.clone(), value.clone(), EventSource::OnlineInitial));
                }
                Mutation::Remove { .. } => report.removed += 1,
            }
        }

        let mut commit = self.commit.lock();
        if commit.disposed {
            return Err(EngineError::Disposed);
        }
        self.store.save(&entries)?;
        let entries = Arc::new(entries);
        commit.entries = Arc::clone(&entries);
        *self.snapshot.write() = entries;

        {
            let mut stats = self.stats.write();
            stats.events_published += batch.len() as u64;
            stats.hydrated_at = Some(Instant::now());
        }
        self.bus.publish_hydration(batch);
        drop(commit);

        tracing::debug!(
            path = %self.config.path,
            loaded = report.loaded,
            fetched = ?report.fetched,
            introduced = report.introduced,
            removed = report.removed,
            "hydrated"
        );
        Ok(report)
    }

    fn apply_stream(&self, change: &ChangeEvent) -> EngineResult<()> {
        let policy = self.config.snapshot_policy();
        self.commit_silent(|entries| Ok(stream_events(apply_change(entries, change, policy)?)))?;
        self.stats.write().stream_changes_applied += 1;
        Ok(())
    }

    fn run_stream(&self) {
        let decoder = StreamDecoder::new(
            Arc::clone(&self.remote),
            self.config.path.clone(),
            self.config.reconnect.clone(),
            self.stream_cancel.clone(),
        );

        for item in decoder {
            let failure = match item {
                Ok(StreamItem::Connected { reconnect }) => {
                    if reconnect {
                        self.stats.write().reconnects += 1;
                        tracing::info!(path = %self.config.path, "change stream re-established");
                    }
                    let _ = self.transition(EngineState::Live);
                    continue;
                }
                Ok(StreamItem::Disconnected { error }) => {
                    self.stats.write().last_error = Some(error);
                    let _ = self.transition(EngineState::Reconnecting);
                    continue;
                }
                Ok(StreamItem::Change(change)) => match self.apply_stream(&change) {
                    Ok(()) => continue,
                    Err(EngineError::Disposed) => return,
                    Err(e @ EngineError::Protocol(_)) => e,
                    Err(e) => {
                        // The replica keeps its last committed state.
                        tracing::error!(path = %self.config.path, error = %e, "failed to apply stream change");
                        continue;
                    }
                },
                Err(e) => e,
            };

            tracing::error!(path = %self.config.path, error = %failure, "change stream terminated");
            self.stats.write().last_error = Some(failure.to_string());
            self.bus.fail(StreamFailure::new(failure.to_string()));
            return;
        }
    }
}

/// Builds the event for a local write that leaves `key` holding `value`.
fn local_event(entries: &mut Entries, key: String, previous: Option<Value>, value: Value) -> Vec<FirebaseEvent> {
    if is_empty_node(&value) {
        return match previous {
            Some(previous) => {
                entries.remove(&key);
                vec![FirebaseEvent::delete(key, Some(previous), EventSource::Offline)]
            }
            None => Vec::new(),
        };
    }
    entries.insert(key.clone(), value.clone());
    vec![FirebaseEvent::upsert(key, value, EventSource::Offline)]
}

fn stream_events(mutations: Vec<Mutation>) -> Vec<FirebaseEvent> {
    mutations
        .into_iter()
        .map(|mutation| match mutation {
            Mutation::Upsert {
                key,
                value,
                existed: false,
            } => FirebaseEvent::upsert(key, value, EventSource::OnlineCreate),
            Mutation::Upsert { key, value, .. } => {
                FirebaseEvent::upsert(key, value, EventSource::OnlineUpdate)
            }
            Mutation::Remove { key, previous } => {
                FirebaseEvent::delete(key, Some(previous), EventSource::OnlineDelete)
            }
        })
        .collect()
}

fn validate_key(key: &str) -> EngineResult<()> {
    let forbidden = ['.', '#', '$', '[', ']', '/'];
    if key.is_empty() || key.contains(forbidden) || key.chars().any(char::is_control) {
        return Err(EngineError::InvalidKey(key.to_string()));
    }
    Ok(())
}
