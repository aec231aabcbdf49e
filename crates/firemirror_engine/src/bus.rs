//! Fan-out of mirror events to subscribers.
//!
//! Every subscriber owns an unbounded queue. The engine publishes while
//! holding its commit lock, so all queues see events in commit order.

use firemirror_protocol::FirebaseEvent;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Terminal failure of the change stream, as delivered to subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("change stream failed: {message}")]
pub struct StreamFailure {
    message: String,
}

impl StreamFailure {
    /// Creates a failure with a description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Description of the failure.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An item received by a [`Subscription`].
pub type Delivery = Result<FirebaseEvent, StreamFailure>;

#[derive(Default)]
struct Queue {
    items: VecDeque<Delivery>,
    closed: bool,
}

#[derive(Default)]
struct Slot {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Slot {
    fn push(&self, event: FirebaseEvent, conflate: bool) {
        let mut queue = self.queue.lock();
        if queue.closed {
            return;
        }
        if conflate && event.event_source().is_stream() {
            let stale = queue.items.iter().position(|item| {
                matches!(item, Ok(queued) if queued.key() == event.key() && queued.event_source().is_stream())
            });
            if let Some(pos) = stale {
                queue.items.remove(pos);
            }
        }
        queue.items.push_back(Ok(event));
        self.ready.notify_all();
    }

    fn terminate(&self, failure: Option<StreamFailure>) {
        let mut queue = self.queue.lock();
        if queue.closed {
            return;
        }
        if let Some(failure) = failure {
            queue.items.push_back(Err(failure));
        }
        queue.closed = true;
        self.ready.notify_all();
    }
}

#[derive(Default)]
struct Registry {
    slots: Vec<Arc<Slot>>,
    replay: Option<Vec<FirebaseEvent>>,
    closed: bool,
}

impl Registry {
    fn prune(&mut self) {
        self.slots.retain(|slot| Arc::strong_count(slot) > 1);
    }
}

/// Multi-subscriber event fan-out.
///
/// The hydration batch is kept for replay until the first later event is
/// published, so a subscriber that attaches right after startup still sees
/// it. With conflation on, an undelivered stream event for a key is
/// replaced by a newer stream event for the same key.
pub struct EventBus {
    registry: Mutex<Registry>,
    conflate: bool,
}

impl EventBus {
    /// Creates a bus. `conflate` enables per-key conflation of stream events.
    pub fn new(conflate: bool) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            conflate,
        }
    }

    /// Attaches a new subscriber.
    ///
    /// A subscription taken after [`close`](Self::close) is already closed.
    pub fn subscribe(&self) -> Subscription {
        let slot = Arc::new(Slot::default());
        let mut registry = self.registry.lock();
        if registry.closed {
            slot.terminate(None);
        } else {
            if let Some(batch) = &registry.replay {
                for event in batch {
                    slot.push(event.clone(), false);
                }
            }
            registry.slots.push(Arc::clone(&slot));
        }
        Subscription { slot }
    }

    /// Publishes the hydration batch and keeps it for late subscribers.
    pub fn publish_hydration(&self, batch: Vec<FirebaseEvent>) {
        let mut registry = self.registry.lock();
        registry.prune();
        for slot in &registry.slots {
            for event in &batch {
                slot.push(event.clone(), false);
            }
        }
        registry.replay = Some(batch);
    }

    /// Publishes one event to every subscriber.
    pub fn publish(&self, event: FirebaseEvent) {
        let mut registry = self.registry.lock();
        registry.replay = None;
        registry.prune();
        for slot in &registry.slots {
            slot.push(event.clone(), self.conflate);
        }
    }

    /// Delivers a terminal failure and detaches every current subscriber.
    pub fn fail(&self, failure: StreamFailure) {
        let mut registry = self.registry.lock();
        for slot in registry.slots.drain(..) {
            slot.terminate(Some(failure.clone()));
        }
    }

    /// Closes every subscription. Later subscriptions start closed.
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.replay = None;
        for slot in registry.slots.drain(..) {
            slot.terminate(None);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut registry = self.registry.lock();
        registry.prune();
        registry.slots.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("conflate", &self.conflate)
            .finish_non_exhaustive()
    }
}

/// Receiving end of an [`EventBus`].
///
/// Dropping the subscription detaches it.
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    /// Takes the next queued item without blocking.
    pub fn try_recv(&self) -> Option<Delivery> {
        self.slot.queue.lock().items.pop_front()
    }

    /// Blocks until an item arrives. `None` once closed and drained.
    pub fn recv(&self) -> Option<Delivery> {
        let mut queue = self.slot.queue.lock();
        loop {
            if let Some(item) = queue.items.pop_front() {
                return Some(item);
            }
            if queue.closed {
                return None;
            }
            self.slot.ready.wait(&mut queue);
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.slot.queue.lock();
        loop {
            if let Some(item) = queue.items.pop_front() {
                return Some(item);
            }
            if queue.closed {
                return None;
            }
            if self.slot.ready.wait_until(&mut queue, deadline).timed_out() {
                return queue.items.pop_front();
            }
        }
    }

    /// Takes everything queued right now.
    pub fn drain(&self) -> Vec<Delivery> {
        self.slot.queue.lock().items.drain(..).collect()
    }

    /// Number of queued items.
    pub fn pending(&self) -> usize {
        self.slot.queue.lock().items.len()
    }

    /// Returns true once no further items will be queued.
    pub fn is_closed(&self) -> bool {
        self.slot.queue.lock().closed
    }
}

impl Iterator for Subscription {
    type Item = Delivery;

    fn next(&mut self) -> Option<Delivery> {
        self.recv()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firemirror_protocol::EventSource;
    use serde_json::json;
    use std::thread;

    fn event(key: &str, n: i64, source: EventSource) -> FirebaseEvent {
        FirebaseEvent::upsert(key, json!(n), source)
    }

    fn values(items: Vec<Delivery>) -> Vec<(String, i64)> {
        items
            .into_iter()
            .map(|item| {
                let event = item.unwrap();
                (event.key().to_string(), event.object().unwrap().as_i64().unwrap())
            })
            .collect()
    }

    #[test]
    fn fans_out_in_order() {
        let bus = EventBus::new(false);
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(event("k", 1, EventSource::Offline));
        bus.publish(event("k", 2, EventSource::OnlineUpdate));

        let expected = vec![("k".to_string(), 1), ("k".to_string(), 2)];
        assert_eq!(values(a.drain()), expected);
        assert_eq!(values(b.drain()), expected);
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(false);
        bus.publish(event("k", 1, EventSource::Offline));
        let late = bus.subscribe();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn conflates_stream_events_per_key() {
        let bus = EventBus::new(true);
        let sub = bus.subscribe();
        bus.publish(event("a", 1, EventSource::OnlineUpdate));
        bus.publish(event("b", 1, EventSource::OnlineUpdate));
        bus.publish(event("a", 2, EventSource::OnlineUpdate));
        assert_eq!(
            values(sub.drain()),
            vec![("b".to_string(), 1), ("a".to_string(), 2)]
        );
    }

    #[test]
    fn never_conflates_local_writes() {
        let bus = EventBus::new(true);
        let sub = bus.subscribe();
        bus.publish(event("a", 1, EventSource::Offline));
        bus.publish(event("a", 2, EventSource::OnlineUpdate));
        bus.publish(event("a", 3, EventSource::Offline));
        assert_eq!(sub.drain().len(), 3);
    }

    #[test]
    fn drained_events_are_not_conflated_away() {
        let bus = EventBus::new(true);
        let sub = bus.subscribe();
        bus.publish(event("a", 1, EventSource::OnlineUpdate));
        assert!(sub.try_recv().is_some());
        bus.publish(event("a", 2, EventSource::OnlineUpdate));
        assert_eq!(values(sub.drain()), vec![("a".to_string(), 2)]);
    }

    #[test]
    fn hydration_batch_replays_until_next_publish() {
        let bus = EventBus::new(false);
        let early = bus.subscribe();
        bus.publish_hydration(vec![
            event("a", 1, EventSource::OnlineInitial),
            event("b", 1, EventSource::OnlineInitial),
        ]);
        assert_eq!(early.drain().len(), 2);

        let on_time = bus.subscribe();
        assert_eq!(on_time.drain().len(), 2);

        bus.publish(event("c", 1, EventSource::Offline));
        let late = bus.subscribe();
        assert!(late.drain().is_empty());
        assert_eq!(values(on_time.drain()), vec![("c".to_string(), 1)]);
    }

    #[test]
    fn failure_is_delivered_then_detaches() {
        let bus = EventBus::new(false);
        let sub = bus.subscribe();
        bus.publish(event("a", 1, EventSource::OnlineCreate));
        bus.fail(StreamFailure::new("authentication revoked"));
        bus.publish(event("a", 2, EventSource::Offline));

        assert!(sub.recv().unwrap().is_ok());
        let failure = sub.recv().unwrap().unwrap_err();
        assert_eq!(failure.message(), "authentication revoked");
        assert!(sub.recv().is_none());

        let fresh = bus.subscribe();
        bus.publish(event("a", 3, EventSource::Offline));
        assert_eq!(values(fresh.drain()), vec![("a".to_string(), 3)]);
    }

    #[test]
    fn close_ends_blocked_receivers() {
        let bus = Arc::new(EventBus::new(false));
        let sub = bus.subscribe();
        let waiter = thread::spawn(move || sub.recv());
        thread::sleep(Duration::from_millis(20));
        bus.close();
        assert!(waiter.join().unwrap().is_none());
        assert!(bus.subscribe().is_closed());
    }

    #[test]
    fn recv_timeout_and_iterator() {
        let bus = EventBus::new(false);
        let sub = bus.subscribe();
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());

        bus.publish(event("a", 1, EventSource::Offline));
        bus.close();
        let collected: Vec<Delivery> = sub.collect();
        assert_eq!(collected.len(), 1);
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = EventBus::new(false);
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
