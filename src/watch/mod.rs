//! Watch hub for registering watchers and dispatching change events.
//!
//! Delivery is synchronous and happens on the committing writer's thread:
//! - A committing writer queues its events while it still holds the writer
//!   lock, so the queue is in commit order
//! - After releasing the lock the writer waits until its events reach the
//!   front of the queue and nothing else is being delivered, then runs the
//!   callbacks itself. A write returns only after its own events went out
//! - One delivery runs at a time, so callbacks never run concurrently
//!
//! A write issued from inside a callback is queued like any other and
//! delivered by the same thread once the running callback returns. A slow
//! callback never holds up a commit, but it delays every later write's return.
//! A callback must not block on a write made by another thread; that write
//! waits for the callback to finish.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Kind of change carried by a [`WatchEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Put,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Put => f.write_str("PUT"),
            ChangeKind::Delete => f.write_str("DELETE"),
        }
    }
}

/// A committed change to one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ChangeKind,

    /// The logical key that changed
    pub key: String,

    /// New value, `None` for deletes
    pub value: Option<Vec<u8>>,

    /// Value before the change, if the key existed
    pub prev_value: Option<Vec<u8>>,

    /// Revision of the write transaction that made the change
    pub revision: i64,
}

/// Callback invoked for every matching event.
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// A single registration.
struct Watcher {
    id: i64,
    prefix: String,
    callback: WatchCallback,
    canceled: AtomicBool,
}

/// An event together with the watchers that matched it at commit time.
struct Delivery {
    /// Thread that committed the event and delivers it
    owner: ThreadId,
    event: WatchEvent,
    targets: Vec<Arc<Watcher>>,
}

/// The watch hub manages registrations and dispatches events.
pub struct WatchHub {
    /// Map of watch_id -> Watcher
    watchers: DashMap<i64, Arc<Watcher>>,

    /// Counter for generating unique watch IDs
    next_watch_id: AtomicI64,

    /// Committed events waiting for delivery, in commit order
    pending: Mutex<Pending>,

    /// Signaled whenever a delivery finishes or the queue is cleared
    turn: Condvar,
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<Delivery>,

    /// Thread currently running callbacks
    delivering: Option<ThreadId>,
}

impl Pending {
    fn holds_events_of(&self, owner: ThreadId) -> bool {
        self.queue.iter().any(|delivery| delivery.owner == owner)
    }

    fn is_turn_of(&self, owner: ThreadId) -> bool {
        self.delivering.is_none()
            && self
                .queue
                .front()
                .map_or(false, |delivery| delivery.owner == owner)
    }
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(WatchHub {
            watchers: DashMap::new(),
            next_watch_id: AtomicI64::new(1),
            pending: Mutex::new(Pending::default()),
            turn: Condvar::new(),
        })
    }

    /// Registers `callback` for every key starting with `prefix`.
    ///
    /// The registration lives until the returned handle is canceled or dropped.
    pub fn register(self: &Arc<Self>, prefix: impl Into<String>, callback: WatchCallback) -> WatchHandle {
        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        let prefix = prefix.into();

        debug!(watch_id = id, prefix = %prefix, "Watch created");
        self.watchers.insert(
            id,
            Arc::new(Watcher {
                id,
                prefix,
                callback,
                canceled: AtomicBool::new(false),
            }),
        );

        WatchHandle {
            id,
            hub: Arc::downgrade(self),
        }
    }

    /// Removes a registration. Returns `false` if it was already gone.
    pub fn cancel(&self, watch_id: i64) -> bool {
        match self.watchers.remove(&watch_id) {
            Some((_, watcher)) => {
                watcher.canceled.store(true, Ordering::SeqCst);
                debug!(watch_id, "Watch canceled");
                true
            }
            None => false,
        }
    }

    /// Drops every registration and every undelivered event.
    pub fn clear(&self) {
        for entry in self.watchers.iter() {
            entry.value().canceled.store(true, Ordering::SeqCst);
        }
        self.watchers.clear();
        self.pending.lock().queue.clear();
        self.turn.notify_all();
    }

    /// Queues committed events. Must be called while the writer lock is held
    /// so that queue order equals commit order.
    pub fn enqueue(&self, events: Vec<WatchEvent>) {
        if events.is_empty() || self.watchers.is_empty() {
            return;
        }

        let owner = thread::current().id();
        let mut pending = self.pending.lock();
        for event in events {
            let targets: Vec<Arc<Watcher>> = self
                .watchers
                .iter()
                .filter(|entry| event.key.starts_with(entry.value().prefix.as_str()))
                .map(|entry| Arc::clone(entry.value()))
                .collect();

            if !targets.is_empty() {
                pending.queue.push_back(Delivery {
                    owner,
                    event,
                    targets,
                });
            }
        }
    }

    /// Delivers the events this thread queued, in commit order with every
    /// other writer's. Must be called after the writer lock is released.
    ///
    /// Returns immediately when called from inside a callback; the events are
    /// delivered by the same thread after that callback returns.
    pub fn dispatch(&self) {
        let me = thread::current().id();
        let mut pending = self.pending.lock();
        if pending.delivering == Some(me) {
            return;
        }

        while pending.holds_events_of(me) {
            if !pending.is_turn_of(me) {
                self.turn.wait(&mut pending);
                continue;
            }

            let Some(delivery) = pending.queue.pop_front() else { break };
            pending.delivering = Some(me);
            MutexGuard::unlocked(&mut pending, || {
                let _reset = ResetOnPanic(self);
                self.deliver(&delivery);
            });
            pending.delivering = None;
            self.turn.notify_all();
        }
    }

    fn deliver(&self, delivery: &Delivery) {
        for watcher in &delivery.targets {
            if watcher.canceled.load(Ordering::SeqCst) {
                continue;
            }
            trace!(watch_id = watcher.id, key = %delivery.event.key, "Delivering watch event");
            (watcher.callback)(&delivery.event);
        }
    }

    /// Returns the number of active watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

/// Releases the delivery slot when a callback panics and drops the rest of
/// the panicking thread's events, so other writers are not left waiting.
struct ResetOnPanic<'a>(&'a WatchHub);

impl Drop for ResetOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let me = thread::current().id();
            let mut pending = self.0.pending.lock();
            pending.delivering = None;
            pending.queue.retain(|delivery| delivery.owner != me);
            drop(pending);
            self.0.turn.notify_all();
        }
    }
}

/// Keeps a watch registration alive. Dropping it unregisters the watch.
#[must_use = "dropping the handle cancels the watch"]
pub struct WatchHandle {
    id: i64,
    hub: Weak<WatchHub>,
}

impl WatchHandle {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Returns `true` while the registration is still in place.
    pub fn is_active(&self) -> bool {
        self.hub
            .upgrade()
            .map(|hub| hub.watchers.contains_key(&self.id))
            .unwrap_or(false)
    }

    /// Unregisters the watch. Returns `false` if it was already gone, for
    /// example after the store was closed.
    pub fn cancel(self) -> bool {
        self.hub
            .upgrade()
            .map(|hub| hub.cancel(self.id))
            .unwrap_or(false)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.cancel(self.id);
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_event(key: &str, revision: i64) -> WatchEvent {
        WatchEvent {
            kind: ChangeKind::Put,
            key: key.to_string(),
            value: Some(b"v".to_vec()),
            prev_value: None,
            revision,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<WatchEvent>>>, WatchCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: WatchCallback = Arc::new(move |event: &WatchEvent| sink.lock().push(event.clone()));
        (seen, callback)
    }

    #[test]
    fn test_register_and_cancel() {
        let hub = WatchHub::new();
        let (_seen, callback) = recorder();

        let handle = hub.register("a/", callback);
        assert_eq!(handle.id(), 1);
        assert_eq!(hub.watcher_count(), 1);
        assert!(handle.is_active());

        assert!(handle.cancel());
        assert_eq!(hub.watcher_count(), 0);
    }

    #[test]
    fn test_prefix_matching() {
        let hub = WatchHub::new();
        let (seen, callback) = recorder();
        let _handle = hub.register("a/", callback);

        hub.enqueue(vec![put_event("a/x", 1), put_event("b/x", 2), put_event("a", 3)]);
        hub.dispatch();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, "a/x");
    }

    #[test]
    fn test_delivery_in_enqueue_order() {
        let hub = WatchHub::new();
        let (seen, callback) = recorder();
        let _handle = hub.register("", callback);

        hub.enqueue(vec![put_event("k", 1)]);
        hub.enqueue(vec![put_event("k", 2), put_event("j", 2)]);
        hub.dispatch();

        let revisions: Vec<i64> = seen.lock().iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2, 2]);
    }

    #[test]
    fn test_watcher_registered_after_commit_misses_event() {
        let hub = WatchHub::new();
        let (first, callback) = recorder();
        let _first = hub.register("", callback);

        hub.enqueue(vec![put_event("k", 1)]);

        let (late, callback) = recorder();
        let _late = hub.register("", callback);
        hub.dispatch();

        assert_eq!(first.lock().len(), 1);
        assert!(late.lock().is_empty());
    }

    #[test]
    fn test_canceled_before_dispatch() {
        let hub = WatchHub::new();
        let (seen, callback) = recorder();
        let handle = hub.register("", callback);

        hub.enqueue(vec![put_event("k", 1)]);
        drop(handle);
        hub.dispatch();

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_cancel_after_hub_dropped() {
        let hub = WatchHub::new();
        let (_seen, callback) = recorder();
        let handle = hub.register("", callback);

        drop(hub);
        assert!(!handle.is_active());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_later_writer_waits_for_earlier_delivery() {
        let hub = WatchHub::new();
        let (seen, callback) = recorder();
        let _handle = hub.register("", callback);

        hub.enqueue(vec![put_event("k", 1)]);

        let later = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                hub.enqueue(vec![put_event("k", 2)]);
                hub.dispatch();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(seen.lock().is_empty());
        assert!(!later.is_finished());

        hub.dispatch();
        later.join().unwrap();

        let revisions: Vec<i64> = seen.lock().iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2]);
    }

    #[test]
    fn test_clear_deactivates_handles() {
        let hub = WatchHub::new();
        let (_seen, callback) = recorder();
        let handle = hub.register("", callback);

        hub.clear();
        assert!(!handle.is_active());
        assert_eq!(hub.watcher_count(), 0);
    }
}
