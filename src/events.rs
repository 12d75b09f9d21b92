//! Log delivery from reader tasks to subscribers.
//!
//! Every managed process publishes its output lines under its `ServiceKey`.
//! Subscribers are either fire-and-forget callbacks, run synchronously on the
//! publishing task, or bounded channels that drop lines instead of blocking
//! when the consumer falls behind.

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

use crate::lock;
use crate::output::LogLine;
use crate::process::ServiceKey;

/// Callback invoked for every line published under a key.
pub type LogCallback = Arc<dyn Fn(&ServiceKey, &LogLine) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A line published for a key, as seen by channel subscribers.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub key: ServiceKey,
    pub line: LogLine,
}

/// Receiving half of a bounded subscription.
#[derive(Debug)]
pub struct LogReceiver {
    pub id: SubscriberId,
    rx: mpsc::Receiver<LogEvent>,
    dropped: Arc<AtomicU64>,
}

impl LogReceiver {
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.rx.try_recv().ok()
    }

    /// Lines discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum Sink {
    Callback(LogCallback),
    Channel {
        tx: mpsc::Sender<LogEvent>,
        dropped: Arc<AtomicU64>,
    },
}

struct Subscriber {
    id: SubscriberId,
    active: AtomicBool,
    // Held for the duration of one delivery; unsubscribe waits on it.
    gate: Mutex<()>,
    sink: Sink,
}

thread_local! {
    static DELIVERING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Thread-safe registry of subscribers per key.
#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    by_key: Mutex<HashMap<ServiceKey, Vec<Arc<Subscriber>>>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &ServiceKey, callback: LogCallback) -> SubscriberId {
        self.insert(key, Sink::Callback(callback))
    }

    pub fn subscribe_channel(&self, key: &ServiceKey, capacity: usize) -> LogReceiver {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.insert(
            key,
            Sink::Channel {
                tx,
                dropped: dropped.clone(),
            },
        );
        LogReceiver { id, rx, dropped }
    }

    fn insert(&self, key: &ServiceKey, sink: Sink) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            sink,
        });
        lock(&self.by_key)
            .entry(key.clone())
            .or_default()
            .push(subscriber);
        id
    }

    /// Removes a subscriber. Once this returns the subscriber is never invoked
    /// again; a delivery already running on another thread is waited for.
    pub fn unsubscribe(&self, key: &ServiceKey, id: SubscriberId) -> bool {
        let removed = {
            let mut by_key = lock(&self.by_key);
            let Some(list) = by_key.get_mut(key) else {
                return false;
            };
            let position = list.iter().position(|s| s.id == id);
            let removed = position.map(|idx| list.remove(idx));
            if list.is_empty() {
                by_key.remove(key);
            }
            removed
        };
        let Some(subscriber) = removed else {
            return false;
        };
        subscriber.active.store(false, Ordering::SeqCst);
        let self_delivery = DELIVERING.with(|current| current.get() == Some(id.0));
        if !self_delivery {
            drop(lock(&subscriber.gate));
        }
        true
    }

    pub fn subscriber_count(&self, key: &ServiceKey) -> usize {
        lock(&self.by_key).get(key).map(Vec::len).unwrap_or(0)
    }

    /// Delivers a line to every subscriber of `key`.
    ///
    /// The table lock is only held while taking a snapshot of the subscriber list.
    pub fn publish(&self, key: &ServiceKey, line: &LogLine) {
        let snapshot: Vec<Arc<Subscriber>> = match lock(&self.by_key).get(key) {
            Some(list) => list.clone(),
            None => return,
        };
        let mut closed = Vec::new();
        for subscriber in snapshot {
            let _gate = lock(&subscriber.gate);
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            match &subscriber.sink {
                Sink::Callback(callback) => {
                    DELIVERING.with(|current| current.set(Some(subscriber.id.0)));
                    let outcome = catch_unwind(AssertUnwindSafe(|| callback(key, line)));
                    DELIVERING.with(|current| current.set(None));
                    if outcome.is_err() {
                        warn!(%key, "log subscriber panicked; line skipped for it");
                    }
                }
                Sink::Channel { tx, dropped } => {
                    let event = LogEvent {
                        key: key.clone(),
                        line: line.clone(),
                    };
                    match tx.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            subscriber.active.store(false, Ordering::SeqCst);
                            closed.push(subscriber.id);
                        }
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut by_key = lock(&self.by_key);
            if let Some(list) = by_key.get_mut(key) {
                list.retain(|s| !closed.contains(&s.id));
                if list.is_empty() {
                    by_key.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::StreamKind;

    fn key() -> ServiceKey {
        ServiceKey::new("p", "backend")
    }

    fn collector() -> (Arc<Mutex<Vec<String>>>, LogCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: LogCallback = Arc::new(move |_key: &ServiceKey, line: &LogLine| {
            sink.lock().unwrap().push(line.text.clone());
        });
        (seen, callback)
    }

    #[test]
    fn publishes_only_to_matching_key() {
        let set = SubscriberSet::new();
        let (seen, callback) = collector();
        set.subscribe(&key(), callback);
        set.publish(&key(), &LogLine::new("hello", StreamKind::Stdout));
        set.publish(
            &ServiceKey::new("p", "frontend"),
            &LogLine::new("other", StreamKind::Stdout),
        );
        assert_eq!(*seen.lock().unwrap(), vec!["hello"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let set = SubscriberSet::new();
        let (seen, callback) = collector();
        let id = set.subscribe(&key(), callback);
        set.publish(&key(), &LogLine::system("one"));
        assert!(set.unsubscribe(&key(), id));
        assert!(!set.unsubscribe(&key(), id));
        set.publish(&key(), &LogLine::system("two"));
        assert_eq!(*seen.lock().unwrap(), vec!["one"]);
        assert_eq!(set.subscriber_count(&key()), 0);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let set = Arc::new(SubscriberSet::new());
        let calls = Arc::new(AtomicU64::new(0));
        let id_slot: Arc<Mutex<Option<SubscriberId>>> = Arc::new(Mutex::new(None));
        let callback: LogCallback = {
            let set = set.clone();
            let calls = calls.clone();
            let id_slot = id_slot.clone();
            Arc::new(move |key: &ServiceKey, _line: &LogLine| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *id_slot.lock().unwrap() {
                    set.unsubscribe(key, id);
                }
            })
        };
        let id = set.subscribe(&key(), callback);
        *id_slot.lock().unwrap() = Some(id);
        set.publish(&key(), &LogLine::system("first"));
        set.publish(&key(), &LogLine::system("second"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_waits_for_delivery_running_on_another_thread() {
        use std::sync::Barrier;
        use std::time::Duration;

        let set = Arc::new(SubscriberSet::new());
        let calls = Arc::new(AtomicU64::new(0));
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let callback: LogCallback = {
            let (calls, entered, release) = (calls.clone(), entered.clone(), release.clone());
            Arc::new(move |_key: &ServiceKey, _line: &LogLine| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    entered.wait();
                    release.wait();
                }
            })
        };
        let id = set.subscribe(&key(), callback);

        let publisher = {
            let set = set.clone();
            std::thread::spawn(move || set.publish(&key(), &LogLine::system("in flight")))
        };
        entered.wait();

        let returned = Arc::new(AtomicBool::new(false));
        let remover = {
            let (set, returned) = (set.clone(), returned.clone());
            std::thread::spawn(move || {
                let removed = set.unsubscribe(&key(), id);
                returned.store(true, Ordering::SeqCst);
                removed
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst));

        release.wait();
        publisher.join().unwrap();
        assert!(remover.join().unwrap());

        set.publish(&key(), &LogLine::system("after unsubscribe"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let set = SubscriberSet::new();
        set.subscribe(
            &key(),
            Arc::new(|_key: &ServiceKey, _line: &LogLine| panic!("boom")),
        );
        let (seen, callback) = collector();
        set.subscribe(&key(), callback);
        set.publish(&key(), &LogLine::system("still delivered"));
        assert_eq!(*seen.lock().unwrap(), vec!["still delivered"]);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let set = SubscriberSet::new();
        let mut receiver = set.subscribe_channel(&key(), 2);
        for i in 0..5 {
            set.publish(&key(), &LogLine::system(format!("{i}")));
        }
        assert_eq!(receiver.dropped(), 3);
        assert_eq!(receiver.try_recv().map(|e| e.line.text), Some("0".into()));
        assert_eq!(receiver.try_recv().map(|e| e.line.text), Some("1".into()));
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn closed_channel_is_pruned() {
        let set = SubscriberSet::new();
        let receiver = set.subscribe_channel(&key(), 4);
        drop(receiver);
        set.publish(&key(), &LogLine::system("nobody listening"));
        assert_eq!(set.subscriber_count(&key()), 0);
    }
}
