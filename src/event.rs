//! In-process multicast events
//!
//! Two flavours: [`Event`] runs subscribers synchronously on the emitter's
//! thread; [`AsyncEvent`] hands payloads to a dedicated consumer thread and
//! invokes subscribers serially in enqueue order. Subscribers register once
//! and are never removed; nothing is dropped, a slow consumer back-pressures
//! its own queue.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Synchronous multicast event.
///
/// `emit` invokes every subscriber on the calling thread, in registration
/// order. The subscriber list is snapshotted before the calls, so a
/// subscriber may register further subscribers without deadlocking.
pub struct Event<T> {
    name: &'static str,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Event<T> {
    /// Create an unnamed event.
    pub fn new() -> Self {
        Self::named("")
    }

    /// Create an event with a diagnostic name.
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber. There is no unsubscription.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.lock().push(Arc::new(subscriber));
    }

    /// Invoke all subscribers with the payload.
    pub fn emit(&self, payload: &T) {
        let snapshot: Vec<Subscriber<T>> = self.subscribers.lock().clone();

        for subscriber in snapshot {
            subscriber(payload);
        }
    }

    /// Diagnostic name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event({}, {} subs)", self.name, self.subscribers.lock().len())
    }
}

/// Asynchronous multicast event.
///
/// `emit` enqueues the payload and returns immediately; one dedicated worker
/// thread drains the queue and invokes subscribers serially in enqueue order.
/// Cloning shares the queue and the subscriber list.
pub struct AsyncEvent<T> {
    name: &'static str,
    tx: crossbeam_channel::Sender<T>,
    subscribers: Arc<Mutex<Vec<Subscriber<T>>>>,
}

impl<T: Send + 'static> AsyncEvent<T> {
    /// Create the event and spawn its consumer thread.
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<T>();
        let subscribers: Arc<Mutex<Vec<Subscriber<T>>>> = Arc::new(Mutex::new(Vec::new()));

        let worker_subscribers = Arc::clone(&subscribers);
        thread::Builder::new()
            .name(format!("event:{name}"))
            .spawn(move || {
                // ends once every sender is gone
                for payload in rx {
                    let snapshot: Vec<Subscriber<T>> = worker_subscribers.lock().clone();
                    for subscriber in snapshot {
                        subscriber(&payload);
                    }
                }
            })
            .expect("failed to spawn event consumer thread");

        Self {
            name,
            tx,
            subscribers,
        }
    }

    /// Register a subscriber. There is no unsubscription.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.lock().push(Arc::new(subscriber));
    }

    /// Enqueue a payload for the consumer thread.
    pub fn emit(&self, payload: T) {
        // only fails when the consumer thread is gone, i.e. at teardown
        let _ = self.tx.send(payload);
    }

    /// Diagnostic name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AsyncEvent<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> std::fmt::Debug for AsyncEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AsyncEvent({}, {} subs)",
            self.name,
            self.subscribers.lock().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn sync_event_runs_subscribers_in_order() {
        let event: Event<u32> = Event::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3u32 {
            let log = Arc::clone(&log);
            event.subscribe(move |value| log.lock().push((tag, *value)));
        }

        event.emit(&7);
        assert_eq!(*log.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn sync_event_subscriber_may_register_more() {
        let event: Arc<Event<u32>> = Arc::new(Event::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_count = Arc::clone(&count);
        let event_handle = Arc::clone(&event);
        event.subscribe(move |_| {
            let inner_count = Arc::clone(&inner_count);
            event_handle.subscribe(move |_| {
                inner_count.fetch_add(1, Ordering::SeqCst);
            });
        });

        event.emit(&0);
        event.emit(&0);
        // one subscriber added per emit, each firing on subsequent emits
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn async_event_delivers_in_fifo_order() {
        let event: AsyncEvent<u32> = AsyncEvent::new("test");
        let (tx, rx) = crossbeam_channel::unbounded();

        event.subscribe(move |value| {
            tx.send(*value).unwrap();
        });

        for value in 0..10 {
            event.emit(value);
        }

        for expected in 0..10 {
            let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(got, expected);
        }
    }
}
