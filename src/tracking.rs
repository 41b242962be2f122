//! Tracked-value reconciliation cells
//!
//! Every observable channel attribute owns one [`TrackedValue`]: a cell
//! holding the last console-confirmed value plus a FIFO of outstanding user
//! requests. The console echoes every accepted command, so a request is
//! considered delivered when a matching echo resolves it; requests the
//! console silently dropped are swept out by age through the session-scoped
//! [`ValueRegistry`].
//!
//! Invariants:
//! - consecutive queued requests never carry the same value (duplicates
//!   refresh the head-of-line timestamp instead)
//! - a `Some` current value has been confirmed by the console at least once
//! - purging drops requests only, never the current value

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::event::Event;

/// Erased handle the registry keeps per cell for the staleness sweep.
pub trait PurgeStale: Send + Sync {
    /// Drop requests older than `max_age`; returns the number dropped.
    fn purge(&self, max_age: Duration) -> usize;
}

/// Session-scoped registry of every tracked value, for the periodic
/// staleness sweep. Passed explicitly; there is no module-level state.
#[derive(Default)]
pub struct ValueRegistry {
    cells: Mutex<Vec<Arc<dyn PurgeStale>>>,
}

impl ValueRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, cell: Arc<dyn PurgeStale>) {
        self.cells.lock().push(cell);
    }

    /// Purge every registered cell; returns the total number of dropped
    /// requests.
    pub fn purge_all(&self, max_age: Duration) -> usize {
        let cells: Vec<Arc<dyn PurgeStale>> = self.cells.lock().clone();
        cells.iter().map(|cell| cell.purge(max_age)).sum()
    }

    /// Number of registered cells
    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    /// Whether no cell has been registered yet
    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }
}

struct TrackedState<T> {
    value: Option<T>,
    last_resolve: Option<Instant>,
    requests: VecDeque<(T, Instant)>,
}

struct TrackedInner<T> {
    immediate: bool,
    state: Mutex<TrackedState<T>>,
    on_resolve: Event<(T, Instant)>,
    on_update_idle: Event<T>,
}

/// A reconciliation cell for one observable attribute.
///
/// Cheap to clone; clones share the cell. The regular flavour queues
/// requests and matches them against console echoes. The *immediate* flavour
/// (see [`TrackedValue::immediate`]) skips the queue entirely: both
/// `request` and `resolve` update the value and notify synchronously. It is
/// used for attributes the console never echoes back, like colors.
pub struct TrackedValue<T> {
    inner: Arc<TrackedInner<T>>,
}

impl<T> Clone for TrackedValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TrackedValue<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a queueing cell and register it for staleness sweeps.
    pub fn new(registry: &ValueRegistry) -> Self {
        Self::build(registry, false)
    }

    /// Create an immediate cell (no request queue).
    pub fn immediate(registry: &ValueRegistry) -> Self {
        Self::build(registry, true)
    }

    fn build(registry: &ValueRegistry, immediate: bool) -> Self {
        let inner = Arc::new(TrackedInner {
            immediate,
            state: Mutex::new(TrackedState {
                value: None,
                last_resolve: None,
                requests: VecDeque::new(),
            }),
            on_resolve: Event::named("tracked_value.on_resolve"),
            on_update_idle: Event::named("tracked_value.on_update_idle"),
        });

        registry.register(Arc::clone(&inner) as Arc<dyn PurgeStale>);

        Self { inner }
    }

    /// Fired when a queued request is confirmed by the console, with the
    /// originally requested value and its request time.
    pub fn on_resolve(&self) -> &Event<(T, Instant)> {
        &self.inner.on_resolve
    }

    /// Fired when the value changed and no further requests are pending.
    pub fn on_update_idle(&self) -> &Event<T> {
        &self.inner.on_update_idle
    }

    /// The console reported an authoritative value.
    ///
    /// Updates the current value, stamps the resolve time and removes the
    /// first queued request carrying the same value. Notifications fire only
    /// when the value actually changed. Returns the number of requests still
    /// queued.
    pub fn resolve(&self, value: T) -> usize {
        if self.inner.immediate {
            self.update_and_notify(value);
            return 0;
        }

        let (changed, matched, remaining) = {
            let mut state = self.inner.state.lock();

            let changed = state.value.as_ref() != Some(&value);
            if changed {
                state.value = Some(value.clone());
            }
            state.last_resolve = Some(Instant::now());

            let matched_index = state
                .requests
                .iter()
                .position(|(requested, _)| *requested == value);
            let matched = matched_index.and_then(|index| state.requests.remove(index));

            (changed, matched, state.requests.len())
        };

        // notify after releasing the lock
        if changed {
            if let Some(resolved) = matched {
                self.inner.on_resolve.emit(&resolved);
            }

            if remaining == 0 {
                self.inner.on_update_idle.emit(&value);
            }
        }

        remaining
    }

    /// Queue an intent to set the attribute to `value`.
    ///
    /// Does nothing when the queue is empty and the value is already
    /// current; refreshes the timestamp when the last queued request equals
    /// `value`. Returns the number of waiting requests and whether a new
    /// request was queued (only then must the caller transmit a command).
    pub fn request(&self, value: T) -> (usize, bool) {
        if self.inner.immediate {
            self.update_and_notify(value);
            return (0, true);
        }

        let mut state = self.inner.state.lock();

        if state.requests.is_empty() {
            if state.value.as_ref() == Some(&value) {
                return (0, false);
            }
        } else if state
            .requests
            .back()
            .map(|(requested, _)| *requested == value)
            .unwrap_or(false)
        {
            let pending = state.requests.len();
            if let Some(last) = state.requests.back_mut() {
                last.1 = Instant::now();
            }
            return (pending, false);
        }

        state.requests.push_back((value, Instant::now()));
        (state.requests.len(), true)
    }

    fn update_and_notify(&self, value: T) {
        let changed = {
            let mut state = self.inner.state.lock();
            let changed = state.value.as_ref() != Some(&value);
            if changed {
                state.value = Some(value.clone());
            }
            state.last_resolve = Some(Instant::now());
            changed
        };

        if changed {
            self.inner.on_resolve.emit(&(value.clone(), Instant::now()));
            self.inner.on_update_idle.emit(&value);
        }
    }

    /// Last confirmed value, if any.
    pub fn value(&self) -> Option<T> {
        self.inner.state.lock().value.clone()
    }

    /// When the console last confirmed a value.
    pub fn last_resolve(&self) -> Option<Instant> {
        self.inner.state.lock().last_resolve
    }

    /// Whether the console has confirmed a value at least once.
    pub fn synced(&self) -> bool {
        self.inner.state.lock().last_resolve.is_some()
    }

    /// Number of outstanding requests
    pub fn pending(&self) -> usize {
        self.inner.state.lock().requests.len()
    }

    /// Snapshot of the outstanding request queue, oldest first.
    pub fn pending_requests(&self) -> Vec<(T, Instant)> {
        self.inner.state.lock().requests.iter().cloned().collect()
    }

    /// Drop requests older than `max_age`; never touches the current value.
    pub fn purge(&self, max_age: Duration) -> usize {
        PurgeStale::purge(&*self.inner, max_age)
    }
}

impl<T> PurgeStale for TrackedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn purge(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();

        let before = state.requests.len();
        if before == 0 {
            return 0;
        }

        let now = Instant::now();
        state
            .requests
            .retain(|(_, requested_at)| now.duration_since(*requested_at) <= max_age);

        before - state.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cell() -> (ValueRegistry, TrackedValue<u8>) {
        let registry = ValueRegistry::new();
        let tracked = TrackedValue::new(&registry);
        (registry, tracked)
    }

    #[test]
    fn request_resolve_cycle() {
        let (_registry, tracked) = cell();

        let (pending, queued) = tracked.request(5);
        assert_eq!((pending, queued), (1, true));

        let remaining = tracked.resolve(5);
        assert_eq!(remaining, 0);
        assert_eq!(tracked.value(), Some(5));
    }

    #[test]
    fn duplicate_request_refreshes_timestamp_only() {
        let (_registry, tracked) = cell();

        tracked.request(5);
        let first = tracked.pending_requests()[0].1;

        std::thread::sleep(Duration::from_millis(5));
        let (pending, queued) = tracked.request(5);
        assert_eq!((pending, queued), (1, false));

        let refreshed = tracked.pending_requests()[0].1;
        assert!(refreshed > first);
    }

    #[test]
    fn request_for_current_value_with_empty_queue_is_a_noop() {
        let (_registry, tracked) = cell();

        tracked.resolve(9);
        assert_eq!(tracked.request(9), (0, false));
        assert_eq!(tracked.pending(), 0);
    }

    #[test]
    fn coalescing_scenario() {
        let (_registry, tracked) = cell();
        let resolves = Arc::new(Mutex::new(Vec::new()));
        let idles = Arc::new(AtomicUsize::new(0));

        {
            let resolves = Arc::clone(&resolves);
            tracked
                .on_resolve()
                .subscribe(move |(value, _)| resolves.lock().push(*value));
        }
        {
            let idles = Arc::clone(&idles);
            tracked.on_update_idle().subscribe(move |_| {
                idles.fetch_add(1, Ordering::SeqCst);
            });
        }

        tracked.request(1);
        tracked.request(1);
        tracked.request(2);

        let queued: Vec<u8> = tracked
            .pending_requests()
            .into_iter()
            .map(|(value, _)| value)
            .collect();
        assert_eq!(queued, vec![1, 2]);

        assert_eq!(tracked.resolve(1), 1);
        assert_eq!(*resolves.lock(), vec![1]);
        assert_eq!(idles.load(Ordering::SeqCst), 0);

        assert_eq!(tracked.resolve(2), 0);
        assert_eq!(*resolves.lock(), vec![1, 2]);
        assert_eq!(idles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolve_is_idempotent_when_idle() {
        let (_registry, tracked) = cell();
        let idles = Arc::new(AtomicUsize::new(0));

        {
            let idles = Arc::clone(&idles);
            tracked.on_update_idle().subscribe(move |_| {
                idles.fetch_add(1, Ordering::SeqCst);
            });
        }

        tracked.resolve(3);
        tracked.resolve(3);
        tracked.resolve(3);

        assert_eq!(tracked.value(), Some(3));
        assert_eq!(idles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn purge_with_zero_age_empties_queue_and_keeps_value() {
        let registry = ValueRegistry::new();
        let tracked: TrackedValue<u8> = TrackedValue::new(&registry);

        tracked.resolve(7);
        tracked.request(1);
        tracked.request(2);
        std::thread::sleep(Duration::from_millis(2));

        let purged = registry.purge_all(Duration::ZERO);
        assert_eq!(purged, 2);
        assert_eq!(tracked.pending(), 0);
        assert_eq!(tracked.value(), Some(7));
    }

    #[test]
    fn purge_keeps_fresh_requests() {
        let (_registry, tracked) = cell();

        tracked.request(1);
        let purged = tracked.purge(Duration::from_secs(10));
        assert_eq!(purged, 0);
        assert_eq!(tracked.pending(), 1);
    }

    #[test]
    fn immediate_cell_skips_the_queue() {
        let registry = ValueRegistry::new();
        let immediate: TrackedValue<u8> = TrackedValue::immediate(&registry);
        let idles = Arc::new(AtomicUsize::new(0));

        {
            let idles = Arc::clone(&idles);
            immediate.on_update_idle().subscribe(move |_| {
                idles.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (pending, queued) = immediate.request(4);
        assert_eq!((pending, queued), (0, true));
        assert_eq!(immediate.value(), Some(4));
        assert_eq!(idles.load(Ordering::SeqCst), 1);

        immediate.resolve(4);
        assert_eq!(idles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_counts_cells() {
        let registry = ValueRegistry::new();
        let _a: TrackedValue<u8> = TrackedValue::new(&registry);
        let _b: TrackedValue<bool> = TrackedValue::immediate(&registry);
        assert_eq!(registry.len(), 2);
    }
}
