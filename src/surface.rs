//! Contracts consumed by the UI layer and the REPL
//!
//! The core never renders anything itself. It exposes a single status line
//! the UI subscribes to, and a key gateway that turns raw key-down/key-up
//! pairs from the hardware surfaces into short- and long-press events using
//! named scheduler jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::{AsyncEvent, Event};
use crate::scheduler::Scheduler;

/// The one user-visible status line.
///
/// Typical values: `"Syncing…"`, `"Hydrating…"`, `"Fully hydrated"`,
/// `"! Overload !"`, `"Not synced | Try again"`, `"Purged N stale requests"`.
pub struct StatusBoard {
    status: Mutex<String>,
    on_status: AsyncEvent<String>,
}

impl StatusBoard {
    /// Create an empty status board.
    pub fn new() -> Self {
        Self {
            status: Mutex::new(String::new()),
            on_status: AsyncEvent::new("surface.status"),
        }
    }

    /// Replace the status line and notify subscribers.
    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        *self.status.lock() = status.clone();
        self.on_status.emit(status);
    }

    /// Transient user-visible notification; shares the status line.
    pub fn notify(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(%message, "notify");
        self.set_status(message);
    }

    /// Current status line
    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    /// Status-changed event for UI subscription
    pub fn on_status(&self) -> &AsyncEvent<String> {
        &self.on_status
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// A key press on one of the hardware surfaces.
///
/// The device identifier is the opaque serial from the configuration; the
/// core never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyEvent {
    /// Opaque device serial
    pub device: String,
    /// Key index on that device
    pub key: u8,
}

impl KeyEvent {
    fn job_name(&self) -> String {
        format!("key_{}:{}", self.device, self.key)
    }
}

/// Long-press threshold
const LONG_PRESS_AFTER: Duration = Duration::from_secs(1);

/// Turns key-down/key-up pairs into short- and long-press events.
///
/// On key-down a named job is scheduled at +1 s; on key-up the job is
/// cancelled. A successful cancel means the long press never fired, so the
/// release counts as a short press. With *direct action* enabled every
/// key-down acts as a long press immediately.
pub struct KeyGateway {
    scheduler: Arc<Scheduler>,
    on_short_press: Arc<Event<KeyEvent>>,
    on_long_press: Arc<Event<KeyEvent>>,
    direct_action: AtomicBool,
}

impl KeyGateway {
    /// Create a gateway using the session's scheduler.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            on_short_press: Arc::new(Event::named("surface.short_press")),
            on_long_press: Arc::new(Event::named("surface.long_press")),
            direct_action: AtomicBool::new(false),
        }
    }

    /// Fired when a key is released before the long-press threshold.
    pub fn on_short_press(&self) -> &Event<KeyEvent> {
        &self.on_short_press
    }

    /// Fired when a key is held past the threshold (or immediately with
    /// direct action enabled).
    pub fn on_long_press(&self) -> &Event<KeyEvent> {
        &self.on_long_press
    }

    /// Toggle direct-action mode; returns the new state.
    pub fn toggle_direct_action(&self) -> bool {
        !self.direct_action.fetch_xor(true, Ordering::SeqCst)
    }

    /// Whether direct-action mode is enabled.
    pub fn direct_action(&self) -> bool {
        self.direct_action.load(Ordering::SeqCst)
    }

    /// A key went down.
    pub fn key_down(&self, event: KeyEvent) {
        if self.direct_action() {
            self.on_long_press.emit(&event);
            return;
        }

        let long_press = Arc::clone(&self.on_long_press);
        let fired = event.clone();
        self.scheduler
            .execute_delayed(&event.job_name(), LONG_PRESS_AFTER, move || {
                long_press.emit(&fired);
            });
    }

    /// A key came back up.
    pub fn key_up(&self, event: KeyEvent) {
        if !self.scheduler.cancel(&event.job_name()) {
            // the long press already ran
            return;
        }

        if !self.direct_action() {
            self.on_short_press.emit(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counting(event: &Event<KeyEvent>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_handle = Arc::clone(&count);
        event.subscribe(move |_| {
            count_handle.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn key(index: u8) -> KeyEvent {
        KeyEvent {
            device: "deck-a".into(),
            key: index,
        }
    }

    #[test]
    fn quick_release_is_a_short_press() {
        let gateway = KeyGateway::new(Arc::new(Scheduler::new(1)));
        let shorts = counting(gateway.on_short_press());
        let longs = counting(gateway.on_long_press());

        gateway.key_down(key(7));
        thread::sleep(Duration::from_millis(20));
        gateway.key_up(key(7));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(shorts.load(Ordering::SeqCst), 1);
        assert_eq!(longs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn held_key_fires_long_press_once() {
        let gateway = KeyGateway::new(Arc::new(Scheduler::new(1)));
        let shorts = counting(gateway.on_short_press());
        let longs = counting(gateway.on_long_press());

        gateway.key_down(key(3));
        thread::sleep(Duration::from_millis(1200));
        gateway.key_up(key(3));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(shorts.load(Ordering::SeqCst), 0);
        assert_eq!(longs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn direct_action_fires_long_press_immediately() {
        let gateway = KeyGateway::new(Arc::new(Scheduler::new(1)));
        let shorts = counting(gateway.on_short_press());
        let longs = counting(gateway.on_long_press());

        gateway.toggle_direct_action();
        gateway.key_down(key(1));
        gateway.key_up(key(1));

        assert_eq!(shorts.load(Ordering::SeqCst), 0);
        assert_eq!(longs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_board_keeps_last_value() {
        let board = StatusBoard::new();
        board.set_status("Syncing…");
        board.notify("Purged 3 stale requests");
        assert_eq!(board.status(), "Purged 3 stale requests");
    }
}
