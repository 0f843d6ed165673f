//! Single-slot "latest wins" mailbox
//!
//! Writers overwrite, they never queue and never wait on readers. Readers
//! either peek at the most recent value or wait for the next unread one.
//! Used between the capture loop and its consumers, for detection reports,
//! and as the per-viewer outbox of the frame publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

struct SlotState<T> {
    value: Option<T>,
    unread: bool,
    closed: bool,
}

/// A single-slot buffer where each write replaces any previous value.
pub struct LatestSlot<T> {
    state: Mutex<SlotState<T>>,
    notify: Notify,
    overwritten: AtomicU64,
}

impl<T: Clone> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: None,
                unread: false,
                closed: false,
            }),
            notify: Notify::new(),
            overwritten: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        // Writers never panic while holding the lock, but a poisoned slot
        // still holds a consistent value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a value, replacing whatever was there.
    ///
    /// Returns true if an unread value was dropped. Writes after `close()`
    /// are discarded.
    pub fn put(&self, value: T) -> bool {
        let dropped = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let dropped = state.unread;
            state.value = Some(value);
            state.unread = true;
            dropped
        };
        if dropped {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        dropped
    }

    /// Clone of the most recent value, without marking it read
    pub fn latest(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// Take the unread value, if any, marking it read
    pub fn take(&self) -> Option<T> {
        let mut state = self.lock();
        if state.unread {
            state.unread = false;
            state.value.clone()
        } else {
            None
        }
    }

    /// Wait for the next unread value.
    ///
    /// Returns None once the slot is closed and nothing unread remains.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a put between check and await is not lost
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.unread {
                    state.unread = false;
                    return state.value.clone();
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the slot; pending and future `recv` calls return None once drained
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of values replaced before anyone read them
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}
