//! Single-assignment cell with async waiters.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A value that starts pending and is resolved at most once.
///
/// Resolution is check-and-set under one lock, so two racing resolvers can
/// never both win. Waiters registered before or after resolution observe the
/// same value.
#[derive(Debug)]
pub struct Slot<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Slot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Record `value` if the slot is still pending. Returns `false` (and drops
    /// `value`) if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        {
            let mut guard = self.value.lock();
            if guard.is_some() {
                return false;
            }
            *guard = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.value.lock().is_some()
    }

    /// The resolved value, if any, without waiting.
    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Wait until the slot is resolved and return a copy of the value.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resolve in between is not missed.
            notified.as_mut().enable();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
