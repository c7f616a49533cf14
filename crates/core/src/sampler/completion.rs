use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Single-assignment result slot, readable by any number of waiters.
///
/// The first [`settle`](Self::settle) wins; later calls are ignored.
pub struct Completion<T> {
    shared: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// Returns `false` if a value was already set.
    pub fn settle(&self, value: T) -> bool {
        let (slot, ready) = &*self.shared;
        let mut slot = slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        ready.notify_all();
        true
    }

    pub fn is_settled(&self) -> bool {
        self.shared.0.lock().is_some()
    }

    pub fn try_get(&self) -> Option<T> {
        self.shared.0.lock().clone()
    }

    pub fn wait(&self) -> T {
        let (slot, ready) = &*self.shared;
        let mut slot = slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            ready.wait(&mut slot);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let (slot, ready) = &*self.shared;
        let mut slot = slot.lock();
        if slot.is_none() {
            ready.wait_while_for(&mut slot, |v| v.is_none(), timeout);
        }
        slot.clone()
    }
}
