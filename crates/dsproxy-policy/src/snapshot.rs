//! Atomically swappable shared value
//!
//! Readers take a cheap `Arc` clone under a read lock and then work on that
//! value without holding any lock. Writers replace the whole value at once,
//! so readers see either the old or the new value, never a mix.

use std::sync::Arc;

use parking_lot::RwLock;

/// Holder for the current version of a value
#[derive(Debug)]
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    /// Create a holder with an initial value
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// Current value
    pub fn load(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Replace the value, returning the previous one
    pub fn swap(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        std::mem::replace(&mut *self.current.write(), next)
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
