//! Lock-free swapping of the mounted extension router.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Read-mostly cell: loaded on every request, replaced when modules
/// register or withdraw endpoints.
pub struct RouterCache<T> {
    inner: ArcSwap<T>,
}

impl<T> RouterCache<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Requests already holding the previous value finish on it.
    pub fn store(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}
