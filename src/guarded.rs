//! One container, three ways in: exclusive (`&mut`), shared read/write (locked),
//! and read-only snapshots. The call site picks the access mode.

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct Guarded<T> {
    inner: RwLock<T>,
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    /// Lock-free access for the single owner.
    pub fn exclusive(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Shared read under a read lock; many readers may run concurrently.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.read())
    }

    /// Mutation under the write lock; writers never interleave.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Clone> Guarded<T> {
    /// Detached copy of the current value.
    pub fn snapshot(&self) -> T {
        self.inner.read().clone()
    }
}
