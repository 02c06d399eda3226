//! Observers of the guard. Listeners run synchronously on whatever thread
//! triggered the event, in no particular order, so they had better be quick.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What an offending operation was trying to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
    Free,
    Reallocate,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::ReadWrite => "READ_WRITE",
            Self::Free => "FREE",
            Self::Reallocate => "REALLOCATE",
        })
    }
}

/// Told about every illegal operation just before the error is returned.
/// `size` is `None` when the offending address isn't tracked at all.
pub trait IllegalAccessListener: Send + Sync {
    fn on_illegal_access(&self, address: u64, size: Option<u64>, kind: AccessKind);
}

impl<F> IllegalAccessListener for F
where
    F: Fn(u64, Option<u64>, AccessKind) + Send + Sync,
{
    fn on_illegal_access(&self, address: u64, size: Option<u64>, kind: AccessKind) {
        self(address, size, kind)
    }
}

/// Lifecycle events. Every method defaults to doing nothing, implement the
/// ones you care about. Sizes are `None` for untracked addresses.
#[allow(unused_variables)]
pub trait MemoryListener: Send + Sync {
    fn before_allocate(&self, size: u64) {}

    fn after_allocate(&self, address: u64, size: u64) {}

    fn before_free(&self, address: u64) {}

    fn after_free(&self, address: u64, size: Option<u64>, succeeded: bool) {}

    fn before_reallocate(&self, old_address: u64, old_size: Option<u64>) {}

    fn after_reallocate(
        &self,
        old_address: u64,
        old_size: Option<u64>,
        new_address: u64,
        new_size: u64,
        succeeded: bool,
    ) {
    }
}

/// The set of registered [`MemoryListener`]s. Reads vastly outnumber
/// writes, and when nobody is listening the hot path only pays for one
/// relaxed load.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn MemoryListener>>>,
    non_empty: AtomicBool,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. Registering the same `Arc` twice is a no-op.
    /// Returns whether the listener was added.
    pub fn register(&self, listener: Arc<dyn MemoryListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        self.non_empty.store(true, Ordering::Release);
        true
    }

    /// Remove `listener` (matched by `Arc` identity). Returns whether it was
    /// registered.
    pub fn deregister(&self, listener: &Arc<dyn MemoryListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        self.non_empty.store(!listeners.is_empty(), Ordering::Release);
        listeners.len() != before
    }

    #[inline]
    pub fn has_listeners(&self) -> bool {
        self.non_empty.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_listeners()
    }

    /// Call `f` on every listener. The set is copied first, so a listener
    /// may (de)register listeners without deadlocking.
    #[inline]
    pub fn for_each(&self, f: impl FnMut(&dyn MemoryListener)) {
        if !self.has_listeners() {
            return;
        }
        self.notify(f);
    }

    #[cold]
    fn notify(&self, mut f: impl FnMut(&dyn MemoryListener)) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}
