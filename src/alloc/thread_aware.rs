//! Routing of registry traffic to per-thread private registries.
//!
//! If a thread only ever uses its own scratch allocations, there is no point
//! in making it fight every other thread over one shared structure. A
//! [`ThreadLocalUsageDecider`] says which threads behave like that, and
//! [`ThreadAwareRegistry`] sends their `put`/`remove`/`contains` to a private
//! registry. This is purely a performance policy. A thread-local thread
//! looks in its private registry first and then in the shared one, so it also
//! sees blocks of retired threads. A block in another thread's private
//! registry stays invisible, so that lookup fails closed.

use std::{
    sync::Arc,
    thread::{self, Thread, ThreadId},
};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::registry::{AllocRegistry, MemoryBlock};

/// Decides whether a thread's allocations are private to it.
pub trait ThreadLocalUsageDecider: Send + Sync {
    fn is_thread_local(&self, thread: &Thread) -> bool;
}

/// Every thread keeps to itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysThreadLocal;

impl ThreadLocalUsageDecider for AlwaysThreadLocal {
    fn is_thread_local(&self, _: &Thread) -> bool {
        true
    }
}

/// Nothing is private, everything goes to the shared registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverThreadLocal;

impl ThreadLocalUsageDecider for NeverThreadLocal {
    fn is_thread_local(&self, _: &Thread) -> bool {
        false
    }
}

/// Threads whose name starts with one of the prefixes are thread-local.
/// Unnamed threads never are.
#[derive(Clone, Debug, Default)]
pub struct ThreadNamePrefixDecider {
    prefixes: Vec<String>,
}

impl ThreadNamePrefixDecider {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `:`-separated list of prefixes, e.g. `"worker-:io-"`. Empty
    /// segments are ignored.
    pub fn from_params(params: &str) -> Self {
        Self::new(params.split(':').filter(|prefix| !prefix.is_empty()))
    }
}

impl ThreadLocalUsageDecider for ThreadNamePrefixDecider {
    fn is_thread_local(&self, thread: &Thread) -> bool {
        thread
            .name()
            .is_some_and(|name| self.prefixes.iter().any(|prefix| name.starts_with(prefix)))
    }
}

type RegistryFactory = Box<dyn Fn() -> Box<dyn AllocRegistry> + Send + Sync>;

/// A registry that sends each calling thread either to a shared registry or
/// to its own private one.
pub struct ThreadAwareRegistry {
    shared: Box<dyn AllocRegistry>,
    locals: RwLock<HashMap<ThreadId, Arc<dyn AllocRegistry>, RandomState>>,
    new_local: RegistryFactory,
    decider: Box<dyn ThreadLocalUsageDecider>,
}

impl ThreadAwareRegistry {
    /// `new_local` builds the private registry for a thread the first time
    /// that thread needs one.
    pub fn new<F>(
        shared: Box<dyn AllocRegistry>,
        new_local: F,
        decider: Box<dyn ThreadLocalUsageDecider>,
    ) -> Self
    where
        F: Fn() -> Box<dyn AllocRegistry> + Send + Sync + 'static,
    {
        Self {
            shared,
            locals: RwLock::new(HashMap::with_hasher(RandomState::new())),
            new_local: Box::new(new_local),
            decider,
        }
    }

    /// The private registry of the calling thread, or `None` if the decider
    /// routes it to the shared one. Only created on `create`.
    fn local(&self, create: bool) -> Option<Arc<dyn AllocRegistry>> {
        let current = thread::current();
        if !self.decider.is_thread_local(&current) {
            return None;
        }
        let id = current.id();
        if let Some(local) = self.locals.read().get(&id) {
            return Some(Arc::clone(local));
        }
        if !create {
            return None;
        }
        let mut locals = self.locals.write();
        let local = locals
            .entry(id)
            .or_insert_with(|| Arc::from((self.new_local)()));
        Some(Arc::clone(local))
    }

    /// Is the calling thread routed to a private registry?
    pub fn is_current_thread_local(&self) -> bool {
        self.decider.is_thread_local(&thread::current())
    }

    /// Number of private registries created so far.
    pub fn nr_local_registries(&self) -> usize {
        self.locals.read().len()
    }

    /// Drop the private registry of a finished thread. Its remaining blocks
    /// are handed to the shared registry, where every thread can find and
    /// free them. Returns how many blocks moved.
    pub fn retire_thread(&self, id: ThreadId) -> usize {
        let Some(local) = self.locals.write().remove(&id) else {
            return 0;
        };
        let mut moved = 0;
        local.iterate(&mut |block| {
            self.shared.put(block.address, block.size);
            moved += 1;
        });
        if moved != 0 {
            log::debug!("moved {moved} blocks of retired thread {id:?} to the shared registry");
        }
        moved
    }
}

impl AllocRegistry for ThreadAwareRegistry {
    fn put(&self, address: u64, size: u64) {
        match self.local(true) {
            Some(local) => local.put(address, size),
            None => self.shared.put(address, size),
        }
    }

    fn remove(&self, address: u64) -> Option<u64> {
        self.local(false)
            .and_then(|local| local.remove(address))
            .or_else(|| self.shared.remove(address))
    }

    fn get(&self, address: u64) -> Option<u64> {
        self.local(false)
            .and_then(|local| local.get(address))
            .or_else(|| self.shared.get(address))
    }

    fn get_in_any_scope(&self, address: u64) -> Option<u64> {
        if let Some(size) = self.shared.get(address) {
            return Some(size);
        }
        let locals: Vec<_> = self.locals.read().values().cloned().collect();
        locals.iter().find_map(|local| local.get(address))
    }

    fn find(&self, address: u64) -> Option<MemoryBlock> {
        self.local(false)
            .and_then(|local| local.find(address))
            .or_else(|| self.shared.find(address))
    }

    fn contains(&self, address: u64, size: u64) -> bool {
        self.local(false)
            .is_some_and(|local| local.contains(address, size))
            || self.shared.contains(address, size)
    }

    fn overlaps(&self, address: u64, size: u64) -> bool {
        if self.shared.overlaps(address, size) {
            return true;
        }
        let locals: Vec<_> = self.locals.read().values().cloned().collect();
        locals.iter().any(|local| local.overlaps(address, size))
    }

    fn iterate(&self, visitor: &mut dyn FnMut(MemoryBlock)) {
        self.shared.iterate(visitor);
        let locals: Vec<_> = self.locals.read().values().cloned().collect();
        for local in locals {
            local.iterate(visitor);
        }
    }

    fn len(&self) -> usize {
        self.shared.len() + self.locals.read().values().map(|local| local.len()).sum::<usize>()
    }
}
