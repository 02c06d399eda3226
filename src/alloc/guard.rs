//! The guarded operation layer.
//!
//! A [`MemoryGuard`] is the one context object that everything hangs off: the
//! registry of live blocks, the optional access lock, the listeners, the
//! running total and the optional path catalogue. Every raw primitive goes
//! through it, gets validated (if the configuration asks for that), and only
//! then reaches the wrapped [`RawMemory`].

use std::{
    fmt,
    mem::size_of,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::ThreadId,
};

use parking_lot::RwLock;

use super::{
    listener::{AccessKind, IllegalAccessListener, ListenerSet, MemoryListener},
    lock::{AccessGuard, AccessLock},
    path::{BacktraceCapture, PathCapture, PathCatalogue, PathKey},
    raw::{AtomicScalar, Location, RawMemory, Scalar, SystemMemory},
    registry::{AllocRegistry, ExactRegistry, MemoryBlock, RangeRegistry},
    thread_aware::{AlwaysThreadLocal, ThreadAwareRegistry, ThreadLocalUsageDecider},
};
use crate::{
    config::{GuardConfig, RegistryStrategy},
    error::{GuardError, Result},
    util::hint::cold,
};

struct PathMonitor {
    catalogue: PathCatalogue,
    capture: Box<dyn PathCapture>,
}

pub struct MemoryGuard<M: RawMemory = SystemMemory> {
    config: GuardConfig,
    raw: M,
    registry: Arc<dyn AllocRegistry>,
    /// Same registry as above, if it routes per thread.
    thread_aware: Option<Arc<ThreadAwareRegistry>>,
    /// Only present when accesses are arbitrated against frees.
    lock: Option<AccessLock>,
    listeners: ListenerSet,
    illegal: RwLock<Option<Arc<dyn IllegalAccessListener>>>,
    /// Bytes in live blocks.
    allocated: AtomicU64,
    paths: Option<PathMonitor>,
}

/// Explicit wiring of a [`MemoryGuard`]. Anything not supplied is derived
/// from the [`GuardConfig`].
pub struct GuardBuilder<M: RawMemory = SystemMemory> {
    raw: M,
    config: GuardConfig,
    registry: Option<Arc<dyn AllocRegistry>>,
    decider: Option<Box<dyn ThreadLocalUsageDecider>>,
    illegal: Option<Arc<dyn IllegalAccessListener>>,
    capture: Option<Box<dyn PathCapture>>,
    listeners: Vec<Arc<dyn MemoryListener>>,
}

impl GuardBuilder<SystemMemory> {
    pub fn new() -> Self {
        Self::with_raw(SystemMemory)
    }
}

impl Default for GuardBuilder<SystemMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMemory> GuardBuilder<M> {
    pub fn with_raw(raw: M) -> Self {
        Self {
            raw,
            config: GuardConfig::default(),
            registry: None,
            decider: None,
            illegal: None,
            capture: None,
            listeners: Vec::new(),
        }
    }

    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `registry` as is. This overrides the registry strategy and the
    /// thread-local routing of the configuration.
    pub fn registry(mut self, registry: impl AllocRegistry + 'static) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Decides which threads get a private registry. Only used with
    /// `thread_local_memory_usage`, and without it every thread does.
    pub fn decider(mut self, decider: impl ThreadLocalUsageDecider + 'static) -> Self {
        self.decider = Some(Box::new(decider));
        self
    }

    pub fn illegal_access_listener(mut self, listener: impl IllegalAccessListener + 'static) -> Self {
        self.illegal = Some(Arc::new(listener));
        self
    }

    /// How allocation paths are captured. Only used with
    /// `allocation_path_monitoring`, and defaults to [`BacktraceCapture`].
    pub fn path_capture(mut self, capture: impl PathCapture + 'static) -> Self {
        self.capture = Some(Box::new(capture));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn MemoryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<MemoryGuard<M>> {
        let config = self.config;
        let (registry, thread_aware) = match self.registry {
            Some(registry) => (registry, None),
            None => {
                config.validate()?;
                wire_registry(&config, self.decider)
            }
        };

        let paths = config.allocation_path_monitoring.then(|| PathMonitor {
            catalogue: PathCatalogue::new(),
            capture: self
                .capture
                .unwrap_or_else(|| Box::new(BacktraceCapture::default())),
        });

        let listeners = ListenerSet::new();
        for listener in self.listeners {
            listeners.register(listener);
        }

        log::debug!("memory guard ready with {config:?}");
        Ok(MemoryGuard {
            lock: config.arbitrates_access().then(AccessLock::new),
            config,
            raw: self.raw,
            registry,
            thread_aware,
            listeners,
            illegal: RwLock::new(self.illegal),
            allocated: AtomicU64::new(0),
            paths,
        })
    }
}

fn new_registry(strategy: RegistryStrategy) -> Box<dyn AllocRegistry> {
    match strategy {
        RegistryStrategy::Exact => Box::new(ExactRegistry::new()),
        RegistryStrategy::Range | RegistryStrategy::Auto => Box::new(RangeRegistry::new()),
    }
}

fn wire_registry(
    config: &GuardConfig,
    decider: Option<Box<dyn ThreadLocalUsageDecider>>,
) -> (Arc<dyn AllocRegistry>, Option<Arc<ThreadAwareRegistry>>) {
    let strategy = config.resolved_registry();
    if !config.thread_local_memory_usage {
        if decider.is_some() {
            log::debug!("thread-local memory usage is off, ignoring the decider");
        }
        return (Arc::from(new_registry(strategy)), None);
    }
    let thread_aware = Arc::new(ThreadAwareRegistry::new(
        new_registry(strategy),
        move || new_registry(strategy),
        decider.unwrap_or_else(|| Box::new(AlwaysThreadLocal)),
    ));
    let registry: Arc<dyn AllocRegistry> = thread_aware.clone();
    (registry, Some(thread_aware))
}

impl MemoryGuard<SystemMemory> {
    pub fn builder() -> GuardBuilder<SystemMemory> {
        GuardBuilder::new()
    }

    /// A guard over `libc` configured by `config`.
    pub fn new(config: GuardConfig) -> Result<Self> {
        GuardBuilder::new().config(config).build()
    }
}

// Lifecycle.
impl<M: RawMemory> MemoryGuard<M> {
    /// Allocate `size` bytes and start tracking them.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        self.listeners.for_each(|l| l.before_allocate(size));
        let address = self.raw.allocate(size);
        if address == 0 {
            return Err(cold(|| {
                log::error!("could not allocate {size} bytes");
                GuardError::AllocationFailed { size }
            }));
        }

        self.registry.put(address, size);
        self.allocated.fetch_add(size, Ordering::Relaxed);
        if let Some(paths) = &self.paths {
            paths.catalogue.record(address, paths.capture.capture());
        }
        self.listeners.for_each(|l| l.after_allocate(address, size));
        log::debug!("allocated memory at address {address:#018x} with size {size}");
        Ok(address)
    }

    /// Free the block at `address`.
    ///
    /// # Safety
    ///
    /// Tracked addresses are always safe to free. With safe memory
    /// management off, an untracked `address` is handed to the raw allocator
    /// as is, so it must be something the raw allocator can free.
    pub unsafe fn free(&self, address: u64) -> Result<()> {
        self.listeners.for_each(|l| l.before_free(address));
        match self.registry.remove(address) {
            Some(size) => {
                // Must happen before the raw free, the address may be handed
                // out again right after it.
                if let Some(paths) = &self.paths {
                    paths.catalogue.forget(address);
                }
                // SAFETY: the block was live and we removed it, nobody else
                // will free it
                unsafe { self.free_raw(address) };
                self.allocated.fetch_sub(size, Ordering::Relaxed);
                self.listeners
                    .for_each(|l| l.after_free(address, Some(size), true));
                log::debug!("freed memory at address {address:#018x}");
                Ok(())
            }
            None if self.config.safe_memory_management => Err(cold(|| self.unknown_free(address))),
            None => {
                log::warn!(
                    "freeing unallocated (or out of the record) memory at address {address:#018x}"
                );
                // SAFETY: requirement passed to caller
                unsafe { self.free_raw(address) };
                self.listeners.for_each(|l| l.after_free(address, None, false));
                Ok(())
            }
        }
    }

    /// Resize the block at `address` to `new_size` bytes, possibly moving it.
    /// Returns the new address, which is `0` only if `new_size` was `0` and
    /// the raw allocator released the block.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::free()`].
    pub unsafe fn reallocate(&self, address: u64, new_size: u64) -> Result<u64> {
        let Some(old_size) = self.registry.remove(address) else {
            if self.config.safe_memory_management {
                return Err(cold(|| self.unknown_reallocate(address, new_size)));
            }
            log::warn!(
                "reallocating unallocated (or out of the record) memory at address \
                 {address:#018x} with new size {new_size}"
            );
            // SAFETY: requirement passed to caller
            let new_address = unsafe { self.reallocate_raw(address, new_size) };
            // Nothing is known about the block, so it stays untracked.
            self.listeners
                .for_each(|l| l.after_reallocate(address, None, new_address, new_size, false));
            return Ok(new_address);
        };

        self.listeners
            .for_each(|l| l.before_reallocate(address, Some(old_size)));
        let path = self
            .paths
            .as_ref()
            .and_then(|paths| paths.catalogue.forget(address));
        // SAFETY: the block was live and we removed it
        let new_address = unsafe { self.reallocate_raw(address, new_size) };

        if new_address == 0 && new_size != 0 {
            // The old block is untouched, so it is still ours.
            self.assign_path(address, path);
            self.registry.put(address, old_size);
            self.listeners
                .for_each(|l| l.after_reallocate(address, Some(old_size), 0, new_size, false));
            return Err(cold(|| {
                log::error!("could not reallocate {address:#018x} to {new_size} bytes");
                GuardError::ReallocationFailed { address, new_size }
            }));
        }

        if new_address == 0 {
            self.allocated.fetch_sub(old_size, Ordering::Relaxed);
        } else {
            self.assign_path(new_address, path);
            self.registry.put(new_address, new_size);
            if new_size >= old_size {
                self.allocated.fetch_add(new_size - old_size, Ordering::Relaxed);
            } else {
                self.allocated.fetch_sub(old_size - new_size, Ordering::Relaxed);
            }
        }
        self.listeners.for_each(|l| {
            l.after_reallocate(address, Some(old_size), new_address, new_size, true)
        });
        log::debug!(
            "reallocated memory from address {address:#018x} with size {old_size} \
             to address {new_address:#018x} with size {new_size}"
        );
        Ok(new_address)
    }

    fn assign_path(&self, address: u64, path: Option<PathKey>) {
        if let (Some(paths), Some(key)) = (&self.paths, path) {
            paths.catalogue.assign(address, key);
        }
    }

    /// # Safety
    ///
    /// As for [`RawMemory::free()`].
    unsafe fn free_raw(&self, address: u64) {
        let _free = self.lock.as_ref().map(AccessLock::free);
        // SAFETY: requirement passed to caller
        unsafe { self.raw.free(address) }
    }

    /// # Safety
    ///
    /// As for [`RawMemory::reallocate()`].
    unsafe fn reallocate_raw(&self, address: u64, new_size: u64) -> u64 {
        let _free = self.lock.as_ref().map(AccessLock::free);
        // SAFETY: requirement passed to caller
        unsafe { self.raw.reallocate(address, new_size) }
    }

    fn unknown_free(&self, address: u64) -> GuardError {
        self.listeners.for_each(|l| l.after_free(address, None, false));
        self.notify_illegal(address, None, AccessKind::Free);
        let error = GuardError::UnknownFree { address };
        log::error!("{error}");
        error
    }

    fn unknown_reallocate(&self, address: u64, new_size: u64) -> GuardError {
        self.listeners.for_each(|l| l.before_reallocate(address, None));
        self.notify_illegal(address, None, AccessKind::Reallocate);
        let error = GuardError::UnknownReallocate { address, new_size };
        log::error!("{error}");
        error
    }
}

// Validation.
impl<M: RawMemory> MemoryGuard<M> {
    /// Validate a `size` byte access at `at`. On success the returned guard
    /// (if any) must be held until the raw operation is done.
    #[inline]
    fn check(&self, at: Location, size: u64, kind: AccessKind) -> Result<Option<AccessGuard<'_>>> {
        if !self.config.safe_memory_access {
            return Ok(None);
        }
        let Some(address) = at.absolute() else {
            return Ok(None);
        };
        let access = self.lock.as_ref().map(AccessLock::access);
        if self.registry.contains(address, size) {
            return Ok(access);
        }
        drop(access);
        Err(cold(|| self.violation(address, size, kind)))
    }

    /// Like [`MemoryGuard::check()`], for a copy reading `src` and writing
    /// `dst`. Both ranges are checked under one hold of the lock.
    fn check_copy(&self, src: Location, dst: Location, bytes: u64) -> Result<Option<AccessGuard<'_>>> {
        if !self.config.safe_memory_access {
            return Ok(None);
        }
        let (src, dst) = (src.absolute(), dst.absolute());
        if src.is_none() && dst.is_none() {
            return Ok(None);
        }
        let access = self.lock.as_ref().map(AccessLock::access);
        let checks = [(src, AccessKind::Read), (dst, AccessKind::Write)];
        for (address, kind) in checks {
            if let Some(address) = address {
                if !self.registry.contains(address, bytes) {
                    drop(access);
                    return Err(cold(|| self.violation(address, bytes, kind)));
                }
            }
        }
        Ok(access)
    }

    fn violation(&self, address: u64, size: u64, kind: AccessKind) -> GuardError {
        self.notify_illegal(address, Some(size), kind);
        let error = GuardError::AccessViolation {
            address,
            size,
            kind,
        };
        log::error!("{error}");
        error
    }

    fn notify_illegal(&self, address: u64, size: Option<u64>, kind: AccessKind) {
        let listener = self.illegal.read().clone();
        if let Some(listener) = listener {
            listener.on_illegal_access(address, size, kind);
        }
    }
}

/// Width of `T` in bytes, as an access size.
#[inline]
const fn width<T>() -> u64 {
    size_of::<T>() as u64
}

// Accesses. All of these are unsafe: only absolute locations are validated,
// and only with safe memory access on. Alignment is never checked.
impl<M: RawMemory> MemoryGuard<M> {
    /// # Safety
    ///
    /// Unless validated, `at` must be valid for reads of `T`.
    pub unsafe fn get<T: Scalar>(&self, at: impl Into<Location>) -> Result<T> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::Read)?;
        log::trace!("get {} at {at}", tynm::type_name::<T>());
        // SAFETY: validated, or requirement passed to caller
        Ok(unsafe { self.raw.get(at) })
    }

    /// # Safety
    ///
    /// Unless validated, `at` must be valid for writes of `T`.
    pub unsafe fn put<T: Scalar>(&self, at: impl Into<Location>, value: T) -> Result<()> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::Write)?;
        log::trace!("put {} {value:?} at {at}", tynm::type_name::<T>());
        // SAFETY: validated, or requirement passed to caller
        unsafe { self.raw.put(at, value) };
        Ok(())
    }

    /// # Safety
    ///
    /// `at` must be aligned for `T`, and unless validated, valid for reads.
    pub unsafe fn get_volatile<T: Scalar>(&self, at: impl Into<Location>) -> Result<T> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::Read)?;
        log::trace!("get volatile {} at {at}", tynm::type_name::<T>());
        // SAFETY: validated, or requirement passed to caller
        Ok(unsafe { self.raw.get_volatile(at) })
    }

    /// # Safety
    ///
    /// `at` must be aligned for `T`, and unless validated, valid for writes.
    pub unsafe fn put_volatile<T: Scalar>(&self, at: impl Into<Location>, value: T) -> Result<()> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::Write)?;
        log::trace!("put volatile {} {value:?} at {at}", tynm::type_name::<T>());
        // SAFETY: validated, or requirement passed to caller
        unsafe { self.raw.put_volatile(at, value) };
        Ok(())
    }

    /// A release store.
    ///
    /// # Safety
    ///
    /// `at` must be aligned for `T`, and unless validated, valid for writes.
    pub unsafe fn put_ordered<T: AtomicScalar>(&self, at: impl Into<Location>, value: T) -> Result<()> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::Write)?;
        log::trace!("put ordered {} {value:?} at {at}", tynm::type_name::<T>());
        // SAFETY: validated, or requirement passed to caller
        unsafe { self.raw.put_ordered(at, value) };
        Ok(())
    }

    /// Returns whether `new` was stored.
    ///
    /// # Safety
    ///
    /// `at` must be aligned for `T`, and unless validated, valid for reads
    /// and writes.
    pub unsafe fn compare_and_swap<T: AtomicScalar>(
        &self,
        at: impl Into<Location>,
        expected: T,
        new: T,
    ) -> Result<bool> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::ReadWrite)?;
        log::trace!(
            "compare and swap {} {expected:?} -> {new:?} at {at}",
            tynm::type_name::<T>()
        );
        // SAFETY: validated, or requirement passed to caller
        Ok(unsafe { self.raw.compare_and_swap(at, expected, new) })
    }

    /// Wrapping add, returning the previous value.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::compare_and_swap()`].
    pub unsafe fn get_and_add<T: AtomicScalar>(&self, at: impl Into<Location>, delta: T) -> Result<T> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::ReadWrite)?;
        log::trace!("get and add {} {delta:?} at {at}", tynm::type_name::<T>());
        // SAFETY: validated, or requirement passed to caller
        Ok(unsafe { self.raw.get_and_add(at, delta) })
    }

    /// Swap in `value`, returning the previous value.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::compare_and_swap()`].
    pub unsafe fn get_and_set<T: AtomicScalar>(&self, at: impl Into<Location>, value: T) -> Result<T> {
        let at = at.into();
        let _access = self.check(at, width::<T>(), AccessKind::ReadWrite)?;
        log::trace!("get and set {} {value:?} at {at}", tynm::type_name::<T>());
        // SAFETY: validated, or requirement passed to caller
        Ok(unsafe { self.raw.get_and_set(at, value) })
    }

    /// A single byte, anything non-zero is `true`.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::get()`].
    pub unsafe fn get_bool(&self, at: impl Into<Location>) -> Result<bool> {
        // SAFETY: requirement passed to caller
        Ok(unsafe { self.get::<u8>(at) }? != 0)
    }

    /// # Safety
    ///
    /// As for [`MemoryGuard::put()`].
    pub unsafe fn put_bool(&self, at: impl Into<Location>, value: bool) -> Result<()> {
        // SAFETY: requirement passed to caller
        unsafe { self.put::<u8>(at, value as u8) }
    }

    /// A pointer-width address.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::get()`].
    pub unsafe fn get_address(&self, at: impl Into<Location>) -> Result<u64> {
        // SAFETY: requirement passed to caller
        Ok(unsafe { self.get::<usize>(at) }? as u64)
    }

    /// # Safety
    ///
    /// As for [`MemoryGuard::put()`].
    pub unsafe fn put_address(&self, at: impl Into<Location>, address: u64) -> Result<()> {
        // SAFETY: requirement passed to caller
        unsafe { self.put::<usize>(at, address as usize) }
    }

    /// Fill `bytes` bytes at `at` with `value`.
    ///
    /// # Safety
    ///
    /// Unless validated, `at` must be valid for writes of `bytes` bytes.
    pub unsafe fn set_memory(&self, at: impl Into<Location>, bytes: u64, value: u8) -> Result<()> {
        let at = at.into();
        let _access = self.check(at, bytes, AccessKind::Write)?;
        log::trace!("set {bytes} bytes to {value:#04x} at {at}");
        // SAFETY: validated, or requirement passed to caller
        unsafe { self.raw.set_memory(at, bytes, value) };
        Ok(())
    }

    /// Copy `bytes` bytes from `src` to `dst`. The ranges may overlap.
    ///
    /// # Safety
    ///
    /// Unless validated, `src` must be valid for reads and `dst` for writes
    /// of `bytes` bytes.
    pub unsafe fn copy_memory(
        &self,
        src: impl Into<Location>,
        dst: impl Into<Location>,
        bytes: u64,
    ) -> Result<()> {
        let (src, dst) = (src.into(), dst.into());
        let _access = self.check_copy(src, dst, bytes)?;
        log::trace!("copy {bytes} bytes from {src} to {dst}");
        // SAFETY: validated, or requirement passed to caller
        unsafe { self.raw.copy_memory(src, dst, bytes) };
        Ok(())
    }
}

// Introspection.
impl<M: RawMemory> MemoryGuard<M> {
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn is_safe_memory_management_enabled(&self) -> bool {
        self.config.safe_memory_management
    }

    pub fn is_safe_memory_access_enabled(&self) -> bool {
        self.config.safe_memory_access
    }

    /// Bytes in live blocks.
    pub fn allocated_memory(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Is `[address, address + size)` inside one live block?
    pub fn contains(&self, address: u64, size: u64) -> bool {
        self.registry.contains(address, size)
    }

    /// Visit every live block. See [`AllocRegistry::iterate()`] for what
    /// that means under concurrent modification.
    pub fn iterate(&self, mut visitor: impl FnMut(MemoryBlock)) {
        self.registry.iterate(&mut visitor);
    }

    pub fn registry(&self) -> &dyn AllocRegistry {
        self.registry.as_ref()
    }

    pub fn raw(&self) -> &M {
        &self.raw
    }

    /// The access lock, if accesses are arbitrated.
    pub fn access_lock(&self) -> Option<&AccessLock> {
        self.lock.as_ref()
    }

    /// The path catalogue, if allocation paths are monitored.
    pub fn paths(&self) -> Option<&PathCatalogue> {
        self.paths.as_ref().map(|paths| &paths.catalogue)
    }

    /// Hand the private registry of a finished thread over to the shared
    /// one. Returns how many blocks moved, `0` without thread-local routing.
    pub fn retire_thread(&self, id: ThreadId) -> usize {
        self.thread_aware
            .as_ref()
            .map_or(0, |registry| registry.retire_thread(id))
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn register_listener(&self, listener: Arc<dyn MemoryListener>) -> bool {
        self.listeners.register(listener)
    }

    pub fn deregister_listener(&self, listener: &Arc<dyn MemoryListener>) -> bool {
        self.listeners.deregister(listener)
    }

    pub fn illegal_access_listener(&self) -> Option<Arc<dyn IllegalAccessListener>> {
        self.illegal.read().clone()
    }

    /// Returns the listener that was replaced.
    pub fn set_illegal_access_listener(
        &self,
        listener: Arc<dyn IllegalAccessListener>,
    ) -> Option<Arc<dyn IllegalAccessListener>> {
        self.illegal.write().replace(listener)
    }

    pub fn clear_illegal_access_listener(&self) -> Option<Arc<dyn IllegalAccessListener>> {
        self.illegal.write().take()
    }
}

impl<M: RawMemory> fmt::Debug for MemoryGuard<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("config", &self.config)
            .field("allocated", &self.allocated_memory())
            .field("blocks", &self.registry.len())
            .field("lock", &self.lock)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, OnceLock, Weak};

    use super::*;
    use crate::alloc::path::{CallSite, CapturedPath};

    /// `libc` underneath. Right before memory goes back to `libc`, looks up
    /// which path the guard still attributes the address to.
    #[derive(Default)]
    struct PathWitness {
        guard: OnceLock<Weak<MemoryGuard<PathWitness>>>,
        keys_on_release: Mutex<Vec<Option<PathKey>>>,
    }

    impl PathWitness {
        fn look(&self, address: u64) {
            if let Some(guard) = self.guard.get().and_then(Weak::upgrade) {
                let key = guard.paths().and_then(|paths| paths.key_of(address));
                self.keys_on_release.lock().unwrap().push(key);
            }
        }
    }

    unsafe impl RawMemory for PathWitness {
        fn allocate(&self, size: u64) -> u64 {
            SystemMemory.allocate(size)
        }

        unsafe fn free(&self, address: u64) {
            self.look(address);
            unsafe { SystemMemory.free(address) }
        }

        unsafe fn reallocate(&self, address: u64, new_size: u64) -> u64 {
            self.look(address);
            unsafe { SystemMemory.reallocate(address, new_size) }
        }
    }

    fn guard(config: GuardConfig) -> MemoryGuard {
        MemoryGuard::new(config).unwrap()
    }

    fn strict() -> GuardConfig {
        GuardConfig {
            safe_memory_management: true,
            safe_memory_access: true,
            concurrent_access_check: true,
            ..Default::default()
        }
    }

    #[test]
    fn allocate_and_free_keep_the_books() {
        let guard = guard(GuardConfig::default());
        let a = guard.allocate(100).unwrap();
        let b = guard.allocate(28).unwrap();
        assert_eq!(guard.allocated_memory(), 128);
        assert_eq!(guard.registry().len(), 2);
        unsafe {
            guard.free(a).unwrap();
            assert_eq!(guard.allocated_memory(), 28);
            guard.free(b).unwrap();
        }
        assert_eq!(guard.allocated_memory(), 0);
        assert!(guard.registry().is_empty());
    }

    #[test]
    fn strict_unknown_free_is_refused() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let guard = {
            let seen = Arc::clone(&seen);
            MemoryGuard::builder()
                .config(strict())
                .illegal_access_listener(move |address: u64, size: Option<u64>, kind: AccessKind| {
                    seen.lock().unwrap().push((address, size, kind))
                })
                .build()
                .unwrap()
        };
        let err = unsafe { guard.free(0xdead_0000) }.unwrap_err();
        assert!(matches!(err, GuardError::UnknownFree { address: 0xdead_0000 }));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0xdead_0000, None, AccessKind::Free)]
        );

        let err = unsafe { guard.reallocate(0xdead_0000, 8) }.unwrap_err();
        assert!(matches!(err, GuardError::UnknownReallocate { new_size: 8, .. }));
        assert_eq!(seen.lock().unwrap()[1].2, AccessKind::Reallocate);
    }

    #[test]
    fn violations_never_touch_memory() {
        let guard = guard(strict());
        let a = guard.allocate(16).unwrap();
        unsafe {
            guard.put::<u64>(a + 8, 7).unwrap();
            let err = guard.put::<u64>(a + 12, 9).unwrap_err();
            assert!(matches!(
                err,
                GuardError::AccessViolation { size: 8, kind: AccessKind::Write, .. }
            ));
            assert_eq!(guard.get::<u64>(a + 8).unwrap(), 7);
            assert!(guard.compare_and_swap::<u64>(a + 8, 7, 8).unwrap());
            assert!(matches!(
                guard.get_and_add::<u32>(a + 16, 1),
                Err(GuardError::AccessViolation { kind: AccessKind::ReadWrite, .. })
            ));
            assert_eq!(guard.access_lock().map(AccessLock::state), Some(0));
            guard.free(a).unwrap();
            assert!(guard.get::<u8>(a).is_err());
        }
    }

    #[test]
    fn object_relative_accesses_are_not_checked() {
        let guard = guard(strict());
        let mut value = [0u32; 2];
        let mut flags = [0u8; 4];
        unsafe {
            guard.put::<u32>(Location::from(&mut value).offset(4), 5).unwrap();
            guard.put_bool(Location::from(&mut flags).offset(3), true).unwrap();
            assert!(guard.get_bool(Location::from(&mut flags).offset(3)).unwrap());
        }
        assert_eq!(value, [0, 5]);
        assert_eq!(flags, [0, 0, 0, 1]);
    }

    #[test]
    fn copy_checks_both_sides() {
        let guard = guard(strict());
        let a = guard.allocate(32).unwrap();
        let b = guard.allocate(16).unwrap();
        unsafe {
            guard.set_memory(a, 32, 0xab).unwrap();
            guard.copy_memory(a, b, 16).unwrap();
            assert_eq!(guard.get::<u8>(b + 15).unwrap(), 0xab);
            assert!(matches!(
                guard.copy_memory(a, b, 32),
                Err(GuardError::AccessViolation { kind: AccessKind::Write, .. })
            ));
            assert!(matches!(
                guard.copy_memory(b, a, 32),
                Err(GuardError::AccessViolation { kind: AccessKind::Read, .. })
            ));
            guard.free(a).unwrap();
            guard.free(b).unwrap();
        }
    }

    #[test]
    fn reallocate_keeps_the_books_and_the_path() {
        let guard = MemoryGuard::builder()
            .config(GuardConfig {
                allocation_path_monitoring: true,
                ..strict()
            })
            .path_capture(|| CapturedPath {
                key: PathKey(42),
                call_sites: vec![CallSite("grow_buffer".into())],
            })
            .build()
            .unwrap();
        let a = guard.allocate(16).unwrap();
        unsafe {
            guard.put::<u64>(a, 0x0102_0304_0506_0708).unwrap();
            let b = guard.reallocate(a, 4096).unwrap();
            assert_eq!(guard.allocated_memory(), 4096);
            assert_eq!(guard.get::<u64>(b).unwrap(), 0x0102_0304_0506_0708);
            assert!(guard.contains(b + 4000, 96));

            let paths = guard.paths().unwrap();
            assert_eq!(paths.key_of(b), Some(PathKey(42)));
            if a != b {
                assert_eq!(paths.key_of(a), None);
            }
            guard.free(b).unwrap();
        }
        assert_eq!(guard.allocated_memory(), 0);
    }

    #[test]
    fn paths_are_dropped_before_memory_is_released() {
        let guard = Arc::new(
            GuardBuilder::with_raw(PathWitness::default())
                .config(GuardConfig {
                    allocation_path_monitoring: true,
                    ..Default::default()
                })
                .path_capture(|| CapturedPath {
                    key: PathKey(7),
                    call_sites: vec![CallSite("scratch".into())],
                })
                .build()
                .unwrap(),
        );
        assert!(guard.raw().guard.set(Arc::downgrade(&guard)).is_ok());

        let a = guard.allocate(16).unwrap();
        let b = guard.allocate(16).unwrap();
        unsafe {
            guard.free(a).unwrap();
            let b = guard.reallocate(b, 256).unwrap();
            assert_eq!(guard.paths().unwrap().key_of(b), Some(PathKey(7)));
            guard.free(b).unwrap();
        }
        assert_eq!(*guard.raw().keys_on_release.lock().unwrap(), vec![None; 3]);
        assert_eq!(guard.paths().unwrap().nr_paths(), 1);
    }

    #[test]
    fn exact_registry_with_access_checks_is_rejected() {
        let result = MemoryGuard::new(GuardConfig {
            safe_memory_access: true,
            registry: RegistryStrategy::Exact,
            ..Default::default()
        });
        assert!(matches!(result, Err(GuardError::Config(_))));

        let guard = MemoryGuard::builder()
            .config(GuardConfig {
                safe_memory_access: true,
                registry: RegistryStrategy::Exact,
                ..Default::default()
            })
            .registry(RangeRegistry::new())
            .build();
        assert!(guard.is_ok());
    }
}
