//! The access/free arbitration lock.
//!
//! Accesses (reads, writes, atomics) may run alongside each other, but never
//! alongside a free. The whole thing is one signed counter:
//!
//! ```plaintext
//!  state == 0  -> idle
//!  state  > 0  -> `state` accesses in flight
//!  state  < 0  -> `-state` frees in flight
//! ```
//!
//! plus two waiter counters that exist only for fairness. An acquirer that
//! sees a waiter of the *other* kind backs off until the current holders
//! drain, so a steady stream of accesses can't starve a pending free
//! forever (and vice versa). It is biased rather than FIFO: waiters of the
//! same kind are not ordered among themselves.
//!
//! Nothing here ever sleeps in the kernel. Acquisition spins until the
//! conflicting holder releases, however long that takes.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

#[derive(Debug, Default)]
pub struct AccessLock {
    state: CachePadded<AtomicI32>,
    access_waiters: AtomicU32,
    free_waiters: AtomicU32,
}

/// RAII access side of the lock. `Drop` impl releases it.
#[must_use = "the access lock is released as soon as the guard is dropped"]
pub struct AccessGuard<'a> {
    lock: &'a AccessLock,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_access();
    }
}

/// RAII free side of the lock. `Drop` impl releases it.
#[must_use = "the free lock is released as soon as the guard is dropped"]
pub struct FreeGuard<'a> {
    lock: &'a AccessLock,
}

impl Drop for FreeGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_free();
    }
}

impl AccessLock {
    pub const fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicI32::new(0)),
            access_waiters: AtomicU32::new(0),
            free_waiters: AtomicU32::new(0),
        }
    }

    /// Acquire the access side and hold it until the guard is dropped.
    pub fn access(&self) -> AccessGuard<'_> {
        self.acquire_access();
        AccessGuard { lock: self }
    }

    /// Acquire the free side and hold it until the guard is dropped.
    pub fn free(&self) -> FreeGuard<'_> {
        self.acquire_free();
        FreeGuard { lock: self }
    }

    /// Join the current accesses. Waits out any free in flight, and if a
    /// free is waiting, lets it go first by waiting for the current accesses
    /// to drain.
    ///
    /// Every call must be matched by exactly one [`AccessLock::release_access()`].
    pub fn acquire_access(&self) {
        self.access_waiters.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.free_waiters.load(Ordering::Acquire) > 0 {
                while self.state.load(Ordering::Acquire) > 0 {
                    backoff.spin();
                }
            }
            let current = self.state.load(Ordering::Acquire);
            if current >= 0
                && self
                    .state
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
            backoff.spin();
        }
        self.access_waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Take the lock for a free. Waits out any accesses in flight, and if an
    /// access is waiting, lets it go first by waiting for the current frees
    /// to drain.
    ///
    /// Every call must be matched by exactly one [`AccessLock::release_free()`].
    pub fn acquire_free(&self) {
        self.free_waiters.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.access_waiters.load(Ordering::Acquire) > 0 {
                while self.state.load(Ordering::Acquire) < 0 {
                    backoff.spin();
                }
            }
            let current = self.state.load(Ordering::Acquire);
            if current <= 0
                && self
                    .state
                    .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
            backoff.spin();
        }
        self.free_waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// # Panics
    ///
    /// - In debug mode if no access is held
    pub fn release_access(&self) {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(
            previous > 0,
            "state must be positive while releasing the access lock but it is {previous}"
        );
    }

    /// # Panics
    ///
    /// - In debug mode if no free is held
    pub fn release_free(&self) {
        let previous = self.state.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            previous < 0,
            "state must be negative while releasing the free lock but it is {previous}"
        );
    }

    /// Current raw state, see the module docs for the encoding.
    pub fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    pub fn access_waiters(&self) -> u32 {
        self.access_waiters.load(Ordering::Acquire)
    }

    pub fn free_waiters(&self) -> u32 {
        self.free_waiters.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicI64},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn accesses_share_the_lock() {
        let lock = AccessLock::new();
        let a = lock.access();
        let b = lock.access();
        assert_eq!(lock.state(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.state(), 0);
        let f = lock.free();
        assert_eq!(lock.state(), -1);
        drop(f);
        assert_eq!(lock.state(), 0);
    }

    #[test]
    fn free_waits_for_accesses_to_drain() {
        let lock = Arc::new(AccessLock::new());
        let freed = Arc::new(AtomicBool::new(false));
        let access = lock.access();

        let handle = {
            let lock = Arc::clone(&lock);
            let freed = Arc::clone(&freed);
            thread::spawn(move || {
                let _free = lock.free();
                freed.store(true, Ordering::Release);
            })
        };

        while lock.free_waiters() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!freed.load(Ordering::Acquire));
        drop(access);
        handle.join().unwrap();
        assert!(freed.load(Ordering::Acquire));
        assert_eq!(lock.state(), 0);
    }

    /// Spawn a thread that takes one side of `lock`, raises `entered` and
    /// lets go again.
    fn enter(lock: &Arc<AccessLock>, free: bool) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = Arc::clone(lock);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                if free {
                    let _free = lock.free();
                    entered.store(true, Ordering::Release);
                } else {
                    let _access = lock.access();
                    entered.store(true, Ordering::Release);
                }
            })
        };
        (handle, entered)
    }

    #[test]
    fn new_accesses_yield_to_a_waiting_free() {
        let lock = Arc::new(AccessLock::new());
        let access = lock.access();

        let (freer, freed) = enter(&lock, true);
        while lock.free_waiters() == 0 {
            thread::yield_now();
        }
        let (reader, read) = enter(&lock, false);
        while lock.access_waiters() == 0 {
            thread::yield_now();
        }

        thread::sleep(Duration::from_millis(20));
        assert_eq!(lock.state(), 1);
        assert!(!read.load(Ordering::Acquire));
        assert!(!freed.load(Ordering::Acquire));

        drop(access);
        freer.join().unwrap();
        reader.join().unwrap();
        assert!(freed.load(Ordering::Acquire));
        assert!(read.load(Ordering::Acquire));
        assert_eq!(lock.state(), 0);
    }

    #[test]
    fn new_frees_yield_to_a_waiting_access() {
        let lock = Arc::new(AccessLock::new());
        let free = lock.free();

        let (reader, read) = enter(&lock, false);
        while lock.access_waiters() == 0 {
            thread::yield_now();
        }
        let (freer, freed) = enter(&lock, true);
        while lock.free_waiters() == 0 {
            thread::yield_now();
        }

        thread::sleep(Duration::from_millis(20));
        assert_eq!(lock.state(), -1);
        assert!(!freed.load(Ordering::Acquire));
        assert!(!read.load(Ordering::Acquire));

        drop(free);
        reader.join().unwrap();
        freer.join().unwrap();
        assert!(read.load(Ordering::Acquire));
        assert!(freed.load(Ordering::Acquire));
        assert_eq!(lock.state(), 0);
    }

    #[test]
    fn accesses_never_overlap_frees() {
        // +1 per access in flight, -1000 per free in flight. An access must
        // never see a free, a free must never see an access.
        let lock = Arc::new(AccessLock::new());
        let inside = Arc::new(AtomicI64::new(0));
        let mut handles = Vec::new();
        for i in 0..6 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    if i % 3 == 0 {
                        let _free = lock.free();
                        let seen = inside.fetch_sub(1000, Ordering::SeqCst);
                        assert!(seen <= 0 && seen % 1000 == 0);
                        inside.fetch_add(1000, Ordering::SeqCst);
                    } else {
                        let _access = lock.access();
                        let seen = inside.fetch_add(1, Ordering::SeqCst);
                        assert!(seen >= 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.state(), 0);
        assert_eq!(lock.access_waiters(), 0);
        assert_eq!(lock.free_waiters(), 0);
    }
}
