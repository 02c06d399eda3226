#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Mutex,
};

use hashbrown::HashSet;
use offheap_guard::{Location, RawMemory, SystemMemory};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `libc` underneath, but only frees what it handed out itself. Anything
/// else is counted as a foreign free.
#[derive(Default)]
pub struct Ledger {
    live: Mutex<HashSet<u64>>,
    pub foreign_frees: AtomicU64,
    pub frees: AtomicU64,
}

unsafe impl RawMemory for Ledger {
    fn allocate(&self, size: u64) -> u64 {
        let address = SystemMemory.allocate(size);
        self.live.lock().unwrap().insert(address);
        address
    }

    unsafe fn free(&self, address: u64) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        if self.live.lock().unwrap().remove(&address) {
            unsafe { SystemMemory.free(address) }
        } else {
            self.foreign_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    unsafe fn reallocate(&self, address: u64, new_size: u64) -> u64 {
        let mut live = self.live.lock().unwrap();
        if !live.remove(&address) {
            self.foreign_frees.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let new_address = unsafe { SystemMemory.reallocate(address, new_size) };
        live.insert(new_address);
        new_address
    }
}

/// Records whether a raw read ever ran at the same time as a raw free.
#[derive(Default)]
pub struct Timeline {
    reads: AtomicI64,
    frees: AtomicI64,
    pub overlaps: AtomicU64,
    pub nr_reads: AtomicU64,
}

unsafe impl RawMemory for Timeline {
    fn allocate(&self, size: u64) -> u64 {
        SystemMemory.allocate(size)
    }

    unsafe fn free(&self, address: u64) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        if self.reads.load(Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        unsafe { SystemMemory.free(address) };
        self.frees.fetch_sub(1, Ordering::SeqCst);
    }

    unsafe fn reallocate(&self, address: u64, new_size: u64) -> u64 {
        self.frees.fetch_add(1, Ordering::SeqCst);
        if self.reads.load(Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let new_address = unsafe { SystemMemory.reallocate(address, new_size) };
        self.frees.fetch_sub(1, Ordering::SeqCst);
        new_address
    }

    unsafe fn get<T: offheap_guard::alloc::raw::Scalar>(&self, at: Location) -> T {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.frees.load(Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let value = unsafe { SystemMemory.get(at) };
        self.nr_reads.fetch_add(1, Ordering::Relaxed);
        self.reads.fetch_sub(1, Ordering::SeqCst);
        value
    }
}
