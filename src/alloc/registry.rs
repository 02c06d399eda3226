//! Bookkeeping for every live block: `address -> size`, plus the bounds
//! queries that access checking is built on.
//!
//! There are two flavours. [`ExactRegistry`] only knows about base
//! addresses, which makes it about as cheap as a hash map can be, but it
//! can't tell that `base + 8` is inside a block. [`RangeRegistry`] keeps
//! blocks ordered so an interior address resolves to its block with a floor
//! lookup, so that's the one you want for access checking.

use std::{cmp::Ordering, collections::BTreeMap};

use ahash::RandomState;
use crossbeam::utils::CachePadded;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::serialize::serde_addr;

/// A live block of raw memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// Where is this block?
    #[serde(with = "serde_addr")]
    pub address: u64,
    /// How big is it?
    pub size: u64,
}

impl MemoryBlock {
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    /// One past the last byte, saturating at the top of the address space.
    pub const fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    /// Tests if `address` is interior to this block. `Less` if it is below
    /// the block, `Greater` if it is at or past the end.
    pub fn test_interior(&self, address: u64) -> Ordering {
        // A pointer is either too low or too high, never both.
        //
        // |    address    | too_low | too_high |  Q |
        // |:-------------:|:-------:|:--------:|:--:|
        // | < address     |   -1    |    0     | -1 |
        // | >= end        |    0    |    1     |  1 |
        // | else          |    0    |    0     |  0 |
        let too_low = -((address < self.address) as i8);
        let too_high = (address >= self.end()) as i8;
        (too_low | too_high).cmp(&0)
    }

    /// Does `[address, address + size)` lie entirely within this block?
    pub fn contains_range(&self, address: u64, size: u64) -> bool {
        match address.checked_add(size) {
            Some(end) => address >= self.address && end <= self.end(),
            None => false,
        }
    }

    /// Do the two half-open ranges share at least one byte?
    pub fn overlaps(&self, address: u64, size: u64) -> bool {
        let end = address.saturating_add(size);
        size != 0 && self.size != 0 && address < self.end() && self.address < end
    }
}

/// The store of live blocks. All methods take `&self` and must be safe to
/// call from any number of threads at once.
pub trait AllocRegistry: Send + Sync {
    /// Insert or replace the block at `address`. Replacing is not an error,
    /// it just redefines the size of that block.
    fn put(&self, address: u64, size: u64);

    /// Detach the block at `address` and return its last size. `None` means
    /// the address is unknown. Two racing removes of the same address never
    /// both see `Some`.
    fn remove(&self, address: u64) -> Option<u64>;

    /// The size of the block based exactly at `address`.
    fn get(&self, address: u64) -> Option<u64>;

    /// Like [`AllocRegistry::get()`], but ignores which thread is asking.
    /// Only differs for registries that split blocks by thread.
    fn get_in_any_scope(&self, address: u64) -> Option<u64> {
        self.get(address)
    }

    /// The block that `address` falls into. Registries that only know base
    /// addresses answer for base addresses only.
    fn find(&self, address: u64) -> Option<MemoryBlock> {
        self.get(address).map(|size| MemoryBlock::new(address, size))
    }

    /// Is `[address, address + size)` entirely inside one live block?
    fn contains(&self, address: u64, size: u64) -> bool {
        self.find(address)
            .is_some_and(|block| block.contains_range(address, size))
    }

    /// Does `[address, address + size)` overlap any live block?
    fn overlaps(&self, address: u64, size: u64) -> bool;

    /// Visit every live block. There is no snapshot: blocks put or removed
    /// while this runs may or may not be visited.
    fn iterate(&self, visitor: &mut dyn FnMut(MemoryBlock));

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Shard = CachePadded<Mutex<HashMap<u64, u64, RandomState>>>;

/// Base-address-only registry. Blocks are spread over a fixed number of
/// independently locked shards so unrelated addresses rarely contend.
pub struct ExactRegistry {
    shards: Box<[Shard]>,
}

impl ExactRegistry {
    pub const DEFAULT_SHARDS: usize = 64;

    pub fn new() -> Self {
        Self::with_shards(Self::DEFAULT_SHARDS)
    }

    /// `nr_shards` is rounded up to a power of two.
    pub fn with_shards(nr_shards: usize) -> Self {
        let nr_shards = nr_shards.max(1).next_power_of_two();
        Self {
            shards: (0..nr_shards)
                .map(|_| CachePadded::new(Mutex::new(HashMap::with_hasher(RandomState::new()))))
                .collect(),
        }
    }

    fn shard(&self, address: u64) -> &Shard {
        // Allocators hand out (at least) 16 byte aligned blocks, so the low
        // bits carry nothing. Fold the rest with a multiplicative hash.
        let mixed = (address >> 4).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let index = (mixed >> 32) as usize & (self.shards.len() - 1);
        &self.shards[index]
    }
}

impl Default for ExactRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocRegistry for ExactRegistry {
    fn put(&self, address: u64, size: u64) {
        self.shard(address).lock().insert(address, size);
    }

    fn remove(&self, address: u64) -> Option<u64> {
        self.shard(address).lock().remove(&address)
    }

    fn get(&self, address: u64) -> Option<u64> {
        self.shard(address).lock().get(&address).copied()
    }

    fn overlaps(&self, address: u64, size: u64) -> bool {
        let mut found = false;
        self.iterate(&mut |block| found |= block.overlaps(address, size));
        found
    }

    fn iterate(&self, visitor: &mut dyn FnMut(MemoryBlock)) {
        for shard in self.shards.iter() {
            // Copy out so the visitor never runs with a shard locked.
            let blocks: Vec<MemoryBlock> = shard
                .lock()
                .iter()
                .map(|(&address, &size)| MemoryBlock::new(address, size))
                .collect();
            blocks.into_iter().for_each(&mut *visitor);
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}

/// Range-aware registry. Blocks are kept ordered by base address so that any
/// address inside a block can be resolved to it.
#[derive(Default)]
pub struct RangeRegistry {
    blocks: RwLock<BTreeMap<u64, u64>>,
}

impl RangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn floor(blocks: &BTreeMap<u64, u64>, address: u64) -> Option<MemoryBlock> {
        blocks
            .range(..=address)
            .next_back()
            .map(|(&address, &size)| MemoryBlock::new(address, size))
    }

    fn overlaps_locked(blocks: &BTreeMap<u64, u64>, address: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let end = address.saturating_add(size);
        // The only block starting below `address` that can reach into the
        // range is the floor. Anything else must start inside the range.
        Self::floor(blocks, address).is_some_and(|block| block.overlaps(address, size))
            || blocks
                .range(address..end)
                .any(|(&base, &len)| MemoryBlock::new(base, len).overlaps(address, size))
    }
}

impl AllocRegistry for RangeRegistry {
    fn put(&self, address: u64, size: u64) {
        let mut blocks = self.blocks.write();
        blocks.remove(&address);
        if log::log_enabled!(log::Level::Warn) && Self::overlaps_locked(&blocks, address, size) {
            log::warn!(
                "block at address {:#018x} with size {} overlaps another live block",
                address,
                size
            );
        }
        blocks.insert(address, size);
    }

    fn remove(&self, address: u64) -> Option<u64> {
        self.blocks.write().remove(&address)
    }

    fn get(&self, address: u64) -> Option<u64> {
        self.blocks.read().get(&address).copied()
    }

    fn find(&self, address: u64) -> Option<MemoryBlock> {
        Self::floor(&self.blocks.read(), address)
            .filter(|block| block.test_interior(address) == Ordering::Equal || block.address == address)
    }

    fn contains(&self, address: u64, size: u64) -> bool {
        Self::floor(&self.blocks.read(), address)
            .is_some_and(|block| block.contains_range(address, size))
    }

    fn overlaps(&self, address: u64, size: u64) -> bool {
        Self::overlaps_locked(&self.blocks.read(), address, size)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(MemoryBlock)) {
        // Walk in batches so writers are never held off for a whole
        // traversal, and so the visitor never runs under the lock.
        const BATCH: usize = 256;
        let mut from = 0u64;
        loop {
            let batch: Vec<MemoryBlock> = self
                .blocks
                .read()
                .range(from..)
                .take(BATCH)
                .map(|(&address, &size)| MemoryBlock::new(address, size))
                .collect();
            let Some(last) = batch.last().copied() else {
                return;
            };
            let done = batch.len() < BATCH;
            batch.into_iter().for_each(&mut *visitor);
            match last.address.checked_add(1) {
                Some(next) if !done => from = next,
                _ => return,
            }
        }
    }

    fn len(&self) -> usize {
        self.blocks.read().len()
    }
}
