//! Allocation-path bookkeeping: which call path asked for each live block,
//! so that memory usage can be aggregated per path.
//!
//! Working out *what* the path is belongs to a [`PathCapture`]. The
//! catalogue only ever sees an opaque [`PathKey`] and, the first time a key
//! turns up, its call sites. Call sites are kept forever, even after every
//! block allocated through that path is gone.

use std::{
    backtrace::Backtrace,
    fmt,
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::registry::AllocRegistry;

/// Fingerprint of an allocation call path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(pub u64);

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A single frame of a call path, in whatever form the capture produced.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallSite(pub String);

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedPath {
    pub key: PathKey,
    /// Innermost call site first.
    pub call_sites: Vec<CallSite>,
}

/// Produces the path of the current call.
pub trait PathCapture: Send + Sync {
    fn capture(&self) -> CapturedPath;
}

impl<F> PathCapture for F
where
    F: Fn() -> CapturedPath + Send + Sync,
{
    fn capture(&self) -> CapturedPath {
        self()
    }
}

/// Captures the calling thread's stack with [`Backtrace`]. Expensive, only
/// suitable for diagnostics runs.
#[derive(Clone, Debug)]
pub struct BacktraceCapture {
    /// Frames at the top of the stack that belong to the guard itself.
    skip: usize,
    /// At most this many frames are kept (and hashed).
    depth: usize,
    hasher: RandomState,
}

impl BacktraceCapture {
    pub fn new(skip: usize, depth: usize) -> Self {
        Self {
            skip,
            depth,
            // Fixed seeds, so the same path hashes the same way in every run.
            hasher: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }
}

impl Default for BacktraceCapture {
    fn default() -> Self {
        Self::new(4, 16)
    }
}

impl PathCapture for BacktraceCapture {
    fn capture(&self) -> CapturedPath {
        let rendered = Backtrace::force_capture().to_string();
        // Frames render as "  N: symbol" followed by an optional
        // "at file:line" line, we only fingerprint the symbols.
        let call_sites: Vec<CallSite> = rendered
            .lines()
            .map(str::trim)
            .filter_map(|line| {
                let (index, symbol) = line.split_once(": ")?;
                index
                    .chars()
                    .all(|c| c.is_ascii_digit())
                    .then(|| CallSite(symbol.to_owned()))
            })
            .skip(self.skip)
            .take(self.depth)
            .collect();
        let mut hasher = self.hasher.build_hasher();
        call_sites.hash(&mut hasher);
        CapturedPath {
            key: PathKey(hasher.finish()),
            call_sites,
        }
    }
}

/// `address -> path key` for live blocks, `path key -> call sites` for
/// every path ever seen.
#[derive(Default)]
pub struct PathCatalogue {
    keys: RwLock<HashMap<u64, PathKey, RandomState>>,
    paths: RwLock<HashMap<PathKey, Arc<[CallSite]>, RandomState>>,
}

impl PathCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute the block at `address` to `path`. Only the first call sites
    /// seen for a key are stored.
    pub fn record(&self, address: u64, path: CapturedPath) {
        if !self.paths.read().contains_key(&path.key) {
            self.paths
                .write()
                .entry(path.key)
                .or_insert_with(|| path.call_sites.into());
        }
        self.keys.write().insert(address, path.key);
    }

    /// Forget which path the block at `address` came from.
    pub fn forget(&self, address: u64) -> Option<PathKey> {
        self.keys.write().remove(&address)
    }

    /// Attribute `address` to a path that was already recorded, e.g. the key
    /// [`PathCatalogue::forget()`] returned for a block before it moved.
    pub fn assign(&self, address: u64, key: PathKey) {
        self.keys.write().insert(address, key);
    }

    pub fn key_of(&self, address: u64) -> Option<PathKey> {
        self.keys.read().get(&address).copied()
    }

    pub fn call_sites(&self, key: PathKey) -> Option<Arc<[CallSite]>> {
        self.paths.read().get(&key).cloned()
    }

    /// The call sites of the path that allocated `address`.
    pub fn path_of(&self, address: u64) -> Option<Arc<[CallSite]>> {
        self.call_sites(self.key_of(address)?)
    }

    /// Number of distinct paths seen so far.
    pub fn nr_paths(&self) -> usize {
        self.paths.read().len()
    }

    /// Live bytes per path, summed over the blocks currently in `registry`.
    /// Blocks without an attribution are skipped.
    pub fn usage_by_path(&self, registry: &dyn AllocRegistry) -> HashMap<PathKey, u64, RandomState> {
        let mut usage = HashMap::with_hasher(RandomState::new());
        registry.iterate(&mut |block| {
            if let Some(key) = self.key_of(block.address) {
                *usage.entry(key).or_insert(0) += block.size;
            }
        });
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::registry::RangeRegistry;

    fn path(key: u64, site: &str) -> CapturedPath {
        CapturedPath {
            key: PathKey(key),
            call_sites: vec![CallSite(site.to_owned())],
        }
    }

    #[test]
    fn first_call_sites_win() {
        let catalogue = PathCatalogue::new();
        catalogue.record(0x1000, path(1, "first"));
        catalogue.record(0x2000, path(1, "second"));
        assert_eq!(catalogue.nr_paths(), 1);
        assert_eq!(
            catalogue.path_of(0x2000).as_deref(),
            Some(&[CallSite("first".into())][..])
        );
    }

    #[test]
    fn call_sites_outlive_blocks() {
        let catalogue = PathCatalogue::new();
        catalogue.record(0x1000, path(7, "alloc_buffer"));
        assert_eq!(catalogue.forget(0x1000), Some(PathKey(7)));
        assert_eq!(catalogue.key_of(0x1000), None);
        assert!(catalogue.call_sites(PathKey(7)).is_some());
    }

    #[test]
    fn usage_by_path_sums_live_blocks() {
        let registry = RangeRegistry::new();
        let catalogue = PathCatalogue::new();
        for (address, size, key) in [(0x1000, 10, 1), (0x2000, 20, 1), (0x3000, 5, 2), (0x4000, 99, 3)] {
            registry.put(address, size);
            catalogue.record(address, path(key, "site"));
        }
        registry.remove(0x4000);
        registry.put(0x5000, 1000);

        let usage = catalogue.usage_by_path(&registry);
        assert_eq!(usage.get(&PathKey(1)), Some(&30));
        assert_eq!(usage.get(&PathKey(2)), Some(&5));
        assert_eq!(usage.get(&PathKey(3)), None);
        assert_eq!(usage.len(), 2);
    }

    #[test]
    fn forget_then_assign_moves_the_key() {
        let catalogue = PathCatalogue::new();
        catalogue.record(0x1000, path(9, "grow"));
        let key = catalogue.forget(0x1000).unwrap();
        assert_eq!(catalogue.key_of(0x1000), None);
        catalogue.assign(0x8000, key);
        assert_eq!(catalogue.key_of(0x8000), Some(PathKey(9)));
        assert_eq!(
            catalogue.path_of(0x8000).as_deref(),
            Some(&[CallSite("grow".into())][..])
        );
        assert_eq!(catalogue.forget(0x1000), None);
    }

    #[test]
    fn backtrace_capture_is_stable_for_the_same_path() {
        let capture = BacktraceCapture::new(0, 64);
        let capture_here = || capture.capture();
        let (a, b) = (capture_here(), capture_here());
        assert_eq!(a.key, b.key);
    }
}
