//! Diagnostics export: dumps of every live block and live bytes per
//! allocation path, as JSON or as plain text.

use std::{fmt, io, ptr::NonNull};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    alloc::{
        guard::MemoryGuard,
        lock::AccessLock,
        path::{CallSite, PathKey},
        raw::{Location, RawMemory},
        registry::MemoryBlock,
    },
    error::{GuardError, Result},
    serialize::serde_addr,
};

const BYTES_PER_ROW: usize = 16;

/// Raw bytes, formatted as hex.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HexDump {
    buf: Vec<u8>,
}

impl HexDump {
    pub const fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl fmt::Debug for HexDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, byte) in self.buf.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        write!(f, "]")
    }
}

/// One row of [`BYTES_PER_ROW`] bytes per line, each prefixed by its offset.
impl fmt::Display for HexDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row, chunk) in self.buf.chunks(BYTES_PER_ROW).enumerate() {
            write!(f, "{:08x} ", row * BYTES_PER_ROW)?;
            for byte in chunk {
                write!(f, " {byte:02x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Serialized as one contiguous lowercase hex string.
impl Serialize for HexDump {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct Contiguous<'a>(&'a [u8]);

        impl fmt::Display for Contiguous<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
            }
        }

        serializer.collect_str(&Contiguous(&self.buf))
    }
}

impl<'de> Deserialize<'de> for HexDump {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        if hex.len() % 2 != 0 {
            return Err(de::Error::invalid_length(hex.len(), &"an even number of hex digits"));
        }
        let buf = (0..hex.len())
            .step_by(2)
            .map(|i| {
                hex.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| de::Error::invalid_value(de::Unexpected::Str(&hex), &"hex digits"))
            })
            .collect::<Result<_, D::Error>>()?;
        Ok(Self { buf })
    }
}

/// A live block with its contents at the time of the dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDump {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub size: u64,
    pub bytes: HexDump,
    /// Call sites of the allocation, if paths are monitored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<CallSite>>,
}

impl fmt::Display for BlockDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Address         : {:#018x}", self.address)?;
        writeln!(f, "Size            : {} bytes", self.size)?;
        writeln!(f, "Dump            :")?;
        write!(f, "{}", self.bytes)?;
        if let Some(path) = &self.path {
            writeln!(f, "Allocation Path :")?;
            if path.is_empty() {
                writeln!(f, "\tNo related allocation path!")?;
            }
            for site in path {
                writeln!(f, "\t|- {site}")?;
            }
        }
        Ok(())
    }
}

/// Live bytes allocated through one path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathUsage {
    pub key: PathKey,
    pub bytes: u64,
    pub call_sites: Vec<CallSite>,
}

impl<M: RawMemory> MemoryGuard<M> {
    /// Snapshot every live block, contents included, ordered by address.
    ///
    /// # Safety
    ///
    /// Each block is re-validated under the access lock right before it is
    /// read. Without the lock (no concurrent access checking) nothing may
    /// free or reallocate a block while this runs.
    pub unsafe fn dump_blocks(&self) -> Vec<BlockDump> {
        let mut blocks = Vec::new();
        self.iterate(|block| blocks.push(block));
        blocks.sort_unstable_by_key(|block| block.address);
        blocks
            .into_iter()
            // SAFETY: requirement passed to caller
            .filter_map(|block| unsafe { self.dump_block(block) })
            .collect()
    }

    /// `None` if the block went away since it was visited.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::dump_blocks()`].
    unsafe fn dump_block(&self, block: MemoryBlock) -> Option<BlockDump> {
        let len = usize::try_from(block.size).ok()?;
        let mut buf = vec![0u8; len];
        {
            let _access = self.access_lock().map(AccessLock::access);
            if self.registry().get_in_any_scope(block.address) != Some(block.size) {
                return None;
            }
            let dst = Location::Object {
                base: NonNull::from(buf.as_mut_slice()).cast(),
                offset: 0,
            };
            // SAFETY: the block is live and can't be freed while we hold the
            // lock (or, without a lock, by the caller's promise)
            unsafe {
                self.raw()
                    .copy_memory(Location::Absolute(block.address), dst, block.size)
            };
        }
        let path = self.paths().map(|paths| {
            paths
                .path_of(block.address)
                .map(|sites| sites.to_vec())
                .unwrap_or_default()
        });
        Some(BlockDump {
            address: block.address,
            size: block.size,
            bytes: HexDump::new(buf),
            path,
        })
    }

    /// [`MemoryGuard::dump_blocks()`] as a JSON array.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::dump_blocks()`].
    pub unsafe fn write_dump_json<W: io::Write>(&self, writer: W) -> Result<()> {
        // SAFETY: requirement passed to caller
        let blocks = unsafe { self.dump_blocks() };
        serde_json::to_writer_pretty(writer, &blocks)?;
        Ok(())
    }

    /// [`MemoryGuard::dump_blocks()`] as human readable text.
    ///
    /// # Safety
    ///
    /// As for [`MemoryGuard::dump_blocks()`].
    pub unsafe fn write_dump<W: io::Write>(&self, mut writer: W) -> Result<()> {
        // SAFETY: requirement passed to caller
        for block in unsafe { self.dump_blocks() } {
            writeln!(writer, "{block}")?;
            writeln!(writer, "{}", "=".repeat(80))?;
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Live bytes per allocation path, biggest first.
    pub fn path_usage(&self) -> Result<Vec<PathUsage>> {
        let paths = self.paths().ok_or(GuardError::PathMonitoringDisabled)?;
        let mut usage: Vec<PathUsage> = paths
            .usage_by_path(self.registry())
            .into_iter()
            .map(|(key, bytes)| PathUsage {
                key,
                bytes,
                call_sites: paths
                    .call_sites(key)
                    .map(|sites| sites.to_vec())
                    .unwrap_or_default(),
            })
            .collect();
        usage.sort_unstable_by(|a, b| b.bytes.cmp(&a.bytes).then(a.key.cmp(&b.key)));
        Ok(usage)
    }

    pub fn write_path_usage_json<W: io::Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, &self.path_usage()?)?;
        Ok(())
    }
}
