//! The global memory table (spec.md §3): a map of named partitions —
//! one per process, plus free-standing heap (`mem`) and device (`perp`)
//! partitions — with a total-size cap.

use std::collections::HashMap;

use crate::error::{EmuError, EmuResult};

use super::process_memory::ProcessMemory;
use super::section::MemorySection;

pub const MAXMEMORY: u64 = 1 << 32;

/// Key into the global partition table: `(kind, id)` in the original's
/// terms, spelled out as a proper enum instead of a string tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    Proc(u32),
    Mem(u32),
    Perp(u32),
}

#[derive(Debug)]
pub enum Partition {
    Proc(ProcessMemory),
    Mem(MemorySection),
    Perp(MemorySection),
}

impl Partition {
    fn size(&self) -> u64 {
        match self {
            Partition::Proc(pm) => pm.es as u64,
            Partition::Mem(sec) | Partition::Perp(sec) => sec.size() as u64,
        }
    }
}

/// The global, size-capped table of all partitions in the machine.
#[derive(Debug, Default)]
pub struct Memory {
    partitions: HashMap<PartitionKey, Partition>,
    used: u64,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn get(&self, key: PartitionKey) -> EmuResult<&Partition> {
        self.partitions.get(&key).ok_or(EmuError::PartitionMissing)
    }

    pub fn get_mut(&mut self, key: PartitionKey) -> EmuResult<&mut Partition> {
        self.partitions.get_mut(&key).ok_or(EmuError::PartitionMissing)
    }

    /// Register a new partition, rejecting it if doing so would exceed
    /// `MAXMEMORY` or if the key is already in use.
    pub fn add(&mut self, key: PartitionKey, partition: Partition) -> EmuResult<()> {
        if self.partitions.contains_key(&key) {
            return Err(EmuError::NameNotInMemory);
        }
        let added = partition.size();
        if self.used + added > MAXMEMORY {
            return Err(EmuError::OutOfMemory);
        }
        self.used += added;
        self.partitions.insert(key, partition);
        Ok(())
    }

    pub fn remove(&mut self, key: PartitionKey) -> EmuResult<Partition> {
        let partition = self.partitions.remove(&key).ok_or(EmuError::PartitionMissing)?;
        self.used -= partition.size();
        Ok(partition)
    }

    /// Recompute `used` from the live partitions. Called after an in-place
    /// resize (e.g. stack growth) changes a partition's size without going
    /// through `add`/`remove`.
    pub fn recalc_used(&mut self) {
        self.used = self.partitions.values().map(Partition::size).sum();
    }

    /// The smallest non-negative integer not currently in use as a
    /// `Mem(id)` partition key (spec.md §3: heap ids are reused holes-first,
    /// matching `operatingsystem.py::allocate_memory`'s `max(ids)+1` with
    /// reuse on free).
    pub fn next_free_mem_id(&self) -> u32 {
        let mut id = 0u32;
        while self.partitions.contains_key(&PartitionKey::Mem(id)) {
            id += 1;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let mut mem = Memory::new();
        mem.add(PartitionKey::Mem(1), Partition::Mem(MemorySection::new("heap", vec![0; 4]))).unwrap();
        assert!(matches!(mem.get(PartitionKey::Mem(1)).unwrap(), Partition::Mem(_)));
        assert_eq!(mem.used(), 4);
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut mem = Memory::new();
        mem.add(PartitionKey::Mem(1), Partition::Mem(MemorySection::new("heap", vec![]))).unwrap();
        assert_eq!(
            mem.add(PartitionKey::Mem(1), Partition::Mem(MemorySection::new("heap", vec![]))),
            Err(EmuError::NameNotInMemory)
        );
    }

    #[test]
    fn missing_key_is_partition_missing() {
        let mem = Memory::new();
        assert_eq!(mem.get(PartitionKey::Proc(7)), Err(EmuError::PartitionMissing));
    }

    #[test]
    fn remove_frees_accounted_size() {
        let mut mem = Memory::new();
        mem.add(PartitionKey::Perp(0), Partition::Perp(MemorySection::new("dev", vec![0; 10]))).unwrap();
        mem.remove(PartitionKey::Perp(0)).unwrap();
        assert_eq!(mem.used(), 0);
    }

    #[test]
    fn over_capacity_add_is_rejected() {
        let mut mem = Memory::new();
        let huge = vec![0u8; 1];
        let key = PartitionKey::Mem(0);
        // Simulate near-capacity usage directly, since allocating a real
        // 2^32-byte Vec in a unit test is impractical.
        mem.used = MAXMEMORY;
        assert_eq!(mem.add(key, Partition::Mem(MemorySection::new("heap", huge))), Err(EmuError::OutOfMemory));
    }
}
