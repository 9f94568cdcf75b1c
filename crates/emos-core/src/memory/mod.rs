//! The memory subsystem (spec.md §3): per-process linear memory plus a
//! global partition table for heaps and device buffers.

mod global;
mod process_memory;
mod section;

pub use global::{Memory, Partition, PartitionKey, MAXMEMORY};
pub use process_memory::{ProcessMemory, MAXPROCESSMEMORY};
pub use section::MemorySection;
