//! Paging models and per-model kernel layout.
//!
//! A [`PagingModel`] pins down everything that differs between the two
//! supported translation schemes: entry width, entries per node, depth,
//! index extraction, the optional self-reference root slot and the kernel's
//! virtual-memory map. Everything above [`crate::arch`] is generic over it.

pub mod legacy;
pub mod long_mode;

pub use legacy::LegacyPaging;
pub use long_mode::LongMode;

use crate::entry::{TableEntry, TableNode};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

/// Kernel virtual-memory map of one paging model.
///
/// All bases and sizes are page aligned; regions never overlap. Checked at
/// compile time next to each model's definition.
#[derive(Debug, Clone, Copy)]
pub struct KernelLayout {
    /// Permanent identity cache: physical `[0, cache_size)` is always
    /// reachable at `cache_base | pa`.
    pub cache_base: u64,
    pub cache_size: u64,
    /// Dynamically mapped slots backing the identity window's slow path.
    pub pool_base: u64,
    pub pool_size: u64,
    /// Kernel heap (bump region, critical).
    pub heap_base: u64,
    pub heap_size: u64,
    /// Contiguous DMA buffers (uncached).
    pub dma_base: u64,
    pub dma_size: u64,
    /// Memory-mapped device windows (uncached).
    pub mmio_base: u64,
    pub mmio_size: u64,
    /// Loaded driver images.
    pub driver_base: u64,
    pub driver_size: u64,
}

impl KernelLayout {
    /// Number of 4 KiB slots in the window pool.
    #[must_use]
    pub const fn pool_slots(&self) -> usize {
        (self.pool_size / PAGE_SIZE) as usize
    }
}

/// One translation scheme: entry/node types plus the constants the walker
/// and the lifecycle code need.
pub trait PagingModel: 'static {
    type Entry: TableEntry;
    type Node: TableNode<Entry = Self::Entry>;

    /// Depth of the hierarchy (2 or 4). Level 0 is the root.
    const LEVELS: usize;

    /// Root slot mapping the hierarchy onto itself, if the model uses one.
    ///
    /// The slot is structural bookkeeping: it is never traversed by the
    /// walker and the virtual range it would decode to is not usable
    /// address space.
    const SELF_REF_SLOT: Option<usize>;

    /// Interior level that takes large leaves during bootstrap, if any.
    const BOOT_LARGE_LEVEL: Option<usize>;

    /// Bytes covered by one bootstrap large leaf (0 when unused).
    const BOOT_LARGE_BYTES: u64;

    /// The kernel's virtual-memory map under this model.
    const LAYOUT: KernelLayout;

    /// Index into the node at `level` for virtual address `va`.
    fn slot_index(level: usize, va: VirtualAddress) -> usize;
}
