//! Error taxonomy.
//!
//! Resource exhaustion and caller-visible precondition failures are values
//! propagated with `?`; the first caller with a policy decides what to do.
//! Invariant violations (reference-count underflow, a table entry without a
//! frame) are panics at the detection site.

use kernel_memory_addresses::VirtualAddress;
use thiserror::Error;

/// Shorthand for results in this crate.
pub type VmemResult<T> = Result<T, VmemError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmemError {
    /// The frame service has no frames left.
    #[error("out of physical frames")]
    OutOfFrames,

    /// The identity-window slot pool could not satisfy a contiguous request.
    #[error("identity window pool exhausted ({requested} slots requested)")]
    PoolExhausted { requested: usize },

    /// A walk hit an absent intermediate entry without permission to create.
    #[error("no mapping at {0}")]
    NotMapped(VirtualAddress),

    /// A walk ran into a large-page leaf above the target level.
    #[error("large-page entry blocks the walk at {0}")]
    LargePage(VirtualAddress),

    /// The address indexes the root slot reserved for self-reference.
    #[error("{0} falls into the reserved self-reference slot")]
    ReservedSlot(VirtualAddress),

    /// A region allocator ran out of virtual address space.
    #[error("region `{region}` exhausted ({requested:#x} bytes requested)")]
    RegionFull {
        region: &'static str,
        requested: u64,
    },

    /// A block handed back to a region is not its trailing allocation.
    #[error("block at {base} is not the trailing allocation of region `{region}`")]
    NotTrailing {
        region: &'static str,
        base: VirtualAddress,
    },
}
