//! # Virtual-memory core
//!
//! Page-table management for the kernel: a level-generic table walker, a
//! single-entry mutator, an identity window over physical memory, address
//! space lifecycle (create/clone/switch/destroy) and bump-style region
//! allocators for the kernel heap, MMIO, DMA and driver images.
//!
//! Two paging models are supported behind one set of types: the classic
//! two-level layout with 1024 32-bit entries per table, and the four-level
//! layout with 512 64-bit entries per table. Code above this crate never
//! branches on the model; it goes through [`PagingModel`].
//!
//! ## Seams
//!
//! The crate touches hardware through four small traits, which is also what
//! keeps it fully testable on the host:
//!
//! - [`PhysMapper`] turns a physical address into a usable pointer (the
//!   kernel wires this to the identity cache; tests wire it to a vector of
//!   aligned frames).
//! - [`FrameService`] is the physical frame allocator.
//! - [`RootRegister`] loads a hierarchy root into the translation hardware.
//! - [`TlbFlush`] invalidates stale translations; the table code itself
//!   never touches the TLB.
//!
//! ## Concurrency
//!
//! Region watermarks and the identity-window slot pool carry their own spin
//! locks. Edits to one address space's tables assume a single writer, which
//! the API encodes by requiring `&mut` access to the owning handle.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(
    unsafe_code,
    clippy::inline_always,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

extern crate alloc;

pub mod arch;
pub mod entry;
pub mod error;
pub mod frames;
pub mod mutator;
pub mod region;
pub mod space;
pub mod tlb;
pub mod vm;
pub mod walker;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use arch::{KernelLayout, PagingModel};
pub use entry::{MapRequest, TableEntry, TableNode};
pub use error::{VmemError, VmemResult};
pub use frames::{FrameLedger, FrameService, RefCountTable};
pub use region::{MapContext, RegionAllocator, RegionBlock};
pub use space::{AddressSpace, CloneStrategy, RootRegister, SpaceManager};
pub use tlb::TlbFlush;
pub use vm::KernelVm;
pub use window::{IdentityWindow, SlotMapper};

use kernel_memory_addresses::PhysicalAddress;

/// Access to physical memory from kernel code.
///
/// The walker, the cloner and the bootstrap path all need to read and write
/// physical frames (table nodes, page contents). They do so exclusively
/// through this trait.
///
/// In the running kernel every table frame lives below the identity-cache
/// bound, so the implementation is a fixed-offset add. Tests implement it
/// over simulated RAM.
pub trait PhysMapper {
    /// Returns a mutable reference to a `T` at physical address `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must point to memory that is valid for reads and writes of a `T`,
    /// properly aligned, and not concurrently accessed through another
    /// reference. The returned lifetime is unconstrained; the caller must not
    /// keep the reference beyond the validity of the mapping.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}
