//! # Typed memory addresses
//!
//! Strongly typed virtual/physical addresses and 4 KiB page bases for the
//! virtual-memory core. The types are `repr(transparent)` wrappers over `u64`;
//! the point is that a physical frame can never be handed to an API expecting
//! a virtual address, and page bases are aligned by construction.
//!
//! The paging code works exclusively on the 4 KiB granule. Large pages exist
//! only as opaque leaf entries installed during bootstrap and are never
//! addressed through these types.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Size of the base paging granule in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(PAGE_SIZE.is_power_of_two());
};

/// Rounds `value` down to the previous page boundary.
///
/// ```rust
/// # use kernel_memory_addresses::page_align_down;
/// assert_eq!(page_align_down(0x1fff), 0x1000);
/// assert_eq!(page_align_down(0x2000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Rounds `value` up to the next page boundary.
///
/// ```rust
/// # use kernel_memory_addresses::page_align_up;
/// assert_eq!(page_align_up(0x1001), 0x2000);
/// assert_eq!(page_align_up(0x2000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn page_align_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// `true` when `value` sits on a page boundary.
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value.is_multiple_of(PAGE_SIZE)
}
