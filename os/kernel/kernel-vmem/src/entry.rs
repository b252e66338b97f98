//! Model-independent view of table entries and mapping requests.
//!
//! The two paging models use different entry widths and bit positions; the
//! walker, mutator and cloner only ever see them through [`TableEntry`] and
//! [`TableNode`]. The concrete bitfield types live in [`crate::arch`].

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// One page-table entry, independent of its width.
///
/// An entry either references a frame (leaf) or a child table (interior);
/// the distinction is positional, not encoded in the entry itself. A raw
/// frame field of zero means "no frame": physical frame 0 is reserved by the
/// frame service and never handed out.
pub trait TableEntry: Copy {
    /// The all-zeroes (absent) entry.
    fn empty() -> Self;

    /// The exact hardware representation, zero-extended to 64 bits.
    fn raw(self) -> u64;

    fn is_present(self) -> bool;
    fn mark_present(&mut self, on: bool);

    fn is_writable(self) -> bool;
    fn mark_writable(&mut self, on: bool);

    fn is_user(self) -> bool;
    fn mark_user(&mut self, on: bool);

    fn mark_write_through(&mut self, on: bool);
    fn mark_cache_disabled(&mut self, on: bool);

    fn is_global(self) -> bool;
    fn mark_global(&mut self, on: bool);

    /// Large-page bit; only meaningful on interior levels.
    fn is_large(self) -> bool;
    fn mark_large(&mut self, on: bool);

    /// OS-available bit tagging a frame shared for copy-on-write.
    fn is_copy_on_write(self) -> bool;
    fn mark_copy_on_write(&mut self, on: bool);

    /// The referenced frame, or `None` when the frame field is zero.
    fn frame(self) -> Option<PhysicalPage>;

    /// Points the entry at `frame` without touching any flag bits.
    fn bind_frame(&mut self, frame: PhysicalPage);

    /// Resets the entry to [`TableEntry::empty`].
    fn clear(&mut self);
}

/// One page-table node: a page-sized, page-aligned array of entries.
pub trait TableNode {
    type Entry: TableEntry;

    /// Number of entries per node (1024 or 512).
    const LEN: usize;

    fn get(&self, index: usize) -> Self::Entry;
    fn set(&mut self, index: usize, entry: Self::Entry);
    fn entry_mut(&mut self, index: usize) -> &mut Self::Entry;

    /// Writes [`TableEntry::empty`] into every slot.
    fn zero(&mut self);
}

/// What a caller wants a leaf entry to look like.
///
/// The default request maps a fresh, writable, user-accessible, cacheable
/// page. Flags restrict or redirect from there.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct MapRequest {
    /// Clear the user bit; the mapping is supervisor-only.
    pub kernel_only: bool,
    /// Clear the writable bit.
    pub read_only: bool,
    /// Write-through caching.
    pub write_through: bool,
    /// Disable caching entirely (device memory).
    pub cache_disabled: bool,
    /// Configure the entry but leave it absent (guard/swap bookkeeping).
    pub not_present: bool,
    /// Never allocate a frame; configure flags over whatever is bound.
    pub no_alloc: bool,
    /// Release the entry instead of configuring it.
    pub free: bool,
    /// Survives address-space switches (kernel mappings).
    pub global: bool,
    #[bits(8)]
    reserved: u8,
}

impl MapRequest {
    /// Writable kernel-only data, cacheable.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new().with_kernel_only(true)
    }

    /// Kernel-only device memory: uncached, write-through.
    #[must_use]
    pub const fn kernel_device() -> Self {
        Self::new()
            .with_kernel_only(true)
            .with_write_through(true)
            .with_cache_disabled(true)
    }

    /// Writable user data, cacheable.
    #[must_use]
    pub const fn user_data() -> Self {
        Self::new()
    }

    /// Request that releases the entry.
    #[must_use]
    pub const fn release() -> Self {
        Self::new().with_free(true)
    }
}
