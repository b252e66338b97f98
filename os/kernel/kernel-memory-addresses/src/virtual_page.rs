use crate::{PAGE_SIZE, VirtualAddress};
use core::fmt;

/// Page-aligned base of a 4 KiB virtual page.
///
/// ### Invariants
/// - The low 12 bits are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    /// The page containing `addr` (truncates the in-page offset).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(addr.0 & !(PAGE_SIZE - 1))
    }

    /// Wraps an already page-aligned address.
    ///
    /// # Panics
    /// In debug builds, when `addr` is not page aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(addr: VirtualAddress) -> Self {
        debug_assert!(addr.0.is_multiple_of(PAGE_SIZE));
        Self(addr.0)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }

    /// Combines this base with an in-page offset.
    ///
    /// # Panics
    /// In debug builds, when `offset` does not fit in the page.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> VirtualAddress {
        debug_assert!(offset < PAGE_SIZE);
        VirtualAddress(self.0 | offset)
    }

    /// The page `count` pages after this one.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, count: u64) -> Self {
        Self(self.0 + count * PAGE_SIZE)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#x})", self.0)
    }
}
