use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// Page-aligned base of a 4 KiB physical frame.
///
/// ### Invariants
/// - The low 12 bits are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// The frame containing `addr` (truncates the in-page offset).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.0 & !(PAGE_SIZE - 1))
    }

    /// Wraps an already frame-aligned address.
    ///
    /// # Panics
    /// In debug builds, when `addr` is not page aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(addr: PhysicalAddress) -> Self {
        debug_assert!(addr.0.is_multiple_of(PAGE_SIZE));
        Self(addr.0)
    }

    /// Frame with the given ordinal index (`base = index << 12`).
    #[inline]
    #[must_use]
    pub const fn from_index(index: u64) -> Self {
        Self(index << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0)
    }

    /// Ordinal index of this frame (`base >> 12`).
    #[inline]
    #[must_use]
    pub const fn index(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Combines this base with an in-page offset.
    ///
    /// # Panics
    /// In debug builds, when `offset` does not fit in the page.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < PAGE_SIZE);
        PhysicalAddress(self.0 | offset)
    }

    /// The frame `count` frames after this one.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, count: u64) -> Self {
        Self(self.0 + count * PAGE_SIZE)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        let frame = PhysicalPage::from_index(0x1234);
        assert_eq!(frame.base().as_u64(), 0x1234 << PAGE_SHIFT);
        assert_eq!(frame.index(), 0x1234);
    }
}
