use crate::VirtualPage;
use core::fmt;
use core::ops::{Add, AddAssign};

/// A virtual memory address.
///
/// Carries no canonicality guarantee; the paging model decides which bits
/// participate in translation.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::VirtualAddress;
/// let va = VirtualAddress::new(0x0040_3017);
/// assert_eq!(va.offset_in_page(), 0x17);
/// assert_eq!(va.page().base().as_u64(), 0x0040_3000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage::containing(self)
    }

    /// Offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn offset_in_page(self) -> u64 {
        self.0 & (crate::PAGE_SIZE - 1)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_offset_recompose() {
        let va = VirtualAddress::new(0xdead_beef);
        assert_eq!(
            va.page().base().as_u64() + va.offset_in_page(),
            va.as_u64()
        );
    }
}
