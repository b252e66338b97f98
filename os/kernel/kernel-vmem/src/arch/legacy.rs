//! Two-level legacy 32-bit paging: 1024 entries of 32 bits per node.
//!
//! Level 0 is the page directory (VA bits 22..=31), level 1 the page table
//! (VA bits 12..=21). Directory slot 1023 is reserved for the
//! self-reference mapping, so virtual range `0xFFC0_0000..` is off limits.

use super::{KernelLayout, PagingModel};
use crate::entry::{TableEntry, TableNode};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};

/// A 32-bit directory or table entry.
///
/// Bit 7 is PS in a directory entry and PAT in a leaf; this superset view
/// names it `large`. Bit 9 is the first OS-available bit and tags
/// copy-on-write frames.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct LegacyEntry {
    /// Present (P, bit 0).
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2).
    pub user: bool,
    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,
    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,
    /// Accessed (A, bit 5), set by hardware.
    pub accessed: bool,
    /// Dirty (D, bit 6), set by hardware on leaf writes.
    pub dirty: bool,
    /// Page Size (PS, bit 7) in directory entries; PAT in leaves.
    pub large: bool,
    /// Global (G, bit 8), leaf only.
    pub global: bool,
    /// OS-available bit 9: frame is shared copy-on-write.
    pub copy_on_write: bool,
    /// OS-available bits 10..=11.
    #[bits(2)]
    pub os_available: u8,
    /// Physical frame index, bits 12..=31 of the address.
    #[bits(20)]
    frame_index: u32,
}

impl TableEntry for LegacyEntry {
    fn empty() -> Self {
        Self::new()
    }

    fn raw(self) -> u64 {
        u64::from(self.into_bits())
    }

    fn is_present(self) -> bool {
        self.present()
    }
    fn mark_present(&mut self, on: bool) {
        self.set_present(on);
    }

    fn is_writable(self) -> bool {
        self.writable()
    }
    fn mark_writable(&mut self, on: bool) {
        self.set_writable(on);
    }

    fn is_user(self) -> bool {
        self.user()
    }
    fn mark_user(&mut self, on: bool) {
        self.set_user(on);
    }

    fn mark_write_through(&mut self, on: bool) {
        self.set_write_through(on);
    }
    fn mark_cache_disabled(&mut self, on: bool) {
        self.set_cache_disabled(on);
    }

    fn is_global(self) -> bool {
        self.global()
    }
    fn mark_global(&mut self, on: bool) {
        self.set_global(on);
    }

    fn is_large(self) -> bool {
        self.large()
    }
    fn mark_large(&mut self, on: bool) {
        self.set_large(on);
    }

    fn is_copy_on_write(self) -> bool {
        self.copy_on_write()
    }
    fn mark_copy_on_write(&mut self, on: bool) {
        self.set_copy_on_write(on);
    }

    fn frame(self) -> Option<PhysicalPage> {
        let index = self.frame_index();
        (index != 0).then(|| PhysicalPage::from_index(u64::from(index)))
    }

    fn bind_frame(&mut self, frame: PhysicalPage) {
        debug_assert!(
            frame.index() < (1 << 20),
            "frame beyond the 32-bit physical address space"
        );
        self.set_frame_index(frame.index() as u32);
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// One page directory or page table.
#[repr(C, align(4096))]
pub struct LegacyNode {
    entries: [LegacyEntry; 1024],
}

const _: () = {
    assert!(size_of::<LegacyNode>() == PAGE_SIZE as usize);
    assert!(align_of::<LegacyNode>() == PAGE_SIZE as usize);
};

impl TableNode for LegacyNode {
    type Entry = LegacyEntry;
    const LEN: usize = 1024;

    fn get(&self, index: usize) -> LegacyEntry {
        self.entries[index]
    }

    fn set(&mut self, index: usize, entry: LegacyEntry) {
        self.entries[index] = entry;
    }

    fn entry_mut(&mut self, index: usize) -> &mut LegacyEntry {
        &mut self.entries[index]
    }

    fn zero(&mut self) {
        self.entries = [LegacyEntry::new(); 1024];
    }
}

/// The two-level model.
pub struct LegacyPaging;

impl PagingModel for LegacyPaging {
    type Entry = LegacyEntry;
    type Node = LegacyNode;

    const LEVELS: usize = 2;
    const SELF_REF_SLOT: Option<usize> = Some(1023);
    const BOOT_LARGE_LEVEL: Option<usize> = None;
    const BOOT_LARGE_BYTES: u64 = 0;

    const LAYOUT: KernelLayout = KernelLayout {
        cache_base: 0xB000_0000,
        cache_size: 0x1000_0000,
        pool_base: 0xC000_0000,
        pool_size: 0x2000_0000,
        heap_base: 0x1000_0000,
        heap_size: 0x6000_0000,
        dma_base: 0x7000_0000,
        dma_size: 0x1000_0000,
        mmio_base: 0x9000_0000,
        mmio_size: 0x1000_0000,
        driver_base: 0xA000_0000,
        driver_size: 0x1000_0000,
    };

    fn slot_index(level: usize, va: VirtualAddress) -> usize {
        let va = va.as_u64();
        let shifted = match level {
            0 => va >> 22,
            1 => va >> 12,
            _ => unreachable!("two-level walk asked for level {level}"),
        };
        (shifted & 0x3FF) as usize
    }
}

const _: () = {
    let l = LegacyPaging::LAYOUT;
    assert!(l.heap_base + l.heap_size <= l.dma_base);
    assert!(l.dma_base + l.dma_size <= l.mmio_base);
    assert!(l.mmio_base + l.mmio_size <= l.driver_base);
    assert!(l.driver_base + l.driver_size <= l.cache_base);
    assert!(l.cache_base + l.cache_size <= l.pool_base);
    // directory slot 1023 covers 0xFFC0_0000..; everything must stay below
    assert!(l.pool_base + l.pool_size <= 0xFFC0_0000);
    assert!(l.cache_base.is_multiple_of(PAGE_SIZE));
    assert!(l.pool_base.is_multiple_of(PAGE_SIZE));
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_bits_match_hardware_positions() {
        let mut entry = LegacyEntry::new();
        entry.mark_present(true);
        entry.mark_writable(true);
        entry.mark_global(true);
        entry.mark_copy_on_write(true);
        entry.bind_frame(PhysicalPage::from_index(0xABCDE));
        let raw = entry.raw();
        assert_eq!(raw & 0b1, 1, "present is bit 0");
        assert_eq!(raw & 0b10, 0b10, "writable is bit 1");
        assert_eq!(raw & (1 << 8), 1 << 8, "global is bit 8");
        assert_eq!(raw & (1 << 9), 1 << 9, "copy-on-write is bit 9");
        assert_eq!(raw >> 12, 0xABCDE, "frame index occupies bits 12..=31");
    }

    #[test]
    fn zero_frame_field_reads_as_none() {
        let mut entry = LegacyEntry::new();
        entry.mark_present(true);
        assert_eq!(entry.frame(), None);
        entry.bind_frame(PhysicalPage::from_index(7));
        assert_eq!(entry.frame(), Some(PhysicalPage::from_index(7)));
    }

    #[test]
    fn index_extraction_splits_directory_and_table_bits() {
        let va = VirtualAddress::new(0x0040_3017);
        assert_eq!(LegacyPaging::slot_index(0, va), 0x0040_3017 >> 22);
        assert_eq!(LegacyPaging::slot_index(1, va), 0x3);
        assert_eq!(va.offset_in_page(), 0x17);
    }
}
