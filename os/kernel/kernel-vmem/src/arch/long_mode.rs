//! Four-level long-mode paging: 512 entries of 64 bits per node.
//!
//! Levels 0..=3 walk root → directory-pointer → directory → table, each
//! consuming nine VA bits starting at bit 39. No self-reference slot; the
//! permanent identity cache makes tables directly reachable instead.

use super::{KernelLayout, PagingModel};
use crate::entry::{TableEntry, TableNode};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};

/// A 64-bit entry for any of the four levels.
///
/// Bit 59 (OS-available under PKU-less operation) tags copy-on-write
/// frames, mirroring the role bit 9 plays in the two-level entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct LongEntry {
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
    /// Page Size (PS, bit 7): large leaf at interior levels.
    pub large: bool,
    /// Global (G, bit 8), leaf only.
    pub global: bool,
    /// OS-available bits 9..=11.
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame index, address bits 12..=51.
    #[bits(40)]
    frame_index: u64,
    /// OS-available bits 52..=58.
    #[bits(7)]
    pub os_available_high: u8,
    /// OS-available bit 59: frame is shared copy-on-write.
    pub copy_on_write: bool,
    /// Protection-key bits 60..=62 (unused).
    #[bits(3)]
    pub protection_key: u8,
    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl TableEntry for LongEntry {
    fn empty() -> Self {
        Self::new()
    }

    fn raw(self) -> u64 {
        self.into_bits()
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
        (index != 0).then(|| PhysicalPage::from_index(index))
    }

    fn bind_frame(&mut self, frame: PhysicalPage) {
        debug_assert!(
            frame.index() < (1 << 40),
            "frame beyond the 52-bit physical address space"
        );
        self.set_frame_index(frame.index());
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// One table node at any level of the four-level hierarchy.
#[repr(C, align(4096))]
pub struct LongNode {
    entries: [LongEntry; 512],
}

const _: () = {
    assert!(size_of::<LongNode>() == PAGE_SIZE as usize);
    assert!(align_of::<LongNode>() == PAGE_SIZE as usize);
};

impl TableNode for LongNode {
    type Entry = LongEntry;
    const LEN: usize = 512;

    fn get(&self, index: usize) -> LongEntry {
        self.entries[index]
    }

    fn set(&mut self, index: usize, entry: LongEntry) {
        self.entries[index] = entry;
    }

    fn entry_mut(&mut self, index: usize) -> &mut LongEntry {
        &mut self.entries[index]
    }

    fn zero(&mut self) {
        self.entries = [LongEntry::new(); 512];
    }
}

/// The four-level model.
pub struct LongMode;

impl PagingModel for LongMode {
    type Entry = LongEntry;
    type Node = LongNode;

    const LEVELS: usize = 4;
    const SELF_REF_SLOT: Option<usize> = None;
    /// 2 MiB leaves in the page directory (level 2), bootstrap only.
    const BOOT_LARGE_LEVEL: Option<usize> = Some(2);
    const BOOT_LARGE_BYTES: u64 = 0x20_0000;

    const LAYOUT: KernelLayout = KernelLayout {
        cache_base: 0xFFFF_8880_0000_0000,
        cache_size: 0x0008_0000_0000, // 32 GiB
        pool_base: 0xFFFF_8900_0000_0000,
        pool_size: 0x2000_0000,
        heap_base: 0xFFFF_9000_0000_0000,
        heap_size: 0x0001_0000_0000,
        dma_base: 0xFFFF_9100_0000_0000,
        dma_size: 0x1000_0000,
        mmio_base: 0xFFFF_9200_0000_0000,
        mmio_size: 0x1000_0000,
        driver_base: 0xFFFF_9300_0000_0000,
        driver_size: 0x1000_0000,
    };

    fn slot_index(level: usize, va: VirtualAddress) -> usize {
        debug_assert!(level < 4, "four-level walk asked for level {level}");
        let shift = 39 - 9 * (level as u32);
        ((va.as_u64() >> shift) & 0x1FF) as usize
    }
}

const _: () = {
    let l = LongMode::LAYOUT;
    assert!(l.cache_base + l.cache_size <= l.pool_base);
    assert!(l.pool_base + l.pool_size <= l.heap_base);
    assert!(l.heap_base + l.heap_size <= l.dma_base);
    assert!(l.dma_base + l.dma_size <= l.mmio_base);
    assert!(l.mmio_base + l.mmio_size <= l.driver_base);
    assert!(l.cache_base.is_multiple_of(LongMode::BOOT_LARGE_BYTES));
    assert!(l.cache_size.is_multiple_of(LongMode::BOOT_LARGE_BYTES));
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_bits_match_hardware_positions() {
        let mut entry = LongEntry::new();
        entry.mark_present(true);
        entry.mark_large(true);
        entry.mark_copy_on_write(true);
        entry.bind_frame(PhysicalPage::from_index(0x12_3456_789A));
        let raw = entry.raw();
        assert_eq!(raw & 0b1, 1, "present is bit 0");
        assert_eq!(raw & (1 << 7), 1 << 7, "large/PS is bit 7");
        assert_eq!(raw & (1 << 59), 1 << 59, "copy-on-write is bit 59");
        assert_eq!((raw >> 12) & ((1 << 40) - 1), 0x12_3456_789A);
    }

    #[test]
    fn index_extraction_consumes_nine_bits_per_level() {
        // 0xFFFF_8880_0000_0000: root slot 273, zero below
        let va = VirtualAddress::new(LongMode::LAYOUT.cache_base);
        assert_eq!(LongMode::slot_index(0, va), 273);
        assert_eq!(LongMode::slot_index(1, va), 0);
        assert_eq!(LongMode::slot_index(2, va), 0);
        assert_eq!(LongMode::slot_index(3, va), 0);

        let va = VirtualAddress::new((5 << 39) | (17 << 30) | (123 << 21) | (511 << 12));
        assert_eq!(LongMode::slot_index(0, va), 5);
        assert_eq!(LongMode::slot_index(1, va), 17);
        assert_eq!(LongMode::slot_index(2, va), 123);
        assert_eq!(LongMode::slot_index(3, va), 511);
    }
}
