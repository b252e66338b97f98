//! Identity window: always-on access to physical memory.
//!
//! Physical range `[0, cache_size)` is permanently offset-mapped during
//! bootstrap, so revealing an address there is a pure address computation.
//! Anything beyond goes through a pool of dynamically mapped slots.
//! [`IdentityWindow::reveal`] and [`IdentityWindow::conceal`] form a strict
//! acquire/release pair; a caller that forgets to conceal leaks slots, which
//! [`IdentityWindow::slots_in_use`] makes visible.

use crate::arch::KernelLayout;
use crate::error::{VmemError, VmemResult};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage, page_align_up,
};
use kernel_sync::SpinLock;
use log::{trace, warn};

/// Hard ceiling on pool slots; bounds the bitmap.
pub const POOL_SLOT_LIMIT: usize = (0x2000_0000 / PAGE_SIZE) as usize;

const POOL_WORDS: usize = POOL_SLOT_LIMIT / 64;

/// Maps and unmaps one pool slot in the kernel address space.
///
/// The window does slot accounting; actual table edits go through this
/// seam, which the kernel wires to walker + mutator and tests to a
/// recording fake.
pub trait SlotMapper {
    fn map_slot(&mut self, page: VirtualPage, frame: PhysicalPage) -> VmemResult<()>;
    fn unmap_slot(&mut self, page: VirtualPage);
}

/// First-fit bitmap over the pool slots.
struct SlotPool {
    bits: [u64; POOL_WORDS],
    slots: usize,
    in_use: usize,
}

impl SlotPool {
    const fn new(slots: usize) -> Self {
        Self {
            bits: [0; POOL_WORDS],
            slots,
            in_use: 0,
        }
    }

    fn is_set(&self, slot: usize) -> bool {
        self.bits[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set(&mut self, slot: usize) {
        self.bits[slot / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: usize) {
        self.bits[slot / 64] &= !(1 << (slot % 64));
    }

    /// First-fit scan for `count` contiguous free slots.
    fn acquire(&mut self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run = 0;
        for slot in 0..self.slots {
            if self.is_set(slot) {
                run = 0;
                run_start = slot + 1;
                continue;
            }
            run += 1;
            if run == count {
                for taken in run_start..=slot {
                    self.set(taken);
                }
                self.in_use += count;
                return Some(run_start);
            }
        }
        None
    }

    /// Returns a contiguous range of slots.
    ///
    /// # Panics
    /// When a slot in the range is already free (conceal without reveal).
    fn release(&mut self, first: usize, count: usize) {
        for slot in first..first + count {
            assert!(self.is_set(slot), "identity window slot {slot} concealed twice");
            self.clear(slot);
        }
        self.in_use -= count;
    }
}

/// The identity window of one kernel.
pub struct IdentityWindow {
    cache_base: u64,
    cache_size: u64,
    pool_base: u64,
    pool_slots: usize,
    pool: SpinLock<Option<SlotPool>>,
}

impl IdentityWindow {
    /// # Panics
    /// When the layout's pool exceeds [`POOL_SLOT_LIMIT`].
    #[must_use]
    pub const fn new(layout: &KernelLayout) -> Self {
        assert!(layout.pool_slots() <= POOL_SLOT_LIMIT);
        Self {
            cache_base: layout.cache_base,
            cache_size: layout.cache_size,
            pool_base: layout.pool_base,
            pool_slots: layout.pool_slots(),
            pool: SpinLock::new(None),
        }
    }

    /// Makes `len` bytes at physical `pa` addressable; returns the virtual
    /// address of the first byte.
    ///
    /// Inside the permanent cache this is `cache_base | pa` and costs
    /// nothing. Beyond it, whole pages are mapped into contiguous pool
    /// slots; the result keeps the original in-page misalignment.
    ///
    /// # Panics
    /// On zero-length requests.
    pub fn reveal(
        &self,
        pa: PhysicalAddress,
        len: u64,
        slots: &mut impl SlotMapper,
    ) -> VmemResult<VirtualAddress> {
        assert!(len > 0, "reveal of a zero-length range at {pa}");
        if pa.as_u64() + len <= self.cache_size {
            return Ok(VirtualAddress::new(self.cache_base | pa.as_u64()));
        }

        let first_frame = pa.frame();
        let span = page_align_up(pa.as_u64() + len) - first_frame.base().as_u64();
        let count = (span / PAGE_SIZE) as usize;

        let mut guard = self.pool.lock();
        let pool = guard.get_or_insert_with(|| SlotPool::new(self.pool_slots));
        let Some(first) = pool.acquire(count) else {
            warn!(
                "identity window pool exhausted: {count} slots requested, {} in use",
                pool.in_use
            );
            return Err(VmemError::PoolExhausted { requested: count });
        };

        let base = VirtualPage::from_base(VirtualAddress::new(
            self.pool_base + first as u64 * PAGE_SIZE,
        ));
        for n in 0..count {
            let page = base.add_pages(n as u64);
            if let Err(error) = slots.map_slot(page, first_frame.add_pages(n as u64)) {
                for undo in 0..n {
                    slots.unmap_slot(base.add_pages(undo as u64));
                }
                pool.release(first, count);
                return Err(error);
            }
        }
        trace!("revealed {len} bytes at {pa} through {count} pool slots at {base}");
        Ok(base.base() + pa.offset_in_page())
    }

    /// Ends a reveal.
    ///
    /// `va` and `len` must be exactly what the matching [`Self::reveal`]
    /// returned and was given. Cache addresses are a no-op; addresses
    /// outside the window are logged and ignored.
    pub fn conceal(&self, va: VirtualAddress, len: u64, slots: &mut impl SlotMapper) {
        let addr = va.as_u64();
        if addr >= self.cache_base && addr + len <= self.cache_base + self.cache_size {
            return;
        }
        let pool_end = self.pool_base + self.pool_slots as u64 * PAGE_SIZE;
        if addr < self.pool_base || addr + len > pool_end {
            warn!("conceal of {va} which is not a window address");
            return;
        }

        let first_page = va.page();
        let span = page_align_up(addr + len) - first_page.base().as_u64();
        let count = (span / PAGE_SIZE) as usize;

        let mut guard = self.pool.lock();
        let Some(pool) = guard.as_mut() else {
            warn!("conceal of {va} before any reveal");
            return;
        };
        for n in 0..count {
            slots.unmap_slot(first_page.add_pages(n as u64));
        }
        let first_slot = ((first_page.base().as_u64() - self.pool_base) / PAGE_SIZE) as usize;
        pool.release(first_slot, count);
        trace!("concealed {count} pool slots at {first_page}");
    }

    /// Number of pool slots currently mapped. Zero when every reveal has
    /// been concealed.
    #[must_use]
    pub fn slots_in_use(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, |pool| pool.in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Records slot traffic instead of editing tables.
    #[derive(Default)]
    struct RecordingSlots {
        mapped: BTreeMap<u64, PhysicalPage>,
        fail_after: Option<usize>,
    }

    impl SlotMapper for RecordingSlots {
        fn map_slot(&mut self, page: VirtualPage, frame: PhysicalPage) -> VmemResult<()> {
            if let Some(budget) = self.fail_after.as_mut() {
                if *budget == 0 {
                    return Err(VmemError::OutOfFrames);
                }
                *budget -= 1;
            }
            assert!(
                self.mapped.insert(page.base().as_u64(), frame).is_none(),
                "slot mapped twice"
            );
            Ok(())
        }

        fn unmap_slot(&mut self, page: VirtualPage) {
            assert!(
                self.mapped.remove(&page.base().as_u64()).is_some(),
                "unmapping an absent slot"
            );
        }
    }

    fn window() -> IdentityWindow {
        // tiny layout: 1 MiB cache, 16 pool slots
        let layout = KernelLayout {
            cache_base: 0xB000_0000,
            cache_size: 0x10_0000,
            pool_base: 0xC000_0000,
            pool_size: 16 * PAGE_SIZE,
            heap_base: 0,
            heap_size: 0,
            dma_base: 0,
            dma_size: 0,
            mmio_base: 0,
            mmio_size: 0,
            driver_base: 0,
            driver_size: 0,
        };
        IdentityWindow::new(&layout)
    }

    #[test]
    fn cached_range_needs_no_slots() {
        let window = window();
        let mut slots = RecordingSlots::default();
        let va = window
            .reveal(PhysicalAddress::new(0x1234), 0x100, &mut slots)
            .unwrap();
        assert_eq!(va.as_u64(), 0xB000_1234);
        assert!(slots.mapped.is_empty());
        window.conceal(va, 0x100, &mut slots);
        assert_eq!(window.slots_in_use(), 0);
    }

    #[test]
    fn slow_path_round_trip_keeps_misalignment() {
        let window = window();
        let mut slots = RecordingSlots::default();
        // 0x200 bytes crossing a page boundary, far beyond the cache
        let pa = PhysicalAddress::new(0x7654_3F80);
        let va = window.reveal(pa, 0x200, &mut slots).unwrap();
        assert_eq!(va.offset_in_page(), 0xF80);
        assert_eq!(window.slots_in_use(), 2);
        assert_eq!(slots.mapped.len(), 2);
        assert_eq!(
            slots.mapped.get(&va.page().base().as_u64()),
            Some(&pa.frame())
        );

        window.conceal(va, 0x200, &mut slots);
        assert_eq!(window.slots_in_use(), 0);
        assert!(slots.mapped.is_empty());
    }

    #[test]
    fn repeated_reveals_do_not_leak() {
        let window = window();
        let mut slots = RecordingSlots::default();
        for round in 0..100u64 {
            let pa = PhysicalAddress::new(0x4000_0000 + round * PAGE_SIZE);
            let va = window.reveal(pa, PAGE_SIZE, &mut slots).unwrap();
            window.conceal(va, PAGE_SIZE, &mut slots);
        }
        assert_eq!(window.slots_in_use(), 0);
        assert!(slots.mapped.is_empty());
    }

    #[test]
    fn pool_exhaustion_is_an_error() {
        let window = window();
        let mut slots = RecordingSlots::default();
        let held = window
            .reveal(PhysicalAddress::new(0x4000_0000), 16 * PAGE_SIZE, &mut slots)
            .unwrap();
        assert_eq!(
            window.reveal(PhysicalAddress::new(0x5000_0000), PAGE_SIZE, &mut slots),
            Err(VmemError::PoolExhausted { requested: 1 })
        );
        window.conceal(held, 16 * PAGE_SIZE, &mut slots);
        assert_eq!(window.slots_in_use(), 0);
    }

    #[test]
    fn failed_mapping_rolls_back_the_slots() {
        let window = window();
        let mut slots = RecordingSlots {
            fail_after: Some(1),
            ..Default::default()
        };
        let result = window.reveal(
            PhysicalAddress::new(0x4000_0000),
            2 * PAGE_SIZE,
            &mut slots,
        );
        assert_eq!(result, Err(VmemError::OutOfFrames));
        assert_eq!(window.slots_in_use(), 0);
        assert!(slots.mapped.is_empty());
    }

    #[test]
    fn freed_slots_are_reused_first_fit() {
        let window = window();
        let mut slots = RecordingSlots::default();
        let a = window
            .reveal(PhysicalAddress::new(0x4000_0000), PAGE_SIZE, &mut slots)
            .unwrap();
        let b = window
            .reveal(PhysicalAddress::new(0x4000_1000), PAGE_SIZE, &mut slots)
            .unwrap();
        assert_ne!(a, b);
        window.conceal(a, PAGE_SIZE, &mut slots);
        let c = window
            .reveal(PhysicalAddress::new(0x4000_2000), PAGE_SIZE, &mut slots)
            .unwrap();
        assert_eq!(c, a, "first fit must reuse the lowest free slot");
        window.conceal(b, PAGE_SIZE, &mut slots);
        window.conceal(c, PAGE_SIZE, &mut slots);
    }
}
