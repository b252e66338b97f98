//! Shared test harness: simulated physical memory and fake seams.
//!
//! Physical addresses are synthetic frame indices (`pa = index << 12`) into
//! a vector of 4 KiB-aligned frames, which keeps both entry widths happy on
//! the host. Frame 0 is never handed out, matching the "zero frame field
//! means absent" rule.

use crate::frames::FrameService;
use crate::space::RootRegister;
use crate::tlb::TlbFlush;
use crate::PhysMapper;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use std::cell::RefCell;

#[repr(C, align(4096))]
#[derive(Clone)]
struct Frame4K([u8; 4096]);

/// Simulated RAM behind the [`PhysMapper`] seam.
pub(crate) struct SimRam {
    frames: Vec<Frame4K>,
}

impl SimRam {
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            frames: vec![Frame4K([0; 4096]); frames],
        }
    }
}

impl PhysMapper for SimRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let index = (pa.as_u64() >> 12) as usize;
        let offset = pa.offset_in_page() as usize;
        assert!(
            index < self.frames.len(),
            "simulated access beyond RAM at {pa}"
        );
        assert!(offset + size_of::<T>() <= 4096, "access crosses a frame");
        let frame = self.frames[index].0.as_ptr().cast_mut();
        // tests are single threaded; aliasing is controlled by the callers
        unsafe { &mut *frame.add(offset).cast::<T>() }
    }
}

/// Frame service with full free accounting: bump allocation plus a free
/// list, so `free_frame_count` baselines hold across alloc/free cycles.
pub(crate) struct CountingFrames {
    next: u64,
    limit: u64,
    free_list: Vec<PhysicalPage>,
}

impl CountingFrames {
    /// Hands out frames `first..limit`; keep `first` at 1 or above so frame
    /// 0 stays reserved.
    pub(crate) fn new(first: u64, limit: u64) -> Self {
        assert!(first > 0 && first <= limit);
        Self {
            next: first,
            limit,
            free_list: Vec::new(),
        }
    }
}

impl FrameService for CountingFrames {
    fn allocate_frame(&mut self) -> Option<PhysicalPage> {
        if let Some(frame) = self.free_list.pop() {
            return Some(frame);
        }
        if self.next >= self.limit {
            return None;
        }
        let frame = PhysicalPage::from_index(self.next);
        self.next += 1;
        Some(frame)
    }

    fn allocate_contiguous(&mut self, count: usize) -> Option<PhysicalPage> {
        let count = count as u64;
        if self.next + count > self.limit {
            return None;
        }
        let first = PhysicalPage::from_index(self.next);
        self.next += count;
        Some(first)
    }

    fn free_frame(&mut self, frame: PhysicalPage) {
        debug_assert!(!self.free_list.contains(&frame), "double free of {frame}");
        self.free_list.push(frame);
    }

    fn free_frame_count(&self) -> usize {
        self.free_list.len() + (self.limit - self.next) as usize
    }
}

/// Records every flushed address.
#[derive(Default)]
pub(crate) struct RecordingTlb {
    flushed: RefCell<Vec<VirtualAddress>>,
}

impl RecordingTlb {
    pub(crate) fn flushes(&self) -> usize {
        self.flushed.borrow().len()
    }

    pub(crate) fn saw(&self, va: VirtualAddress) -> bool {
        self.flushed.borrow().contains(&va)
    }
}

impl TlbFlush for RecordingTlb {
    fn invalidate(&self, va: VirtualAddress) {
        self.flushed.borrow_mut().push(va);
    }

    fn shootdown(&self, va: VirtualAddress) {
        self.flushed.borrow_mut().push(va);
    }
}

/// Root register that records every load instead of touching hardware.
#[derive(Default)]
pub(crate) struct StubRoot {
    loads: Vec<PhysicalPage>,
}

impl StubRoot {
    pub(crate) fn loads(&self) -> &[PhysicalPage] {
        &self.loads
    }
}

impl RootRegister for StubRoot {
    unsafe fn load(&mut self, root: PhysicalPage) {
        self.loads.push(root);
    }
}
