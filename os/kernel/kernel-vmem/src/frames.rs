//! Physical frame accounting.
//!
//! The frame allocator itself lives outside this crate, behind
//! [`FrameService`]. The [`FrameLedger`] wraps it with a reference-count
//! table so that shared frames (copy-on-write) are freed exactly once, and
//! so that double releases are caught instead of corrupting the allocator.

use crate::error::{VmemError, VmemResult};
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalPage;
use log::trace;

/// The physical memory manager's interface, as this crate needs it.
///
/// Frame 0 is reserved and must never be handed out; a zero frame field in a
/// table entry means "no frame".
pub trait FrameService {
    /// Allocates one 4 KiB frame.
    fn allocate_frame(&mut self) -> Option<PhysicalPage>;

    /// Allocates `count` physically contiguous frames, returning the first.
    fn allocate_contiguous(&mut self, count: usize) -> Option<PhysicalPage>;

    /// Returns a frame to the allocator.
    fn free_frame(&mut self, frame: PhysicalPage);

    /// Number of frames currently free.
    fn free_frame_count(&self) -> usize;
}

/// One byte of reference count per trackable frame.
///
/// Counts above 1 only ever occur on the copy-on-write path. Frames beyond
/// the table (device windows, MMIO addresses) are untracked.
pub struct RefCountTable {
    counts: Vec<u8>,
}

impl RefCountTable {
    #[must_use]
    pub fn with_frames(frames: usize) -> Self {
        Self {
            counts: vec![0; frames],
        }
    }

    fn slot(&self, frame: PhysicalPage) -> Option<usize> {
        usize::try_from(frame.index())
            .ok()
            .filter(|&index| index < self.counts.len())
    }

    /// Current count, or `None` for untracked frames.
    #[must_use]
    pub fn count(&self, frame: PhysicalPage) -> Option<u8> {
        self.slot(frame).map(|index| self.counts[index])
    }

    /// Marks a freshly allocated frame as referenced once.
    ///
    /// # Panics
    /// When the frame is untracked or its count is not zero; either means
    /// the frame service handed out a live frame.
    fn acquire(&mut self, frame: PhysicalPage) {
        let Some(index) = self.slot(frame) else {
            panic!("frame service returned untracked frame {frame}");
        };
        assert!(
            self.counts[index] == 0,
            "frame service returned frame {frame} with {} live references",
            self.counts[index]
        );
        self.counts[index] = 1;
    }

    /// Adds a reference to a shared frame.
    ///
    /// # Panics
    /// On untracked frames and on count overflow.
    pub fn retain(&mut self, frame: PhysicalPage) {
        let Some(index) = self.slot(frame) else {
            panic!("retain of untracked frame {frame}");
        };
        self.counts[index] = self.counts[index]
            .checked_add(1)
            .unwrap_or_else(|| panic!("reference count overflow for frame {frame}"));
    }

    /// Drops a reference; `true` when the count reached zero.
    ///
    /// # Panics
    /// When the count is already zero (double release) or the frame is
    /// untracked.
    pub fn release(&mut self, frame: PhysicalPage) -> bool {
        let Some(index) = self.slot(frame) else {
            panic!("release of untracked frame {frame}");
        };
        assert!(
            self.counts[index] > 0,
            "reference count underflow releasing frame {frame}"
        );
        self.counts[index] -= 1;
        self.counts[index] == 0
    }

    /// Whether the frame falls inside the table.
    #[must_use]
    pub fn is_tracked(&self, frame: PhysicalPage) -> bool {
        self.slot(frame).is_some()
    }
}

/// A [`FrameService`] paired with its [`RefCountTable`].
///
/// All frame traffic from this crate goes through the ledger: allocation
/// sets the count to 1, release decrements and frees at zero. Releasing an
/// untracked frame is a silent no-op; such frames (device memory) were never
/// the allocator's to begin with.
pub struct FrameLedger<F> {
    service: F,
    refs: RefCountTable,
}

impl<F: FrameService> FrameLedger<F> {
    pub fn new(service: F, tracked_frames: usize) -> Self {
        Self {
            service,
            refs: RefCountTable::with_frames(tracked_frames),
        }
    }

    /// Allocates one frame with an initial reference count of 1.
    pub fn allocate(&mut self) -> VmemResult<PhysicalPage> {
        let frame = self
            .service
            .allocate_frame()
            .ok_or(VmemError::OutOfFrames)?;
        self.refs.acquire(frame);
        Ok(frame)
    }

    /// Allocates `count` contiguous frames, each counted once.
    pub fn allocate_contiguous(&mut self, count: usize) -> VmemResult<PhysicalPage> {
        let first = self
            .service
            .allocate_contiguous(count)
            .ok_or(VmemError::OutOfFrames)?;
        for n in 0..count {
            self.refs.acquire(first.add_pages(n as u64));
        }
        Ok(first)
    }

    /// Adds a reference to a shared (copy-on-write) frame.
    pub fn retain(&mut self, frame: PhysicalPage) {
        self.refs.retain(frame);
    }

    /// Drops a reference and frees the frame when nobody holds it anymore.
    pub fn release(&mut self, frame: PhysicalPage) {
        if !self.refs.is_tracked(frame) {
            trace!("release of untracked frame {frame}; leaving it alone");
            return;
        }
        if self.refs.release(frame) {
            self.service.free_frame(frame);
            trace!("frame {frame} freed");
        }
    }

    /// Current reference count, `None` for untracked frames.
    #[must_use]
    pub fn reference_count(&self, frame: PhysicalPage) -> Option<u8> {
        self.refs.count(frame)
    }

    #[must_use]
    pub fn free_frame_count(&self) -> usize {
        self.service.free_frame_count()
    }
}
