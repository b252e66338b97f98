//! Bump-style virtual region allocators.
//!
//! Each region (heap, MMIO, DMA, driver) owns a fixed virtual range and a
//! watermark under a spin lock. Growth maps pages at the watermark and
//! returns an owning [`RegionBlock`]; only the trailing block can be handed
//! back, which is all the heap's sbrk discipline needs. There is no free
//! list.

use crate::PhysMapper;
use crate::arch::PagingModel;
use crate::entry::MapRequest;
use crate::error::{VmemError, VmemResult};
use crate::frames::{FrameLedger, FrameService};
use crate::tlb::TlbFlush;
use crate::{mutator, walker};
use core::marker::PhantomData;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, is_page_aligned,
};
use kernel_sync::SpinLock;
use log::{debug, warn};

/// Everything a region needs to edit mappings: the target space's root plus
/// the seams. Borrowed fresh for every call.
pub struct MapContext<'a, M: PagingModel, P: PhysMapper, F: FrameService, T: TlbFlush> {
    root: PhysicalPage,
    mapper: &'a P,
    ledger: &'a mut FrameLedger<F>,
    tlb: &'a T,
    _model: PhantomData<M>,
}

impl<'a, M: PagingModel, P: PhysMapper, F: FrameService, T: TlbFlush>
    MapContext<'a, M, P, F, T>
{
    pub fn new(
        root: PhysicalPage,
        mapper: &'a P,
        ledger: &'a mut FrameLedger<F>,
        tlb: &'a T,
    ) -> Self {
        Self {
            root,
            mapper,
            ledger,
            tlb,
            _model: PhantomData,
        }
    }
}

/// An allocation a region handed out. Must be returned to the same region.
#[must_use = "region blocks must be handed back via shrink or they stay mapped"]
#[derive(Debug)]
pub struct RegionBlock {
    base: VirtualAddress,
    len: u64,
    region: &'static str,
}

impl RegionBlock {
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One bump region.
///
/// `critical` regions (the kernel heap) panic on exhaustion or mapping
/// failure; everything else surfaces a `Result` so drivers can degrade.
pub struct RegionAllocator {
    name: &'static str,
    base: u64,
    size: u64,
    request: MapRequest,
    critical: bool,
    watermark: SpinLock<u64>,
}

impl RegionAllocator {
    pub const fn new(
        name: &'static str,
        base: u64,
        size: u64,
        request: MapRequest,
        critical: bool,
    ) -> Self {
        Self {
            name,
            base,
            size,
            request,
            critical,
            watermark: SpinLock::new(0),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn used(&self) -> u64 {
        *self.watermark.lock()
    }

    /// Extends the region by `len` bytes backed by fresh frames.
    ///
    /// # Panics
    /// When `len` is zero or not page aligned, and on any failure in a
    /// critical region.
    pub fn grow<M, P, F, T>(
        &self,
        cx: &mut MapContext<'_, M, P, F, T>,
        len: u64,
    ) -> VmemResult<RegionBlock>
    where
        M: PagingModel,
        P: PhysMapper,
        F: FrameService,
        T: TlbFlush,
    {
        self.extend(cx, len, None)
    }

    /// Maps `len` bytes of caller-owned physical memory at the watermark.
    ///
    /// No frames are allocated; the entries alias `phys` with this region's
    /// request flags.
    ///
    /// # Panics
    /// When `phys` or `len` is not page aligned, or `len` is zero.
    pub fn map_device<M, P, F, T>(
        &self,
        cx: &mut MapContext<'_, M, P, F, T>,
        phys: PhysicalAddress,
        len: u64,
    ) -> VmemResult<RegionBlock>
    where
        M: PagingModel,
        P: PhysMapper,
        F: FrameService,
        T: TlbFlush,
    {
        assert!(
            is_page_aligned(phys.as_u64()),
            "region `{}`: device address {phys} is not page aligned",
            self.name
        );
        self.extend(cx, len, Some(phys))
    }

    fn extend<M, P, F, T>(
        &self,
        cx: &mut MapContext<'_, M, P, F, T>,
        len: u64,
        phys: Option<PhysicalAddress>,
    ) -> VmemResult<RegionBlock>
    where
        M: PagingModel,
        P: PhysMapper,
        F: FrameService,
        T: TlbFlush,
    {
        assert!(
            len > 0 && is_page_aligned(len),
            "region `{}`: length {len:#x} is not a whole page multiple",
            self.name
        );
        let mut watermark = self.watermark.lock();
        if *watermark + len > self.size {
            assert!(
                !self.critical,
                "critical region `{}` exhausted: {len:#x} requested, {:#x} free",
                self.name,
                self.size - *watermark
            );
            warn!(
                "region `{}` exhausted: {len:#x} requested, {:#x} free",
                self.name,
                self.size - *watermark
            );
            return Err(VmemError::RegionFull {
                region: self.name,
                requested: len,
            });
        }

        let base = VirtualAddress::new(self.base + *watermark);
        if let Err(error) = self.map_range(cx, base, len, phys) {
            assert!(
                !self.critical,
                "critical region `{}` growth failed: {error}",
                self.name
            );
            return Err(error);
        }
        *watermark += len;
        debug!("region `{}` grew {len:#x} bytes at {base}", self.name);
        Ok(RegionBlock {
            base,
            len,
            region: self.name,
        })
    }

    fn map_range<M, P, F, T>(
        &self,
        cx: &mut MapContext<'_, M, P, F, T>,
        base: VirtualAddress,
        len: u64,
        phys: Option<PhysicalAddress>,
    ) -> VmemResult<()>
    where
        M: PagingModel,
        P: PhysMapper,
        F: FrameService,
        T: TlbFlush,
    {
        for n in 0..len / PAGE_SIZE {
            let va = base + n * PAGE_SIZE;
            let bind = phys.map(|p| (p + n * PAGE_SIZE).frame());
            let mapped = walker::locate::<M, P, F>(cx.mapper, cx.ledger, cx.root, va, true)
                .and_then(|entry| mutator::configure(entry, cx.ledger, self.request, bind));
            if let Err(error) = mapped {
                for undo in 0..n {
                    self.unmap_page(cx, base + undo * PAGE_SIZE);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn unmap_page<M, P, F, T>(&self, cx: &mut MapContext<'_, M, P, F, T>, va: VirtualAddress)
    where
        M: PagingModel,
        P: PhysMapper,
        F: FrameService,
        T: TlbFlush,
    {
        match walker::lookup::<M, P>(cx.mapper, cx.root, va) {
            Ok(entry) => {
                mutator::release(entry, cx.ledger);
                cx.tlb.shootdown(va);
            }
            Err(_) => warn!("region `{}`: no mapping at {va} to remove", self.name),
        }
    }

    /// Returns `block` to the region, unmapping its pages and releasing
    /// their frames through the ledger.
    ///
    /// Only the trailing allocation can be returned; anything else is
    /// refused with [`VmemError::NotTrailing`] and the watermark stays put.
    /// On success the block's base address is returned (sbrk symmetry: a
    /// following `grow` of any size yields this base again).
    ///
    /// # Panics
    /// When `block` came from a different region.
    pub fn shrink<M, P, F, T>(
        &self,
        cx: &mut MapContext<'_, M, P, F, T>,
        block: RegionBlock,
    ) -> VmemResult<VirtualAddress>
    where
        M: PagingModel,
        P: PhysMapper,
        F: FrameService,
        T: TlbFlush,
    {
        assert!(
            block.region == self.name,
            "block from region `{}` returned to `{}`",
            block.region,
            self.name
        );
        let mut watermark = self.watermark.lock();
        let offset = block.base.as_u64() - self.base;
        if offset + block.len != *watermark {
            warn!(
                "region `{}`: block at {} is not the trailing allocation; shrink refused",
                self.name, block.base
            );
            return Err(VmemError::NotTrailing {
                region: self.name,
                base: block.base,
            });
        }

        for n in 0..block.len / PAGE_SIZE {
            self.unmap_page(cx, block.base + n * PAGE_SIZE);
        }
        *watermark = offset;
        debug!(
            "region `{}` shrank {:#x} bytes back to {:#x}",
            self.name, block.len, *watermark
        );
        Ok(block.base)
    }
}
