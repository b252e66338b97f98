//! The kernel's assembled virtual-memory service.
//!
//! [`KernelVm`] wires the mapper, the frame ledger, the space manager, the
//! identity window and the four regions into one front door. The kernel
//! instantiates exactly one; `&mut self` on every mutating operation is the
//! single-writer rule in type form.

use crate::PhysMapper;
use crate::arch::PagingModel;
use crate::entry::{MapRequest, TableEntry};
use crate::error::VmemResult;
use crate::frames::{FrameLedger, FrameService};
use crate::region::{MapContext, RegionAllocator, RegionBlock};
use crate::space::{AddressSpace, CloneStrategy, RootRegister, SpaceManager};
use crate::tlb::TlbFlush;
use crate::window::{IdentityWindow, SlotMapper};
use crate::{mutator, walker};
use core::marker::PhantomData;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage, is_page_aligned,
    page_align_up,
};
use log::{debug, warn};

/// Pool-slot mapper over the kernel address space.
struct KernelSlots<'a, M: PagingModel, P: PhysMapper, F: FrameService, T: TlbFlush> {
    root: PhysicalPage,
    mapper: &'a P,
    ledger: &'a mut FrameLedger<F>,
    tlb: &'a T,
    _model: PhantomData<M>,
}

impl<M: PagingModel, P: PhysMapper, F: FrameService, T: TlbFlush> SlotMapper
    for KernelSlots<'_, M, P, F, T>
{
    fn map_slot(&mut self, page: VirtualPage, frame: PhysicalPage) -> VmemResult<()> {
        let entry =
            walker::locate::<M, P, F>(self.mapper, self.ledger, self.root, page.base(), true)?;
        // slots may expose device memory, so they are always mapped uncached
        mutator::configure(entry, self.ledger, MapRequest::kernel_device(), Some(frame))
    }

    fn unmap_slot(&mut self, page: VirtualPage) {
        match walker::lookup::<M, P>(self.mapper, self.root, page.base()) {
            Ok(entry) => {
                // the revealed frame is borrowed, never owned by the slot
                mutator::unbind(entry);
                self.tlb.shootdown(page.base());
            }
            Err(_) => warn!("identity window slot {page} vanished before conceal"),
        }
    }
}

/// The assembled virtual-memory service.
pub struct KernelVm<M, P, F, R, T>
where
    M: PagingModel,
    P: PhysMapper,
    F: FrameService,
    R: RootRegister,
    T: TlbFlush,
{
    mapper: P,
    ledger: FrameLedger<F>,
    spaces: SpaceManager<M, R>,
    window: IdentityWindow,
    tlb: T,
    heap: RegionAllocator,
    mmio: RegionAllocator,
    dma: RegionAllocator,
    driver: RegionAllocator,
}

impl<M, P, F, R, T> KernelVm<M, P, F, R, T>
where
    M: PagingModel,
    P: PhysMapper,
    F: FrameService,
    R: RootRegister,
    T: TlbFlush,
{
    /// Builds the service and the kernel address space.
    ///
    /// `tracked_frames` sizes the reference-count table; it should cover
    /// every frame the service can allocate. The register is not touched
    /// yet; bootstrap hand-off order is build, [`Self::init_identity_cache`],
    /// then [`Self::activate`].
    pub fn new(
        mapper: P,
        service: F,
        tracked_frames: usize,
        register: R,
        tlb: T,
    ) -> VmemResult<Self> {
        let mut ledger = FrameLedger::new(service, tracked_frames);
        let kernel = AddressSpace::<M>::create(&mapper, &mut ledger)?;
        let spaces = SpaceManager::new(kernel.root(), register);
        let layout = &M::LAYOUT;
        Ok(Self {
            mapper,
            ledger,
            spaces,
            window: IdentityWindow::new(layout),
            tlb,
            heap: RegionAllocator::new(
                "heap",
                layout.heap_base,
                layout.heap_size,
                MapRequest::kernel_data().with_global(true),
                true,
            ),
            mmio: RegionAllocator::new(
                "mmio",
                layout.mmio_base,
                layout.mmio_size,
                MapRequest::kernel_device().with_global(true),
                false,
            ),
            dma: RegionAllocator::new(
                "dma",
                layout.dma_base,
                layout.dma_size,
                MapRequest::kernel_device().with_global(true),
                false,
            ),
            driver: RegionAllocator::new(
                "driver",
                layout.driver_base,
                layout.driver_size,
                MapRequest::kernel_data().with_global(true),
                false,
            ),
        })
    }

    /// Identity-maps the first `min(ram_bytes, cache_size)` bytes of
    /// physical memory at the cache base.
    ///
    /// The four-level model uses large leaves here (and only here); the
    /// two-level model loops 4 KiB pages. RAM beyond the cache stays
    /// reachable through reveal/conceal.
    pub fn init_identity_cache(&mut self, ram_bytes: u64) -> VmemResult<()> {
        let layout = &M::LAYOUT;
        let mut mapped = page_align_up(ram_bytes);
        if mapped > layout.cache_size {
            warn!(
                "RAM ({ram_bytes:#x} bytes) exceeds the identity cache; caching the first {:#x} bytes only",
                layout.cache_size
            );
            mapped = layout.cache_size;
        }
        let root = self.spaces.kernel_root();

        if let Some(level) = M::BOOT_LARGE_LEVEL {
            let chunk = M::BOOT_LARGE_BYTES;
            let span = mapped.div_ceil(chunk) * chunk;
            let mut offset = 0;
            while offset < span {
                let va = VirtualAddress::new(layout.cache_base + offset);
                let entry = walker::locate_at::<M, P, F>(
                    &self.mapper,
                    &mut self.ledger,
                    root,
                    va,
                    level,
                    true,
                )?;
                entry.bind_frame(PhysicalPage::from_base(PhysicalAddress::new(offset)));
                entry.mark_present(true);
                entry.mark_writable(true);
                entry.mark_global(true);
                entry.mark_large(true);
                offset += chunk;
            }
        } else {
            // frame 0 is the reserved null frame; a zero frame field decodes
            // as absent, so its cache page stays unmapped
            let mut offset = PAGE_SIZE;
            while offset < mapped {
                let va = VirtualAddress::new(layout.cache_base + offset);
                let entry = walker::locate::<M, P, F>(
                    &self.mapper,
                    &mut self.ledger,
                    root,
                    va,
                    true,
                )?;
                mutator::configure(
                    entry,
                    &mut self.ledger,
                    MapRequest::kernel_data().with_global(true),
                    Some(PhysicalPage::from_base(PhysicalAddress::new(offset))),
                )?;
                offset += PAGE_SIZE;
            }
        }
        debug!(
            "identity cache covers {mapped:#x} bytes at {:#x}",
            layout.cache_base
        );
        Ok(())
    }

    /// Loads the kernel root into the translation hardware.
    ///
    /// Finishes bring-up: [`Self::new`] and [`Self::init_identity_cache`]
    /// only build the hierarchy, they never touch the root register.
    pub fn activate(&mut self) {
        self.spaces.activate();
    }

    /// Extends the kernel heap; panics on exhaustion (critical region).
    pub fn heap_grow(&mut self, len: u64) -> VmemResult<RegionBlock> {
        let mut cx = MapContext::<M, _, _, _>::new(
            self.spaces.kernel_root(),
            &self.mapper,
            &mut self.ledger,
            &self.tlb,
        );
        self.heap.grow(&mut cx, len)
    }

    /// Returns the trailing heap block; frames go back to the service.
    pub fn heap_shrink(&mut self, block: RegionBlock) -> VmemResult<VirtualAddress> {
        let mut cx = MapContext::<M, _, _, _>::new(
            self.spaces.kernel_root(),
            &self.mapper,
            &mut self.ledger,
            &self.tlb,
        );
        self.heap.shrink(&mut cx, block)
    }

    /// Maps `len` bytes of device registers at `phys`, uncached.
    pub fn map_mmio(&mut self, phys: PhysicalAddress, len: u64) -> VmemResult<RegionBlock> {
        let mut cx = MapContext::<M, _, _, _>::new(
            self.spaces.kernel_root(),
            &self.mapper,
            &mut self.ledger,
            &self.tlb,
        );
        self.mmio.map_device(&mut cx, phys, len)
    }

    pub fn unmap_mmio(&mut self, block: RegionBlock) -> VmemResult<VirtualAddress> {
        let mut cx = MapContext::<M, _, _, _>::new(
            self.spaces.kernel_root(),
            &self.mapper,
            &mut self.ledger,
            &self.tlb,
        );
        self.mmio.shrink(&mut cx, block)
    }

    /// Allocates physically contiguous, uncached DMA memory.
    ///
    /// Returns the block plus the physical base for device programming.
    ///
    /// # Panics
    /// When `len` is zero or not page aligned.
    pub fn allocate_dma(&mut self, len: u64) -> VmemResult<(RegionBlock, PhysicalAddress)> {
        assert!(
            len > 0 && is_page_aligned(len),
            "DMA length {len:#x} is not a whole page multiple"
        );
        let count = (len / PAGE_SIZE) as usize;
        let first = self.ledger.allocate_contiguous(count)?;
        let result = {
            let mut cx = MapContext::<M, _, _, _>::new(
                self.spaces.kernel_root(),
                &self.mapper,
                &mut self.ledger,
                &self.tlb,
            );
            self.dma.map_device(&mut cx, first.base(), len)
        };
        match result {
            Ok(block) => Ok((block, first.base())),
            Err(error) => {
                for n in 0..count {
                    self.ledger.release(first.add_pages(n as u64));
                }
                Err(error)
            }
        }
    }

    /// Returns a DMA block; its frames are freed.
    pub fn free_dma(&mut self, block: RegionBlock) -> VmemResult<VirtualAddress> {
        let mut cx = MapContext::<M, _, _, _>::new(
            self.spaces.kernel_root(),
            &self.mapper,
            &mut self.ledger,
            &self.tlb,
        );
        self.dma.shrink(&mut cx, block)
    }

    /// Carves out space for a driver image.
    pub fn map_driver(&mut self, len: u64) -> VmemResult<RegionBlock> {
        let mut cx = MapContext::<M, _, _, _>::new(
            self.spaces.kernel_root(),
            &self.mapper,
            &mut self.ledger,
            &self.tlb,
        );
        self.driver.grow(&mut cx, len)
    }

    pub fn unmap_driver(&mut self, block: RegionBlock) -> VmemResult<VirtualAddress> {
        let mut cx = MapContext::<M, _, _, _>::new(
            self.spaces.kernel_root(),
            &self.mapper,
            &mut self.ledger,
            &self.tlb,
        );
        self.driver.shrink(&mut cx, block)
    }

    /// Makes `len` bytes at physical `pa` addressable. See
    /// [`IdentityWindow::reveal`].
    pub fn reveal(&mut self, pa: PhysicalAddress, len: u64) -> VmemResult<VirtualAddress> {
        let mut slots = KernelSlots::<M, P, F, T> {
            root: self.spaces.kernel_root(),
            mapper: &self.mapper,
            ledger: &mut self.ledger,
            tlb: &self.tlb,
            _model: PhantomData,
        };
        self.window.reveal(pa, len, &mut slots)
    }

    /// Ends a reveal. See [`IdentityWindow::conceal`].
    pub fn conceal(&mut self, va: VirtualAddress, len: u64) {
        let mut slots = KernelSlots::<M, P, F, T> {
            root: self.spaces.kernel_root(),
            mapper: &self.mapper,
            ledger: &mut self.ledger,
            tlb: &self.tlb,
            _model: PhantomData,
        };
        self.window.conceal(va, len, &mut slots);
    }

    /// Creates an empty address space.
    pub fn create_space(&mut self) -> VmemResult<AddressSpace<M>> {
        AddressSpace::create(&self.mapper, &mut self.ledger)
    }

    /// Clones `source`, or the currently active space for `None`.
    pub fn clone_space(
        &mut self,
        source: Option<&AddressSpace<M>>,
        strategy: CloneStrategy,
    ) -> VmemResult<AddressSpace<M>> {
        let current;
        let source = match source {
            Some(space) => space,
            None => {
                current = AddressSpace::from_root(self.spaces.current_root());
                &current
            }
        };
        source.clone_with(&self.mapper, &mut self.ledger, strategy)
    }

    /// Switches to `target` (`None` = kernel space); `false` when it was
    /// already active.
    pub fn switch(&mut self, target: Option<&AddressSpace<M>>) -> bool {
        self.spaces.switch(target)
    }

    /// Tears a space down, returning all its frames.
    ///
    /// # Panics
    /// When `space` is the active one.
    pub fn destroy_space(&mut self, space: AddressSpace<M>) {
        assert!(
            space.root() != self.spaces.current_root(),
            "destroying the active address space"
        );
        space.destroy(&self.mapper, &mut self.ledger);
    }

    /// Maps one page in `space`. Flushes the local TLB entry.
    pub fn map_page(
        &mut self,
        space: &AddressSpace<M>,
        va: VirtualAddress,
        request: MapRequest,
        bind: Option<PhysicalPage>,
    ) -> VmemResult<()> {
        let entry =
            walker::locate::<M, P, F>(&self.mapper, &mut self.ledger, space.root(), va, true)?;
        mutator::configure(entry, &mut self.ledger, request, bind)?;
        self.tlb.invalidate(va);
        Ok(())
    }

    /// Unmaps one page in `space`, releasing its frame. Broadcasts a
    /// shootdown.
    pub fn unmap_page(&mut self, space: &AddressSpace<M>, va: VirtualAddress) -> VmemResult<()> {
        let entry = walker::lookup::<M, P>(&self.mapper, space.root(), va)?;
        mutator::release(entry, &mut self.ledger);
        self.tlb.shootdown(va);
        Ok(())
    }

    /// Resolves `va` through `space`'s tables.
    #[must_use]
    pub fn translate_in(
        &self,
        space: &AddressSpace<M>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        space.translate(&self.mapper, va)
    }

    /// The kernel address space as an adoptable handle.
    #[must_use]
    pub fn kernel_space(&self) -> AddressSpace<M> {
        AddressSpace::from_root(self.spaces.kernel_root())
    }

    #[must_use]
    pub fn current_root(&self) -> PhysicalPage {
        self.spaces.current_root()
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.ledger.free_frame_count()
    }

    #[must_use]
    pub fn window_slots_in_use(&self) -> usize {
        self.window.slots_in_use()
    }

    #[cfg(test)]
    pub(crate) fn parts(&self) -> (&P, &T) {
        (&self.mapper, &self.tlb)
    }

    #[cfg(test)]
    pub(crate) const fn root_register(&self) -> &R {
        self.spaces.register()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{LegacyPaging, LongMode};
    use crate::error::VmemError;
    use crate::testing::{CountingFrames, RecordingTlb, SimRam, StubRoot};

    type LegacyVm = KernelVm<LegacyPaging, SimRam, CountingFrames, StubRoot, RecordingTlb>;
    type LongVm = KernelVm<LongMode, SimRam, CountingFrames, StubRoot, RecordingTlb>;

    fn vm(frames: usize) -> LegacyVm {
        KernelVm::new(
            SimRam::new(frames),
            CountingFrames::new(1, frames as u64),
            frames,
            StubRoot::default(),
            RecordingTlb::default(),
        )
        .unwrap()
    }

    #[test]
    fn locate_configure_translate_recomposes_the_offset() {
        let mut vm = vm(64);
        let kernel = vm.kernel_space();
        let va = VirtualAddress::new(0x0040_3017);
        vm.map_page(&kernel, va, MapRequest::kernel_data(), None)
            .unwrap();

        let pa = vm.translate_in(&kernel, va).unwrap();
        let frame = pa.frame();
        assert_eq!(pa, frame.join(0x17));
        // the whole page translates consistently
        assert_eq!(
            vm.translate_in(&kernel, VirtualAddress::new(0x0040_3000)),
            Some(frame.base())
        );
    }

    #[test]
    fn heap_grow_shrink_restores_base_and_frames() {
        let mut vm = vm(128);
        let baseline = vm.free_frames();

        let block = vm.heap_grow(0x3000).unwrap();
        let base = block.base();
        assert_eq!(vm.heap_shrink(block).unwrap(), base);
        // page frames return; only the table built underneath stays
        assert_eq!(vm.free_frames(), baseline - 1);

        let again = vm.heap_grow(0x1000).unwrap();
        assert_eq!(again.base(), base, "sbrk symmetry");
        let _ = vm.heap_shrink(again).unwrap();
        assert_eq!(vm.free_frames(), baseline - 1);
    }

    #[test]
    fn reveal_beyond_the_cache_round_trips_without_leaking() {
        let mut vm = vm(64);
        let baseline_frames = vm.free_frames();
        let mut first_pass_frames = 0;

        for round in 0..50u64 {
            let pa = PhysicalAddress::new(0x7654_3F80 + round * PAGE_SIZE);
            let va = vm.reveal(pa, 0x200).unwrap();
            assert_eq!(va.offset_in_page(), 0xF80);
            assert_eq!(vm.window_slots_in_use(), 2);
            vm.conceal(va, 0x200);
            assert_eq!(vm.window_slots_in_use(), 0);
            if round == 0 {
                first_pass_frames = vm.free_frames();
            }
        }
        // table frames for the pool slots are built once, then reused
        assert_eq!(vm.free_frames(), first_pass_frames);
        assert!(vm.free_frames() < baseline_frames);
    }

    #[test]
    fn reveal_inside_the_cache_is_pure_arithmetic() {
        let mut vm = vm(64);
        let baseline = vm.free_frames();
        let va = vm.reveal(PhysicalAddress::new(0x1234), 0x100).unwrap();
        assert_eq!(
            va.as_u64(),
            LegacyPaging::LAYOUT.cache_base | 0x1234
        );
        assert_eq!(vm.free_frames(), baseline, "no table edits on the fast path");
        vm.conceal(va, 0x100);
    }

    #[test]
    fn identity_cache_binds_frames_one_to_one() {
        let mut vm = vm(64);
        vm.init_identity_cache(0x8000).unwrap();
        let kernel = vm.kernel_space();
        let cache_base = LegacyPaging::LAYOUT.cache_base;
        for page in 1..8u64 {
            let va = VirtualAddress::new(cache_base + page * PAGE_SIZE + 0x21);
            assert_eq!(
                vm.translate_in(&kernel, va),
                Some(PhysicalAddress::new(page * PAGE_SIZE + 0x21))
            );
        }
        // the null frame's cache page is deliberately left unmapped
        assert_eq!(
            vm.translate_in(&kernel, VirtualAddress::new(cache_base + 0x21)),
            None
        );
    }

    #[test]
    fn activation_loads_the_kernel_root_exactly_once() {
        let mut vm = vm(64);
        vm.init_identity_cache(0x8000).unwrap();
        assert!(
            vm.root_register().loads().is_empty(),
            "bring-up must not touch the register before activation"
        );
        vm.activate();
        assert_eq!(vm.root_register().loads(), &[vm.current_root()]);
        // the kernel space stays the no-op switch target afterwards
        assert!(!vm.switch(None));
        assert_eq!(vm.root_register().loads().len(), 1);
    }

    #[test]
    fn four_level_identity_cache_uses_large_leaves() {
        let mut vm: LongVm = KernelVm::new(
            SimRam::new(64),
            CountingFrames::new(1, 64),
            64,
            StubRoot::default(),
            RecordingTlb::default(),
        )
        .unwrap();
        let before = vm.free_frames();
        vm.init_identity_cache(0x40_0000).unwrap();
        // two 2 MiB leaves share one pointer-table/directory chain
        assert_eq!(vm.free_frames(), before - 2);

        let (ram, _) = vm.parts();
        let entry = walker::lookup::<LongMode, _>(
            ram,
            vm.current_root(),
            VirtualAddress::new(LongMode::LAYOUT.cache_base),
        );
        assert!(matches!(entry, Err(VmemError::LargePage(_))));
    }

    #[test]
    fn dma_is_contiguous_uncached_and_freed_on_return() {
        let mut vm = vm(128);
        let baseline = vm.free_frames();

        let (block, phys) = vm.allocate_dma(0x3000).unwrap();
        let kernel = vm.kernel_space();
        for page in 0..3u64 {
            let va = block.base() + page * PAGE_SIZE;
            assert_eq!(
                vm.translate_in(&kernel, va),
                Some(phys + page * PAGE_SIZE),
                "DMA pages alias contiguous frames"
            );
        }

        let _ = vm.free_dma(block).unwrap();
        assert_eq!(vm.free_frames(), baseline - 1, "frames freed, table kept");
    }

    #[test]
    fn mmio_blocks_never_touch_the_frame_service() {
        let mut vm = vm(64);
        let block = vm.map_mmio(PhysicalAddress::new(0xFEC0_0000), 0x1000).unwrap();
        let frames_mapped = vm.free_frames();
        let _ = vm.unmap_mmio(block).unwrap();
        assert_eq!(vm.free_frames(), frames_mapped);
    }

    #[test]
    fn driver_region_backs_images_with_fresh_frames() {
        let mut vm = vm(64);
        let block = vm.map_driver(0x2000).unwrap();
        let kernel = vm.kernel_space();
        let a = vm.translate_in(&kernel, block.base()).unwrap();
        let b = vm
            .translate_in(&kernel, block.base() + PAGE_SIZE)
            .unwrap();
        assert_ne!(a.frame(), b.frame());
        let _ = vm.unmap_driver(block).unwrap();
    }

    #[test]
    fn clone_switch_destroy_lifecycle() {
        let mut vm = vm(128);
        let _held_heap = vm.heap_grow(0x1000).unwrap();

        let child = vm
            .clone_space(None, CloneStrategy::EagerCopy)
            .unwrap();
        let kernel_root = vm.current_root();
        assert!(vm.switch(Some(&child)));
        assert_ne!(vm.current_root(), kernel_root);
        assert!(!vm.switch(Some(&child)), "repeat switch is a no-op");

        assert!(vm.switch(None));
        assert_eq!(vm.current_root(), kernel_root);
        vm.destroy_space(child);
    }

    #[test]
    #[should_panic(expected = "active address space")]
    fn destroying_the_active_space_panics() {
        let mut vm = vm(128);
        let child = vm.clone_space(None, CloneStrategy::EagerCopy).unwrap();
        let _ = vm.switch(Some(&child));
        vm.destroy_space(child);
    }

    #[test]
    fn unmap_page_shoots_the_address_down() {
        let mut vm = vm(64);
        let kernel = vm.kernel_space();
        let va = VirtualAddress::new(0x0040_0000);
        vm.map_page(&kernel, va, MapRequest::user_data(), None).unwrap();
        vm.unmap_page(&kernel, va).unwrap();
        let (_, tlb) = vm.parts();
        assert!(tlb.saw(va));
        assert_eq!(vm.translate_in(&kernel, va), None);
    }
}
