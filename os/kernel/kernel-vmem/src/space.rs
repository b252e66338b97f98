//! Address-space lifecycle: create, clone, switch, destroy.
//!
//! An [`AddressSpace`] is a typed physical root; everything reachable from
//! it is owned by it, except what the clone rules share (kernel leaves and
//! bootstrap large pages). [`SpaceManager`] tracks which root the hardware
//! currently translates through.

use crate::PhysMapper;
use crate::arch::PagingModel;
use crate::entry::{TableEntry, TableNode};
use crate::error::VmemResult;
use crate::frames::{FrameLedger, FrameService};
use core::marker::PhantomData;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use log::debug;

/// How [`AddressSpace::clone_with`] treats user leaf frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloneStrategy {
    /// Copy every user frame into a fresh one. The shipped strategy.
    #[default]
    EagerCopy,
    /// Share user frames read-only and bump their reference count.
    ///
    /// Only the sharing half exists; there is no fault handler that would
    /// resolve a write to a shared frame yet, so writes simply fault.
    CopyOnWrite,
}

/// Loads a hierarchy root into the translation hardware.
pub trait RootRegister {
    /// # Safety
    /// `root` must describe mappings covering the currently executing code
    /// and stack, or the next instruction fetch dies.
    unsafe fn load(&mut self, root: PhysicalPage);
}

/// `mov cr3` loader for x86 family cores.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub struct Cr3Register;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl RootRegister for Cr3Register {
    unsafe fn load(&mut self, root: PhysicalPage) {
        // Safety: forwarded to the caller per the trait contract.
        unsafe {
            core::arch::asm!(
                "mov cr3, {0}",
                in(reg) root.base().as_u64() as usize,
                options(nostack, preserves_flags)
            );
        }
    }
}

/// One virtual address space, identified by its physical root frame.
///
/// Not `Clone`: duplicating the handle would duplicate ownership of the
/// hierarchy. Use [`Self::clone_with`] for a real clone.
pub struct AddressSpace<M: PagingModel> {
    root: PhysicalPage,
    _model: PhantomData<M>,
}

impl<M: PagingModel> AddressSpace<M> {
    /// Allocates and zeroes a fresh root, installing the self-reference
    /// slot where the model defines one.
    pub fn create<P, F>(mapper: &P, ledger: &mut FrameLedger<F>) -> VmemResult<Self>
    where
        P: PhysMapper,
        F: FrameService,
    {
        let root = ledger.allocate()?;
        // Safety: freshly allocated table frame, single writer.
        let node: &mut M::Node = unsafe { mapper.phys_to_mut(root.base()) };
        node.zero();
        if let Some(slot) = M::SELF_REF_SLOT {
            node.set(slot, self_reference_entry::<M>(root));
        }
        debug!("created address space rooted at {root}");
        Ok(Self {
            root,
            _model: PhantomData,
        })
    }

    /// Adopts an existing hierarchy (bootstrap hand-off, or a root obtained
    /// from [`SpaceManager::current_root`]).
    ///
    /// The caller asserts that `root` is a live hierarchy root.
    #[must_use]
    pub const fn from_root(root: PhysicalPage) -> Self {
        Self {
            root,
            _model: PhantomData,
        }
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    /// Resolves `va` to a physical address through this space's tables.
    pub fn translate<P: PhysMapper>(
        &self,
        mapper: &P,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let entry = crate::walker::lookup::<M, P>(mapper, self.root, va).ok()?;
        if !entry.is_present() {
            return None;
        }
        Some(entry.frame()?.join(va.offset_in_page()))
    }

    /// Clones this space into a new one.
    ///
    /// Every present entry gets a fresh child table with attribute bits
    /// copied raw. At the leaf level, kernel entries (user bit clear) and
    /// large-page bootstrap entries are shared by value; user leaves follow
    /// `strategy`. The self-reference slot is skipped during the walk and
    /// re-established for the new root.
    ///
    /// Under [`CloneStrategy::CopyOnWrite`] the *source* entries are
    /// downgraded to read-only too; the caller must flush the TLB for the
    /// source space afterwards.
    pub fn clone_with<P, F>(
        &self,
        mapper: &P,
        ledger: &mut FrameLedger<F>,
        strategy: CloneStrategy,
    ) -> VmemResult<Self>
    where
        P: PhysMapper,
        F: FrameService,
    {
        let root = clone_table::<M, P, F>(mapper, ledger, strategy, 0, self.root)?;
        if let Some(slot) = M::SELF_REF_SLOT {
            // Safety: `root` was just allocated by `clone_table`.
            let node: &mut M::Node = unsafe { mapper.phys_to_mut(root.base()) };
            node.set(slot, self_reference_entry::<M>(root));
        }
        debug!("cloned address space {} -> {root} ({strategy:?})", self.root);
        Ok(Self {
            root,
            _model: PhantomData,
        })
    }

    /// Tears the whole hierarchy down.
    ///
    /// Every transitively owned table frame is freed. Leaf frames with the
    /// user bit are released through the ledger; kernel-shared leaves,
    /// large-page bootstrap entries and the self-reference slot are
    /// skipped. Must not be called on the active space.
    pub fn destroy<P, F>(self, mapper: &P, ledger: &mut FrameLedger<F>)
    where
        P: PhysMapper,
        F: FrameService,
    {
        let root = self.root;
        destroy_table::<M, P, F>(mapper, ledger, 0, root);
        debug!("destroyed address space rooted at {root}");
    }
}

fn self_reference_entry<M: PagingModel>(root: PhysicalPage) -> M::Entry {
    let mut entry = M::Entry::empty();
    entry.bind_frame(root);
    entry.mark_present(true);
    entry.mark_writable(true);
    entry
}

fn clone_table<M, P, F>(
    mapper: &P,
    ledger: &mut FrameLedger<F>,
    strategy: CloneStrategy,
    level: usize,
    src: PhysicalPage,
) -> VmemResult<PhysicalPage>
where
    M: PagingModel,
    P: PhysMapper,
    F: FrameService,
{
    let dst = ledger.allocate()?;
    // Safety: `dst` is fresh; `src` belongs to the hierarchy being cloned,
    // whose owner called us with exclusive access.
    let dst_node: &mut M::Node = unsafe { mapper.phys_to_mut(dst.base()) };
    let src_node: &mut M::Node = unsafe { mapper.phys_to_mut(src.base()) };
    dst_node.zero();

    for index in 0..M::Node::LEN {
        if level == 0 && M::SELF_REF_SLOT == Some(index) {
            continue;
        }
        let entry = src_node.get(index);
        if !entry.is_present() {
            continue;
        }
        // bootstrap chunks and kernel leaves are shared by value
        if entry.is_large() || (level == M::LEVELS - 1 && !entry.is_user()) {
            dst_node.set(index, entry);
            continue;
        }
        if level < M::LEVELS - 1 {
            let Some(child) = entry.frame() else {
                panic!("present table entry without a frame at level {level}");
            };
            let copy = clone_table::<M, P, F>(mapper, ledger, strategy, level + 1, child)?;
            let mut rewired = entry;
            rewired.bind_frame(copy);
            dst_node.set(index, rewired);
            continue;
        }
        // user leaf
        let Some(frame) = entry.frame() else {
            // frameless bookkeeping entry (no_alloc); copy as-is
            dst_node.set(index, entry);
            continue;
        };
        match strategy {
            CloneStrategy::EagerCopy => {
                let copy = ledger.allocate()?;
                copy_frame(mapper, frame, copy);
                let mut rewired = entry;
                rewired.bind_frame(copy);
                dst_node.set(index, rewired);
            }
            CloneStrategy::CopyOnWrite => {
                ledger.retain(frame);
                let mut shared = entry;
                shared.mark_writable(false);
                shared.mark_copy_on_write(true);
                src_node.set(index, shared);
                dst_node.set(index, shared);
            }
        }
    }
    Ok(dst)
}

fn copy_frame<P: PhysMapper>(mapper: &P, src: PhysicalPage, dst: PhysicalPage) {
    // Safety: two distinct frames viewed as byte arrays.
    let from: &[u8; PAGE_SIZE as usize] = unsafe { mapper.phys_to_mut(src.base()) };
    let to: &mut [u8; PAGE_SIZE as usize] = unsafe { mapper.phys_to_mut(dst.base()) };
    to.copy_from_slice(from);
}

fn destroy_table<M, P, F>(
    mapper: &P,
    ledger: &mut FrameLedger<F>,
    level: usize,
    table: PhysicalPage,
) where
    M: PagingModel,
    P: PhysMapper,
    F: FrameService,
{
    // Safety: exclusive access per the destroy contract.
    let node: &mut M::Node = unsafe { mapper.phys_to_mut(table.base()) };
    for index in 0..M::Node::LEN {
        if level == 0 && M::SELF_REF_SLOT == Some(index) {
            continue;
        }
        let entry = node.get(index);
        if !entry.is_present() || entry.is_large() {
            continue;
        }
        let Some(frame) = entry.frame() else {
            continue;
        };
        if level < M::LEVELS - 1 {
            destroy_table::<M, P, F>(mapper, ledger, level + 1, frame);
        } else if entry.is_user() {
            ledger.release(frame);
        }
    }
    ledger.release(table);
}

/// Tracks the active root and performs switches.
pub struct SpaceManager<M: PagingModel, R: RootRegister> {
    kernel_root: PhysicalPage,
    current: PhysicalPage,
    register: R,
    _model: PhantomData<M>,
}

impl<M: PagingModel, R: RootRegister> SpaceManager<M, R> {
    /// Adopts the kernel root the bootstrap path already activated.
    pub const fn new(kernel_root: PhysicalPage, register: R) -> Self {
        Self {
            kernel_root,
            current: kernel_root,
            register,
            _model: PhantomData,
        }
    }

    /// Loads the current root into the translation hardware unconditionally.
    ///
    /// [`Self::new`] adopts the kernel root without touching the register;
    /// the first load during bring-up must be this explicit call, after the
    /// kernel hierarchy is fully populated.
    pub fn activate(&mut self) {
        // Safety: the caller finished populating the kernel mappings.
        unsafe { self.register.load(self.current) };
        debug!("activated address space rooted at {}", self.current);
    }

    /// Switches to `target`, or to the kernel space for `None`.
    ///
    /// Returns `false` when the target is already active (no hardware
    /// access). Every clonable space maps the kernel half, which is what
    /// makes the load safe mid-execution.
    pub fn switch(&mut self, target: Option<&AddressSpace<M>>) -> bool {
        let root = target.map_or(self.kernel_root, AddressSpace::root);
        if root == self.current {
            return false;
        }
        // Safety: see above; kernel mappings are present in every space.
        unsafe { self.register.load(root) };
        debug!("address space switch {} -> {root}", self.current);
        self.current = root;
        true
    }

    #[must_use]
    pub const fn current_root(&self) -> PhysicalPage {
        self.current
    }

    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalPage {
        self.kernel_root
    }

    #[cfg(test)]
    pub(crate) const fn register(&self) -> &R {
        &self.register
    }
}
