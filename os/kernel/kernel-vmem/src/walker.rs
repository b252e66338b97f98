//! Level-generic page-table walker.
//!
//! [`locate`] descends from a hierarchy root to the leaf entry covering a
//! virtual address, optionally creating intermediate tables on the way. It
//! returns a reference to the entry and never configures the leaf itself;
//! that is the mutator's job. Intermediate entries created here are
//! permissive (present, writable, user) so that access control is enforced
//! at the leaf.

use crate::PhysMapper;
use crate::arch::PagingModel;
use crate::entry::{TableEntry, TableNode};
use crate::error::{VmemError, VmemResult};
use crate::frames::{FrameLedger, FrameService};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use log::trace;

fn reserved_slot_check<M: PagingModel>(va: VirtualAddress) -> VmemResult<()> {
    if let Some(slot) = M::SELF_REF_SLOT
        && M::slot_index(0, va) == slot
    {
        return Err(VmemError::ReservedSlot(va));
    }
    Ok(())
}

/// Walks to the leaf entry for `va`.
///
/// With `create`, absent intermediate entries are backed by fresh zeroed
/// frames from the ledger; without it the walk fails with
/// [`VmemError::NotMapped`]. A large-page leaf above the target level stops
/// the walk with [`VmemError::LargePage`] either way.
pub fn locate<'a, M, P, F>(
    mapper: &P,
    ledger: &mut FrameLedger<F>,
    root: PhysicalPage,
    va: VirtualAddress,
    create: bool,
) -> VmemResult<&'a mut M::Entry>
where
    M: PagingModel,
    P: PhysMapper,
    F: FrameService,
{
    locate_at::<M, P, F>(mapper, ledger, root, va, M::LEVELS - 1, create)
}

/// Walks to the entry for `va` at `target_level`, not necessarily the leaf.
///
/// Exists for the bootstrap identity map, which installs large leaves at an
/// interior level; everything else wants [`locate`].
pub fn locate_at<'a, M, P, F>(
    mapper: &P,
    ledger: &mut FrameLedger<F>,
    root: PhysicalPage,
    va: VirtualAddress,
    target_level: usize,
    create: bool,
) -> VmemResult<&'a mut M::Entry>
where
    M: PagingModel,
    P: PhysMapper,
    F: FrameService,
{
    debug_assert!(target_level < M::LEVELS);
    reserved_slot_check::<M>(va)?;

    // Safety: table frames are owned by the hierarchy rooted at `root` and
    // reachable through the mapper; the single-writer rule on the owning
    // address space keeps the references unique.
    let mut node: &'a mut M::Node = unsafe { mapper.phys_to_mut(root.base()) };
    let mut level = 0;
    loop {
        let index = M::slot_index(level, va);
        if level == target_level {
            return Ok(node.entry_mut(index));
        }

        let entry = node.entry_mut(index);
        if entry.is_present() && entry.is_large() {
            return Err(VmemError::LargePage(va));
        }
        if !entry.is_present() {
            if !create {
                return Err(VmemError::NotMapped(va));
            }
            let frame = ledger.allocate()?;
            // Safety: a freshly allocated frame; nothing else references it.
            unsafe { mapper.phys_to_mut::<M::Node>(frame.base()) }.zero();
            entry.bind_frame(frame);
            entry.mark_present(true);
            entry.mark_writable(true);
            entry.mark_user(true);
            trace!("new level-{} table at {frame} covering {va}", level + 1);
        }

        let Some(child) = entry.frame() else {
            panic!("present entry without a frame at level {level} covering {va}");
        };
        // Safety: as above; `child` is a table frame of this hierarchy.
        node = unsafe { mapper.phys_to_mut(child.base()) };
        level += 1;
    }
}

/// Read-only walk to the leaf entry for `va`.
///
/// Same contract as [`locate`] with `create = false`, but usable without a
/// frame ledger.
pub fn lookup<'a, M, P>(
    mapper: &P,
    root: PhysicalPage,
    va: VirtualAddress,
) -> VmemResult<&'a mut M::Entry>
where
    M: PagingModel,
    P: PhysMapper,
{
    reserved_slot_check::<M>(va)?;

    // Safety: see `locate_at`.
    let mut node: &'a mut M::Node = unsafe { mapper.phys_to_mut(root.base()) };
    let mut level = 0;
    loop {
        let index = M::slot_index(level, va);
        if level == M::LEVELS - 1 {
            return Ok(node.entry_mut(index));
        }
        let entry = node.get(index);
        if !entry.is_present() {
            return Err(VmemError::NotMapped(va));
        }
        if entry.is_large() {
            return Err(VmemError::LargePage(va));
        }
        let Some(child) = entry.frame() else {
            panic!("present entry without a frame at level {level} covering {va}");
        };
        // Safety: see `locate_at`.
        node = unsafe { mapper.phys_to_mut(child.base()) };
        level += 1;
    }
}
