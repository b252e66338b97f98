//! Single-entry configuration and release.
//!
//! Operates on exactly one leaf entry the walker located. Frame ownership
//! goes through the ledger; TLB invalidation is the caller's job for every
//! function here, documented per function.

use crate::entry::{MapRequest, TableEntry};
use crate::error::VmemResult;
use crate::frames::{FrameLedger, FrameService};
use kernel_memory_addresses::PhysicalPage;
use log::{trace, warn};

/// Configures a leaf entry according to `request`.
///
/// Frame selection, in order:
/// - `bind` aliases the given frame (identity cache, MMIO, DMA); the ledger
///   is not involved and no reference is taken.
/// - an already-bound frame is kept and only the flags change.
/// - otherwise a fresh frame is allocated with one reference, unless the
///   request says `no_alloc`.
///
/// A `free` request short-circuits into [`release`].
///
/// The caller invalidates the TLB for the covered address.
pub fn configure<E, F>(
    entry: &mut E,
    ledger: &mut FrameLedger<F>,
    request: MapRequest,
    bind: Option<PhysicalPage>,
) -> VmemResult<()>
where
    E: TableEntry,
    F: FrameService,
{
    if request.free() {
        release(entry, ledger);
        return Ok(());
    }

    if let Some(frame) = bind {
        entry.bind_frame(frame);
    } else if entry.frame().is_none() && !request.no_alloc() {
        let frame = ledger.allocate()?;
        entry.bind_frame(frame);
        trace!("fresh frame {frame} bound");
    }

    entry.mark_present(!request.not_present());
    entry.mark_writable(!request.read_only());
    entry.mark_user(!request.kernel_only());
    entry.mark_write_through(request.write_through());
    entry.mark_cache_disabled(request.cache_disabled());
    entry.mark_global(request.global());
    Ok(())
}

/// Releases a leaf entry: drops the ledger reference on its frame (freeing
/// the frame when the count reaches zero) and clears the entry.
///
/// Releasing an entry that holds no frame is tolerated and logged; it must
/// never turn into a double free.
///
/// The caller invalidates the TLB for the covered address.
pub fn release<E, F>(entry: &mut E, ledger: &mut FrameLedger<F>)
where
    E: TableEntry,
    F: FrameService,
{
    match entry.frame() {
        Some(frame) => ledger.release(frame),
        None => warn!("release of an entry with no frame bound"),
    }
    entry.clear();
}

/// Clears a leaf entry without touching frame ownership.
///
/// For mappings that only borrowed their frame, such as identity-window
/// slots: the frame belongs to somebody else and must stay alive.
///
/// The caller invalidates the TLB for the covered address.
pub fn unbind<E: TableEntry>(entry: &mut E) {
    entry.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::legacy::LegacyEntry;
    use crate::testing::CountingFrames;
    use kernel_memory_addresses::PhysicalPage;

    fn ledger() -> FrameLedger<CountingFrames> {
        FrameLedger::new(CountingFrames::new(1, 64), 64)
    }

    #[test]
    fn configure_allocates_once_and_sets_flags() {
        let mut ledger = ledger();
        let mut entry = LegacyEntry::new();
        let free = ledger.free_frame_count();

        configure(&mut entry, &mut ledger, MapRequest::kernel_data(), None).unwrap();
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert!(!entry.is_user());
        assert_eq!(ledger.free_frame_count(), free - 1);

        // reconfiguring keeps the frame
        let frame = entry.frame().unwrap();
        configure(&mut entry, &mut ledger, MapRequest::user_data(), None).unwrap();
        assert_eq!(entry.frame(), Some(frame));
        assert!(entry.is_user());
        assert_eq!(ledger.free_frame_count(), free - 1);
    }

    #[test]
    fn bind_aliases_without_accounting() {
        let mut ledger = ledger();
        let mut entry = LegacyEntry::new();
        let mmio = PhysicalPage::from_index(0x9_0000);
        let free = ledger.free_frame_count();

        configure(
            &mut entry,
            &mut ledger,
            MapRequest::kernel_device(),
            Some(mmio),
        )
        .unwrap();
        assert_eq!(entry.frame(), Some(mmio));
        assert!(entry.cache_disabled());
        assert_eq!(ledger.free_frame_count(), free, "aliasing must not allocate");
        assert_eq!(ledger.reference_count(mmio), None);
    }

    #[test]
    fn free_request_short_circuits_into_release() {
        let mut ledger = ledger();
        let mut entry = LegacyEntry::new();
        let free = ledger.free_frame_count();
        configure(&mut entry, &mut ledger, MapRequest::user_data(), None).unwrap();
        configure(&mut entry, &mut ledger, MapRequest::release(), None).unwrap();
        assert!(!entry.is_present());
        assert_eq!(entry.frame(), None);
        assert_eq!(ledger.free_frame_count(), free);
    }

    #[test]
    fn releasing_an_absent_entry_is_tolerated() {
        let mut ledger = ledger();
        let mut entry = LegacyEntry::new();
        let free = ledger.free_frame_count();
        release(&mut entry, &mut ledger);
        release(&mut entry, &mut ledger);
        assert_eq!(ledger.free_frame_count(), free);
    }

    #[test]
    fn no_alloc_leaves_the_entry_frameless() {
        let mut ledger = ledger();
        let mut entry = LegacyEntry::new();
        let request = MapRequest::new().with_no_alloc(true).with_not_present(true);
        configure(&mut entry, &mut ledger, request, None).unwrap();
        assert!(!entry.is_present());
        assert_eq!(entry.frame(), None);
    }

    #[test]
    fn unbind_keeps_the_frame_alive() {
        let mut ledger = ledger();
        let mut entry = LegacyEntry::new();
        configure(&mut entry, &mut ledger, MapRequest::kernel_data(), None).unwrap();
        let frame = entry.frame().unwrap();
        let free = ledger.free_frame_count();
        unbind(&mut entry);
        assert_eq!(entry.frame(), None);
        assert_eq!(ledger.free_frame_count(), free);
        assert_eq!(ledger.reference_count(frame), Some(1));
    }
}
