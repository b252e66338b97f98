//! TLB invalidation seam.
//!
//! Table code never flushes translations itself; every removal or
//! permission downgrade names the address and goes through [`TlbFlush`].
//! Cross-core shootdown needs the interrupt layer, which provides its own
//! implementation wrapping the local flush with an IPI broadcast.

use kernel_memory_addresses::VirtualAddress;

pub trait TlbFlush {
    /// Drops the local translation for `va`.
    fn invalidate(&self, va: VirtualAddress);

    /// Drops the translation for `va` on every core that may hold it.
    fn shootdown(&self, va: VirtualAddress);
}

/// No-op flush for single-core bring-up, before paging is live on any other
/// core.
pub struct NoFlush;

impl TlbFlush for NoFlush {
    fn invalidate(&self, _va: VirtualAddress) {}
    fn shootdown(&self, _va: VirtualAddress) {}
}

/// `invlpg`-based flush for the executing core.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub struct LocalInvlpg;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl TlbFlush for LocalInvlpg {
    fn invalidate(&self, va: VirtualAddress) {
        // Safety: invlpg only drops a TLB entry.
        unsafe {
            core::arch::asm!(
                "invlpg [{0}]",
                in(reg) va.as_u64() as usize,
                options(nostack, preserves_flags)
            );
        }
    }

    fn shootdown(&self, va: VirtualAddress) {
        // Single-core reach; remote cores are the IPI layer's business.
        self.invalidate(va);
    }
}
