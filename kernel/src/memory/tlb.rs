//! TLB maintenance and translation-root loads.
//!
//! This module is the hardware boundary of the paging core: single-page
//! invalidation, PCID-tagged invalidation via `invpcid`, and CR3 loads.
//! Nothing here decides *what* to invalidate; the binding and shootdown
//! layers do. The test build records every operation into the per-thread
//! hardware journal instead of touching the CPU.

#[cfg(not(test))]
mod imp {
    use x86_64::instructions::tlb;
    use x86_64::VirtAddr;

    /// Invalidate one page of the current address space (`invlpg`).
    #[inline]
    pub fn flush_page(addr: VirtAddr) {
        tlb::flush(addr);
    }

    /// Invalidate every non-global entry of the current address space.
    #[inline]
    pub fn flush_all() {
        tlb::flush_all();
    }

    /// Invalidate one page tagged with `pcid` (`invpcid` type 0).
    #[inline]
    pub fn flush_pcid_page(pcid: u16, addr: VirtAddr) {
        let descriptor: [u64; 2] = [pcid as u64, addr.as_u64()];
        unsafe {
            core::arch::asm!(
                "invpcid {0}, [{1}]",
                in(reg) 0u64,
                in(reg) descriptor.as_ptr(),
                options(nostack, preserves_flags),
            );
        }
    }

    /// Invalidate every entry tagged with `pcid` (`invpcid` type 1).
    #[inline]
    pub fn flush_pcid_all(pcid: u16) {
        let descriptor: [u64; 2] = [pcid as u64, 0];
        unsafe {
            core::arch::asm!(
                "invpcid {0}, [{1}]",
                in(reg) 1u64,
                in(reg) descriptor.as_ptr(),
                options(nostack, preserves_flags),
            );
        }
    }

    /// Load CR3. `value` carries the root physical address, the PCID in
    /// the low bits, and bit 63 when the TLB must be preserved across the
    /// reload.
    #[inline]
    pub fn write_root_table(value: u64) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) value,
                options(nostack, preserves_flags),
            );
        }
    }
}


pub use imp::{flush_all, flush_page, flush_pcid_all, flush_pcid_page, write_root_table};
