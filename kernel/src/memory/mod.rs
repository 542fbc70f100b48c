//! Memory management: translation hierarchies, address spaces, per-CPU
//! bindings and TLB shootdown.

pub mod address_space;
pub mod binding;
pub mod frame_allocator;
#[cfg(test)]
pub(crate) mod mock;
pub mod paging;
pub mod tlb;

#[cfg(not(test))]
use conquer_once::spin::OnceCell;
use x86_64::{PhysAddr, VirtAddr};

/// Size of one page and one page-table frame.
pub const PAGE_SIZE: u64 = 4096;

/// Architectural cap on physical addresses reachable through the identity
/// window.
const PHYSICAL_LIMIT: u64 = 1 << 46;

/// Offset of the kernel's identity map of physical memory.
#[cfg(not(test))]
static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// Initialize the memory subsystem. The bootloader maps all physical
/// memory at `physical_memory_offset` before handing over control.
#[cfg(not(test))]
pub fn init(physical_memory_offset: VirtAddr) {
    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);
    log::info!("Physical memory offset: {:?}", physical_memory_offset);
}

/// Get the physical memory offset
#[cfg(not(test))]
pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET
        .get()
        .expect("physical memory offset not initialized")
}

#[cfg(test)]
pub fn physical_memory_offset() -> VirtAddr {
    mock::physical_memory_offset()
}

/// Convert a physical address to a virtual address using the offset
/// mapping. The window is always mapped and needs no locking.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    assert!(
        phys.as_u64() < PHYSICAL_LIMIT,
        "physical address {:#x} is beyond the identity window",
        phys.as_u64()
    );
    VirtAddr::new(physical_memory_offset().as_u64() + phys.as_u64())
}
