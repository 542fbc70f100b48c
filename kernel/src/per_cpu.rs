//! Per-CPU data, reached through the GS segment.
//!
//! Each CPU owns exactly one `CpuData`, installed at bring-up and never
//! freed. The paging context inside is mutated only by its owning CPU
//! with interrupts disabled, so no lock guards it.

use alloc::boxed::Box;
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

use crate::memory::binding::PageContext;

pub struct CpuData {
    pub cpu_id: u32,
    pub page_context: PageContext,
}

/// Install this CPU's data and point GS at it. Called once per CPU
/// during bring-up, before the first context switch.
pub fn init(cpu_id: u32, have_pcids: bool) {
    let data = Box::leak(Box::new(CpuData {
        cpu_id,
        page_context: PageContext::new(have_pcids),
    }));
    GsBase::write(VirtAddr::new(data as *mut CpuData as u64));
    log::info!("CPU {}: paging context ready (pcids={})", cpu_id, have_pcids);
}

/// Run `f` on the current CPU's data. Interrupts must be disabled so the
/// current CPU cannot change underneath the reference.
pub fn with_current<R>(f: impl FnOnce(&mut CpuData) -> R) -> R {
    debug_assert!(crate::irq::disabled());
    let ptr = GsBase::read().as_u64() as *mut CpuData;
    assert!(!ptr.is_null(), "per-CPU data not initialized");
    f(unsafe { &mut *ptr })
}
