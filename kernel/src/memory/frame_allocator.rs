//! Physical frame source for page-table construction.
//!
//! The actual allocator lives outside this core; it registers here during
//! bring-up. The walker only ever asks for single zeroed 4 KiB frames for
//! intermediate tables and roots.

#[cfg(not(test))]
use conquer_once::spin::OnceCell;
use x86_64::structures::paging::PhysFrame;

/// Supplier of zeroed physical frames.
pub trait FrameSource: Sync {
    /// Hand out one zeroed, 4 KiB-aligned frame. `None` means physical
    /// memory is exhausted.
    fn allocate_zeroed(&self) -> Option<PhysFrame>;
}

#[cfg(not(test))]
static FRAME_SOURCE: OnceCell<&'static dyn FrameSource> = OnceCell::uninit();

/// Register the global frame source. Called once during bring-up.
#[cfg(not(test))]
pub fn init(source: &'static dyn FrameSource) {
    FRAME_SOURCE.init_once(|| source);
    log::info!("Frame source registered");
}

/// Allocate a zeroed frame for a page table.
///
/// Exhaustion is fatal at this layer. A caller that wants to refuse a
/// mapping request for lack of memory must do so before touching the
/// translation structures.
pub fn allocate_zeroed_frame() -> PhysFrame {
    #[cfg(not(test))]
    {
        FRAME_SOURCE
            .get()
            .expect("frame source not registered")
            .allocate_zeroed()
            .expect("out of physical frames for page tables")
    }
    #[cfg(test)]
    {
        crate::memory::mock::allocate_zeroed_frame()
    }
}
