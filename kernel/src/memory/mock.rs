//! Test-only physical memory and hardware journal.
//!
//! The paging code reaches hardware through four seams: the physical
//! frame source, the identity window, the TLB intrinsics and the
//! shootdown IPI. Under `cargo test` all four land here. Physical memory
//! is a pool of 4 KiB-aligned host frames addressed linearly from zero,
//! exposed through the same offset arithmetic the kernel uses, and every
//! hardware side effect is appended to a journal the tests drain.
//!
//! Everything is thread-local: each test owns its machine, and a
//! multi-CPU scenario is several `PageContext` values driven sequentially
//! from one thread.

use std::cell::RefCell;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::PAGE_SIZE;

/// Frames in the mock pool (2 MiB of "RAM").
const MOCK_FRAMES: usize = 512;

#[repr(align(4096))]
#[derive(Clone, Copy)]
struct Frame4K([u8; PAGE_SIZE as usize]);

struct MockPhysical {
    frames: Box<[Frame4K]>,
    next: usize,
}

/// One recorded hardware side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOp {
    FlushPage(u64),
    FlushAll,
    FlushPcidPage { pcid: u16, addr: u64 },
    FlushPcidAll { pcid: u16 },
    WriteRootTable(u64),
    ShootdownIpi,
}

thread_local! {
    static PHYSICAL: RefCell<Option<MockPhysical>> = RefCell::new(None);
    static JOURNAL: RefCell<Vec<HwOp>> = RefCell::new(Vec::new());
}

/// Install a fresh machine for the current test: zeroed physical memory,
/// empty journal. Call this first in every test.
pub fn reset() {
    PHYSICAL.with(|phys| {
        *phys.borrow_mut() = Some(MockPhysical {
            frames: vec![Frame4K([0; PAGE_SIZE as usize]); MOCK_FRAMES].into_boxed_slice(),
            // Frame 0 stays unused so no table ever lives at physical 0.
            next: 1,
        });
    });
    JOURNAL.with(|journal| journal.borrow_mut().clear());
}

/// The mock identity-window offset: physical address N lives at host
/// address `offset + N`.
pub fn physical_memory_offset() -> VirtAddr {
    PHYSICAL.with(|phys| {
        let phys = phys.borrow();
        let pool = phys
            .as_ref()
            .expect("mock physical memory not installed; call mock::reset()");
        VirtAddr::new(pool.frames.as_ptr() as u64)
    })
}

/// Bump-allocate one zeroed frame from the pool.
pub fn allocate_zeroed_frame() -> PhysFrame {
    PHYSICAL.with(|phys| {
        let mut phys = phys.borrow_mut();
        let pool = phys
            .as_mut()
            .expect("mock physical memory not installed; call mock::reset()");
        assert!(
            pool.next < MOCK_FRAMES,
            "out of physical frames for page tables"
        );
        let index = pool.next;
        pool.next += 1;
        PhysFrame::from_start_address(PhysAddr::new(index as u64 * PAGE_SIZE))
            .expect("mock frames are page-aligned")
    })
}

/// Append one operation to the journal.
pub fn record(op: HwOp) {
    JOURNAL.with(|journal| journal.borrow_mut().push(op));
}

/// Drain and return everything recorded since the last call.
pub fn take_ops() -> Vec<HwOp> {
    JOURNAL.with(|journal| core::mem::take(&mut *journal.borrow_mut()))
}
