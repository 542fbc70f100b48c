//! Translation-structure walker.
//!
//! Pure manipulation of the four-level hierarchy (L4 down to L1, 512
//! entries per level): install a 4 KiB leaf, clear one, or probe for
//! presence. Intermediate tables are created on demand from the frame
//! source. Tables are reached exclusively through the identity window, so
//! the walker works on any hierarchy given its root frame, active or not.
//!
//! The walker never invalidates the TLB. Coherency is the job of the
//! activation and shootdown layers. Callers hold the owning space's mutex
//! with interrupts disabled for the duration of a walk.

use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::{frame_allocator, phys_to_virt, PAGE_SIZE};

bitflags::bitflags! {
    /// Access intent of a new mapping. Read access is implied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAccess: u32 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
    }
}

/// Caching behavior of a leaf mapping, encoded across the write-through
/// and PAT bits. `Null`, `Uncached` and `WriteBack` all select the
/// hardware default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingMode {
    Null,
    Uncached,
    WriteCombine,
    WriteThrough,
    WriteBack,
}

/// Unmap tolerance. `Remap` silently skips pages whose chain or leaf is
/// already absent; the other modes treat absence as a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    Null,
    Normal,
    Remap,
}

/// PAT select bit of a 4 KiB leaf. Bit 7 doubles as the huge-page bit on
/// non-leaf levels, which this walker never sets.
const PAT_4K: PageTableFlags = PageTableFlags::HUGE_PAGE;

/// Indices of `va` into L4, L3, L2, L1.
fn table_indices(va: VirtAddr) -> [usize; 4] {
    let raw = va.as_u64();
    [
        ((raw >> 39) & 0x1ff) as usize,
        ((raw >> 30) & 0x1ff) as usize,
        ((raw >> 21) & 0x1ff) as usize,
        ((raw >> 12) & 0x1ff) as usize,
    ]
}

/// Access a table frame through the identity window.
///
/// The returned lifetime is unconstrained; callers keep the reference
/// only while they hold the owning space's mutex.
unsafe fn table_mut<'a>(frame: PhysFrame) -> &'a mut PageTable {
    &mut *phys_to_virt(frame.start_address()).as_mut_ptr::<PageTable>()
}

unsafe fn table_ref<'a>(frame: PhysFrame) -> &'a PageTable {
    &*phys_to_virt(frame.start_address()).as_ptr::<PageTable>()
}

/// Compose the permission and caching bits of a leaf entry. `PRESENT` is
/// always included; `GLOBAL` and `USER_ACCESSIBLE` are the caller's call.
pub(super) fn leaf_flags(access: PageAccess, caching: CachingMode) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if access.contains(PageAccess::WRITE) {
        flags |= PageTableFlags::WRITABLE;
    }
    if !access.contains(PageAccess::EXECUTE) {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    match caching {
        CachingMode::WriteThrough => flags |= PageTableFlags::WRITE_THROUGH,
        CachingMode::WriteCombine => flags |= PAT_4K | PageTableFlags::WRITE_THROUGH,
        CachingMode::Null | CachingMode::Uncached | CachingMode::WriteBack => {}
    }
    flags
}

/// Descend one level, creating the next table if the entry is absent.
///
/// New intermediate entries are `PRESENT | WRITABLE`, plus
/// `USER_ACCESSIBLE` for user-owned chains. A present entry whose user
/// bit disagrees with `user_tables` means two hierarchies got mixed,
/// which is fatal.
fn descend_or_create<'a>(
    entry: &mut PageTableEntry,
    user_tables: bool,
    va: VirtAddr,
) -> &'a mut PageTable {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        debug_assert!(!entry.flags().contains(PageTableFlags::HUGE_PAGE));
        assert_eq!(
            entry.flags().contains(PageTableFlags::USER_ACCESSIBLE),
            user_tables,
            "mixed user/kernel table chain at {:#x}",
            va.as_u64()
        );
        unsafe { table_mut(PhysFrame::containing_address(entry.addr())) }
    } else {
        let frame = frame_allocator::allocate_zeroed_frame();
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user_tables {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        entry.set_addr(frame.start_address(), flags);
        unsafe { table_mut(frame) }
    }
}

/// Descend one level of an existing chain. Returns `None` when the entry
/// is absent and `mode` is `Remap`; otherwise absence is fatal because
/// the caller claims it mapped this page.
fn descend<'a>(entry: &PageTableEntry, mode: PageMode, va: VirtAddr) -> Option<&'a mut PageTable> {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        Some(unsafe { table_mut(PhysFrame::containing_address(entry.addr())) })
    } else if mode == PageMode::Remap {
        None
    } else {
        panic!("unmap: table chain for {:#x} is absent", va.as_u64());
    }
}

/// Install `pa` at `va` in the hierarchy rooted at `root`.
///
/// The leaf must currently be absent; remapping a present page is a
/// caller bug. `leaf` carries the fully composed entry bits (see
/// [`leaf_flags`]), `user_tables` the ownership of any newly created
/// intermediate entries.
pub(super) fn map_single_4k(
    root: PhysFrame,
    va: VirtAddr,
    pa: PhysAddr,
    leaf: PageTableFlags,
    user_tables: bool,
) {
    assert_eq!(
        va.as_u64() % PAGE_SIZE,
        0,
        "map: misaligned virtual address {:#x}",
        va.as_u64()
    );
    assert_eq!(
        pa.as_u64() % PAGE_SIZE,
        0,
        "map: misaligned physical address {:#x}",
        pa.as_u64()
    );

    let [i4, i3, i2, i1] = table_indices(va);

    let l4 = unsafe { table_mut(root) };
    let l3 = descend_or_create(&mut l4[i4], user_tables, va);
    let l2 = descend_or_create(&mut l3[i3], user_tables, va);
    let l1 = descend_or_create(&mut l2[i2], user_tables, va);

    let entry = &mut l1[i1];
    assert!(
        !entry.flags().contains(PageTableFlags::PRESENT),
        "map: {:#x} is already mapped",
        va.as_u64()
    );
    entry.set_addr(pa, leaf);
}

/// Clear the present bit of the leaf at `va`, preserving the remaining
/// bits so the detached frame stays recoverable from the entry.
///
/// Returns the previously mapped frame, or `None` when `mode` is `Remap`
/// and the chain or the leaf is absent.
pub(super) fn unmap_single_4k(root: PhysFrame, va: VirtAddr, mode: PageMode) -> Option<PhysFrame> {
    assert_eq!(
        va.as_u64() % PAGE_SIZE,
        0,
        "unmap: misaligned virtual address {:#x}",
        va.as_u64()
    );

    let [i4, i3, i2, i1] = table_indices(va);

    let l4 = unsafe { table_mut(root) };
    let l3 = descend(&l4[i4], mode, va)?;
    let l2 = descend(&l3[i3], mode, va)?;
    let l1 = descend(&l2[i2], mode, va)?;

    let entry = &mut l1[i1];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        if mode == PageMode::Remap {
            return None;
        }
        panic!("unmap: {:#x} is not mapped", va.as_u64());
    }

    let frame = PhysFrame::containing_address(entry.addr());
    entry.set_flags(entry.flags().difference(PageTableFlags::PRESENT));
    Some(frame)
}

/// Whether `va` currently has a present leaf.
pub(super) fn is_mapped(root: PhysFrame, va: VirtAddr) -> bool {
    assert_eq!(
        va.as_u64() % PAGE_SIZE,
        0,
        "probe: misaligned virtual address {:#x}",
        va.as_u64()
    );

    let [i4, i3, i2, i1] = table_indices(va);

    let mut table = unsafe { table_ref(root) };
    for index in [i4, i3, i2] {
        let entry = &table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return false;
        }
        table = unsafe { table_ref(PhysFrame::containing_address(entry.addr())) };
    }
    table[i1].flags().contains(PageTableFlags::PRESENT)
}
