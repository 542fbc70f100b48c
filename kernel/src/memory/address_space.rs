//! Address spaces and shootdown submission.
//!
//! A `PageSpace` owns the root frame of one translation hierarchy plus
//! the serialized state that coordinates TLB shootdowns across the
//! per-CPU bindings caching it. `KernelPageSpace` and `ClientPageSpace`
//! wrap it with the kernel-half and user-half mapping policies.
//!
//! Ownership is deliberately one-directional: a space only counts its
//! bindings, it never points at them. Each binding finds its space
//! through its own weak reference, so a binding can never keep a dead
//! address space alive.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::irq;
use crate::memory::paging::{self, CachingMode, PageAccess, PageMode};
use crate::memory::{frame_allocator, phys_to_virt, PAGE_SIZE};

/// One pending shootdown: a page range whose translations must be
/// dropped by every CPU that cached them.
///
/// The node is queued on its space by [`PageSpace::submit_shootdown`] and
/// handed back through `shot_down` exactly once, when the last counted
/// binding has invalidated the range.
pub struct ShootNode {
    address: VirtAddr,
    size: u64,
    sequence: AtomicU64,
    bindings_to_shoot: AtomicUsize,
    shot_down: Mutex<Option<Box<dyn FnOnce(&ShootNode) + Send>>>,
}

impl ShootNode {
    pub fn new(
        address: VirtAddr,
        size: u64,
        shot_down: impl FnOnce(&ShootNode) + Send + 'static,
    ) -> Arc<Self> {
        assert_eq!(
            address.as_u64() % PAGE_SIZE,
            0,
            "shootdown: misaligned address {:#x}",
            address.as_u64()
        );
        assert_eq!(size % PAGE_SIZE, 0, "shootdown: misaligned size {:#x}", size);
        Arc::new(ShootNode {
            address,
            size,
            sequence: AtomicU64::new(0),
            bindings_to_shoot: AtomicUsize::new(0),
            shot_down: Mutex::new(Some(Box::new(shot_down))),
        })
    }

    pub fn address(&self) -> VirtAddr {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub(super) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Credit one binding's invalidation. Returns true for the last
    /// decrementer, which then owns completion. Acquire-release so the
    /// completer observes every other CPU's invalidations.
    pub(super) fn credit(&self) -> bool {
        self.bindings_to_shoot.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Hand the node back to its submitter.
    pub(super) fn complete(&self) {
        let callback = self
            .shot_down
            .lock()
            .take()
            .expect("shootdown completed twice");
        callback(self);
    }
}

/// State shared between map/unmap, shootdown submission and the per-CPU
/// bindings. Guarded by the space mutex, always with interrupts off.
pub(super) struct SpaceState {
    /// Live bindings currently caching this space, across all CPUs.
    pub num_bindings: usize,
    /// Last shootdown sequence assigned; the first node gets 1.
    pub shoot_sequence: u64,
    /// Pending shootdowns in ascending sequence order.
    pub shoot_queue: VecDeque<Arc<ShootNode>>,
}

/// The serialized core of one address space.
pub struct PageSpace {
    root: PhysFrame,
    state: Mutex<SpaceState>,
}

impl PageSpace {
    /// Construct a space around a pre-allocated root frame.
    pub fn new(root: PhysFrame) -> Arc<PageSpace> {
        Arc::new(PageSpace {
            root,
            state: Mutex::new(SpaceState {
                num_bindings: 0,
                shoot_sequence: 0,
                shoot_queue: VecDeque::new(),
            }),
        })
    }

    /// Physical address of the L4 table. Immutable after construction.
    pub fn root_table(&self) -> PhysFrame {
        self.root
    }

    pub(super) fn state(&self) -> &Mutex<SpaceState> {
        &self.state
    }

    /// Queue `node` and prod every CPU that might cache this space.
    ///
    /// If no binding currently caches the space there is nothing to
    /// invalidate and the node completes synchronously. Otherwise the
    /// node is assigned the next sequence number, charged with the
    /// current binding count and appended to the queue; the IPI handler
    /// drives the actual invalidation.
    pub fn submit_shootdown(&self, node: Arc<ShootNode>) {
        let any_bindings = irq::without_interrupts(|| {
            let mut state = self.state.lock();
            let any = state.num_bindings > 0;
            if any {
                state.shoot_sequence += 1;
                node.sequence.store(state.shoot_sequence, Ordering::Relaxed);
                node.bindings_to_shoot
                    .store(state.num_bindings, Ordering::Relaxed);
                state.shoot_queue.push_back(node.clone());
            }
            any
        });

        if any_bindings {
            crate::ipi::send_shootdown_ipi();
        } else {
            node.complete();
        }
    }
}

#[cfg(all(target_arch = "x86_64", not(test)))]
impl PageSpace {
    /// Make `space` live on the current CPU, rebinding a PCID slot if
    /// necessary.
    pub fn activate(space: &Arc<PageSpace>) {
        irq::without_interrupts(|| {
            crate::per_cpu::with_current(|cpu| cpu.page_context.activate(space))
        });
    }
}

static KERNEL_SPACE: OnceCell<KernelPageSpace> = OnceCell::uninit();

/// The kernel's own address space.
///
/// Leaves carry the global bit so they survive CR3 reloads, and the
/// table chain is supervisor-only. Unmapping hands the detached frame
/// back so the caller can release it.
pub struct KernelPageSpace {
    space: Arc<PageSpace>,
}

impl KernelPageSpace {
    pub fn new(root: PhysFrame) -> KernelPageSpace {
        KernelPageSpace {
            space: PageSpace::new(root),
        }
    }

    /// Install the global kernel space around the boot-provided root.
    pub fn initialize(root: PhysFrame) {
        KERNEL_SPACE.init_once(|| KernelPageSpace::new(root));
        log::info!(
            "Kernel page space initialized, root {:#x}",
            root.start_address().as_u64()
        );
    }

    pub fn global() -> &'static KernelPageSpace {
        KERNEL_SPACE
            .get()
            .expect("kernel page space not initialized")
    }

    pub fn space(&self) -> &Arc<PageSpace> {
        &self.space
    }

    pub fn map_4k(&self, va: VirtAddr, pa: PhysAddr, access: PageAccess, caching: CachingMode) {
        irq::without_interrupts(|| {
            let _state = self.space.state.lock();
            let leaf = paging::leaf_flags(access, caching) | PageTableFlags::GLOBAL;
            paging::map_single_4k(self.space.root, va, pa, leaf, false);
        });
    }

    /// Unmap one page and return the now-detached physical frame.
    pub fn unmap_4k(&self, va: VirtAddr) -> PhysAddr {
        irq::without_interrupts(|| {
            let _state = self.space.state.lock();
            match paging::unmap_single_4k(self.space.root, va, PageMode::Normal) {
                Some(frame) => frame.start_address(),
                None => unreachable!("normal-mode unmap never skips"),
            }
        })
    }
}

/// An address space for one userspace client.
///
/// The lower half (L4 entries 0..256) starts empty; the upper half is
/// copied by value from the kernel root at construction and never
/// diverges afterwards, so kernel code keeps working after any CR3
/// switch.
pub struct ClientPageSpace {
    space: Arc<PageSpace>,
}

impl ClientPageSpace {
    pub fn new(kernel: &KernelPageSpace) -> ClientPageSpace {
        let root = frame_allocator::allocate_zeroed_frame();

        let table = unsafe { &mut *phys_to_virt(root.start_address()).as_mut_ptr::<PageTable>() };
        let kernel_table = unsafe {
            &*phys_to_virt(kernel.space.root.start_address()).as_ptr::<PageTable>()
        };

        // Bottom half: unmapped. Top half: shared with the kernel.
        for i in 0..256 {
            table[i].set_unused();
        }
        for i in 256..512 {
            table[i] = kernel_table[i].clone();
        }

        ClientPageSpace {
            space: PageSpace::new(root),
        }
    }

    pub fn space(&self) -> &Arc<PageSpace> {
        &self.space
    }

    pub fn map_4k(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        user_access: bool,
        access: PageAccess,
        caching: CachingMode,
    ) {
        irq::without_interrupts(|| {
            let _state = self.space.state.lock();
            let mut leaf = paging::leaf_flags(access, caching);
            if user_access {
                leaf |= PageTableFlags::USER_ACCESSIBLE;
            }
            paging::map_single_4k(self.space.root, va, pa, leaf, user_access);
        });
    }

    /// Unmap every page in `[va, va + size)`. `PageMode::Remap` tolerates
    /// pages that are already absent.
    pub fn unmap_range(&self, va: VirtAddr, size: u64, mode: PageMode) {
        assert_eq!(
            va.as_u64() % PAGE_SIZE,
            0,
            "unmap: misaligned virtual address {:#x}",
            va.as_u64()
        );
        assert_eq!(size % PAGE_SIZE, 0, "unmap: misaligned size {:#x}", size);

        irq::without_interrupts(|| {
            let _state = self.space.state.lock();
            let mut progress = 0;
            while progress < size {
                let _ = paging::unmap_single_4k(
                    self.space.root,
                    VirtAddr::new(va.as_u64() + progress),
                    mode,
                );
                progress += PAGE_SIZE;
            }
        });
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        irq::without_interrupts(|| {
            let _state = self.space.state.lock();
            paging::is_mapped(self.space.root, va)
        })
    }
}

impl Drop for ClientPageSpace {
    fn drop(&mut self) {
        // Interior tables are not reclaimed yet; their frames leak with
        // the space.
        log::warn!("ClientPageSpace does not release its page tables");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mock::{self, HwOp};
    use core::sync::atomic::AtomicUsize;

    fn kernel_space() -> KernelPageSpace {
        mock::reset();
        KernelPageSpace::new(frame_allocator::allocate_zeroed_frame())
    }

    fn counting_node(va: u64, size: u64) -> (Arc<ShootNode>, Arc<AtomicUsize>) {
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let node = ShootNode::new(VirtAddr::new(va), size, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (node, completions)
    }

    #[test]
    fn client_map_unmap_round_trip() {
        let kernel = kernel_space();
        let client = ClientPageSpace::new(&kernel);

        client.map_4k(
            VirtAddr::new(0x1000),
            PhysAddr::new(0x200000),
            true,
            PageAccess::WRITE,
            CachingMode::WriteBack,
        );
        assert!(client.is_mapped(VirtAddr::new(0x1000)));

        client.unmap_range(VirtAddr::new(0x1000), 0x1000, PageMode::Normal);
        assert!(!client.is_mapped(VirtAddr::new(0x1000)));
    }

    #[test]
    fn kernel_map_unmap_round_trip_returns_frame() {
        let kernel = kernel_space();
        let va = VirtAddr::new(0xffff_8000_0010_0000);
        let pa = PhysAddr::new(0x42000);

        kernel.map_4k(va, pa, PageAccess::WRITE, CachingMode::WriteBack);
        assert_eq!(kernel.unmap_4k(va), pa);
    }

    #[test]
    fn kernel_leaf_carries_global_bit() {
        let kernel = kernel_space();
        let va = VirtAddr::new(0xffff_8000_0010_0000);
        kernel.map_4k(
            va,
            PhysAddr::new(0x42000),
            PageAccess::WRITE | PageAccess::EXECUTE,
            CachingMode::WriteBack,
        );

        // Walk by hand: present | writable | global, nothing else.
        let root = kernel.space().root_table();
        let table = unsafe { &*phys_to_virt(root.start_address()).as_ptr::<PageTable>() };
        let mut entry = &table[((va.as_u64() >> 39) & 0x1ff) as usize];
        for shift in [30, 21] {
            let next = unsafe {
                &*phys_to_virt(entry.addr()).as_ptr::<PageTable>()
            };
            entry = &next[((va.as_u64() >> shift) & 0x1ff) as usize];
        }
        let leaf_table = unsafe { &*phys_to_virt(entry.addr()).as_ptr::<PageTable>() };
        let leaf = &leaf_table[((va.as_u64() >> 12) & 0x1ff) as usize];
        assert_eq!(
            leaf.flags(),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL
        );
        assert_eq!(leaf.addr(), PhysAddr::new(0x42000));
    }

    #[test]
    fn client_top_half_matches_kernel_bottom_half_empty() {
        let kernel = kernel_space();
        // Give the kernel space some upper-half structure first.
        kernel.map_4k(
            VirtAddr::new(0xffff_8000_0010_0000),
            PhysAddr::new(0x42000),
            PageAccess::WRITE,
            CachingMode::WriteBack,
        );
        kernel.map_4k(
            VirtAddr::new(0xffff_c000_0000_0000),
            PhysAddr::new(0x43000),
            PageAccess::empty(),
            CachingMode::WriteBack,
        );

        let client = ClientPageSpace::new(&kernel);

        let kernel_table = unsafe {
            &*phys_to_virt(kernel.space().root_table().start_address()).as_ptr::<PageTable>()
        };
        let client_table = unsafe {
            &*phys_to_virt(client.space().root_table().start_address()).as_ptr::<PageTable>()
        };
        for i in 0..256 {
            assert!(client_table[i].is_unused(), "low entry {} not empty", i);
        }
        for i in 256..512 {
            let kernel_raw =
                unsafe { *(&kernel_table[i] as *const _ as *const u64) };
            let client_raw =
                unsafe { *(&client_table[i] as *const _ as *const u64) };
            assert_eq!(kernel_raw, client_raw, "high entry {} differs", i);
        }
    }

    #[test]
    fn shootdown_without_bindings_completes_synchronously() {
        let kernel = kernel_space();
        let client = ClientPageSpace::new(&kernel);
        let (node, completions) = counting_node(0x1000, 0x1000);

        client.space().submit_shootdown(node);

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        let state = client.space().state().lock();
        assert!(state.shoot_queue.is_empty());
        assert_eq!(state.shoot_sequence, 0);
        drop(state);
        // No IPI either.
        assert!(!mock::take_ops().contains(&HwOp::ShootdownIpi));
    }

    #[test]
    fn shootdown_with_bindings_queues_and_sends_ipi() {
        let kernel = kernel_space();
        let client = ClientPageSpace::new(&kernel);
        client.space().state().lock().num_bindings = 2;

        let (node, completions) = counting_node(0x1000, 0x2000);
        client.space().submit_shootdown(node.clone());

        assert_eq!(completions.load(Ordering::SeqCst), 0);
        assert_eq!(node.sequence(), 1);
        assert_eq!(node.bindings_to_shoot.load(Ordering::SeqCst), 2);
        {
            let state = client.space().state().lock();
            assert_eq!(state.shoot_queue.len(), 1);
            assert_eq!(state.shoot_sequence, 1);
        }
        assert!(mock::take_ops().contains(&HwOp::ShootdownIpi));
    }

    #[test]
    fn sequences_ascend_in_queue_order() {
        let kernel = kernel_space();
        let client = ClientPageSpace::new(&kernel);
        client.space().state().lock().num_bindings = 1;

        for i in 0..4 {
            let (node, _) = counting_node(0x1000 + i * 0x1000, 0x1000);
            client.space().submit_shootdown(node);
        }

        let state = client.space().state().lock();
        let sequences: Vec<u64> = state.shoot_queue.iter().map(|n| n.sequence()).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(state.shoot_sequence, 4);
    }

    #[test]
    #[should_panic(expected = "misaligned address")]
    fn misaligned_shoot_node_panics() {
        ShootNode::new(VirtAddr::new(0x1234), 0x1000, |_| {});
    }
}
