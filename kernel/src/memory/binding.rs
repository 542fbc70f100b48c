//! Per-CPU page-space bindings and the activation policy.
//!
//! Each CPU owns `MAX_PCID_COUNT` slots, one per hardware PCID. A slot
//! caches the translations of at most one `PageSpace` through a weak
//! reference, and remembers how far through that space's shootdown queue
//! it has already worked. The `PageContext` picks slots on context switch
//! with a least-recently-primary policy and keeps the CR3 fast path: when
//! the primary slot is reactivated without an intervening rebind, the
//! root register is already correct and no reload happens.
//!
//! Bindings are mutated only by their owning CPU with interrupts
//! disabled. Other CPUs observe them indirectly, through the space's
//! binding count and shootdown queue.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::irq;
use crate::memory::address_space::{PageSpace, ShootNode};
use crate::memory::{tlb, PAGE_SIZE};

/// PCID slots (and thus bindings) per CPU.
pub const MAX_PCID_COUNT: usize = 8;

/// One (CPU, PCID) slot.
pub struct PageBinding {
    /// Hardware tag of this slot; fixed at construction. Slot 0 carries
    /// PCID 0, which is also the only usable slot without the feature.
    pcid: u16,
    have_pcids: bool,
    /// The space whose translations this slot caches. `None` when the
    /// slot is empty; the weak reference may dangle if the space died.
    bound_space: Option<Weak<PageSpace>>,
    was_rebound: bool,
    /// LRU key: value of the context's stamp counter at the last
    /// `make_primary`. Higher means more recently primary.
    primary_stamp: u64,
    /// Highest shootdown sequence of the bound space this slot has
    /// already serviced.
    already_shot_sequence: u64,
}

impl PageBinding {
    fn new(pcid: u16, have_pcids: bool) -> PageBinding {
        PageBinding {
            pcid,
            have_pcids,
            bound_space: None,
            was_rebound: false,
            primary_stamp: 0,
            already_shot_sequence: 0,
        }
    }

    /// The space this slot currently caches, if it is still alive.
    pub fn bound_space(&self) -> Option<Arc<PageSpace>> {
        self.bound_space.as_ref().and_then(Weak::upgrade)
    }

    pub fn pcid(&self) -> u16 {
        self.pcid
    }

    pub fn primary_stamp(&self) -> u64 {
        self.primary_stamp
    }

    #[cfg(test)]
    pub(super) fn was_rebound(&self) -> bool {
        self.was_rebound
    }

    #[cfg(test)]
    pub(super) fn already_shot_sequence(&self) -> u64 {
        self.already_shot_sequence
    }

    /// Bind this slot to `space`.
    ///
    /// Rebinding to the space already bound is a no-op. Otherwise the
    /// slot's tagged TLB entries are invalidated, everything still queued
    /// on the old space is credited here (this slot's translations for it
    /// are gone wholesale), and the slot attaches to `space` taking its
    /// current sequence as already serviced: a freshly loaded TLB holds
    /// nothing that could need shooting.
    pub fn rebind(&mut self, space: &Arc<PageSpace>) {
        debug_assert!(irq::disabled());

        let old = self.bound_space();
        if let Some(ref old) = old {
            if Arc::ptr_eq(old, space) {
                return;
            }
        }

        if self.have_pcids {
            tlb::flush_pcid_all(self.pcid);
        }
        self.was_rebound = true;

        let mut completed: Vec<Arc<ShootNode>> = Vec::new();
        if let Some(old) = old {
            let mut state = old.state().lock();
            for index in (0..state.shoot_queue.len()).rev() {
                if state.shoot_queue[index].sequence() <= self.already_shot_sequence {
                    break;
                }
                if state.shoot_queue[index].credit() {
                    if let Some(node) = state.shoot_queue.remove(index) {
                        completed.push(node);
                    }
                }
            }
            state.num_bindings -= 1;
        }
        // Completions run outside the lock, oldest first.
        for node in completed.iter().rev() {
            node.complete();
        }

        let target = {
            let mut state = space.state().lock();
            state.num_bindings += 1;
            state.shoot_sequence
        };

        self.bound_space = Some(Arc::downgrade(space));
        self.already_shot_sequence = target;
    }

    /// Service pending shootdowns of the bound space. Runs from the
    /// shootdown IPI on the owning CPU.
    ///
    /// Walks the queue from the newest node backwards and stops at the
    /// first node already serviced here, so repeated calls cost only the
    /// new work. A node is invalidated page by page, then credited; the
    /// last crediting CPU unlinks it and fires its completion.
    pub fn shootdown(&mut self) {
        debug_assert!(irq::disabled());

        let space = match self.bound_space() {
            Some(space) => space,
            None => {
                // The space died while this slot still cached it. Drop
                // the stale translations and make the slot rebindable.
                if self.bound_space.take().is_some() {
                    log::warn!(
                        "binding pcid={} lost its space, dropping stale translations",
                        self.pcid
                    );
                    if self.have_pcids {
                        tlb::flush_pcid_all(self.pcid);
                    } else {
                        tlb::flush_all();
                    }
                }
                return;
            }
        };

        let mut completed: Vec<Arc<ShootNode>> = Vec::new();
        let target;
        {
            let mut state = space.state().lock();
            target = match state.shoot_queue.back() {
                Some(node) => node.sequence(),
                None => return,
            };

            for index in (0..state.shoot_queue.len()).rev() {
                let node = &state.shoot_queue[index];
                if node.sequence() <= self.already_shot_sequence {
                    break;
                }

                let mut offset = 0;
                while offset < node.size() {
                    let addr = VirtAddr::new(node.address().as_u64() + offset);
                    if self.have_pcids {
                        tlb::flush_pcid_page(self.pcid, addr);
                    } else {
                        assert_eq!(self.pcid, 0);
                        tlb::flush_page(addr);
                    }
                    offset += PAGE_SIZE;
                }

                if state.shoot_queue[index].credit() {
                    if let Some(node) = state.shoot_queue.remove(index) {
                        completed.push(node);
                    }
                }
            }
        }
        for node in completed.iter().rev() {
            node.complete();
        }
        self.already_shot_sequence = target;
    }
}

/// Per-CPU paging context: the PCID slots plus the LRU bookkeeping.
pub struct PageContext {
    have_pcids: bool,
    /// Advances on every `make_primary`; never reused.
    next_stamp: u64,
    /// Slot whose translations are currently loaded in CR3.
    primary: Option<usize>,
    bindings: [PageBinding; MAX_PCID_COUNT],
}

impl PageContext {
    pub fn new(have_pcids: bool) -> PageContext {
        PageContext {
            have_pcids,
            next_stamp: 1,
            primary: None,
            bindings: core::array::from_fn(|slot| PageBinding::new(slot as u16, have_pcids)),
        }
    }

    pub fn have_pcids(&self) -> bool {
        self.have_pcids
    }

    pub fn binding(&self, slot: usize) -> &PageBinding {
        &self.bindings[slot]
    }

    pub fn binding_mut(&mut self, slot: usize) -> &mut PageBinding {
        &mut self.bindings[slot]
    }

    /// Slot currently live in CR3, if any.
    pub fn primary_slot(&self) -> Option<usize> {
        self.primary
    }

    /// Load `slot`'s space into CR3, unless it is already live.
    ///
    /// The reload is skipped when the slot is primary and was not rebound
    /// since: CR3 still holds the right root and the TLB its entries.
    /// This is the fast path for recurring switches into the same space.
    pub fn make_primary(&mut self, slot: usize) {
        debug_assert!(irq::disabled());

        let binding = &mut self.bindings[slot];
        debug_assert!(binding.have_pcids || binding.pcid == 0);

        if binding.was_rebound || self.primary != Some(slot) {
            let space = binding
                .bound_space()
                .expect("make_primary on an unbound slot");
            let mut cr3 = space.root_table().start_address().as_u64() | binding.pcid as u64;
            if binding.have_pcids {
                // Bit 63 keeps existing TLB entries across the reload.
                cr3 |= 1 << 63;
            }
            tlb::write_root_table(cr3);
        }

        binding.was_rebound = false;
        binding.primary_stamp = self.next_stamp;
        self.next_stamp += 1;
        self.primary = Some(slot);
    }

    /// Make `space` live on this CPU.
    ///
    /// A slot already holding the space is reused as is. Otherwise the
    /// least-recently-primary slot is rebound; without PCIDs only slot 0
    /// is considered.
    pub fn activate(&mut self, space: &Arc<PageSpace>) {
        debug_assert!(irq::disabled());

        let mut victim = 0;
        for slot in 0..MAX_PCID_COUNT {
            if let Some(bound) = self.bindings[slot].bound_space() {
                if Arc::ptr_eq(&bound, space) {
                    self.make_primary(slot);
                    return;
                }
            }

            if !self.have_pcids {
                break;
            }

            if self.bindings[slot].primary_stamp() < self.bindings[victim].primary_stamp() {
                victim = slot;
            }
        }

        self.bindings[victim].rebind(space);
        self.make_primary(victim);
    }

    /// Service shootdowns on every slot; the IPI-handler entry point.
    pub fn shootdown_all(&mut self) {
        debug_assert!(irq::disabled());
        for binding in &mut self.bindings {
            binding.shootdown();
        }
    }
}
