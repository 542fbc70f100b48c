//! Virtual-memory paging core.
//!
//! This crate maintains the four-level translation hierarchies of the
//! kernel and of every userspace client, binds address spaces to per-CPU
//! PCID slots, and propagates unmaps across CPUs via TLB shootdowns.
//!
//! The crate is freestanding when built for the kernel. Under `cargo test`
//! it builds hosted instead: the hardware touchpoints (frame source,
//! physical-memory window, TLB intrinsics, IPIs, the interrupt gate) are
//! replaced by a deterministic mock so the paging logic runs unmodified on
//! the development machine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ipi;
pub mod irq;
pub mod memory;
#[cfg(target_arch = "x86_64")]
pub mod per_cpu;
