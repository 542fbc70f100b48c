//! Shootdown IPI plumbing.
//!
//! The core does not know how inter-processor interrupts are delivered.
//! The platform registers a sender at bring-up; delivery must eventually
//! run `handle_shootdown_ipi` on every CPU that may hold a binding to the
//! initiating space. Spurious deliveries are harmless: servicing an empty
//! queue is a no-op.

#[cfg(not(test))]
use conquer_once::spin::OnceCell;

#[cfg(not(test))]
static SHOOTDOWN_SENDER: OnceCell<fn()> = OnceCell::uninit();

/// Register the platform's shootdown IPI sender. Called once during
/// bring-up, before the first client space is activated.
#[cfg(not(test))]
pub fn set_shootdown_sender(sender: fn()) {
    SHOOTDOWN_SENDER.init_once(|| sender);
    log::info!("Shootdown IPI sender registered");
}

/// Prod the other CPUs into servicing their shootdown queues.
#[cfg(not(test))]
pub fn send_shootdown_ipi() {
    (SHOOTDOWN_SENDER
        .get()
        .expect("shootdown IPI sender not registered"))();
}

#[cfg(test)]
pub fn send_shootdown_ipi() {
    crate::memory::mock::record(crate::memory::mock::HwOp::ShootdownIpi);
}

/// Interrupt-handler side of the protocol: service pending shootdowns on
/// every PCID slot of the current CPU.
#[cfg(all(target_arch = "x86_64", not(test)))]
pub fn handle_shootdown_ipi() {
    crate::per_cpu::with_current(|cpu| cpu.page_context.shootdown_all());
}
