//! Hardware port layer: interrupt gate, register contexts, vectors, timers.
//!
//! Everything behind these traits is vendor territory. The kernel only
//! depends on the contracts defined here; a host implementation backs the
//! test suite, and a thin AArch64 implementation backs real hardware.

pub mod context;
pub mod timer;
pub mod vector;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

use context::RegisterContext;

/// Architecture abstraction for the single global interrupt gate.
///
/// The whole kernel is protected by this one gate: all shared state (the
/// thread ring, primitive counters and queues) is touched only while the
/// gate is closed. `disable_interrupts` returns the prior enabled state so
/// critical sections nest with the save/restore idiom.
pub trait Arch: 'static {
    /// Architecture-specific register context type.
    type Context: RegisterContext;

    /// Whether closing a vector's pending bit actually dispatches hardware.
    /// Host implementations set this false so yield falls back to a direct
    /// tick call.
    const HAS_VECTOR_DISPATCH: bool;

    /// Disable the global interrupt source, returning whether it was enabled.
    fn disable_interrupts() -> bool;

    /// Restore the global interrupt source to a previously saved state.
    fn restore_interrupts(was_enabled: bool);

    /// Check if the global interrupt source is currently enabled.
    fn interrupts_enabled() -> bool;

    /// Stop the CPU. Used when there is no outer authority to report to.
    fn halt() -> !;
}

/// Run a closure with the global interrupt gate closed.
///
/// The prior gate state is restored on exit, so these sections nest.
#[inline]
pub fn critical<A: Arch, R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = A::disable_interrupts();
    let result = f();
    A::restore_interrupts(was_enabled);
    result
}

/// Critical section over the default architecture.
///
/// Synchronization primitives use this so they stay non-generic.
#[inline]
pub fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    critical::<DefaultArch, R>(f)
}

/// Host-side architecture for testing the kernel's policy logic.
///
/// The interrupt gate is a software flag; nothing is actually masked. Under
/// the test harness the flag is per-thread, since tests run concurrently
/// and each models its own core.
pub struct HostArch;

#[cfg(not(test))]
static HOST_IRQ_ENABLED: portable_atomic::AtomicBool = portable_atomic::AtomicBool::new(true);

#[cfg(test)]
std::thread_local! {
    static HOST_IRQ_ENABLED: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
}

impl Arch for HostArch {
    type Context = context::HostContext;

    const HAS_VECTOR_DISPATCH: bool = false;

    #[cfg(not(test))]
    fn disable_interrupts() -> bool {
        HOST_IRQ_ENABLED.swap(false, portable_atomic::Ordering::AcqRel)
    }

    #[cfg(test)]
    fn disable_interrupts() -> bool {
        HOST_IRQ_ENABLED.with(|gate| gate.replace(false))
    }

    #[cfg(not(test))]
    fn restore_interrupts(was_enabled: bool) {
        HOST_IRQ_ENABLED.store(was_enabled, portable_atomic::Ordering::Release);
    }

    #[cfg(test)]
    fn restore_interrupts(was_enabled: bool) {
        HOST_IRQ_ENABLED.with(|gate| gate.set(was_enabled));
    }

    #[cfg(not(test))]
    fn interrupts_enabled() -> bool {
        HOST_IRQ_ENABLED.load(portable_atomic::Ordering::Acquire)
    }

    #[cfg(test)]
    fn interrupts_enabled() -> bool {
        HOST_IRQ_ENABLED.with(|gate| gate.get())
    }

    fn halt() -> ! {
        panic!("halt reached on host architecture");
    }
}

#[cfg(all(target_arch = "aarch64", not(test), not(feature = "std-shim")))]
pub use aarch64::Aarch64Arch as DefaultArch;

#[cfg(any(not(target_arch = "aarch64"), test, feature = "std-shim"))]
pub use HostArch as DefaultArch;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_section_restores_prior_state() {
        HostArch::restore_interrupts(true);
        critical::<HostArch, _>(|| {
            assert!(!HostArch::interrupts_enabled());
            // Nested section: still disabled inside, restored to disabled after
            critical::<HostArch, _>(|| {
                assert!(!HostArch::interrupts_enabled());
            });
            assert!(!HostArch::interrupts_enabled());
        });
        assert!(HostArch::interrupts_enabled());
    }

    #[test]
    fn disable_returns_prior_state() {
        HostArch::restore_interrupts(true);
        assert!(HostArch::disable_interrupts());
        assert!(!HostArch::disable_interrupts());
        HostArch::restore_interrupts(true);
    }
}
