#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! Deterministic preemptive multithreading core for bare-metal targets.
//!
//! A single-core kernel built around a priority-weighted round-robin
//! scheduler: a thread's priority (1..=10) is the number of base quanta it
//! keeps the core per dispatch. Blocking primitives do not signal waiters;
//! the scheduler polls each blocked thread's resource once per tick, so
//! every wait condition lives behind one trait and wakeups may be spurious.
//!
//! All hardware access goes through port traits ([`arch::vector::VectorOps`],
//! [`arch::timer::PeriodicTimer`], [`time::ClockSource`]), which is what
//! lets the complete scheduling policy run under `cargo test` on a host.
//!
//! # Quick Start
//!
//! ```ignore
//! use rtcore::{BoardConfig, Kernel, HardwarePorts, Thread};
//!
//! fn kernel_main(ports: HardwarePorts) {
//!     static mut KERNEL: Option<Kernel<rtcore::DefaultArch>> = None;
//!     let kernel = unsafe {
//!         KERNEL = Some(Kernel::bring_up(BoardConfig::default(), ports).unwrap());
//!         KERNEL.as_ref().unwrap()
//!     };
//!     unsafe { kernel.register_global() };
//!     kernel.start_ticking().unwrap();
//!
//!     let worker = Thread::spawn(|| { /* thread work */ }, 4096).unwrap();
//!     worker.start().unwrap();
//! }
//! ```

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod time;

#[cfg(test)]
mod tests;

#[cfg(test)]
extern crate std;

extern crate alloc;

// Panic handler for bare-metal
#[cfg(all(not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    // On panic, disable interrupts and halt
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("msr daifset, #0xf", options(nomem, nostack));
    }
    loop {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("wfe", options(nomem, nostack));
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, DefaultArch};

// Kernel
pub use kernel::{active, HardwarePorts, Kernel};

// Configuration
pub use config::BoardConfig;

// Scheduler
pub use sched::{Scheduler, ThreadId, ThreadState, TickDecision};

// Threads
pub use thread::Thread;

// Synchronization
pub use sync::{BlockableResource, Escalator, Mutex, Semaphore};

// Memory management
pub use mem::{Stack, StackPool, StackSizeClass};

// Time
pub use time::{ClockSource, Duration, Instant};

// Errors
pub use errors::{KernelError, KernelResult, SpawnError, SyncError};

// ============================================================================
// Convenience Functions
// ============================================================================

/// Yield the current thread's time slice to the scheduler.
///
/// This is a cooperative yield - the thread voluntarily gives up the CPU
/// to allow other threads to run. The current thread remains runnable
/// and will be scheduled again later.
#[inline]
pub fn yield_now() {
    if let Some(kernel) = kernel::active() {
        kernel.yield_now();
    }
}
