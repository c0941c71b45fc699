//! Blocking synchronization primitives.
//!
//! Every primitive exposes its wait condition through [`BlockableResource`].
//! A blocked thread does not sit on a per-primitive wait list waiting to be
//! signalled; the scheduler polls the resource once per tick and wakes the
//! thread when `is_blocked` reports false. Wakeups can therefore be spurious
//! and every acquire path re-checks its condition in a loop.

pub mod escalator;
pub mod mutex;
pub mod semaphore;

pub use escalator::Escalator;
pub use mutex::Mutex;
pub use semaphore::Semaphore;

use alloc::sync::Arc;

use crate::sched::ThreadId;

/// Wait condition polled by the scheduler on behalf of a blocked thread.
///
/// Implementations must be cheap: this runs inside the tick's critical
/// section, once per blocked thread per revolution.
pub trait BlockableResource: Send + Sync {
    /// Should `waiter` stay blocked? A return of `false` wakes the thread;
    /// fair primitives make their grant decision inside this call so the
    /// grant and the wakeup are one atomic step.
    fn is_blocked(&self, waiter: ThreadId) -> bool;
}

/// Id of the thread currently on the core, if the kernel is up and a thread
/// context exists. Interrupt handlers and pre-kernel code get `None`.
pub(crate) fn current_waiter() -> Option<ThreadId> {
    crate::kernel::active().and_then(|k| k.scheduler().current_id())
}

/// Park the calling thread on `resource` until the scheduler's poll releases
/// it. Outside a thread context there is nothing to park, so this degrades
/// to a spin hint and the caller's retry loop carries the wait.
pub(crate) fn block_and_reschedule(resource: &Arc<dyn BlockableResource>) {
    match crate::kernel::active() {
        Some(kernel) => {
            kernel.scheduler().block_current(Arc::downgrade(resource));
            kernel.yield_now();
        }
        None => core::hint::spin_loop(),
    }
}
