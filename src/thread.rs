//! Owner-facing thread handle.
//!
//! [`Thread::new`] carves a stack out of the kernel's pool, builds a TCB,
//! and points its first dispatch at [`thread_trampoline`]; `start` enters it
//! into the scheduler ring. The handle releases the TCB slot on drop once
//! the thread has finished; dropping a handle to a live thread detaches it.

use alloc::boxed::Box;

use crate::arch::{Arch, DefaultArch};
use crate::errors::{KernelError, KernelResult, SpawnError};
use crate::kernel::Kernel;
use crate::mem::StackSizeClass;
use crate::sched::{TcbHandle, ThreadId, ThreadState};
use crate::time::Duration;

pub use crate::sched::{DEFAULT_PRIORITY, LOCK_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};

pub struct Thread {
    handle: TcbHandle,
}

impl Thread {
    /// Create a thread running `task` on a fresh `stack_bytes` stack at the
    /// given priority (clamped to 1..=10). The thread stays NEW until
    /// [`start`](Self::start).
    pub fn new<F>(task: F, stack_bytes: usize, priority: u8) -> KernelResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let kernel = crate::kernel::active().ok_or(KernelError::NotInitialized)?;
        if StackSizeClass::for_size(stack_bytes).is_none() {
            return Err(SpawnError::InvalidStackSize(stack_bytes).into());
        }
        let stack = kernel
            .stack_pool()
            .allocate_bytes(stack_bytes)
            .ok_or(SpawnError::OutOfMemory)?;
        let id = kernel.next_thread_id();
        let handle = kernel.scheduler().create_thread(
            stack,
            priority,
            Box::new(task),
            id,
            thread_trampoline as usize,
        );
        Ok(Self { handle })
    }

    /// Create with the default priority.
    pub fn spawn<F>(task: F, stack_bytes: usize) -> KernelResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(task, stack_bytes, DEFAULT_PRIORITY)
    }

    /// Enter the thread into the scheduler ring. Fails on a second start.
    pub fn start(&self) -> KernelResult<()> {
        let kernel = crate::kernel::active().ok_or(KernelError::NotInitialized)?;
        kernel.scheduler().start(self.handle)
    }

    /// Yield until the thread has finished. Joining an already-released
    /// thread returns immediately.
    pub fn join(&self) {
        let kernel = match crate::kernel::active() {
            Some(kernel) => kernel,
            None => return,
        };
        loop {
            match kernel.scheduler().state_of(self.handle) {
                None | Some(ThreadState::Dead) => return,
                _ => kernel.yield_now(),
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        match crate::kernel::active() {
            Some(kernel) => matches!(
                kernel.scheduler().state_of(self.handle),
                None | Some(ThreadState::Dead)
            ),
            None => true,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.handle.id
    }

    pub fn priority(&self) -> Option<u8> {
        crate::kernel::active().and_then(|k| k.scheduler().priority_of(self.handle))
    }

    /// Re-prioritize; the value is clamped to 1..=10 and applies from the
    /// thread's next dispatch.
    pub fn set_priority(&self, priority: u8) {
        if let Some(kernel) = crate::kernel::active() {
            kernel.scheduler().set_priority(self.handle, priority);
        }
    }

    /// Move the thread to the lock-holder priority, which maps its quantum
    /// to the timer's maximum period.
    pub fn set_lock_priority(&self) {
        if let Some(kernel) = crate::kernel::active() {
            kernel.scheduler().set_lock_priority(self.handle);
        }
    }

    /// Put the calling thread to sleep for at least the given span. Outside
    /// a thread context this returns immediately.
    pub fn sleep(ms: u32, ns: u32) {
        let kernel = match crate::kernel::active() {
            Some(kernel) => kernel,
            None => return,
        };
        let span = Duration::from_nanos(ms as u64 * 1_000_000 + ns as u64);
        if kernel.scheduler().sleep_current(kernel.now() + span) {
            kernel.yield_now();
        }
    }

    /// Id of the thread currently on the core.
    pub fn current_id() -> Option<ThreadId> {
        crate::kernel::active().and_then(|k| k.scheduler().current_id())
    }

    /// Give up the rest of the current quantum.
    pub fn yield_now() {
        if let Some(kernel) = crate::kernel::active() {
            kernel.yield_now();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Reclaims the slot and stack of a finished or never-started
        // thread. A live thread keeps running detached; its slot stays
        // allocated for the kernel's lifetime.
        if let Some(kernel) = crate::kernel::active() {
            if let Some(stack) = kernel.scheduler().release(self.handle) {
                kernel.stack_pool().deallocate(stack);
            }
        }
    }
}

/// First code every thread runs. The scheduler seeds the entry context with
/// the arena slot and raw id so the trampoline can rebuild its own handle.
/// Never returns; after the body finishes the TCB is dead and the next tick
/// dispatches someone else.
pub(crate) extern "C" fn thread_trampoline(slot: usize, raw_id: usize) -> ! {
    if let Some(kernel) = crate::kernel::active() {
        if let Some(id) = ThreadId::from_raw(raw_id) {
            let handle = TcbHandle { slot, id };
            run_thread(kernel, handle);
            kernel.yield_now();
        }
    }
    // Unreachable once the tick above dispatches away; parked here if the
    // kernel vanished underneath us.
    DefaultArch::halt()
}

/// Run a thread's body to completion and retire its TCB.
pub(crate) fn run_thread(kernel: &Kernel<DefaultArch>, handle: TcbHandle) {
    if let Some(task) = kernel.scheduler().take_task(handle) {
        task();
    }
    kernel.scheduler().mark_dead_and_unlink(handle);
}
