//! Blocking mutex with FIFO handoff.
//!
//! The lock is a binary count plus a wait queue of thread ids. The fast path
//! takes the count when nobody is queued; otherwise the caller enqueues and
//! only the queue head may claim the count when it returns. Unlock never
//! touches the queue, it just restores the count and lets the scheduler's
//! polling deliver the handoff.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::arch::with_interrupts_disabled;
use crate::errors::{KernelResult, SyncError};
use crate::sched::ThreadId;
use crate::sync::{block_and_reschedule, current_waiter, BlockableResource};

struct MutexState {
    /// Binary: 1 available, 0 held.
    count: u32,
    /// Threads waiting for the lock, in arrival order.
    waiters: VecDeque<ThreadId>,
}

pub(crate) struct MutexShared {
    state: SpinMutex<MutexState>,
}

impl MutexShared {
    pub(crate) fn new() -> Self {
        Self {
            state: SpinMutex::new(MutexState {
                count: 1,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Uncontended path: take the count only when the queue is empty, so a
    /// late arrival can never jump a queued waiter.
    pub(crate) fn try_fast_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.count == 1 && state.waiters.is_empty() {
            state.count = 0;
            true
        } else {
            false
        }
    }

    pub(crate) fn enqueue_waiter(&self, id: ThreadId) {
        self.state.lock().waiters.push_back(id);
    }

    /// Claim the lock if `id` is the queue head and the count is available.
    /// Any other waiter, woken spuriously, goes back to blocking.
    pub(crate) fn try_claim_as_head(&self, id: ThreadId) -> bool {
        let mut state = self.state.lock();
        if state.waiters.front() == Some(&id) && state.count > 0 {
            state.count -= 1;
            state.waiters.pop_front();
            true
        } else {
            false
        }
    }

    /// Restore the count. The queue is untouched; handoff happens when the
    /// scheduler next polls the head.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        if state.count == 0 {
            state.count = 1;
        }
    }

    pub(crate) fn locked_out(&self) -> bool {
        self.state.lock().count == 0
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl BlockableResource for MutexShared {
    /// Deliberately coarse: this only checks the count, not the waiter's
    /// queue position, so every queued thread wakes when the lock frees and
    /// all but the head immediately block again.
    fn is_blocked(&self, _waiter: ThreadId) -> bool {
        self.locked_out()
    }
}

/// Blocking mutual-exclusion lock.
pub struct Mutex {
    shared: Arc<MutexShared>,
}

impl Mutex {
    /// Fails until the kernel is brought up; the lock cannot park threads
    /// without a scheduler behind it.
    pub fn new() -> KernelResult<Self> {
        if crate::kernel::active().is_none() {
            return Err(SyncError::NotInitialized.into());
        }
        Ok(Self {
            shared: Arc::new(MutexShared::new()),
        })
    }

    /// Acquire the lock, blocking in FIFO order behind earlier waiters.
    pub fn lock(&self) {
        let me = match current_waiter() {
            Some(id) => id,
            None => {
                // No thread context. Spin on the fast path; queued threads
                // still keep their ordering over us.
                loop {
                    if with_interrupts_disabled(|| self.shared.try_fast_lock()) {
                        return;
                    }
                    core::hint::spin_loop();
                }
            }
        };
        if with_interrupts_disabled(|| self.shared.try_fast_lock()) {
            return;
        }
        with_interrupts_disabled(|| self.shared.enqueue_waiter(me));
        let resource: Arc<dyn BlockableResource> = self.shared.clone();
        loop {
            block_and_reschedule(&resource);
            if with_interrupts_disabled(|| self.shared.try_claim_as_head(me)) {
                return;
            }
        }
    }

    /// Acquire without blocking. Queued waiters keep priority over this.
    pub fn try_lock(&self) -> bool {
        with_interrupts_disabled(|| self.shared.try_fast_lock())
    }

    /// Release the lock. Nothing enforces that the caller holds it.
    pub fn unlock(&self) {
        with_interrupts_disabled(|| self.shared.release());
    }

    /// Whether an acquirer would block right now.
    pub fn is_blocked(&self) -> bool {
        // The tick polls the same state lock from interrupt context, so even
        // a read-only peek has to close the gate first.
        with_interrupts_disabled(|| self.shared.locked_out())
    }
}
