//! Semaphore variant whose grants ride the scheduler's poll.
//!
//! Where [`Semaphore`](crate::sync::Semaphore) wakes a waiter and lets it
//! claim permits itself, the escalator performs the grant inside
//! `is_blocked`: when the scheduler polls the queue head and enough permits
//! are available, the poll decrements the pool, dequeues the head, and
//! reports it unblocked in one step. Non-head waiters always stay blocked,
//! so ordering is FIFO in both modes; the fairness flag only controls the
//! observable executing set.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::arch::with_interrupts_disabled;
use crate::errors::{KernelResult, SyncError};
use crate::sched::ThreadId;
use crate::sync::semaphore::Waiter;
use crate::sync::{block_and_reschedule, current_waiter, BlockableResource};

struct EscState {
    available: u32,
    /// Arrival-ordered requests not yet granted.
    waiting: VecDeque<Waiter>,
    /// Grants not yet released. Maintained in fair mode only.
    executing: VecDeque<Waiter>,
}

pub(crate) struct EscalatorShared {
    fair: bool,
    capacity: u32,
    state: SpinMutex<EscState>,
}

impl EscalatorShared {
    pub(crate) fn new(permits: u32, fair: bool) -> Self {
        Self {
            fair,
            capacity: permits,
            state: SpinMutex::new(EscState {
                available: permits,
                waiting: VecDeque::new(),
                executing: VecDeque::new(),
            }),
        }
    }

    /// Fast path for an empty queue. Mirrors the fair semaphore's shape and
    /// records the grant when fairness bookkeeping is on.
    pub(crate) fn try_fast(&self, id: Option<ThreadId>, amount: u32) -> bool {
        let mut state = self.state.lock();
        if !state.waiting.is_empty() || state.available < amount {
            return false;
        }
        state.available -= amount;
        if self.fair {
            if let Some(id) = id {
                state.executing.push_back(Waiter { id, amount });
            }
        }
        true
    }

    pub(crate) fn enqueue(&self, id: ThreadId, amount: u32) {
        self.state.lock().waiting.push_back(Waiter { id, amount });
    }

    /// Whether `id` still sits in the wait queue. The acquire loop uses this
    /// to detect that a poll granted its request.
    pub(crate) fn still_waiting(&self, id: ThreadId) -> bool {
        self.state.lock().waiting.iter().any(|w| w.id == id)
    }

    /// Return permits and, in fair mode, retire the caller's oldest grant.
    pub(crate) fn put(&self, id: Option<ThreadId>, amount: u32) {
        let mut state = self.state.lock();
        state.available += amount;
        if self.fair {
            if let Some(id) = id {
                if let Some(pos) = state.executing.iter().position(|w| w.id == id) {
                    state.executing.remove(pos);
                }
            }
        }
    }

    pub(crate) fn available(&self) -> u32 {
        self.state.lock().available
    }

    #[cfg(test)]
    fn executing_count(&self) -> usize {
        self.state.lock().executing.len()
    }
}

impl BlockableResource for EscalatorShared {
    /// The grant path. Only the queue head can be released, and only when
    /// the pool covers its request; the decrement, dequeue, and executing
    /// entry all land before the waiter observes the wakeup.
    fn is_blocked(&self, waiter: ThreadId) -> bool {
        let mut state = self.state.lock();
        let granted = matches!(
            state.waiting.front(),
            Some(head) if head.id == waiter && state.available >= head.amount
        );
        if !granted {
            return true;
        }
        if let Some(head) = state.waiting.pop_front() {
            state.available -= head.amount;
            if self.fair {
                state.executing.push_back(head);
            }
        }
        false
    }
}

/// FIFO semaphore whose grants happen at poll time.
pub struct Escalator {
    shared: Arc<EscalatorShared>,
}

impl Escalator {
    pub fn new(permits: u32) -> KernelResult<Self> {
        Self::with_fairness(permits, false)
    }

    pub fn new_fair(permits: u32) -> KernelResult<Self> {
        Self::with_fairness(permits, true)
    }

    pub fn with_fairness(permits: u32, fair: bool) -> KernelResult<Self> {
        if crate::kernel::active().is_none() {
            return Err(SyncError::NotInitialized.into());
        }
        if permits == 0 {
            return Err(SyncError::ZeroPermits.into());
        }
        Ok(Self {
            shared: Arc::new(EscalatorShared::new(permits, fair)),
        })
    }

    pub fn acquire(&self) {
        self.acquire_many(1);
    }

    /// Take `amount` permits. Zero succeeds immediately; more than the
    /// pool's capacity blocks forever.
    pub fn acquire_many(&self, amount: u32) {
        if amount == 0 {
            return;
        }
        let me = current_waiter();
        if with_interrupts_disabled(|| self.shared.try_fast(me, amount)) {
            return;
        }
        let me = match me {
            Some(id) => id,
            None => {
                // Without a thread context the poll-side grant can never
                // name us, so spin on the fast path instead.
                loop {
                    if with_interrupts_disabled(|| self.shared.try_fast(None, amount)) {
                        return;
                    }
                    core::hint::spin_loop();
                }
            }
        };
        with_interrupts_disabled(|| self.shared.enqueue(me, amount));
        let resource: Arc<dyn BlockableResource> = self.shared.clone();
        loop {
            // Leaving the wait queue is the grant signal; the scheduler's
            // poll moved us out when it handed over the permits.
            if !with_interrupts_disabled(|| self.shared.still_waiting(me)) {
                return;
            }
            block_and_reschedule(&resource);
        }
    }

    pub fn release(&self) {
        self.release_many(1);
    }

    pub fn release_many(&self, amount: u32) {
        let me = current_waiter();
        with_interrupts_disabled(|| self.shared.put(me, amount));
    }

    /// Whether an acquirer of one permit would block right now.
    pub fn is_blocked(&self) -> bool {
        self.available() == 0
    }

    pub fn is_fair(&self) -> bool {
        self.shared.fair
    }

    /// Permits currently in the pool. Gate-closed like every other touch of
    /// the state lock; the tick polls it from interrupt context.
    pub fn available(&self) -> u32 {
        with_interrupts_disabled(|| self.shared.available())
    }

    pub fn capacity(&self) -> u32 {
        self.shared.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(raw: usize) -> ThreadId {
        ThreadId::from_raw(raw).unwrap()
    }

    #[test]
    fn poll_grants_head_atomically() {
        let shared = EscalatorShared::new(2, true);
        shared.enqueue(tid(1), 2);
        // The poll both dequeues and decrements.
        assert!(!shared.is_blocked(tid(1)));
        assert!(!shared.still_waiting(tid(1)));
        assert_eq!(shared.available(), 0);
        assert_eq!(shared.executing_count(), 1);
    }

    #[test]
    fn non_head_waiter_always_blocked() {
        let shared = EscalatorShared::new(1, true);
        shared.enqueue(tid(1), 1);
        shared.enqueue(tid(2), 1);
        // Even with a permit free, 2 is not the head.
        assert!(shared.is_blocked(tid(2)));
        assert!(!shared.is_blocked(tid(1)));
        // Pool now empty; 2 is head but uncovered.
        assert!(shared.is_blocked(tid(2)));
        shared.put(Some(tid(1)), 1);
        assert!(!shared.is_blocked(tid(2)));
    }

    #[test]
    fn head_with_large_request_holds_the_queue() {
        let shared = EscalatorShared::new(3, true);
        shared.enqueue(tid(1), 3);
        shared.enqueue(tid(2), 1);
        assert!(!shared.is_blocked(tid(1)));
        // 2 is head now but the pool is drained.
        assert!(shared.is_blocked(tid(2)));
        shared.put(Some(tid(1)), 3);
        assert!(!shared.is_blocked(tid(2)));
    }

    #[test]
    fn fair_release_retires_executing_entry() {
        let shared = EscalatorShared::new(2, true);
        shared.enqueue(tid(1), 1);
        shared.enqueue(tid(2), 1);
        assert!(!shared.is_blocked(tid(1)));
        assert!(!shared.is_blocked(tid(2)));
        assert_eq!(shared.executing_count(), 2);
        shared.put(Some(tid(1)), 1);
        assert_eq!(shared.executing_count(), 1);
        shared.put(Some(tid(2)), 1);
        assert_eq!(shared.executing_count(), 0);
        assert_eq!(shared.available(), 2);
    }

    #[test]
    fn unfair_mode_skips_executing_bookkeeping() {
        let shared = EscalatorShared::new(1, false);
        assert!(shared.try_fast(Some(tid(1)), 1));
        assert_eq!(shared.executing_count(), 0);
        shared.put(Some(tid(1)), 1);
        assert_eq!(shared.available(), 1);
    }

    #[test]
    fn fast_path_defers_to_queue() {
        let shared = EscalatorShared::new(2, true);
        shared.enqueue(tid(1), 1);
        assert!(!shared.try_fast(Some(tid(2)), 1));
    }
}
