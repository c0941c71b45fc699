//! Priority-weighted round-robin scheduler.
//!
//! A single ring of handles feeds one core. Each tick demotes the previously
//! running thread, walks the ring at most one full revolution to advance
//! waiter states, and reports what the kernel should do with the hardware as
//! a [`TickDecision`]. Keeping the decision separate from its effects lets
//! the whole policy run on a host without any timer or vector hardware.

use alloc::collections::VecDeque;
use alloc::sync::Weak;

use spin::Mutex;

use crate::arch::context::{ContextRecord, RegisterContext};
use crate::arch::{critical, Arch};
use crate::errors::{KernelResult, SpawnError};
use crate::mem::Stack;
use crate::sched::tcb::{TaskFn, Tcb, TcbArena, TcbHandle, ThreadId, ThreadState};
use crate::sync::BlockableResource;
use crate::time::Instant;

/// What the kernel should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// The ring is empty. Stop the preemption timer; threads may still be
    /// created later, which restarts it.
    Idle,
    /// Threads exist but none is runnable this tick. Keep ticking at the
    /// base quantum so waiters keep getting polled.
    NoneRunnable,
    /// Dispatch `handle`. The timer period is `priority` quanta; the record
    /// pointer stays valid while the thread stays in the arena.
    Switch {
        handle: TcbHandle,
        priority: u8,
        record: *mut ContextRecord,
    },
}

struct SchedInner<C: RegisterContext> {
    arena: TcbArena<C>,
    ring: VecDeque<TcbHandle>,
    running: Option<TcbHandle>,
}

/// The scheduler for one core.
pub struct Scheduler<A: Arch> {
    inner: Mutex<SchedInner<A::Context>>,
}

// Dispatch record pointers are only dereferenced by the switch hardware
// while interrupts are masked; the spin lock covers everything else.
unsafe impl<A: Arch> Send for Scheduler<A> {}
unsafe impl<A: Arch> Sync for Scheduler<A> {}

impl<A: Arch> Scheduler<A> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(SchedInner {
                arena: TcbArena::new(),
                ring: VecDeque::new(),
                running: None,
            }),
        }
    }

    /// Build a TCB for `task` and seed its register context so the first
    /// dispatch lands in `trampoline(slot, raw_id)`. The thread starts NEW
    /// and does not join the ring until [`start`](Self::start).
    pub fn create_thread(
        &self,
        stack: Stack,
        priority: u8,
        task: TaskFn,
        id: ThreadId,
        trampoline: usize,
    ) -> TcbHandle {
        critical::<A, _>(|| {
            let mut inner = self.inner.lock();
            let handle = inner.arena.insert(Tcb::new(id, stack, priority, task));
            if let Some(tcb) = inner.arena.get_mut(handle) {
                let top = tcb.stack.initial_top();
                tcb.context.initialize(top, trampoline, handle.slot, id.get());
            }
            handle
        })
    }

    /// Enter a NEW thread into the ring. Starting twice is an error;
    /// starting a released handle reports the same thing.
    pub fn start(&self, handle: TcbHandle) -> KernelResult<()> {
        critical::<A, _>(|| {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            match inner.arena.get(handle) {
                Some(tcb) if tcb.state() == ThreadState::New => {
                    tcb.set_state(ThreadState::Runnable);
                    inner.ring.push_back(handle);
                    Ok(())
                }
                _ => Err(SpawnError::AlreadyStarted.into()),
            }
        })
    }

    /// One scheduling tick at time `now`.
    ///
    /// The previously running thread is demoted back to RUNNABLE (unless it
    /// blocked, slept, or died since). The ring head is then examined: dead
    /// entries are dropped, blocked entries poll their resource, sleepers
    /// check their deadline. A RUNNABLE head is promoted and rotated to the
    /// tail so the next scan starts after it; anything else rotates without
    /// promotion. The scan stops after one full revolution.
    pub fn advance(&self, now: Instant) -> TickDecision {
        critical::<A, _>(|| {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;

            if let Some(prev) = inner.running.take() {
                if let Some(tcb) = inner.arena.get(prev) {
                    if tcb.state() == ThreadState::Running {
                        tcb.set_state(ThreadState::Runnable);
                    }
                }
            }

            let mut remaining = inner.ring.len();
            while remaining > 0 {
                remaining -= 1;
                let handle = match inner.ring.front() {
                    Some(&handle) => handle,
                    None => break,
                };
                let state = match inner.arena.get(handle) {
                    Some(tcb) => tcb.state(),
                    None => {
                        // Released while ringed; drop without rotating.
                        inner.ring.pop_front();
                        continue;
                    }
                };
                match state {
                    ThreadState::Dead | ThreadState::New => {
                        inner.ring.pop_front();
                        continue;
                    }
                    ThreadState::Blocked => {
                        let wake = match inner.arena.get(handle).and_then(|t| t.blocked_on.as_ref())
                        {
                            Some(weak) => match weak.upgrade() {
                                // The resource decides; a grant may happen
                                // inside this call.
                                Some(resource) => !resource.is_blocked(handle.id),
                                // Resource dropped: nothing left to wait for.
                                None => true,
                            },
                            None => true,
                        };
                        if wake {
                            if let Some(tcb) = inner.arena.get_mut(handle) {
                                tcb.blocked_on = None;
                                tcb.set_state(ThreadState::Runnable);
                            }
                        }
                    }
                    ThreadState::Sleeping => {
                        if let Some(tcb) = inner.arena.get(handle) {
                            if now.as_nanos() >= tcb.wake_deadline_ns {
                                tcb.set_state(ThreadState::Runnable);
                            }
                        }
                    }
                    ThreadState::Runnable | ThreadState::Running => {}
                }

                let runnable = inner
                    .arena
                    .get(handle)
                    .map(|t| t.state() == ThreadState::Runnable)
                    .unwrap_or(false);
                if let Some(rotated) = inner.ring.pop_front() {
                    inner.ring.push_back(rotated);
                }
                if runnable {
                    if let Some(tcb) = inner.arena.get_mut(handle) {
                        tcb.set_state(ThreadState::Running);
                        let priority = tcb.priority();
                        let record = tcb.install_record();
                        inner.running = Some(handle);
                        return TickDecision::Switch {
                            handle,
                            priority,
                            record,
                        };
                    }
                }
            }

            if inner.ring.is_empty() {
                TickDecision::Idle
            } else {
                TickDecision::NoneRunnable
            }
        })
    }

    pub fn current(&self) -> Option<TcbHandle> {
        critical::<A, _>(|| self.inner.lock().running)
    }

    pub fn current_id(&self) -> Option<ThreadId> {
        self.current().map(|h| h.id)
    }

    pub fn state_of(&self, handle: TcbHandle) -> Option<ThreadState> {
        critical::<A, _>(|| self.inner.lock().arena.get(handle).map(|t| t.state()))
    }

    pub fn priority_of(&self, handle: TcbHandle) -> Option<u8> {
        critical::<A, _>(|| self.inner.lock().arena.get(handle).map(|t| t.priority()))
    }

    /// Change a thread's priority, clamped to the schedulable band. Takes
    /// effect at its next dispatch.
    pub fn set_priority(&self, handle: TcbHandle, priority: u8) {
        critical::<A, _>(|| {
            if let Some(tcb) = self.inner.lock().arena.get(handle) {
                tcb.set_priority(priority);
            }
        })
    }

    /// Move a thread to the lock-holder priority.
    pub fn set_lock_priority(&self, handle: TcbHandle) {
        critical::<A, _>(|| {
            if let Some(tcb) = self.inner.lock().arena.get(handle) {
                tcb.set_lock_priority();
            }
        })
    }

    /// Mark the running thread BLOCKED on `resource`. Returns false when no
    /// thread is running, in which case the caller has nothing to block.
    pub fn block_current(&self, resource: Weak<dyn BlockableResource>) -> bool {
        critical::<A, _>(|| {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            match inner.running {
                Some(handle) => match inner.arena.get_mut(handle) {
                    Some(tcb) => {
                        tcb.blocked_on = Some(resource);
                        tcb.set_state(ThreadState::Blocked);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        })
    }

    /// Mark the running thread SLEEPING until `deadline`.
    pub fn sleep_current(&self, deadline: Instant) -> bool {
        critical::<A, _>(|| {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            match inner.running {
                Some(handle) => match inner.arena.get_mut(handle) {
                    Some(tcb) => {
                        tcb.wake_deadline_ns = deadline.as_nanos();
                        tcb.set_state(ThreadState::Sleeping);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        })
    }

    /// Mark a thread DEAD and take it out of the ring. The arena slot stays
    /// allocated until [`release`](Self::release) so a joiner can still
    /// observe the final state.
    pub fn mark_dead_and_unlink(&self, handle: TcbHandle) {
        critical::<A, _>(|| {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            if let Some(tcb) = inner.arena.get(handle) {
                tcb.set_state(ThreadState::Dead);
            }
            inner.ring.retain(|h| *h != handle);
            if inner.running == Some(handle) {
                inner.running = None;
            }
        })
    }

    /// Take the thread body out of its TCB, leaving `None` behind.
    pub fn take_task(&self, handle: TcbHandle) -> Option<TaskFn> {
        critical::<A, _>(|| {
            self.inner
                .lock()
                .arena
                .get_mut(handle)
                .and_then(|tcb| tcb.task.take())
        })
    }

    /// Free the arena slot of a DEAD or never-started thread. Live threads
    /// are refused; their stacks and save areas are still in use.
    pub fn release(&self, handle: TcbHandle) -> Option<Stack> {
        critical::<A, _>(|| {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let releasable = matches!(
                inner.arena.get(handle).map(|t| t.state()),
                Some(ThreadState::Dead) | Some(ThreadState::New)
            );
            if !releasable {
                return None;
            }
            inner.ring.retain(|h| *h != handle);
            inner.arena.remove(handle).map(|tcb| tcb.stack)
        })
    }

    /// (total, runnable-or-running, waiting) thread counts.
    pub fn stats(&self) -> (usize, usize, usize) {
        critical::<A, _>(|| {
            let inner = self.inner.lock();
            let mut runnable = 0;
            let mut waiting = 0;
            for tcb in inner.arena.iter() {
                match tcb.state() {
                    ThreadState::Runnable | ThreadState::Running => runnable += 1,
                    ThreadState::Blocked | ThreadState::Sleeping => waiting += 1,
                    ThreadState::New | ThreadState::Dead => {}
                }
            }
            (inner.arena.live(), runnable, waiting)
        })
    }
}

impl<A: Arch> Default for Scheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use portable_atomic::{AtomicBool, Ordering};

    use crate::arch::HostArch;
    use crate::mem::StackPool;
    use crate::sched::tcb::{ThreadId, LOCK_PRIORITY};
    use crate::time::Duration;

    fn at(ns: u64) -> Instant {
        Instant::from_nanos(ns)
    }

    fn spawn(
        sched: &Scheduler<HostArch>,
        pool: &StackPool,
        id: usize,
        priority: u8,
    ) -> TcbHandle {
        let stack = pool.allocate_bytes(1024).unwrap();
        let tid = ThreadId::from_raw(id).unwrap();
        let handle = sched.create_thread(stack, priority, Box::new(|| {}), tid, 0);
        sched.start(handle).unwrap();
        handle
    }

    struct Gate {
        open: AtomicBool,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(false),
            })
        }
    }

    impl BlockableResource for Gate {
        fn is_blocked(&self, _waiter: ThreadId) -> bool {
            !self.open.load(Ordering::Acquire)
        }
    }

    fn gate_resource(gate: &Arc<Gate>) -> Weak<dyn BlockableResource> {
        let resource: Arc<dyn BlockableResource> = gate.clone();
        Arc::downgrade(&resource)
    }

    #[test]
    fn empty_ring_is_idle() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        assert_eq!(sched.advance(at(0)), TickDecision::Idle);
    }

    #[test]
    fn round_robin_rotates_through_runnable_threads() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let a = spawn(&sched, &pool, 1, 5);
        let b = spawn(&sched, &pool, 2, 5);

        let first = sched.advance(at(0));
        let second = sched.advance(at(1));
        let third = sched.advance(at(2));
        match (first, second, third) {
            (
                TickDecision::Switch { handle: h1, .. },
                TickDecision::Switch { handle: h2, .. },
                TickDecision::Switch { handle: h3, .. },
            ) => {
                assert_eq!(h1, a);
                assert_eq!(h2, b);
                assert_eq!(h3, a);
            }
            other => panic!("expected three switches, got {:?}", other),
        }
    }

    #[test]
    fn switch_reports_priority_for_quantum_scaling() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let handle = spawn(&sched, &pool, 1, 7);
        match sched.advance(at(0)) {
            TickDecision::Switch { priority, .. } => assert_eq!(priority, 7),
            other => panic!("expected switch, got {:?}", other),
        }
        sched.set_lock_priority(handle);
        match sched.advance(at(1)) {
            TickDecision::Switch { priority, .. } => assert_eq!(priority, LOCK_PRIORITY),
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn at_most_one_running() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        spawn(&sched, &pool, 1, 5);
        spawn(&sched, &pool, 2, 5);
        sched.advance(at(0));
        sched.advance(at(1));
        let (total, runnable, waiting) = sched.stats();
        assert_eq!(total, 2);
        assert_eq!(runnable, 2);
        assert_eq!(waiting, 0);
        assert!(sched.current().is_some());
    }

    #[test]
    fn blocked_thread_skipped_until_resource_opens() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let a = spawn(&sched, &pool, 1, 5);
        let b = spawn(&sched, &pool, 2, 5);
        let gate = Gate::new();

        // A runs, then blocks on the gate.
        assert!(matches!(
            sched.advance(at(0)),
            TickDecision::Switch { handle, .. } if handle == a
        ));
        assert!(sched.block_current(gate_resource(&gate)));

        // Only B runs while the gate is closed.
        for step in 1..4 {
            match sched.advance(at(step)) {
                TickDecision::Switch { handle, .. } => assert_eq!(handle, b),
                other => panic!("expected switch to b, got {:?}", other),
            }
        }

        gate.open.store(true, Ordering::Release);
        let mut saw_a = false;
        for step in 4..7 {
            if let TickDecision::Switch { handle, .. } = sched.advance(at(step)) {
                saw_a |= handle == a;
            }
        }
        assert!(saw_a);
    }

    #[test]
    fn mutex_waiter_parks_through_advance_until_release() {
        use crate::sync::mutex::MutexShared;

        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let a = spawn(&sched, &pool, 1, 5);
        let b = spawn(&sched, &pool, 2, 5);
        let lock = Arc::new(MutexShared::new());
        let resource: Arc<dyn BlockableResource> = lock.clone();

        // A is dispatched and takes the lock.
        assert!(matches!(
            sched.advance(at(0)),
            TickDecision::Switch { handle, .. } if handle == a
        ));
        assert!(lock.try_fast_lock());

        // B is dispatched, misses the fast path, queues, and parks.
        assert!(matches!(
            sched.advance(at(1)),
            TickDecision::Switch { handle, .. } if handle == b
        ));
        assert!(!lock.try_fast_lock());
        lock.enqueue_waiter(b.id);
        assert!(sched.block_current(Arc::downgrade(&resource)));

        // While the lock is held only A ever runs.
        for step in 2..5 {
            match sched.advance(at(step)) {
                TickDecision::Switch { handle, .. } => assert_eq!(handle, a),
                other => panic!("expected switch to a, got {:?}", other),
            }
        }

        // A releases; the next poll wakes B and it claims as queue head.
        lock.release();
        let mut resumed = false;
        for step in 5..8 {
            if let TickDecision::Switch { handle, .. } = sched.advance(at(step)) {
                if handle == b {
                    assert!(lock.try_claim_as_head(b.id));
                    resumed = true;
                    break;
                }
            }
        }
        assert!(resumed);
        assert!(lock.locked_out());
    }

    #[test]
    fn dropped_resource_unblocks_waiter() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let a = spawn(&sched, &pool, 1, 5);
        assert!(matches!(
            sched.advance(at(0)),
            TickDecision::Switch { handle, .. } if handle == a
        ));
        let gate = Gate::new();
        assert!(sched.block_current(gate_resource(&gate)));
        drop(gate);
        assert!(matches!(
            sched.advance(at(1)),
            TickDecision::Switch { handle, .. } if handle == a
        ));
    }

    #[test]
    fn sleeper_wakes_at_deadline_not_before() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let a = spawn(&sched, &pool, 1, 5);
        assert!(matches!(
            sched.advance(at(0)),
            TickDecision::Switch { handle, .. } if handle == a
        ));
        let deadline = Instant::from_nanos(0) + Duration::from_micros(500);
        assert!(sched.sleep_current(deadline));

        assert_eq!(sched.advance(at(100)), TickDecision::NoneRunnable);
        assert_eq!(sched.advance(at(499_999)), TickDecision::NoneRunnable);
        assert!(matches!(
            sched.advance(at(500_000)),
            TickDecision::Switch { handle, .. } if handle == a
        ));
    }

    #[test]
    fn scan_is_bounded_when_everything_waits() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let gate = Gate::new();
        for id in 1..=4 {
            let handle = spawn(&sched, &pool, id, 5);
            // Force each thread into the blocked state directly.
            match sched.advance(at(id as u64)) {
                TickDecision::Switch { handle: h, .. } => assert_eq!(h, handle),
                other => panic!("expected switch, got {:?}", other),
            }
            assert!(sched.block_current(gate_resource(&gate)));
        }
        // One revolution, no progress, terminates.
        assert_eq!(sched.advance(at(100)), TickDecision::NoneRunnable);
        let (total, runnable, waiting) = sched.stats();
        assert_eq!((total, runnable, waiting), (4, 0, 4));
    }

    #[test]
    fn dead_threads_leave_the_ring_and_release_frees_the_slot() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let a = spawn(&sched, &pool, 1, 5);
        sched.mark_dead_and_unlink(a);
        assert_eq!(sched.advance(at(0)), TickDecision::Idle);
        assert_eq!(sched.state_of(a), Some(ThreadState::Dead));
        let stack = sched.release(a);
        assert!(stack.is_some());
        assert_eq!(sched.state_of(a), None);
        // Double release is a no-op.
        assert!(sched.release(a).is_none());
    }

    #[test]
    fn release_refuses_live_threads() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let a = spawn(&sched, &pool, 1, 5);
        assert!(sched.release(a).is_none());
        assert_eq!(sched.state_of(a), Some(ThreadState::Runnable));
    }

    #[test]
    fn double_start_rejected() {
        let sched: Scheduler<HostArch> = Scheduler::new();
        let pool = StackPool::new();
        let stack = pool.allocate_bytes(1024).unwrap();
        let handle = sched.create_thread(
            stack,
            5,
            Box::new(|| {}),
            ThreadId::from_raw(7).unwrap(),
            0,
        );
        sched.start(handle).unwrap();
        assert!(sched.start(handle).is_err());
    }
}
