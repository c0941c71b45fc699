//! Thread control blocks and the arena that owns them.
//!
//! Every thread is described by a [`Tcb`] stored in a [`TcbArena`] slot.
//! Blocks are boxed so their register save areas keep a stable address for
//! the lifetime of the thread, no matter how the arena's slot table grows.
//! Callers hold a [`TcbHandle`] instead of a pointer; the handle carries the
//! thread id so a recycled slot can never be confused with its previous
//! occupant.

use alloc::boxed::Box;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::num::NonZeroUsize;

use portable_atomic::{AtomicU8, Ordering};

use crate::arch::context::{ContextRecord, RegisterContext};
use crate::mem::Stack;
use crate::sync::BlockableResource;

/// Lowest schedulable priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest schedulable priority.
pub const MAX_PRIORITY: u8 = 10;
/// Priority used while a thread holds a lock. Maps to the timer's maximum
/// period, so the holder is effectively not preempted. Never assigned by
/// clamping; a thread gets it only through an explicit request.
pub const LOCK_PRIORITY: u8 = 0;
/// Priority assigned when the caller expresses no preference.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Clamp a requested priority into the schedulable band.
#[inline]
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// Unique thread identifier. Ids start at 1 and are never reused, which is
/// what makes stale [`TcbHandle`]s detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroUsize);

impl ThreadId {
    pub fn new(id: u64) -> Option<Self> {
        NonZeroUsize::new(id as usize).map(Self)
    }

    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    /// # Safety
    /// `id` must be non-zero.
    pub unsafe fn new_unchecked(id: usize) -> Self {
        Self(unsafe { NonZeroUsize::new_unchecked(id) })
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get() as u64
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// Lifecycle of a thread. Stored as an atomic byte inside the TCB so state
/// reads never need the scheduler lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created but not yet entered into the scheduler ring.
    New = 0,
    /// In the ring, eligible for the next dispatch.
    Runnable = 1,
    /// Currently installed on the core.
    Running = 2,
    /// Waiting on a blockable resource; polled every tick.
    Blocked = 3,
    /// Waiting for a wall-clock deadline.
    Sleeping = 4,
    /// Finished. Stays in the arena until the owner releases the slot.
    Dead = 5,
}

impl ThreadState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::New),
            1 => Some(Self::Runnable),
            2 => Some(Self::Running),
            3 => Some(Self::Blocked),
            4 => Some(Self::Sleeping),
            5 => Some(Self::Dead),
            _ => None,
        }
    }
}

/// Thread body, boxed so the TCB owns it until the trampoline takes it.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Per-thread control block.
pub struct Tcb<C: RegisterContext> {
    pub id: ThreadId,
    state: AtomicU8,
    priority: AtomicU8,
    /// Architecture register save area. Boxing the TCB keeps its address
    /// stable for the context-switch hardware.
    pub context: C,
    /// Two-word record handed to the dispatch hardware on each switch.
    record: ContextRecord,
    pub stack: Stack,
    /// Absolute wake time in nanoseconds; meaningful only while SLEEPING.
    pub wake_deadline_ns: u64,
    /// Resource this thread waits on; meaningful only while BLOCKED. Weak so
    /// a dropped resource unblocks its waiters instead of wedging them.
    pub blocked_on: Option<Weak<dyn BlockableResource>>,
    /// Body to run when the thread first gets the core.
    pub task: Option<TaskFn>,
}

impl<C: RegisterContext> Tcb<C> {
    pub fn new(id: ThreadId, stack: Stack, priority: u8, task: TaskFn) -> Self {
        Self {
            id,
            state: AtomicU8::new(ThreadState::New as u8),
            priority: AtomicU8::new(clamp_priority(priority)),
            context: C::default(),
            record: ContextRecord::empty(),
            stack,
            wake_deadline_ns: 0,
            blocked_on: None,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ThreadState {
        // Only the six enum values are ever stored.
        ThreadState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(ThreadState::Dead)
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Set the scheduling priority, clamped to the schedulable band.
    pub fn set_priority(&self, priority: u8) {
        self.priority
            .store(clamp_priority(priority), Ordering::Relaxed);
    }

    /// Enter the lock-holder priority. Bypasses clamping on purpose; this is
    /// the only way a thread reaches priority 0.
    pub fn set_lock_priority(&self) {
        self.priority.store(LOCK_PRIORITY, Ordering::Relaxed);
    }

    /// Refresh the dispatch record from the current save area and stack top,
    /// returning a pointer valid for as long as this TCB stays boxed.
    pub fn install_record(&mut self) -> *mut ContextRecord {
        self.record = ContextRecord {
            save_area: self.context.save_area(),
            stack_top: self.stack.initial_top(),
        };
        &mut self.record as *mut ContextRecord
    }
}

// The raw pointer inside `record` only ever points into the same box.
unsafe impl<C: RegisterContext> Send for Tcb<C> {}

/// Stable reference to an arena slot. The id is checked on every access, so
/// a handle left over from a released thread resolves to `None` rather than
/// to whatever thread reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbHandle {
    pub slot: usize,
    pub id: ThreadId,
}

/// Slot table owning every live TCB.
pub struct TcbArena<C: RegisterContext> {
    slots: Vec<Option<Box<Tcb<C>>>>,
    free: Vec<usize>,
}

impl<C: RegisterContext> TcbArena<C> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, tcb: Tcb<C>) -> TcbHandle {
        let id = tcb.id;
        let boxed = Box::new(tcb);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(boxed);
                slot
            }
            None => {
                self.slots.push(Some(boxed));
                self.slots.len() - 1
            }
        };
        TcbHandle { slot, id }
    }

    pub fn get(&self, handle: TcbHandle) -> Option<&Tcb<C>> {
        match self.slots.get(handle.slot) {
            Some(Some(tcb)) if tcb.id == handle.id => Some(tcb),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: TcbHandle) -> Option<&mut Tcb<C>> {
        match self.slots.get_mut(handle.slot) {
            Some(Some(tcb)) if tcb.id == handle.id => Some(tcb),
            _ => None,
        }
    }

    /// Remove the block and recycle its slot. Stale handles are a no-op.
    pub fn remove(&mut self, handle: TcbHandle) -> Option<Box<Tcb<C>>> {
        match self.slots.get_mut(handle.slot) {
            Some(entry @ Some(_)) => {
                if entry.as_ref().map(|t| t.id) != Some(handle.id) {
                    return None;
                }
                let tcb = entry.take();
                self.free.push(handle.slot);
                tcb
            }
            _ => None,
        }
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb<C>> {
        self.slots.iter().filter_map(|s| s.as_deref())
    }
}
