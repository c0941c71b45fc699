//! Thread scheduling: control blocks, the arena, and the ring scheduler.

pub mod scheduler;
pub mod tcb;

pub use scheduler::{Scheduler, TickDecision};
pub use tcb::{
    clamp_priority, TcbArena, TcbHandle, ThreadId, ThreadState, DEFAULT_PRIORITY, LOCK_PRIORITY,
    MAX_PRIORITY, MIN_PRIORITY,
};
