//! Register contexts and the install-now, restore-later context slot.

use core::ptr;
use portable_atomic::{AtomicPtr, Ordering};

/// The minimal packed state a hardware trampoline needs to restore a context.
///
/// The shape of this record is fixed by the kernel; only its construction is
/// vendor-specific. `save_area` is where the vector entry sequence saves (and
/// the exit sequence restores) registers; `stack_top` is the initial stack
/// pointer for a context that has never run.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ContextRecord {
    /// Register save area the hardware writes on vector entry
    pub save_area: *mut u8,
    /// Initial top-of-stack address
    pub stack_top: *mut u8,
}

impl ContextRecord {
    pub const fn empty() -> Self {
        Self {
            save_area: ptr::null_mut(),
            stack_top: ptr::null_mut(),
        }
    }
}

unsafe impl Send for ContextRecord {}
unsafe impl Sync for ContextRecord {}

/// Opaque per-architecture CPU state snapshot, exclusively owned by its TCB.
pub trait RegisterContext: Default + Send + 'static {
    /// Seed the context so that installing it and returning from the vector
    /// resumes execution at `entry` with `arg0`/`arg1` in the first two
    /// argument registers and the stack pointer at `stack_top`.
    fn initialize(&mut self, stack_top: *mut u8, entry: usize, arg0: usize, arg1: usize);

    /// Raw pointer to the register save area the hardware writes on entry.
    fn save_area(&mut self) -> *mut u8;
}

/// The single installed-context slot the hardware trampoline reads.
///
/// This cell is the hardware-mandated exception to exclusive ownership: it
/// has exactly one writer (the scheduler tick, via
/// [`VectorTable::set_context`](super::vector::VectorTable::set_context)) and
/// one reader (the vector exit trampoline). Both run with the global
/// interrupt gate closed, so a plain atomic pointer is sufficient.
pub struct InstalledContext {
    slot: AtomicPtr<ContextRecord>,
}

impl InstalledContext {
    pub const fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Redirect what the hardware will restore when the vector returns.
    pub fn install(&self, record: *mut ContextRecord) {
        self.slot.store(record, Ordering::Release);
    }

    /// Clear the slot; the vector returns to the default (interrupted) context.
    pub fn clear(&self) {
        self.slot.store(ptr::null_mut(), Ordering::Release);
    }

    /// The record the trampoline will restore, or null for the default.
    pub fn current(&self) -> *mut ContextRecord {
        self.slot.load(Ordering::Acquire)
    }
}

impl Default for InstalledContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-side register context: records what would be seeded into hardware
/// registers so tests can execute the entry point directly.
#[derive(Debug, Default)]
pub struct HostContext {
    pub entry: usize,
    pub arg0: usize,
    pub arg1: usize,
    pub stack_top: usize,
    /// Scratch byte standing in for the register save area
    save_marker: u8,
}

impl RegisterContext for HostContext {
    fn initialize(&mut self, stack_top: *mut u8, entry: usize, arg0: usize, arg1: usize) {
        self.stack_top = stack_top as usize;
        self.entry = entry;
        self.arg0 = arg0;
        self.arg1 = arg1;
    }

    fn save_area(&mut self) -> *mut u8 {
        &mut self.save_marker as *mut u8
    }
}
