//! Bare-metal heap bring-up.
//!
//! The global allocator is a [`linked_list_allocator::LockedHeap`] fed from
//! the one-time configuration record. Host builds (tests, `std-shim`) keep
//! the platform allocator instead.
//!
//! The allocator's own lock only serializes allocations against each other;
//! callers that allocate from both thread and interrupt context additionally
//! hold the global interrupt gate, the same discipline the scheduler uses
//! for its shared state.

use linked_list_allocator::LockedHeap;

#[cfg_attr(all(not(test), not(feature = "std-shim")), global_allocator)]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hand the heap its memory region.
///
/// Called exactly once during kernel bring-up, before any allocation.
///
/// # Safety
///
/// `base..base + size` must be a valid, unused RAM region that outlives the
/// kernel.
pub unsafe fn init(base: usize, size: usize) {
    unsafe {
        HEAP.lock().init(base as *mut u8, size);
    }
}

/// Bytes currently handed out.
pub fn used() -> usize {
    HEAP.lock().used()
}

/// Bytes still available.
pub fn free() -> usize {
    HEAP.lock().free()
}

/// Run `f` with the global interrupt gate closed around heap access.
///
/// The interrupt-toggle hook shared between the allocator and the
/// scheduler's critical-section discipline.
pub fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R {
    crate::arch::with_interrupts_disabled(f)
}
