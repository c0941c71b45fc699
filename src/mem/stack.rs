//! Pool-based stack allocator with size classes and growth conventions.
//!
//! Requested sizes are rounded up to the machine word and then to the
//! smallest size class that fits; freed stacks go back on a per-class free
//! list for reuse.

use core::ptr::NonNull;

use portable_atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;

use crate::config::WORD_BYTES;

const STACK_ALIGN: usize = 16;

/// How the hardware stack pointer moves through the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowthConvention {
    /// SP points at the last pushed word, moving toward lower addresses
    #[default]
    FullDescending,
    /// SP points at the next free word, moving toward lower addresses
    EmptyDescending,
    /// SP points at the last pushed word, moving toward higher addresses
    FullAscending,
    /// SP points at the next free word, moving toward higher addresses
    EmptyAscending,
}

/// Stack size classes for the pool allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSizeClass {
    /// 1 KiB
    Tiny = 1024,
    /// 4 KiB
    Small = 4096,
    /// 16 KiB
    Medium = 16384,
    /// 64 KiB
    Large = 65536,
}

impl StackSizeClass {
    pub fn size(self) -> usize {
        self as usize
    }

    /// Smallest class that accommodates `requested` bytes, after rounding the
    /// request up to the machine word.
    pub fn for_size(requested: usize) -> Option<Self> {
        let rounded = round_to_word(requested);
        match rounded {
            0..=1024 => Some(Self::Tiny),
            1025..=4096 => Some(Self::Small),
            4097..=16384 => Some(Self::Medium),
            16385..=65536 => Some(Self::Large),
            _ => None,
        }
    }
}

/// Round a byte count up to the machine word.
pub fn round_to_word(bytes: usize) -> usize {
    (bytes + WORD_BYTES - 1) & !(WORD_BYTES - 1)
}

/// A contiguous stack buffer, exclusively owned by one TCB or vector channel.
pub struct Stack {
    memory: NonNull<u8>,
    size: usize,
    size_class: StackSizeClass,
    convention: GrowthConvention,
}

impl Stack {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn size_class(&self) -> StackSizeClass {
        self.size_class
    }

    pub fn convention(&self) -> GrowthConvention {
        self.convention
    }

    /// Lowest address of the buffer.
    pub fn base(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    /// Highest address of the buffer, aligned down to the stack alignment.
    pub fn limit(&self) -> *mut u8 {
        let top = unsafe { self.memory.as_ptr().add(self.size) } as usize;
        (top & !(STACK_ALIGN - 1)) as *mut u8
    }

    /// Initial stack pointer for a context that has never run, per the
    /// hardware growth convention.
    pub fn initial_top(&self) -> *mut u8 {
        match self.convention {
            GrowthConvention::FullDescending | GrowthConvention::EmptyDescending => self.limit(),
            GrowthConvention::FullAscending | GrowthConvention::EmptyAscending => self.base(),
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.size, STACK_ALIGN) {
            unsafe {
                dealloc(self.memory.as_ptr(), layout);
            }
        }
    }
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

/// Pool allocator keeping a free list per size class.
pub struct StackPool {
    free_stacks: [Mutex<Vec<Stack>>; 4],
    convention: GrowthConvention,
    allocated: AtomicUsize,
    in_use: AtomicUsize,
}

impl StackPool {
    pub const fn new() -> Self {
        Self {
            free_stacks: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            convention: GrowthConvention::FullDescending,
            allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    pub const fn with_convention(convention: GrowthConvention) -> Self {
        Self {
            free_stacks: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            convention,
            allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Allocate a stack sized to a declared byte requirement.
    pub fn allocate_bytes(&self, requested: usize) -> Option<Stack> {
        self.allocate(StackSizeClass::for_size(requested)?)
    }

    /// Allocate a stack of the given size class, reusing a freed one if
    /// available.
    pub fn allocate(&self, size_class: StackSizeClass) -> Option<Stack> {
        let index = Self::class_index(size_class);
        if let Some(mut free_list) = self.free_stacks[index].try_lock() {
            if let Some(stack) = free_list.pop() {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                return Some(stack);
            }
        }
        self.allocate_new(size_class)
    }

    /// Return a stack to the pool for reuse.
    pub fn deallocate(&self, stack: Stack) {
        let index = Self::class_index(stack.size_class);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        match self.free_stacks[index].try_lock() {
            Some(mut free_list) => free_list.push(stack),
            None => {
                // Lock contention: drop the stack outright and take it off
                // the allocated count, the memory left the pool for good.
                self.allocated.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// (total allocated, currently in use)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.allocated.load(Ordering::Acquire),
            self.in_use.load(Ordering::Acquire),
        )
    }

    fn class_index(size_class: StackSizeClass) -> usize {
        match size_class {
            StackSizeClass::Tiny => 0,
            StackSizeClass::Small => 1,
            StackSizeClass::Medium => 2,
            StackSizeClass::Large => 3,
        }
    }

    fn allocate_new(&self, size_class: StackSizeClass) -> Option<Stack> {
        let size = size_class.size();
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        let memory = unsafe { alloc(layout) };
        let memory = NonNull::new(memory)?;

        self.allocated.fetch_add(1, Ordering::AcqRel);
        self.in_use.fetch_add(1, Ordering::AcqRel);

        Some(Stack {
            memory,
            size,
            size_class,
            convention: self.convention,
        })
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_rounding() {
        assert_eq!(round_to_word(1), WORD_BYTES);
        assert_eq!(round_to_word(WORD_BYTES), WORD_BYTES);
        assert_eq!(round_to_word(WORD_BYTES + 1), 2 * WORD_BYTES);
        assert_eq!(round_to_word(0), 0);
    }

    #[test]
    fn size_class_selection() {
        assert_eq!(StackSizeClass::for_size(100), Some(StackSizeClass::Tiny));
        assert_eq!(StackSizeClass::for_size(1024), Some(StackSizeClass::Tiny));
        assert_eq!(StackSizeClass::for_size(1025), Some(StackSizeClass::Small));
        assert_eq!(StackSizeClass::for_size(8192), Some(StackSizeClass::Medium));
        assert_eq!(StackSizeClass::for_size(65536), Some(StackSizeClass::Large));
        assert_eq!(StackSizeClass::for_size(1 << 20), None);
    }

    #[test]
    fn pool_reuses_freed_stacks() {
        let pool = StackPool::new();
        let stack = pool.allocate(StackSizeClass::Small).unwrap();
        let base = stack.base() as usize;
        pool.deallocate(stack);

        let again = pool.allocate(StackSizeClass::Small).unwrap();
        assert_eq!(again.base() as usize, base);

        let (allocated, in_use) = pool.stats();
        assert_eq!(allocated, 1);
        assert_eq!(in_use, 1);
    }

    #[test]
    fn contended_free_drops_the_stack_from_the_counts() {
        let pool = StackPool::new();
        let stack = pool.allocate(StackSizeClass::Small).unwrap();
        assert_eq!(pool.stats(), (1, 1));

        // Hold the class free list so the return path cannot take it.
        let index = StackPool::class_index(StackSizeClass::Small);
        let held = pool.free_stacks[index].lock();
        pool.deallocate(stack);
        drop(held);

        // The stack was freed outright, not pooled; both counters agree.
        assert_eq!(pool.stats(), (0, 0));
        let fresh = pool.allocate(StackSizeClass::Small).unwrap();
        assert_eq!(pool.stats(), (1, 1));
        drop(fresh);
    }

    #[test]
    fn descending_stack_top_is_aligned_limit() {
        let pool = StackPool::new();
        let stack = pool.allocate(StackSizeClass::Tiny).unwrap();
        let top = stack.initial_top() as usize;
        assert_eq!(top % 16, 0);
        assert!(top > stack.base() as usize);
        assert!(top <= stack.base() as usize + stack.size());
    }

    #[test]
    fn ascending_convention_starts_at_base() {
        let pool = StackPool::with_convention(GrowthConvention::EmptyAscending);
        let stack = pool.allocate(StackSizeClass::Tiny).unwrap();
        assert_eq!(stack.initial_top(), stack.base());
    }
}
