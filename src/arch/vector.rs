//! Interrupt-vector dispatch: channel allocation and the context-switch seam.
//!
//! A [`VectorTable`] multiplexes abstract interrupt sources onto a fixed set
//! of hardware channels. Each allocated channel owns a dedicated register
//! context and a dedicated stack sized to the handler's declared requirement.
//! The table also owns the single installed-context slot the scheduler uses
//! to hand the CPU from one thread to another: on every tick the scheduler
//! calls [`VectorTable::set_context`] so that the interrupt return restores
//! the newly selected thread instead of the interrupted one.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::arch::context::{ContextRecord, InstalledContext, RegisterContext};
use crate::arch::Arch;
use crate::errors::VectorError;
use crate::mem::{Stack, StackPool};

/// Handler entry point installed on a vector channel.
pub type HandlerFn = fn();

/// Vendor register surface for one interrupt controller.
///
/// Per-chip register layouts live behind this trait; the table above it is
/// chip-independent.
pub trait VectorOps: Send + Sync {
    /// Point the hardware line for `source` at `entry`. Returns false when
    /// the line cannot be claimed (out of range, fused off, in use).
    fn claim(&self, source: u32, entry: usize) -> bool;

    /// Release a previously claimed line.
    fn release(&self, source: u32);

    fn enable_source(&self, source: u32);

    fn disable_source(&self, source: u32);

    fn set_pending(&self, source: u32);

    fn clear_pending(&self, source: u32);

    fn is_pending(&self, source: u32) -> bool;
}

struct Channel<C: RegisterContext> {
    source: u32,
    handler: HandlerFn,
    // Box keeps the save area at a stable address for the hardware.
    context: Box<C>,
    record: ContextRecord,
    stack: Stack,
    enabled: bool,
}

/// Interrupt-vector control surface shared by the whole kernel.
pub struct VectorTable<C: RegisterContext> {
    ops: Box<dyn VectorOps>,
    channels: spin::Mutex<Vec<Option<Channel<C>>>>,
    installed: InstalledContext,
}

impl<C: RegisterContext> VectorTable<C> {
    pub fn new(ops: Box<dyn VectorOps>, channel_count: usize) -> Self {
        let mut channels = Vec::with_capacity(channel_count);
        channels.resize_with(channel_count, || None);
        Self {
            ops,
            channels: spin::Mutex::new(channels),
            installed: InstalledContext::new(),
        }
    }

    /// Allocate a hardware channel for `source` and install `handler` on it.
    ///
    /// Allocation is all-or-nothing: the handler stack, the dedicated
    /// context, and the hardware claim must all succeed before the channel
    /// table is touched, and each is rolled back if a later step fails.
    pub fn set_handler(
        &self,
        handler: HandlerFn,
        source: u32,
        stack_bytes: usize,
        pool: &StackPool,
    ) -> Result<usize, VectorError> {
        let mut channels = self.channels.lock();

        let mut free_slot = None;
        for (index, channel) in channels.iter().enumerate() {
            match channel {
                Some(ch) if ch.source == source => {
                    return Err(VectorError::SourceInUse(source));
                }
                Some(_) => {}
                None if free_slot.is_none() => free_slot = Some(index),
                None => {}
            }
        }
        let slot = free_slot.ok_or(VectorError::NoFreeChannel)?;

        let stack = pool
            .allocate_bytes(stack_bytes)
            .ok_or(VectorError::OutOfMemory)?;

        let mut context = Box::new(C::default());
        context.initialize(stack.initial_top(), handler as usize, 0, 0);
        let record = ContextRecord {
            save_area: context.save_area(),
            stack_top: stack.initial_top(),
        };

        if !self.ops.claim(source, handler as usize) {
            pool.deallocate(stack);
            return Err(VectorError::SourceInUse(source));
        }

        channels[slot] = Some(Channel {
            source,
            handler,
            context,
            record,
            stack,
            enabled: false,
        });
        Ok(slot)
    }

    /// Tear down a channel, releasing its line, context, and stack.
    pub fn remove_handler(&self, channel: usize, pool: &StackPool) -> Result<(), VectorError> {
        let mut channels = self.channels.lock();
        let slot = channels
            .get_mut(channel)
            .ok_or(VectorError::InvalidChannel(channel))?;
        let ch = slot.take().ok_or(VectorError::InvalidChannel(channel))?;

        self.ops.disable_source(ch.source);
        self.ops.clear_pending(ch.source);
        self.ops.release(ch.source);
        pool.deallocate(ch.stack);
        Ok(())
    }

    /// Enable or disable a channel, returning the prior enabled state.
    ///
    /// The returned prior state is the save/restore idiom used throughout
    /// for critical sections.
    pub fn enable(&self, channel: usize, enable: bool) -> Result<bool, VectorError> {
        let mut channels = self.channels.lock();
        let ch = channels
            .get_mut(channel)
            .and_then(Option::as_mut)
            .ok_or(VectorError::InvalidChannel(channel))?;

        let prior = ch.enabled;
        ch.enabled = enable;
        if enable {
            self.ops.enable_source(ch.source);
        } else {
            self.ops.disable_source(ch.source);
        }
        Ok(prior)
    }

    /// Disable a channel, returning the prior enabled state.
    pub fn disable(&self, channel: usize) -> Result<bool, VectorError> {
        self.enable(channel, false)
    }

    /// Raise the channel's pending bit.
    pub fn set(&self, channel: usize) -> Result<(), VectorError> {
        let source = self.source_of(channel)?;
        self.ops.set_pending(source);
        Ok(())
    }

    /// Clear the channel's pending bit.
    pub fn clear(&self, channel: usize) -> Result<(), VectorError> {
        let source = self.source_of(channel)?;
        self.ops.clear_pending(source);
        Ok(())
    }

    /// Force immediate vector entry by raising the pending bit.
    ///
    /// This is how a voluntary yield re-enters the scheduler tick without
    /// waiting for the periodic timer.
    pub fn jump(&self, channel: usize) -> Result<(), VectorError> {
        self.set(channel)
    }

    /// Redirect what the hardware will restore when this vector returns.
    ///
    /// Called only by the scheduler tick; see [`InstalledContext`] for the
    /// one-writer/one-reader contract.
    pub fn set_context(&self, record: *mut ContextRecord) {
        self.installed.install(record);
    }

    /// Return the vector to restoring the default (interrupted) context.
    pub fn restore_context(&self) {
        self.installed.clear();
    }

    /// The record the vector exit trampoline will restore, or null.
    pub fn installed_context(&self) -> *mut ContextRecord {
        self.installed.current()
    }

    /// Find the channel currently bound to `source`.
    pub fn channel_for_source(&self, source: u32) -> Option<usize> {
        let channels = self.channels.lock();
        channels
            .iter()
            .position(|ch| matches!(ch, Some(c) if c.source == source))
    }

    /// The channel's own dispatch record: the context and stack a handler
    /// runs on when its source fires. Valid while the channel stays
    /// installed.
    pub fn entry_record(&self, channel: usize) -> Result<*mut ContextRecord, VectorError> {
        let mut channels = self.channels.lock();
        channels
            .get_mut(channel)
            .and_then(Option::as_mut)
            .map(|ch| {
                ch.record.save_area = ch.context.save_area();
                &mut ch.record as *mut ContextRecord
            })
            .ok_or(VectorError::InvalidChannel(channel))
    }

    /// The handler installed on a channel.
    pub fn handler_of(&self, channel: usize) -> Result<HandlerFn, VectorError> {
        let channels = self.channels.lock();
        channels
            .get(channel)
            .and_then(Option::as_ref)
            .map(|ch| ch.handler)
            .ok_or(VectorError::InvalidChannel(channel))
    }

    fn source_of(&self, channel: usize) -> Result<u32, VectorError> {
        let channels = self.channels.lock();
        channels
            .get(channel)
            .and_then(Option::as_ref)
            .map(|ch| ch.source)
            .ok_or(VectorError::InvalidChannel(channel))
    }
}

// The record pointers inside channels are owned by the table.
unsafe impl<C: RegisterContext> Send for VectorTable<C> {}
unsafe impl<C: RegisterContext> Sync for VectorTable<C> {}

/// RAII capability for nested interrupt handling.
///
/// Lets a handler re-enable the global gate mid-handler after saving its own
/// enable state; dropping the guard disables the gate again and restores the
/// saved state before the handler returns, so the single installed-context
/// slot is never observed half-written.
pub struct NestedInterrupts<A: Arch> {
    saved: bool,
    _arch: PhantomData<A>,
}

impl<A: Arch> NestedInterrupts<A> {
    pub fn enter() -> Self {
        let saved = A::interrupts_enabled();
        A::restore_interrupts(true);
        Self {
            saved,
            _arch: PhantomData,
        }
    }
}

impl<A: Arch> Drop for NestedInterrupts<A> {
    fn drop(&mut self) {
        let _ = A::disable_interrupts();
        A::restore_interrupts(self.saved);
    }
}

/// Host interrupt controller mock: 32 sources tracked as bitmasks.
pub struct HostVectorOps {
    claimed: portable_atomic::AtomicU32,
    enabled: portable_atomic::AtomicU32,
    pending: portable_atomic::AtomicU32,
}

impl HostVectorOps {
    pub const fn new() -> Self {
        Self {
            claimed: portable_atomic::AtomicU32::new(0),
            enabled: portable_atomic::AtomicU32::new(0),
            pending: portable_atomic::AtomicU32::new(0),
        }
    }
}

impl Default for HostVectorOps {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorOps for HostVectorOps {
    fn claim(&self, source: u32, _entry: usize) -> bool {
        use portable_atomic::Ordering;
        if source >= 32 {
            return false;
        }
        let bit = 1u32 << source;
        let prior = self.claimed.fetch_or(bit, Ordering::AcqRel);
        prior & bit == 0
    }

    fn release(&self, source: u32) {
        use portable_atomic::Ordering;
        if source < 32 {
            self.claimed.fetch_and(!(1u32 << source), Ordering::AcqRel);
        }
    }

    fn enable_source(&self, source: u32) {
        use portable_atomic::Ordering;
        if source < 32 {
            self.enabled.fetch_or(1u32 << source, Ordering::AcqRel);
        }
    }

    fn disable_source(&self, source: u32) {
        use portable_atomic::Ordering;
        if source < 32 {
            self.enabled.fetch_and(!(1u32 << source), Ordering::AcqRel);
        }
    }

    fn set_pending(&self, source: u32) {
        use portable_atomic::Ordering;
        if source < 32 {
            self.pending.fetch_or(1u32 << source, Ordering::AcqRel);
        }
    }

    fn clear_pending(&self, source: u32) {
        use portable_atomic::Ordering;
        if source < 32 {
            self.pending.fetch_and(!(1u32 << source), Ordering::AcqRel);
        }
    }

    fn is_pending(&self, source: u32) -> bool {
        use portable_atomic::Ordering;
        source < 32 && self.pending.load(Ordering::Acquire) & (1u32 << source) != 0
    }
}
