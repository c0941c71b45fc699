//! Periodic timer port driving the scheduler tick.

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

/// Vendor-implemented periodic timer.
///
/// The scheduler reprograms the period on every tick to stretch or shrink
/// the next quantum; a period of zero selects the hardware maximum.
pub trait PeriodicTimer: Send + Sync {
    /// Start counting; the timer raises its interrupt source every period.
    fn start(&self);

    /// Stop counting. Used when the thread ring empties.
    fn stop(&self);

    /// Reset the current count.
    fn set_count(&self, count: u32);

    /// Set the period in microseconds; `0` selects the hardware maximum.
    fn set_period_us(&self, period_us: u32);

    /// The abstract interrupt source this timer raises.
    fn interrupt_source(&self) -> u32;
}

impl<T: PeriodicTimer + ?Sized> PeriodicTimer for alloc::sync::Arc<T> {
    fn start(&self) {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn set_count(&self, count: u32) {
        (**self).set_count(count)
    }

    fn set_period_us(&self, period_us: u32) {
        (**self).set_period_us(period_us)
    }

    fn interrupt_source(&self) -> u32 {
        (**self).interrupt_source()
    }
}

/// Host timer mock: records programming calls for assertions.
pub struct HostTimer {
    running: AtomicBool,
    period_us: AtomicU32,
    count: AtomicU32,
    source: u32,
}

impl HostTimer {
    pub const fn new(source: u32) -> Self {
        Self {
            running: AtomicBool::new(false),
            period_us: AtomicU32::new(0),
            count: AtomicU32::new(0),
            source,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn period_us(&self) -> u32 {
        self.period_us.load(Ordering::Acquire)
    }
}

impl PeriodicTimer for HostTimer {
    fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn set_count(&self, count: u32) {
        self.count.store(count, Ordering::Release);
    }

    fn set_period_us(&self, period_us: u32) {
        self.period_us.store(period_us, Ordering::Release);
    }

    fn interrupt_source(&self) -> u32 {
        self.source
    }
}
