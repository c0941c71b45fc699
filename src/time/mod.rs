//! Time keeping: instants, durations, and the accumulated monotonic clock.

use alloc::boxed::Box;
use spin::Mutex;

/// Nanoseconds since an arbitrary epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        Self(self.0 + duration.as_nanos())
    }
}

/// A span of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * 1_000)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub const fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }
}

/// Vendor-implemented free-running counter.
///
/// The counter may be narrow and is allowed to wrap; the monotonic clock
/// handles the carry. Only the low `width_bits` of `read` are meaningful.
pub trait ClockSource: Send + Sync {
    fn read(&self) -> u32;
}

impl<T: ClockSource + ?Sized> ClockSource for alloc::sync::Arc<T> {
    fn read(&self) -> u32 {
        (**self).read()
    }
}

/// Monotonic nanosecond clock built from a narrow free-running counter.
///
/// Accumulates counter deltas with explicit carry handling so no wide
/// hardware counter is required: as long as `now` is called at least once
/// per counter wrap period, no time is lost.
pub struct MonotonicClock {
    source: Box<dyn ClockSource>,
    counter_hz: u32,
    mask: u32,
    state: Mutex<ClockState>,
}

struct ClockState {
    last_raw: u32,
    total_ticks: u64,
}

impl MonotonicClock {
    pub fn new(source: Box<dyn ClockSource>, counter_hz: u32, width_bits: u32) -> Self {
        let mask = if width_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << width_bits) - 1
        };
        let last_raw = source.read() & mask;
        Self {
            source,
            counter_hz,
            mask,
            state: Mutex::new(ClockState {
                last_raw,
                total_ticks: 0,
            }),
        }
    }

    /// Current monotonic time.
    ///
    /// The tick reads the clock from interrupt context, so the inner lock is
    /// only ever taken with interrupts masked; a thread-side read that held
    /// it gate-open would deadlock the tick on a single core.
    pub fn now(&self) -> Instant {
        crate::arch::with_interrupts_disabled(|| {
            let mut state = self.state.lock();
            let raw = self.source.read() & self.mask;
            let delta = raw.wrapping_sub(state.last_raw) & self.mask;
            state.last_raw = raw;
            state.total_ticks += delta as u64;

            let nanos =
                (state.total_ticks as u128 * 1_000_000_000 / self.counter_hz as u128) as u64;
            Instant::from_nanos(nanos)
        })
    }
}

/// Host clock source backed by a settable counter value.
pub struct HostClockSource {
    value: portable_atomic::AtomicU32,
}

impl HostClockSource {
    pub const fn new() -> Self {
        Self {
            value: portable_atomic::AtomicU32::new(0),
        }
    }

    /// Advance the raw counter, wrapping like hardware would.
    pub fn advance(&self, ticks: u32) {
        self.value
            .fetch_add(ticks, portable_atomic::Ordering::AcqRel);
    }
}

impl Default for HostClockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for HostClockSource {
    fn read(&self) -> u32 {
        self.value.load(portable_atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::arch::Arch;

    struct SharedSource(Arc<HostClockSource>);

    impl ClockSource for SharedSource {
        fn read(&self) -> u32 {
            self.0.read()
        }
    }

    fn clock_with_source(width_bits: u32) -> (MonotonicClock, Arc<HostClockSource>) {
        let source = Arc::new(HostClockSource::new());
        let clock = MonotonicClock::new(
            Box::new(SharedSource(source.clone())),
            1_000_000, // 1 MHz: one tick per microsecond
            width_bits,
        );
        (clock, source)
    }

    #[test]
    fn accumulates_counter_deltas() {
        let (clock, source) = clock_with_source(32);
        assert_eq!(clock.now().as_nanos(), 0);

        source.advance(1_000); // 1 ms at 1 MHz
        assert_eq!(clock.now().as_nanos(), 1_000_000);

        source.advance(500);
        assert_eq!(clock.now().as_nanos(), 1_500_000);
    }

    #[test]
    fn narrow_counter_carries_across_wrap() {
        let (clock, source) = clock_with_source(16);
        // Walk the counter past the 16-bit wrap in steps smaller than the
        // wrap period
        source.advance(60_000);
        let t1 = clock.now();
        source.advance(60_000); // raw value wraps past 65535
        let t2 = clock.now();

        assert_eq!(t1.as_nanos(), 60_000_000);
        assert_eq!(t2.as_nanos(), 120_000_000);
    }

    #[test]
    fn now_masks_interrupts_around_the_counter_read() {
        struct GateWatch {
            inner: HostClockSource,
            saw_open: portable_atomic::AtomicBool,
        }

        impl ClockSource for GateWatch {
            fn read(&self) -> u32 {
                if crate::arch::HostArch::interrupts_enabled() {
                    self.saw_open
                        .store(true, portable_atomic::Ordering::Release);
                }
                self.inner.read()
            }
        }

        let source = Arc::new(GateWatch {
            inner: HostClockSource::new(),
            saw_open: portable_atomic::AtomicBool::new(false),
        });
        let clock = MonotonicClock::new(Box::new(source.clone()), 1_000_000, 32);
        // The constructor read runs before the clock is reachable from the
        // tick, so only `now` has to hold the gate.
        source.saw_open.store(false, portable_atomic::Ordering::Release);

        clock.now();
        source.inner.advance(10);
        clock.now();
        assert!(!source.saw_open.load(portable_atomic::Ordering::Acquire));
    }

    #[test]
    fn monotonic_without_counter_movement() {
        let (clock, _source) = clock_with_source(32);
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn duration_conversions() {
        assert_eq!(Duration::from_millis(2).as_nanos(), 2_000_000);
        assert_eq!(Duration::from_micros(3).as_nanos(), 3_000);
        assert_eq!(Duration::from_nanos(5_000_000).as_millis(), 5);
        let base = Instant::from_nanos(100);
        assert_eq!((base + Duration::from_nanos(50)).as_nanos(), 150);
    }
}
