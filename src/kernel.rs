//! Kernel bring-up and the tick that wires policy to hardware.
//!
//! [`Kernel::bring_up`] validates the board description and builds every
//! facility in dependency order: heap, clock, vector table, scheduler. All
//! hardware access goes through the port traits handed over in
//! [`HardwarePorts`], so the same kernel drives a board or a host test.
//!
//! The interrupt path reaches the kernel through one registered global;
//! everything else takes `&self`.

use alloc::boxed::Box;

use portable_atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::arch::timer::PeriodicTimer;
use crate::arch::vector::{VectorOps, VectorTable};
use crate::arch::{Arch, DefaultArch};
use crate::config::BoardConfig;
use crate::errors::{KernelError, KernelResult};
use crate::mem::{heap, StackPool};
use crate::sched::{Scheduler, TcbHandle, ThreadId, TickDecision};
use crate::time::{ClockSource, Instant, MonotonicClock};

/// Stack handed to the scheduler's own vector channel.
const SCHEDULER_STACK_BYTES: usize = 4096;

/// Sentinel for "no scheduler channel installed yet".
const NO_CHANNEL: usize = usize::MAX;

/// Sentinel held while one caller is installing the scheduler channel.
const CLAIMING: usize = usize::MAX - 1;

/// Board-specific driver implementations, consumed at bring-up.
pub struct HardwarePorts {
    pub vector_ops: Box<dyn VectorOps>,
    pub timer: Box<dyn PeriodicTimer>,
    pub clock_source: Box<dyn ClockSource>,
}

pub struct Kernel<A: Arch> {
    config: BoardConfig,
    scheduler: Scheduler<A>,
    stack_pool: StackPool,
    vectors: VectorTable<A::Context>,
    timer: Box<dyn PeriodicTimer>,
    clock: MonotonicClock,
    next_thread_id: AtomicUsize,
    sched_channel: AtomicUsize,
}

impl<A: Arch> Kernel<A> {
    /// Construct the kernel in dependency order. Fails fast on a bad board
    /// description; nothing is left half-initialized on error.
    pub fn bring_up(config: BoardConfig, ports: HardwarePorts) -> KernelResult<Self> {
        config.validate()?;
        if config.heap_size > 0 {
            // The board hands us its RAM window exactly once.
            unsafe { heap::init(config.heap_base, config.heap_size) };
        }
        let clock = MonotonicClock::new(
            ports.clock_source,
            config.counter_hz,
            config.counter_width_bits,
        );
        let vectors = VectorTable::new(ports.vector_ops, config.vector_channels);
        Ok(Self {
            config,
            scheduler: Scheduler::new(),
            stack_pool: StackPool::new(),
            vectors,
            timer: ports.timer,
            clock,
            next_thread_id: AtomicUsize::new(1),
            sched_channel: AtomicUsize::new(NO_CHANNEL),
        })
    }

    /// Claim a vector channel for the preemption timer and start ticking at
    /// the base quantum. Rolls the channel back if enabling fails.
    pub fn start_ticking(&'static self) -> KernelResult<()> {
        // Reserve the slot before touching the vector table so a second
        // caller cannot install a second handler.
        if self
            .sched_channel
            .compare_exchange(NO_CHANNEL, CLAIMING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KernelError::AlreadyInitialized);
        }
        let source = self.timer.interrupt_source();
        let channel = match self.vectors.set_handler(
            scheduler_tick_entry,
            source,
            SCHEDULER_STACK_BYTES,
            &self.stack_pool,
        ) {
            Ok(channel) => channel,
            Err(err) => {
                self.sched_channel.store(NO_CHANNEL, Ordering::Release);
                return Err(err.into());
            }
        };
        if let Err(err) = self.vectors.enable(channel, true) {
            let _ = self.vectors.remove_handler(channel, &self.stack_pool);
            self.sched_channel.store(NO_CHANNEL, Ordering::Release);
            return Err(err.into());
        }
        self.sched_channel.store(channel, Ordering::Release);
        self.timer.set_period_us(self.config.quantum_us);
        self.timer.set_count(0);
        self.timer.start();
        Ok(())
    }

    /// One scheduling tick: run the policy, then program the context-switch
    /// cell and the timer to match its decision.
    pub fn tick(&self) {
        let was_enabled = A::disable_interrupts();
        let now = self.clock.now();
        match self.scheduler.advance(now) {
            TickDecision::Idle => {
                // Nothing left to run. Ticking resumes when a new thread
                // starts.
                self.timer.stop();
                self.vectors.restore_context();
            }
            TickDecision::NoneRunnable => {
                // Waiters only get polled on ticks, so keep ticking at the
                // base quantum and park the core in between.
                self.vectors.restore_context();
                self.timer.set_period_us(self.config.quantum_us);
                self.timer.set_count(0);
            }
            TickDecision::Switch {
                priority, record, ..
            } => {
                self.vectors.set_context(record);
                // Quantum scales linearly with priority. LOCK_PRIORITY is 0,
                // which the timer contract maps to its maximum period.
                self.timer
                    .set_period_us(priority as u32 * self.config.quantum_us);
                self.timer.set_count(0);
            }
        }
        A::restore_interrupts(was_enabled);
    }

    /// Donate the rest of the current quantum by raising the scheduler's
    /// vector. Without vector dispatch the tick runs inline.
    pub fn yield_now(&self) {
        let channel = self.sched_channel.load(Ordering::Acquire);
        let installed = channel != NO_CHANNEL && channel != CLAIMING;
        if installed {
            let _ = self.vectors.jump(channel);
        }
        if !A::HAS_VECTOR_DISPATCH {
            self.tick();
            if installed {
                let _ = self.vectors.clear(channel);
            }
        }
    }

    /// Hand out the next thread id. Ids start at 1 and are never reused.
    pub fn next_thread_id(&self) -> ThreadId {
        let raw = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        // fetch_add from 1 can only return 0 after a usize wrap, which
        // would need the board to create usize::MAX threads.
        ThreadId::from_raw(raw).unwrap_or_else(|| unsafe { ThreadId::new_unchecked(1) })
    }

    /// The thread currently on the core, if any.
    pub fn current_thread(&self) -> Option<TcbHandle> {
        self.scheduler.current()
    }

    pub fn scheduler(&self) -> &Scheduler<A> {
        &self.scheduler
    }

    pub fn stack_pool(&self) -> &StackPool {
        &self.stack_pool
    }

    pub fn vectors(&self) -> &VectorTable<A::Context> {
        &self.vectors
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// (total, runnable, waiting) thread counts.
    pub fn thread_stats(&self) -> (usize, usize, usize) {
        self.scheduler.stats()
    }

    /// (allocated, in-use) stack counts.
    pub fn stack_stats(&self) -> (usize, usize) {
        self.stack_pool.stats()
    }
}

static GLOBAL_KERNEL: AtomicPtr<Kernel<DefaultArch>> =
    AtomicPtr::new(core::ptr::null_mut());

impl Kernel<DefaultArch> {
    /// Publish this kernel as the one the interrupt path and the facade
    /// types resolve.
    ///
    /// # Safety
    /// The kernel must stay alive and at this address for the rest of the
    /// program. Re-registering replaces the previous kernel for all future
    /// lookups.
    pub unsafe fn register_global(&'static self) {
        GLOBAL_KERNEL.store(
            self as *const Kernel<DefaultArch> as *mut Kernel<DefaultArch>,
            Ordering::Release,
        );
    }
}

/// The registered kernel, if bring-up has published one.
pub fn active() -> Option<&'static Kernel<DefaultArch>> {
    let ptr = GLOBAL_KERNEL.load(Ordering::Acquire);
    // Registration requires 'static, so a non-null pointer stays valid.
    unsafe { ptr.as_ref() }
}

/// Entry installed on the preemption timer's vector channel. Runs with its
/// own stack and context; a tick before registration is dropped because the
/// interrupt path has nobody to report an error to.
fn scheduler_tick_entry() {
    if let Some(kernel) = active() {
        kernel.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::arch::timer::HostTimer;
    use crate::arch::vector::HostVectorOps;
    use crate::arch::HostArch;
    use crate::time::HostClockSource;

    fn host_ports(timer: Arc<HostTimer>, clock: Arc<HostClockSource>) -> HardwarePorts {
        HardwarePorts {
            vector_ops: Box::new(HostVectorOps::new()),
            timer: Box::new(timer),
            clock_source: Box::new(clock),
        }
    }

    fn host_kernel() -> (Kernel<HostArch>, Arc<HostTimer>, Arc<HostClockSource>) {
        let timer = Arc::new(HostTimer::new(30));
        let clock = Arc::new(HostClockSource::new());
        let config = BoardConfig::default();
        let kernel = Kernel::bring_up(config, host_ports(timer.clone(), clock.clone())).unwrap();
        (kernel, timer, clock)
    }

    #[test]
    fn bring_up_rejects_bad_config() {
        let timer = Arc::new(HostTimer::new(30));
        let clock = Arc::new(HostClockSource::new());
        let config = BoardConfig {
            counter_hz: 0,
            ..BoardConfig::default()
        };
        let err = Kernel::<HostArch>::bring_up(config, host_ports(timer, clock));
        assert!(err.is_err());
    }

    #[test]
    fn tick_on_empty_ring_stops_timer() {
        let (kernel, timer, _clock) = host_kernel();
        timer.start();
        kernel.tick();
        assert!(!timer.is_running());
        assert!(kernel.vectors().installed_context().is_null());
    }

    #[test]
    fn tick_scales_quantum_by_priority() {
        let (kernel, timer, _clock) = host_kernel();
        let stack = kernel.stack_pool().allocate_bytes(1024).unwrap();
        let id = kernel.next_thread_id();
        let handle = kernel
            .scheduler()
            .create_thread(stack, 3, Box::new(|| {}), id, 0);
        kernel.scheduler().start(handle).unwrap();

        kernel.tick();
        assert_eq!(timer.period_us(), 3 * kernel.config().quantum_us);
        assert!(!kernel.vectors().installed_context().is_null());
    }

    #[test]
    fn lock_priority_selects_maximum_period() {
        let (kernel, timer, _clock) = host_kernel();
        let stack = kernel.stack_pool().allocate_bytes(1024).unwrap();
        let id = kernel.next_thread_id();
        let handle = kernel
            .scheduler()
            .create_thread(stack, 5, Box::new(|| {}), id, 0);
        kernel.scheduler().start(handle).unwrap();
        kernel.scheduler().set_lock_priority(handle);

        kernel.tick();
        // Period 0 is the timer contract's "maximum period".
        assert_eq!(timer.period_us(), 0);
    }

    #[test]
    fn start_ticking_claims_the_channel_exactly_once() {
        let (kernel, _timer, _clock) = host_kernel();
        let kernel: &'static Kernel<HostArch> = Box::leak(Box::new(kernel));

        let first = std::thread::spawn(move || kernel.start_ticking().is_ok());
        let second = std::thread::spawn(move || kernel.start_ticking().is_ok());
        let wins = [first.join().unwrap(), second.join().unwrap()]
            .into_iter()
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        assert!(matches!(
            kernel.start_ticking(),
            Err(KernelError::AlreadyInitialized)
        ));
    }

    #[test]
    fn thread_ids_are_sequential_from_one() {
        let (kernel, _timer, _clock) = host_kernel();
        assert_eq!(kernel.next_thread_id().get(), 1);
        assert_eq!(kernel.next_thread_id().get(), 2);
        assert_eq!(kernel.next_thread_id().get(), 3);
    }

    #[test]
    fn none_runnable_keeps_base_quantum() {
        let (kernel, timer, _clock) = host_kernel();
        let stack = kernel.stack_pool().allocate_bytes(1024).unwrap();
        let id = kernel.next_thread_id();
        let handle = kernel
            .scheduler()
            .create_thread(stack, 5, Box::new(|| {}), id, 0);
        kernel.scheduler().start(handle).unwrap();

        kernel.tick();
        assert!(kernel
            .scheduler()
            .sleep_current(kernel.now() + crate::time::Duration::from_millis(10)));
        kernel.tick();
        assert_eq!(timer.period_us(), kernel.config().quantum_us);
        assert!(kernel.vectors().installed_context().is_null());
    }
}
