//! Thin AArch64 port: interrupt gate, register context, halt.
//!
//! Only the architectural pieces the kernel contract needs live here; the
//! interrupt controller and timer register blocks are board-specific and are
//! supplied at bring-up through the [`VectorOps`](super::vector::VectorOps)
//! and [`PeriodicTimer`](super::timer::PeriodicTimer) ports.

use core::arch::asm;

use super::context::RegisterContext;
use super::Arch;

pub struct Aarch64Arch;

/// Full AArch64 register snapshot, exclusively owned by its TCB.
///
/// Layout is fixed `repr(C)` because the vector save/restore sequence
/// addresses the fields by offset.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct Aarch64Context {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl Default for Aarch64Context {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            // EL1h, interrupts enabled
            pstate: 0x3c5,
        }
    }
}

unsafe impl Send for Aarch64Context {}
unsafe impl Sync for Aarch64Context {}

impl RegisterContext for Aarch64Context {
    fn initialize(&mut self, stack_top: *mut u8, entry: usize, arg0: usize, arg1: usize) {
        self.x = [0; 31];
        self.x[0] = arg0 as u64;
        self.x[1] = arg1 as u64;
        self.sp = stack_top as u64;
        self.pc = entry as u64;
        self.pstate = 0x3c5;
    }

    fn save_area(&mut self) -> *mut u8 {
        self as *mut Self as *mut u8
    }
}

impl Arch for Aarch64Arch {
    type Context = Aarch64Context;

    const HAS_VECTOR_DISPATCH: bool = true;

    fn disable_interrupts() -> bool {
        let was_enabled = Self::interrupts_enabled();
        unsafe {
            asm!("msr daifset, #2", options(nomem, nostack));
        }
        was_enabled
    }

    fn restore_interrupts(was_enabled: bool) {
        if was_enabled {
            unsafe {
                asm!("msr daifclr, #2", options(nomem, nostack));
            }
        } else {
            unsafe {
                asm!("msr daifset, #2", options(nomem, nostack));
            }
        }
    }

    fn interrupts_enabled() -> bool {
        let daif: u64;
        unsafe {
            asm!("mrs {daif}, daif", daif = out(reg) daif, options(nomem, nostack));
        }
        (daif & 0x80) == 0
    }

    fn halt() -> ! {
        unsafe {
            asm!("msr daifset, #0xf", options(nomem, nostack));
        }
        loop {
            unsafe {
                asm!("wfe", options(nomem, nostack));
            }
        }
    }
}

/// Read the architectural free-running counter.
///
/// Useful as a [`ClockSource`](crate::time::ClockSource) on boards without a
/// dedicated timebase; the monotonic clock accumulates the low 32 bits with
/// carry handling, so the full 64-bit width is not required.
pub fn counter_low() -> u32 {
    let cnt: u64;
    unsafe {
        asm!("mrs {}, cntpct_el0", out(reg) cnt, options(nomem, nostack));
    }
    cnt as u32
}

/// Read the architectural counter frequency in Hz.
pub fn counter_hz() -> u32 {
    let freq: u64;
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
    }
    freq as u32
}
