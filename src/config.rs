//! One-time bring-up configuration record.
//!
//! Supplied once to [`Kernel::bring_up`](crate::kernel::Kernel::bring_up) and
//! never mutated afterward. Holds everything that varies between boards but
//! not between runs: clock rates, the heap region, and the scheduling quantum.

use crate::errors::ConfigError;

/// Machine word size in bytes; stack sizes are rounded up to this.
pub const WORD_BYTES: usize = core::mem::size_of::<usize>();

/// Board-level configuration captured at bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardConfig {
    /// Rate of the free-running hardware counter in Hz
    pub counter_hz: u32,
    /// Usable width of the free-running counter in bits (1..=32)
    pub counter_width_bits: u32,
    /// Heap base address; ignored when `heap_size` is zero
    pub heap_base: usize,
    /// Heap size in bytes; zero means the heap is managed externally
    pub heap_size: usize,
    /// Base scheduling quantum in microseconds; a thread's timer period is
    /// `priority * quantum_us`
    pub quantum_us: u32,
    /// Number of hardware interrupt channels the vector table manages
    pub vector_channels: usize,
}

impl BoardConfig {
    /// Check the record for values the kernel cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.counter_hz == 0 {
            return Err(ConfigError::ZeroCounterRate);
        }
        if self.counter_width_bits == 0 || self.counter_width_bits > 32 {
            return Err(ConfigError::BadCounterWidth(self.counter_width_bits));
        }
        if self.quantum_us == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        if self.heap_size > 0 && (self.heap_base == 0 || self.heap_base % WORD_BYTES != 0) {
            return Err(ConfigError::BadHeapBase(self.heap_base));
        }
        if self.vector_channels == 0 {
            return Err(ConfigError::NoVectorChannels);
        }
        Ok(())
    }
}

impl Default for BoardConfig {
    /// Defaults suitable for host testing: 1 MHz 32-bit counter, 1 ms base
    /// quantum, external heap, 8 channels.
    fn default() -> Self {
        Self {
            counter_hz: 1_000_000,
            counter_width_bits: 32,
            heap_base: 0,
            heap_size: 0,
            quantum_us: 1_000,
            vector_channels: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(BoardConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_counter_rate() {
        let cfg = BoardConfig {
            counter_hz: 0,
            ..BoardConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroCounterRate));
    }

    #[test]
    fn rejects_wide_counter() {
        let cfg = BoardConfig {
            counter_width_bits: 48,
            ..BoardConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::BadCounterWidth(48)));
    }

    #[test]
    fn rejects_misaligned_heap() {
        let cfg = BoardConfig {
            heap_base: 0x2000_0001,
            heap_size: 64 * 1024,
            ..BoardConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::BadHeapBase(0x2000_0001)));
    }

    #[test]
    fn external_heap_skips_base_check() {
        let cfg = BoardConfig {
            heap_base: 0,
            heap_size: 0,
            ..BoardConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
