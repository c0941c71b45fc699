//! Error handling for the kernel core.
//!
//! Every fallible operation returns a status value; there is no exception
//! propagation anywhere in the system. Contexts that cannot report an error
//! (the interrupt path, the thread trampoline) halt or drop the event
//! instead of using these types.

use core::fmt;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Top-level error type for all kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The kernel has not been brought up or registered yet
    NotInitialized,
    /// The kernel has already been brought up
    AlreadyInitialized,
    /// Thread creation errors
    Spawn(SpawnError),
    /// Synchronization primitive errors
    Sync(SyncError),
    /// Interrupt vector errors
    Vector(VectorError),
    /// Bring-up configuration errors
    Config(ConfigError),
}

/// Errors that can occur when creating a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Out of memory for stack or control-block allocation
    OutOfMemory,
    /// Requested stack size cannot be satisfied by any size class
    InvalidStackSize(usize),
    /// The thread has already been started
    AlreadyStarted,
}

/// Errors that can occur when constructing a synchronization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Primitives require an initialized, registered kernel
    NotInitialized,
    /// A counting primitive needs at least one permit
    ZeroPermits,
}

/// Errors from the interrupt-vector control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorError {
    /// No free hardware channel to multiplex the source onto
    NoFreeChannel,
    /// The interrupt source is already claimed by another channel
    SourceInUse(u32),
    /// Handler stack allocation failed; the channel table is untouched
    OutOfMemory,
    /// The channel index does not name an allocated channel
    InvalidChannel(usize),
}

/// Errors detected while validating the one-time bring-up record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The free-running counter rate must be non-zero
    ZeroCounterRate,
    /// Counter width must be between 1 and 32 bits
    BadCounterWidth(u32),
    /// The scheduling quantum must be non-zero
    ZeroQuantum,
    /// A heap region was requested with a null or misaligned base
    BadHeapBase(usize),
    /// At least one interrupt channel is required
    NoVectorChannels,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NotInitialized => write!(f, "kernel not initialized"),
            KernelError::AlreadyInitialized => write!(f, "kernel already initialized"),
            KernelError::Spawn(e) => write!(f, "thread spawn error: {}", e),
            KernelError::Sync(e) => write!(f, "sync primitive error: {}", e),
            KernelError::Vector(e) => write!(f, "interrupt vector error: {}", e),
            KernelError::Config(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => write!(f, "out of memory for thread creation"),
            SpawnError::InvalidStackSize(size) => write!(f, "invalid stack size: {}", size),
            SpawnError::AlreadyStarted => write!(f, "thread already started"),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NotInitialized => write!(f, "kernel must be initialized first"),
            SyncError::ZeroPermits => write!(f, "permit count must be non-zero"),
        }
    }
}

impl fmt::Display for VectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorError::NoFreeChannel => write!(f, "no free interrupt channel"),
            VectorError::SourceInUse(src) => write!(f, "interrupt source {} already claimed", src),
            VectorError::OutOfMemory => write!(f, "out of memory for handler stack"),
            VectorError::InvalidChannel(ch) => write!(f, "invalid interrupt channel: {}", ch),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroCounterRate => write!(f, "counter rate must be non-zero"),
            ConfigError::BadCounterWidth(bits) => write!(f, "bad counter width: {} bits", bits),
            ConfigError::ZeroQuantum => write!(f, "scheduling quantum must be non-zero"),
            ConfigError::BadHeapBase(base) => write!(f, "bad heap base address: {:#x}", base),
            ConfigError::NoVectorChannels => write!(f, "at least one vector channel required"),
        }
    }
}

impl From<SpawnError> for KernelError {
    fn from(error: SpawnError) -> Self {
        KernelError::Spawn(error)
    }
}

impl From<SyncError> for KernelError {
    fn from(error: SyncError) -> Self {
        KernelError::Sync(error)
    }
}

impl From<VectorError> for KernelError {
    fn from(error: VectorError) -> Self {
        KernelError::Vector(error)
    }
}

impl From<ConfigError> for KernelError {
    fn from(error: ConfigError) -> Self {
        KernelError::Config(error)
    }
}
