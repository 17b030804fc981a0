//! Kernel configuration — constants and the runtime `KernelConfig`
//!
//! Fixed limits are compile-time constants. Pool size, size classes and
//! tick length are chosen per kernel instance.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::timer::Time;

/// Number of priority levels (0 = idle, 7 = most urgent)
pub const NUM_PRIORITIES: usize = 8;
/// Idle priority
pub const PRI_MIN: u8 = 0;
/// Most urgent application priority
pub const PRI_MAX: u8 = 7;
/// Priority used when the application has no preference
pub const PRI_DEFAULT: u8 = 1;

/// Maximum number of allocation size classes
pub const MAX_SIZE_CLASSES: usize = 16;

/// Hardware timers used by the kernel (elapsed time + timeout alarm)
pub const NUM_TIMERS: usize = 2;
/// Interrupt sources (elapsed, timeout, interprocess, three user sources)
pub const NUM_IRQ_SOURCES: usize = 6;
/// User interrupt sources available to applications
pub const NUM_USER_IRQS: usize = 3;

/// Nanoseconds per second
pub const NS_PER_SEC: Time = 1_000_000_000;
/// Default interval between elapsed-time interrupts
pub const DEFAULT_TICK_NS: Time = NS_PER_SEC;
/// Default bytes of backing storage for process records
pub const DEFAULT_POOL_BYTES: usize = 32_768;

/// Default size classes in bytes, ascending.
///
/// Sized for a process record plus a few words of local state at the
/// low end and guard-heavy processes at the top.
pub const DEFAULT_SIZE_CLASSES: [u32; MAX_SIZE_CLASSES] = [
    16, 32, 48, 64, 96, 128, 160, 192, 256, 320, 384, 512, 768, 1024, 1536, 2048,
];

/// Alignment of every pool block. Process bodies may not need more.
pub const BLOCK_ALIGN: usize = 16;

/// Per-instance kernel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Bytes of backing storage handed to the memory pool
    pub pool_bytes: usize,
    /// Allocation size classes, strictly ascending
    pub size_classes: Vec<u32>,
    /// Interval between elapsed-time interrupts (ns)
    pub tick_ns: Time,
}

impl KernelConfig {
    pub fn with_pool_bytes(self, pool_bytes: usize) -> Self {
        Self { pool_bytes, ..self }
    }

    pub fn with_size_classes(self, size_classes: &[u32]) -> Self {
        Self {
            size_classes: size_classes.to_vec(),
            ..self
        }
    }

    pub fn with_tick_ns(self, tick_ns: Time) -> Self {
        Self { tick_ns, ..self }
    }

    /// Reject configurations the kernel cannot run with
    pub fn validate(&self) -> Result<(), KernelError> {
        if u32::try_from(self.pool_bytes).is_err() {
            return Err(KernelError::InvalidConfig("pool larger than 4 GiB"));
        }
        if self.tick_ns == 0 {
            return Err(KernelError::InvalidConfig("tick must be nonzero"));
        }
        if self.size_classes.is_empty() {
            return Err(KernelError::InvalidConfig("no size classes"));
        }
        if self.size_classes.len() > MAX_SIZE_CLASSES {
            return Err(KernelError::InvalidConfig("too many size classes"));
        }
        if self
            .size_classes
            .iter()
            .any(|&len| len == 0 || len as usize % BLOCK_ALIGN != 0)
        {
            return Err(KernelError::InvalidConfig("size classes must be multiples of 16"));
        }
        if self.size_classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(KernelError::InvalidConfig("size classes must ascend"));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            pool_bytes: DEFAULT_POOL_BYTES,
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
            tick_ns: DEFAULT_TICK_NS,
        }
    }
}
