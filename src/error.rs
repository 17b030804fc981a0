//! Kernel errors — every one of them fatal
//!
//! Misconfiguration, protocol violations and resource exhaustion are
//! programmer errors in a statically sized system. They surface as
//! `Err` from the run loop after passing through the hardware's fatal
//! sink; nothing inside the kernel retries.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

/// Fatal kernel condition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("invalid priority {0} (application processes use 1..=7)")]
    InvalidPriority(u8),

    #[error("an active output guard must be the only active guard")]
    MultipleOutputGuards,

    #[error("process was readied but no branch of its ALT is ready")]
    NoReadyBranch,

    #[error("interrupt guard on a channel not connected to an interrupt")]
    NotInterruptChannel,

    #[error("channel guard on a channel connected to an interrupt")]
    InterruptChannelMisuse,

    #[error("another process already waits on the same end of this channel")]
    ChannelEndBusy,

    #[error("transfer size mismatch: offered {offered} bytes, expected {expected}")]
    TransferSize { offered: usize, expected: usize },

    #[error("no memory block large enough for {0} bytes")]
    NoSizeClass(usize),

    #[error("out of memory")]
    OutOfMemory,

    #[error("process needs {0}-byte alignment, more than a pool block offers")]
    UnsupportedAlignment(usize),

    #[error("channel ids exhausted")]
    TooManyChannels,

    #[error("invalid user interrupt number {0}")]
    InvalidUserInterrupt(usize),

    #[error("no guard {0} in this ALT")]
    NoSuchGuard(usize),

    #[error("channel {0} does not belong to this kernel")]
    UnknownChannel(u32),

    #[error("stale process handle")]
    StaleProcess,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("hardware call {call} failed")]
    Hardware { call: &'static str },
}

/// Kernel result alias
pub type Result<T> = core::result::Result<T, KernelError>;
