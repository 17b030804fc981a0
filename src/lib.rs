//! ALICE-CSP — Communicating Sequential Processes kernel
//!
//! Don't share memory, rendezvous.
//!
//! Small concurrency kernel for process-oriented embedded programs:
//! - Eight-level priority scheduler with preemption by nesting
//! - Unbuffered rendezvous channels, one value transferred exactly once
//! - Two-phase ALT over input, output, skip, timeout and interrupt guards
//! - Timeout queue driven by a single-shot alarm
//! - Fixed size-class memory pool with intrusive free lists
//! - Prioritised interrupt layer over a pluggable `Hardware`
//! - Host backend that preempts running steps from real timers
//!
//! Without the `std` feature the crate is `no_std` + `alloc`.
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod memory;
pub mod hardware;
#[cfg(feature = "std")]
pub mod host;
pub mod interrupt;
pub mod timer;
pub mod process;
pub mod scheduler;
pub mod channel;
pub mod alt;
pub mod kernel;

pub use alt::{Guard, GuardKind};
pub use channel::{ChanIn, ChanOut, Channel};
pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use hardware::{Hardware, SimulatedHardware, TimerId};
#[cfg(feature = "std")]
pub use host::{HostHardware, StopHandle};
pub use interrupt::IrqSource;
pub use kernel::{Context, Kernel, KernelStats};
pub use memory::{Block, MemoryPool};
pub use process::{Pid, Priority, ProcState, Process};
pub use timer::Time;
