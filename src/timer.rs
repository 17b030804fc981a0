//! Timer — elapsed-time clock and the timeout queue
//!
//! Elapsed time is kept in two parts: a logical clock advanced on every
//! elapsed-time interrupt, and the hardware countdown that measures how
//! far into the current tick we are. The clock advances by as many ticks
//! as the timer has expired, so a tick interrupt delivered late still
//! credits every period that passed. A second hardware timer is armed
//! single-shot for the nearest pending timeout only.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;

use log::{debug, trace, warn};

use crate::error::KernelError;
use crate::hardware::{Hardware, TimerId};
use crate::interrupt::IrqSource;
use crate::kernel::Kernel;
use crate::process::Pid;

/// Nanoseconds since kernel start
pub type Time = u64;

/// Logical elapsed-time clock
///
/// Size: 24 bytes
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// Time at the start of the current tick (ns)
    current: Time,
    /// Tick length (ns)
    tick: Time,
    /// Ticks counted
    ticks: u64,
}

impl Clock {
    pub const fn new(tick: Time) -> Self {
        Self {
            current: 0,
            tick,
            ticks: 0,
        }
    }

    /// Bring the clock up to `expired` ticks since start.
    /// Returns the ticks credited.
    pub fn catch_up(&mut self, expired: u64) -> u64 {
        let missed = expired.saturating_sub(self.ticks);
        self.current = self.current.wrapping_add(missed.wrapping_mul(self.tick));
        self.ticks += missed;
        missed
    }

    /// Time at the start of the current tick
    pub fn current(&self) -> Time {
        self.current
    }

    pub fn tick(&self) -> Time {
        self.tick
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// A process waiting for an absolute time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub time: Time,
    pub pid: Pid,
}

/// Pending timeouts, ascending by time, FIFO among equal times
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Vec<Timeout>,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert behind every entry with the same or earlier time.
    /// Returns true if the entry became the head.
    pub fn insert(&mut self, timeout: Timeout) -> bool {
        let at = self.entries.partition_point(|t| t.time <= timeout.time);
        self.entries.insert(at, timeout);
        at == 0
    }

    /// Remove the entry for `pid` at `time`, wherever it is
    pub fn remove(&mut self, time: Time, pid: Pid) -> Option<Timeout> {
        let from = self.entries.partition_point(|t| t.time < time);
        let at = self.entries[from..]
            .iter()
            .take_while(|t| t.time == time)
            .position(|t| t.pid == pid)?;
        Some(self.entries.remove(from + at))
    }

    /// Remove the head if it is due at `now`
    pub fn pop_due(&mut self, now: Time) -> Option<Timeout> {
        if self.entries.first()?.time <= now {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    pub fn head(&self) -> Option<&Timeout> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: Hardware> Kernel<H> {
    /// Current elapsed time
    pub fn now(&self) -> Time {
        let tick = self.clock.tick();
        loop {
            // Ticks that expired but are not yet handled have already
            // rewound the countdown
            let before = self.hw.expirations(TimerId::Elapsed);
            let remaining = self.hw.read_timer(TimerId::Elapsed);
            let after = self.hw.expirations(TimerId::Elapsed);
            if before == after {
                let unhandled = after.saturating_sub(self.clock.ticks());
                return self
                    .clock
                    .current()
                    .wrapping_add(unhandled.wrapping_mul(tick))
                    .wrapping_add(tick.saturating_sub(remaining));
            }
        }
    }

    /// Arm a timeout guard. Returns true if `time` has already passed.
    ///
    /// Interrupts must be disabled.
    pub(crate) fn enable_timeout(&mut self, time: Time, pid: Pid) -> Result<bool, KernelError> {
        let now = self.now();
        if now >= time {
            return Ok(true);
        }
        if self.timeouts.insert(Timeout { time, pid }) {
            self.hw.set_timer_single(TimerId::Timeout, time - now)?;
        }
        Ok(false)
    }

    /// Withdraw a timeout guard. Returns true if `time` has passed.
    ///
    /// Interrupts must be disabled.
    pub(crate) fn disable_timeout(&mut self, time: Time, pid: Pid) -> bool {
        let ready = self.now() >= time;
        self.timeouts.remove(time, pid);
        ready
    }

    /// Install the timer handlers and start the elapsed-time tick
    pub(crate) fn timer_init(&mut self) -> Result<(), KernelError> {
        self.irq.define_handler(IrqSource::ElapsedTick, elapsed_tick);
        self.hw.init_timer(TimerId::Elapsed, IrqSource::ElapsedTick)?;
        self.hw
            .set_timer_repeating(TimerId::Elapsed, self.clock.tick())?;

        self.irq.define_handler(IrqSource::TimeoutAlarm, timeout_alarm);
        self.hw.init_timer(TimerId::Timeout, IrqSource::TimeoutAlarm)?;
        Ok(())
    }
}

fn elapsed_tick<H: Hardware>(kernel: &mut Kernel<H>, _: IrqSource) -> Result<(), KernelError> {
    let expired = kernel.hw.expirations(TimerId::Elapsed);
    let credited = kernel.clock.catch_up(expired);
    if credited > 1 {
        debug!("tick {}: {} ticks delivered late", kernel.clock.ticks(), credited - 1);
    } else {
        trace!("tick {}", kernel.clock.ticks());
    }
    Ok(())
}

fn timeout_alarm<H: Hardware>(kernel: &mut Kernel<H>, _: IrqSource) -> Result<(), KernelError> {
    let now = kernel.now();
    while let Some(due) = kernel.timeouts.pop_due(now) {
        trace!("timeout {} due for {:?}", due.time, due.pid);
        if kernel.procs.get(due.pid).is_none() {
            warn!("timeout for reclaimed process {:?}", due.pid);
            continue;
        }
        kernel.ready_if_necessary(due.pid)?;
    }

    if let Some(head) = kernel.timeouts.head() {
        let interval = head.time.saturating_sub(now);
        kernel.hw.set_timer_single(TimerId::Timeout, interval)?;
    }
    Ok(())
}
