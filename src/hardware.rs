//! Hardware interface — what the kernel needs from the platform
//!
//! Two countdown timers, six interrupt sources with a pending flag each,
//! a global interrupt mask, raw memory for the pool and a fatal-error
//! sink. Interrupt *delivery* is the kernel's job: the platform only
//! marks sources pending, the kernel takes them in priority order when
//! interrupts are enabled (see `interrupt.rs`).
//!
//! A backend also decides how a process step executes. The default runs
//! it in place on the kernel's own stack; a backend with real time
//! passing underneath it overrides `execute` so interrupts reach the
//! kernel while a long step is still computing.
//!
//! `SimulatedHardware` runs on a virtual clock that only moves while
//! the kernel is idle, which makes every timing property reproducible.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::NUM_TIMERS;
use crate::error::KernelError;
use crate::interrupt::IrqSource;
use crate::kernel::{Context, Kernel};
use crate::process::{Pid, Process};
use crate::timer::Time;

/// Hardware timer id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    /// Repeating timer driving the elapsed-time clock
    Elapsed = 0,
    /// Single-shot alarm for the nearest pending timeout
    Timeout = 1,
}

impl TimerId {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Platform services consumed by the kernel
pub trait Hardware: 'static {
    /// Mask every interrupt source
    fn disable_interrupts(&mut self);

    /// Unmask every interrupt source
    fn enable_interrupts(&mut self);

    /// Bind a timer to the interrupt source it raises on expiry
    fn init_timer(&mut self, timer: TimerId, source: IrqSource) -> Result<(), KernelError>;

    /// Arm a timer to expire once after `interval` (0 = immediately)
    fn set_timer_single(&mut self, timer: TimerId, interval: Time) -> Result<(), KernelError>;

    /// Arm a timer to expire every `interval`
    fn set_timer_repeating(&mut self, timer: TimerId, interval: Time) -> Result<(), KernelError>;

    /// Time remaining until the timer next expires (0 if disarmed)
    fn read_timer(&self, timer: TimerId) -> Time;

    /// Expirations since the timer was last armed.
    ///
    /// A repeating timer whose interrupt was delivered late counts every
    /// period that passed, so no tick is lost.
    fn expirations(&self, timer: TimerId) -> u64;

    /// Raise an interrupt from software
    fn raise(&mut self, source: IrqSource) -> Result<(), KernelError>;

    /// Is `source` pending delivery?
    fn is_pending(&self, source: IrqSource) -> bool;

    /// Clear and return the most urgent pending source strictly more
    /// urgent than `ceiling` (any source when `ceiling` is `None`)
    fn take_pending(&mut self, ceiling: Option<IrqSource>) -> Option<IrqSource>;

    /// Block until some interrupt is pending.
    ///
    /// Returns `false` if no interrupt can ever become pending again.
    fn wait_for_interrupt(&mut self) -> bool;

    /// Raw backing storage for the memory pool
    fn allocate(&mut self, len: usize) -> Result<Box<[u8]>, KernelError> {
        Ok(vec![0u8; len].into_boxed_slice())
    }

    /// Diagnostic sink for fatal errors
    fn fatal(&mut self, error: &KernelError);

    /// Run one step of `pid` with `body`.
    ///
    /// Called with interrupts enabled. The default runs the step on the
    /// caller's stack, so interrupts raised meanwhile wait for the step
    /// to return.
    fn execute(
        kernel: &mut Kernel<Self>,
        pid: Pid,
        body: &mut dyn Process<Self>,
    ) -> Result<(), KernelError>
    where
        Self: Sized,
    {
        body.step(&mut Context::local(kernel, pid))
    }
}

/// Pending bit for a source
pub(crate) const fn irq_bit(source: IrqSource) -> u8 {
    1 << source.index()
}

/// Most urgent pending source strictly above `ceiling`
pub(crate) fn most_urgent(pending: u8, ceiling: Option<IrqSource>) -> Option<IrqSource> {
    let limit = ceiling.map_or(IrqSource::ALL.len(), IrqSource::index);
    IrqSource::ALL[..limit]
        .iter()
        .copied()
        .find(|&src| pending & irq_bit(src) != 0)
}

#[derive(Debug, Clone, Copy, Default)]
struct SimTimer {
    source: Option<IrqSource>,
    deadline: Option<Time>,
    period: Option<Time>,
    expirations: u64,
}

/// Deterministic virtual-time hardware
pub struct SimulatedHardware {
    /// Virtual time since power-on (ns)
    now: Time,
    timers: [SimTimer; NUM_TIMERS],
    pending: u8,
    masked: bool,
    /// Virtual time past which the machine halts
    horizon: Option<Time>,
    /// Every fatal error reported to the sink
    pub faults: Vec<KernelError>,
    /// Interrupts raised from software, in order
    pub raised: Vec<IrqSource>,
    /// Interrupts taken for delivery, in order
    pub delivered: Vec<IrqSource>,
}

impl SimulatedHardware {
    pub const fn new() -> Self {
        Self {
            now: 0,
            timers: [SimTimer {
                source: None,
                deadline: None,
                period: None,
                expirations: 0,
            }; NUM_TIMERS],
            pending: 0,
            masked: true,
            horizon: None,
            faults: Vec::new(),
            raised: Vec::new(),
            delivered: Vec::new(),
        }
    }

    /// Halt once virtual time would pass `horizon`
    pub fn with_horizon(mut self, horizon: Time) -> Self {
        self.horizon = Some(horizon);
        self
    }

    /// Virtual time since power-on
    pub fn elapsed(&self) -> Time {
        self.now
    }

    /// Are interrupts currently masked?
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Advance virtual time, expiring every timer on the way
    pub fn advance(&mut self, delta: Time) {
        let target = self.now + delta;
        while let Some(deadline) = self.next_deadline().filter(|&d| d <= target) {
            self.now = deadline;
            self.expire_due();
        }
        self.now = target;
    }

    fn next_deadline(&self) -> Option<Time> {
        self.timers.iter().filter_map(|t| t.deadline).min()
    }

    fn expire_due(&mut self) {
        let now = self.now;
        for timer in self.timers.iter_mut() {
            match timer.deadline {
                Some(deadline) if deadline <= now => {
                    if let Some(source) = timer.source {
                        self.pending |= irq_bit(source);
                    }
                    timer.expirations += 1;
                    timer.deadline = timer.period.map(|p| deadline + p);
                }
                _ => {}
            }
        }
    }
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for SimulatedHardware {
    fn disable_interrupts(&mut self) {
        self.masked = true;
    }

    fn enable_interrupts(&mut self) {
        self.masked = false;
    }

    fn init_timer(&mut self, timer: TimerId, source: IrqSource) -> Result<(), KernelError> {
        self.timers[timer.index()] = SimTimer {
            source: Some(source),
            ..SimTimer::default()
        };
        Ok(())
    }

    fn set_timer_single(&mut self, timer: TimerId, interval: Time) -> Result<(), KernelError> {
        let slot = &mut self.timers[timer.index()];
        slot.deadline = Some(self.now + interval);
        slot.period = None;
        slot.expirations = 0;
        self.expire_due();
        Ok(())
    }

    fn set_timer_repeating(&mut self, timer: TimerId, interval: Time) -> Result<(), KernelError> {
        if interval == 0 {
            return Err(KernelError::Hardware {
                call: "set_timer_repeating",
            });
        }
        let slot = &mut self.timers[timer.index()];
        slot.deadline = Some(self.now + interval);
        slot.period = Some(interval);
        slot.expirations = 0;
        Ok(())
    }

    fn read_timer(&self, timer: TimerId) -> Time {
        self.timers[timer.index()]
            .deadline
            .map_or(0, |d| d.saturating_sub(self.now))
    }

    fn expirations(&self, timer: TimerId) -> u64 {
        self.timers[timer.index()].expirations
    }

    fn raise(&mut self, source: IrqSource) -> Result<(), KernelError> {
        self.pending |= irq_bit(source);
        self.raised.push(source);
        Ok(())
    }

    fn is_pending(&self, source: IrqSource) -> bool {
        self.pending & irq_bit(source) != 0
    }

    fn take_pending(&mut self, ceiling: Option<IrqSource>) -> Option<IrqSource> {
        let source = most_urgent(self.pending, ceiling)?;
        self.pending &= !irq_bit(source);
        self.delivered.push(source);
        Some(source)
    }

    fn wait_for_interrupt(&mut self) -> bool {
        if self.pending != 0 {
            return true;
        }
        let Some(deadline) = self.next_deadline() else {
            return false;
        };
        if self.horizon.is_some_and(|h| deadline > h) {
            return false;
        }
        self.now = self.now.max(deadline);
        self.expire_due();
        true
    }

    fn fatal(&mut self, error: &KernelError) {
        log::error!("fatal: {error}");
        self.faults.push(error.clone());
    }
}
