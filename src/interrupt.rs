//! Interrupt layer — priority-nested delivery of pending sources
//!
//! Sources are numbered in priority order, lower number = more urgent.
//! The platform marks sources pending; the kernel delivers them whenever
//! interrupts are enabled. While a handler runs, its own source and every
//! less urgent source stay blocked, so a more urgent handler may nest
//! inside a less urgent one but never the other way round. When the
//! outermost handler exits, the scheduler runs before control returns to
//! the interrupted code.
//!
//! Author: Moroya Sakamoto

use log::{debug, trace, warn};

use crate::channel::{ChanIn, Channel};
use crate::config::{NUM_IRQ_SOURCES, NUM_USER_IRQS};
use crate::error::KernelError;
use crate::hardware::Hardware;
use crate::kernel::Kernel;

/// Interrupt source, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IrqSource {
    /// Elapsed-time tick
    ElapsedTick = 0,
    /// Timeout alarm
    TimeoutAlarm = 1,
    /// Reserved for interprocessor signalling
    InterProcess = 2,
    /// User interrupt 0
    User0 = 3,
    /// User interrupt 1
    User1 = 4,
    /// User interrupt 2
    User2 = 5,
}

impl IrqSource {
    /// All sources, most urgent first
    pub const ALL: [IrqSource; NUM_IRQ_SOURCES] = [
        IrqSource::ElapsedTick,
        IrqSource::TimeoutAlarm,
        IrqSource::InterProcess,
        IrqSource::User0,
        IrqSource::User1,
        IrqSource::User2,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Source for application-visible user interrupt `n`
    pub fn user(n: usize) -> Result<IrqSource, KernelError> {
        match n {
            0 => Ok(IrqSource::User0),
            1 => Ok(IrqSource::User1),
            2 => Ok(IrqSource::User2),
            _ => Err(KernelError::InvalidUserInterrupt(n)),
        }
    }

    /// User interrupt number, if this is a user source
    pub fn user_number(self) -> Option<usize> {
        self.index()
            .checked_sub(IrqSource::User0.index())
            .filter(|&n| n < NUM_USER_IRQS)
    }
}

/// Interrupt handler
pub type Handler<H> = fn(&mut Kernel<H>, IrqSource) -> Result<(), KernelError>;

/// Interrupt layer state held by the kernel
pub struct InterruptLayer<H: Hardware> {
    /// Handler per source
    handlers: [Option<Handler<H>>; NUM_IRQ_SOURCES],
    /// Handlers currently running (nesting depth)
    active: usize,
    /// Source of the innermost running handler
    level: Option<IrqSource>,
    /// Interrupts globally masked
    masked: bool,
    /// Channel each user interrupt is wired to
    user_channels: [Option<Channel>; NUM_USER_IRQS],
}

impl<H: Hardware> InterruptLayer<H> {
    pub fn new() -> Self {
        Self {
            handlers: [None; NUM_IRQ_SOURCES],
            active: 0,
            level: None,
            masked: true,
            user_channels: [None; NUM_USER_IRQS],
        }
    }

    /// Install the handler for `source`
    pub fn define_handler(&mut self, source: IrqSource, handler: Handler<H>) {
        self.handlers[source.index()] = Some(handler);
    }

    /// Is some handler running?
    pub fn in_handler(&self) -> bool {
        self.active > 0
    }

    pub fn is_masked(&self) -> bool {
        self.masked
    }

    pub(crate) fn user_channel(&self, n: usize) -> Option<Channel> {
        self.user_channels[n]
    }
}

impl<H: Hardware> Default for InterruptLayer<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hardware> Kernel<H> {
    /// Mask all interrupts
    pub(crate) fn disable_interrupts(&mut self) {
        self.hw.disable_interrupts();
        self.irq.masked = true;
    }

    /// Unmask all interrupts, delivering whatever is pending
    pub(crate) fn enable_interrupts(&mut self) -> Result<(), KernelError> {
        self.irq.masked = false;
        self.hw.enable_interrupts();
        self.dispatch_pending()
    }

    /// Run `f` with interrupts masked, restoring the previous mask state
    pub(crate) fn critical<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> R,
    ) -> Result<R, KernelError> {
        let was_masked = self.irq.masked;
        self.disable_interrupts();
        let result = f(self);
        if !was_masked {
            self.enable_interrupts()?;
        }
        Ok(result)
    }

    /// Deliver pending interrupts more urgent than the innermost handler
    pub(crate) fn dispatch_pending(&mut self) -> Result<(), KernelError> {
        while !self.irq.masked {
            let Some(source) = self.hw.take_pending(self.irq.level) else {
                break;
            };
            self.irq.active += 1;
            self.stats.interrupts += 1;
            let outer_level = self.irq.level.replace(source);
            trace!("irq {source:?} enter (depth {})", self.irq.active);

            if let Some(handler) = self.irq.handlers[source.index()] {
                handler(self, source)?;
            }

            self.disable_interrupts();
            self.irq.active -= 1;
            self.irq.level = outer_level;
            trace!("irq {source:?} exit (depth {})", self.irq.active);

            if self.irq.active == 0 {
                // Last handler out: anything it readied runs before the
                // interrupted code resumes
                let interrupted = self.current;
                let priority = self.current_priority();
                self.stats.reschedules += 1;
                self.schedule(Some(priority))?;
                self.current = interrupted;
            }

            self.irq.masked = false;
            self.hw.enable_interrupts();
        }
        Ok(())
    }

    /// Wire user interrupt `n` to the input end of a channel.
    ///
    /// The channel becomes an interrupt channel with a zero count.
    pub fn connect_interrupt(&mut self, chan: ChanIn, n: usize) -> Result<(), KernelError> {
        let source = IrqSource::user(n)?;
        let chan = chan.channel();
        self.critical(|k| {
            k.channels.make_interrupt(chan)?;
            k.irq.user_channels[n] = Some(chan);
            Ok::<(), KernelError>(())
        })??;
        debug!("user interrupt {n} ({source:?}) -> {chan:?}");
        Ok(())
    }

    /// Unwire user interrupt `n`
    pub fn disconnect_interrupt(&mut self, n: usize) -> Result<(), KernelError> {
        IrqSource::user(n)?;
        self.critical(|k| k.irq.user_channels[n] = None)?;
        debug!("user interrupt {n} disconnected");
        Ok(())
    }

    /// Raise user interrupt `n` from software
    pub fn send_software_interrupt(&mut self, n: usize) -> Result<(), KernelError> {
        let source = IrqSource::user(n)?;
        self.hw.raise(source)?;
        if !self.irq.masked {
            self.dispatch_pending()?;
        }
        Ok(())
    }
}

/// Handler for the three user sources
pub(crate) fn user_interrupt<H: Hardware>(
    kernel: &mut Kernel<H>,
    source: IrqSource,
) -> Result<(), KernelError> {
    let Some(n) = source.user_number() else {
        return Ok(());
    };
    let Some(chan) = kernel.irq.user_channel(n) else {
        warn!("user interrupt {n} with no channel connected");
        return Ok(());
    };
    if let Some(waiting) = kernel.channels.record_interrupt(chan) {
        kernel.ready_if_necessary(waiting)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use parking_lot::Mutex;

    use crate::alt::Guard;
    use crate::config::KernelConfig;
    use crate::hardware::{most_urgent, SimulatedHardware};
    use crate::kernel::Context;
    use crate::timer::Time;

    type Sim = SimulatedHardware;

    fn kernel() -> Kernel<Sim> {
        let config = KernelConfig::default().with_tick_ns(1_000);
        Kernel::new(Sim::new(), config).unwrap()
    }

    #[test]
    fn test_source_order_is_priority_order() {
        assert!(IrqSource::ElapsedTick < IrqSource::TimeoutAlarm);
        assert!(IrqSource::TimeoutAlarm < IrqSource::User0);
        for (i, src) in IrqSource::ALL.iter().enumerate() {
            assert_eq!(src.index(), i);
        }
    }

    #[test]
    fn test_user_numbers() {
        assert_eq!(IrqSource::user(0), Ok(IrqSource::User0));
        assert_eq!(IrqSource::user(2), Ok(IrqSource::User2));
        assert_eq!(IrqSource::user(3), Err(KernelError::InvalidUserInterrupt(3)));
        assert_eq!(IrqSource::User1.user_number(), Some(1));
        assert_eq!(IrqSource::TimeoutAlarm.user_number(), None);
    }

    #[test]
    fn test_ceiling_blocks_equal_and_lower_priority() {
        let pending = 0b11_1111;
        assert_eq!(most_urgent(pending, None), Some(IrqSource::ElapsedTick));
        assert_eq!(most_urgent(pending, Some(IrqSource::ElapsedTick)), None);
        assert_eq!(
            most_urgent(0b11_1000, Some(IrqSource::User1)),
            Some(IrqSource::User0)
        );
        assert_eq!(most_urgent(0b11_0000, Some(IrqSource::User1)), None);
    }

    #[test]
    fn test_tick_is_handled_before_alarm() {
        let mut k = kernel();
        let seen: Arc<Mutex<Vec<Time>>> = Arc::default();
        let log = seen.clone();
        k.start(
            move |cx: &mut Context<'_, Sim>| -> Result<(), KernelError> {
                if cx.initial() {
                    // Falls due on the first tick boundary
                    return cx.init_alt([Guard::timeout(1_000).activated()]);
                }
                log.lock().push(cx.now()?);
                cx.terminate();
                Ok(())
            },
            2,
        )
        .unwrap();
        k.run().unwrap();

        assert_eq!(
            k.hardware().delivered,
            [IrqSource::ElapsedTick, IrqSource::TimeoutAlarm]
        );
        assert_eq!(k.clock.ticks(), 1);
        assert_eq!(*seen.lock(), [1_000]);
    }

    fn plain<H: Hardware>(_: &mut Kernel<H>, _: IrqSource) -> Result<(), KernelError> {
        Ok(())
    }

    /// Less urgent handler: raises User0 and lets it nest
    fn outer(k: &mut Kernel<Sim>, source: IrqSource) -> Result<(), KernelError> {
        assert_eq!(source, IrqSource::User2);
        assert_eq!(k.irq.level, Some(IrqSource::User2));
        k.hw.raise(IrqSource::User0)?;
        k.dispatch_pending()?;
        assert_eq!(
            k.hw.delivered,
            [IrqSource::User2, IrqSource::User0, IrqSource::User1]
        );
        assert_eq!(k.irq.active, 1);
        // Nothing has been rescheduled while a handler is still running
        assert_eq!(k.stats.reschedules, 0);
        Ok(())
    }

    /// More urgent handler: raises User1, which must wait for it
    fn inner(k: &mut Kernel<Sim>, source: IrqSource) -> Result<(), KernelError> {
        assert_eq!(source, IrqSource::User0);
        assert_eq!(k.irq.active, 2);
        k.hw.raise(IrqSource::User1)?;
        k.dispatch_pending()?;
        assert!(k.hw.is_pending(IrqSource::User1));
        Ok(())
    }

    #[test]
    fn test_more_urgent_source_nests_inside_handler() {
        let mut k = kernel();
        k.irq.define_handler(IrqSource::User2, outer);
        k.irq.define_handler(IrqSource::User0, inner);
        k.irq.define_handler(IrqSource::User1, plain);

        k.hw.raise(IrqSource::User2).unwrap();
        k.enable_interrupts().unwrap();

        assert_eq!(k.stats.interrupts, 3);
        // Only the outermost exit reschedules
        assert_eq!(k.stats.reschedules, 1);
        assert!(!k.irq.in_handler());
        assert_eq!(k.irq.level, None);
    }

    #[test]
    fn test_masked_interrupts_stay_pending() {
        let mut k = kernel();
        k.irq.define_handler(IrqSource::User1, plain);
        k.hw.raise(IrqSource::User1).unwrap();
        k.critical(|k| k.dispatch_pending()).unwrap().unwrap();
        assert!(k.hw.is_pending(IrqSource::User1));
        assert_eq!(k.stats.interrupts, 0);
    }
}
