//! Host hardware — the kernel on an operating-system thread
//!
//! Timers are real: a background thread sleeps until the nearest
//! deadline and marks its source pending, so interrupts arrive
//! asynchronously with respect to the kernel, as they do on a board.
//! The kernel thread parks in `wait_for_interrupt` while idle.
//!
//! Each process step runs on a scoped thread of its own. While it
//! computes, the kernel thread serves the step's requests and delivers
//! interrupts, so a more urgent process readied by a timer runs at once
//! instead of after the step returns. The preempted step keeps computing
//! meanwhile, but its next kernel request waits until the preempting
//! work has unwound.
//!
//! Author: Moroya Sakamoto

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::vec::Vec;

use log::{error, trace};
use parking_lot::{Condvar, Mutex};

use crate::config::NUM_TIMERS;
use crate::error::KernelError;
use crate::hardware::{irq_bit, most_urgent, Hardware, TimerId};
use crate::interrupt::IrqSource;
use crate::kernel::{Context, Kernel, Mailbox, Request};
use crate::process::{Pid, Process};
use crate::timer::Time;

#[derive(Debug, Clone, Copy, Default)]
struct HostTimer {
    source: Option<IrqSource>,
    deadline: Option<Instant>,
    period: Option<Duration>,
    expirations: u64,
}

#[derive(Debug, Default)]
struct State {
    timers: [HostTimer; NUM_TIMERS],
    pending: u8,
    stopped: bool,
}

impl State {
    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|t| t.deadline).min()
    }

    /// Mark every expired timer's source pending. Returns true if any fired.
    fn expire_due(&mut self, now: Instant) -> bool {
        let mut fired = false;
        for timer in self.timers.iter_mut() {
            let Some(deadline) = timer.deadline.filter(|&d| d <= now) else {
                continue;
            };
            if let Some(source) = timer.source {
                self.pending |= irq_bit(source);
                fired = true;
            }
            match timer.period {
                Some(period) => {
                    // Periods missed while nobody looked still count
                    let step = nanos(period).max(1);
                    let missed = nanos(now - deadline) / step;
                    timer.expirations += missed + 1;
                    timer.deadline =
                        Some(deadline + Duration::from_nanos((missed + 1).saturating_mul(step)));
                }
                None => {
                    timer.expirations += 1;
                    timer.deadline = None;
                }
            }
        }
        fired
    }
}

/// State shared between the kernel thread, the timer thread and step
/// threads
#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    /// Wake every waiter. Holding the state lock while notifying means no
    /// waiter can miss it between its check and its wait.
    fn notify(&self) {
        let _state = self.state.lock();
        self.wake.notify_all();
    }
}

/// Stops a `HostHardware` from another thread
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<Shared>);

impl StopHandle {
    /// Halt the machine: the kernel's next idle turn ends `run`
    pub fn stop(&self) {
        self.0.state.lock().stopped = true;
        self.0.wake.notify_all();
    }
}

/// Hardware backed by `std` threads and the monotonic clock
pub struct HostHardware {
    shared: Arc<Shared>,
    masked: bool,
    timer: Option<JoinHandle<()>>,
    /// Every fatal error reported to the sink
    pub faults: Vec<KernelError>,
}

impl HostHardware {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let timer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || timer_thread(&shared))
        };
        Self {
            shared,
            masked: true,
            timer: Some(timer),
            faults: Vec::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.shared))
    }

    fn arm(&mut self, timer: TimerId, interval: Time, period: Option<Duration>) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let slot = &mut state.timers[timer.index()];
        slot.deadline = Some(now + Duration::from_nanos(interval));
        slot.period = period;
        slot.expirations = 0;
        state.expire_due(now);
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Read timer state after bringing it up to the present
    fn sample<R>(&self, read: impl FnOnce(&State, Instant) -> R) -> R {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        if state.expire_due(now) {
            self.shared.wake.notify_all();
        }
        read(&state, now)
    }
}

impl Default for HostHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostHardware {
    fn drop(&mut self) {
        self.stop_handle().stop();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

fn timer_thread(shared: &Shared) {
    let mut state = shared.state.lock();
    while !state.stopped {
        if state.expire_due(Instant::now()) {
            trace!("host timer fired, pending {:#08b}", state.pending);
            shared.wake.notify_all();
        }
        match state.next_deadline() {
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
            None => shared.wake.wait(&mut state),
        }
    }
}

fn nanos(d: Duration) -> Time {
    Time::try_from(d.as_nanos()).unwrap_or(Time::MAX)
}

/// What the kernel thread does next while a step runs
enum Event {
    /// Serve a request from the step
    Request(Request<HostHardware>),
    /// Deliver pending interrupts
    Interrupt,
    /// The step returned
    Done(Result<(), KernelError>),
}

#[derive(Default)]
struct Inbox {
    events: VecDeque<Event>,
    closed: bool,
}

/// Connection between one step's thread and the kernel thread.
///
/// Lock order is state, then inbox. The step side never holds both.
struct StepLink {
    shared: Arc<Shared>,
    inbox: Mutex<Inbox>,
}

impl StepLink {
    fn send(&self, event: Event) {
        {
            let mut inbox = self.inbox.lock();
            if inbox.closed {
                // Dropping a request drops its reply sender, which fails
                // the waiting call
                return;
            }
            inbox.events.push_back(event);
        }
        self.shared.notify();
    }

    /// Block until there is something to do. Pending interrupts come
    /// first when `interruptible`.
    fn next(&self, interruptible: bool) -> Event {
        let mut state = self.shared.state.lock();
        loop {
            if interruptible && state.pending != 0 {
                return Event::Interrupt;
            }
            if let Some(event) = self.inbox.lock().events.pop_front() {
                return event;
            }
            self.shared.wake.wait(&mut state);
        }
    }

    /// Refuse further requests and fail the queued ones
    fn close(&self) {
        let dropped: Vec<Event> = {
            let mut inbox = self.inbox.lock();
            inbox.closed = true;
            inbox.events.drain(..).collect()
        };
        drop(dropped);
    }
}

impl Mailbox<HostHardware> for StepLink {
    fn post(&self, request: Request<HostHardware>) {
        self.send(Event::Request(request));
    }
}

/// Reports a step's result when dropped, a failure if the step panicked
struct Outcome<'a> {
    link: &'a StepLink,
    result: Result<(), KernelError>,
}

impl Drop for Outcome<'_> {
    fn drop(&mut self) {
        let result = core::mem::replace(&mut self.result, Ok(()));
        self.link.send(Event::Done(result));
    }
}

/// Kernel side of a running step
fn serve(kernel: &mut Kernel<HostHardware>, link: &StepLink) -> Result<(), KernelError> {
    loop {
        match link.next(!kernel.irq.is_masked()) {
            Event::Request(request) => request(kernel),
            Event::Interrupt => kernel.dispatch_pending()?,
            Event::Done(result) => return result,
        }
    }
}

impl Hardware for HostHardware {
    fn disable_interrupts(&mut self) {
        self.masked = true;
    }

    fn enable_interrupts(&mut self) {
        self.masked = false;
    }

    fn init_timer(&mut self, timer: TimerId, source: IrqSource) -> Result<(), KernelError> {
        self.shared.state.lock().timers[timer.index()] = HostTimer {
            source: Some(source),
            ..HostTimer::default()
        };
        Ok(())
    }

    fn set_timer_single(&mut self, timer: TimerId, interval: Time) -> Result<(), KernelError> {
        self.arm(timer, interval, None);
        Ok(())
    }

    fn set_timer_repeating(&mut self, timer: TimerId, interval: Time) -> Result<(), KernelError> {
        if interval == 0 {
            return Err(KernelError::Hardware {
                call: "set_timer_repeating",
            });
        }
        self.arm(timer, interval, Some(Duration::from_nanos(interval)));
        Ok(())
    }

    fn read_timer(&self, timer: TimerId) -> Time {
        self.sample(|state, now| {
            state.timers[timer.index()]
                .deadline
                .map_or(0, |d| nanos(d.saturating_duration_since(now)))
        })
    }

    fn expirations(&self, timer: TimerId) -> u64 {
        self.sample(|state, _| state.timers[timer.index()].expirations)
    }

    fn raise(&mut self, source: IrqSource) -> Result<(), KernelError> {
        self.shared.state.lock().pending |= irq_bit(source);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn is_pending(&self, source: IrqSource) -> bool {
        self.shared.state.lock().pending & irq_bit(source) != 0
    }

    fn take_pending(&mut self, ceiling: Option<IrqSource>) -> Option<IrqSource> {
        let mut state = self.shared.state.lock();
        let source = most_urgent(state.pending, ceiling)?;
        state.pending &= !irq_bit(source);
        Some(source)
    }

    fn wait_for_interrupt(&mut self) -> bool {
        let mut state = self.shared.state.lock();
        loop {
            if state.pending != 0 {
                return true;
            }
            if state.stopped {
                return false;
            }
            self.shared.wake.wait(&mut state);
        }
    }

    fn fatal(&mut self, err: &KernelError) {
        error!("fatal: {err}");
        self.faults.push(err.clone());
    }

    fn execute(
        kernel: &mut Kernel<Self>,
        pid: Pid,
        body: &mut dyn Process<Self>,
    ) -> Result<(), KernelError> {
        let link = Arc::new(StepLink {
            shared: Arc::clone(&kernel.hw.shared),
            inbox: Mutex::default(),
        });
        let info = kernel.step_info(pid);

        thread::scope(|scope| {
            let remote = Arc::clone(&link);
            let worker = thread::Builder::new()
                .name(format!("step {}", pid.slot()))
                .spawn_scoped(scope, move || {
                    let mut outcome = Outcome {
                        link: &remote,
                        result: Err(KernelError::Hardware {
                            call: "process step",
                        }),
                    };
                    let mailbox: Arc<dyn Mailbox<HostHardware>> = remote.clone();
                    outcome.result = body.step(&mut Context::remote(mailbox, pid, info));
                })
                .map_err(|_| KernelError::Hardware {
                    call: "spawn step thread",
                })?;

            let result = serve(kernel, &link);
            if result.is_err() {
                link.close();
            }
            match worker.join() {
                Ok(()) => result,
                Err(_) => {
                    error!("{pid:?} panicked in its step");
                    Err(KernelError::Hardware {
                        call: "process step",
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::alt::Guard;
    use crate::config::KernelConfig;

    const MS: Time = 1_000_000;

    type Sample = Arc<Mutex<Option<(Time, Duration)>>>;

    #[test]
    fn test_zero_interval_is_pending_at_once() {
        let mut hw = HostHardware::new();
        hw.init_timer(TimerId::Timeout, IrqSource::TimeoutAlarm).unwrap();
        hw.set_timer_single(TimerId::Timeout, 0).unwrap();
        assert!(hw.is_pending(IrqSource::TimeoutAlarm));
        assert_eq!(hw.take_pending(None), Some(IrqSource::TimeoutAlarm));
        assert!(!hw.is_pending(IrqSource::TimeoutAlarm));
    }

    #[test]
    fn test_timer_thread_raises_alarm() {
        let mut hw = HostHardware::new();
        hw.init_timer(TimerId::Timeout, IrqSource::TimeoutAlarm).unwrap();
        hw.set_timer_single(TimerId::Timeout, 5 * MS).unwrap();
        assert!(hw.read_timer(TimerId::Timeout) <= 5 * MS);

        let start = Instant::now();
        assert!(hw.wait_for_interrupt());
        assert!(start.elapsed() >= Duration::from_millis(4));
        assert!(hw.is_pending(IrqSource::TimeoutAlarm));
        assert_eq!(hw.expirations(TimerId::Timeout), 1);
    }

    #[test]
    fn test_missed_periods_are_counted() {
        let mut hw = HostHardware::new();
        hw.init_timer(TimerId::Elapsed, IrqSource::ElapsedTick).unwrap();
        hw.set_timer_repeating(TimerId::Elapsed, 5 * MS).unwrap();
        thread::sleep(Duration::from_millis(23));

        // Nobody took the interrupt, yet every period is on the count
        assert!(hw.expirations(TimerId::Elapsed) >= 4);
        assert!(hw.read_timer(TimerId::Elapsed) <= 5 * MS);
        assert_eq!(hw.take_pending(None), Some(IrqSource::ElapsedTick));
    }

    #[test]
    fn test_timeouts_on_real_clock() {
        let config = KernelConfig::default().with_tick_ns(10 * MS);
        let hw = HostHardware::new();
        let stop = hw.stop_handle();
        let mut k = Kernel::new(hw, config).unwrap();

        let fired: Arc<Mutex<Vec<Time>>> = Arc::default();
        let log = fired.clone();
        k.start(
            move |cx: &mut Context<'_, HostHardware>| -> Result<(), KernelError> {
                let now = cx.now()?;
                if cx.initial() {
                    return cx.init_alt([Guard::timeout(now + 20 * MS).activated()]);
                }
                let mut log = log.lock();
                log.push(now);
                if log.len() == 3 {
                    cx.terminate();
                    return Ok(());
                }
                cx.set_timeout(0, now + 20 * MS)
            },
            3,
        )
        .unwrap();
        k.run().unwrap();
        stop.stop();

        let fired = fired.lock();
        assert_eq!(fired.len(), 3);
        assert!(fired[0] >= 20 * MS);
        assert!(fired.windows(2).all(|w| w[1] - w[0] >= 20 * MS), "{fired:?}");
        assert!(k.stats().interrupts >= 3);
    }

    #[test]
    fn test_timeout_preempts_long_step() {
        let origin = Instant::now();
        let config = KernelConfig::default().with_tick_ns(10 * MS);
        let mut k = Kernel::new(HostHardware::new(), config).unwrap();
        let urgent = Sample::default();
        let busy = Sample::default();

        let seen = urgent.clone();
        k.start(
            move |cx: &mut Context<'_, HostHardware>| -> Result<(), KernelError> {
                if cx.initial() {
                    let now = cx.now()?;
                    return cx.init_alt([Guard::timeout(now + 20 * MS).activated()]);
                }
                *seen.lock() = Some((cx.now()?, origin.elapsed()));
                cx.terminate();
                Ok(())
            },
            7,
        )
        .unwrap();
        let seen = busy.clone();
        k.start(
            move |cx: &mut Context<'_, HostHardware>| -> Result<(), KernelError> {
                while origin.elapsed() < Duration::from_millis(300) {
                    std::hint::spin_loop();
                }
                *seen.lock() = Some((cx.now()?, origin.elapsed()));
                cx.terminate();
                Ok(())
            },
            1,
        )
        .unwrap();
        k.run().unwrap();

        // The urgent process ran while the busy step was still spinning
        let (now, wall) = urgent.lock().unwrap();
        assert!(now >= 20 * MS, "{now}");
        assert!(wall < Duration::from_millis(200), "{wall:?}");

        // Ticks delivered during the long step kept the clock on time
        let (now, wall) = busy.lock().unwrap();
        assert!(nanos(wall).abs_diff(now) < 10 * MS, "now {now}, wall {wall:?}");
        assert!(k.stats().reschedules >= 1);
        assert_eq!(k.processes(), 0);
    }

    #[test]
    fn test_rendezvous_between_step_threads() {
        let mut k = Kernel::new(HostHardware::new(), KernelConfig::default()).unwrap();
        let c = k.channel().unwrap();
        let got: Arc<Mutex<Vec<u64>>> = Arc::default();

        k.start(
            move |cx: &mut Context<'_, HostHardware>| -> Result<(), KernelError> {
                if cx.initial() {
                    cx.init_alt([Guard::output(c.output()).activated()])?;
                    return cx.offer(0, &0xfeed_u64);
                }
                cx.terminate();
                Ok(())
            },
            2,
        )
        .unwrap();
        let log = got.clone();
        k.start(
            move |cx: &mut Context<'_, HostHardware>| -> Result<(), KernelError> {
                if cx.initial() {
                    return cx.init_alt([Guard::input(c.input()).activated()]);
                }
                assert_eq!(cx.selected(), Some(0));
                log.lock().push(cx.received::<u64>(0)?);
                cx.terminate();
                Ok(())
            },
            1,
        )
        .unwrap();
        k.run().unwrap();

        assert_eq!(*got.lock(), [0xfeed]);
        assert_eq!(k.processes(), 0);
    }

    #[test]
    fn test_panicking_step_is_fatal() {
        let mut k = Kernel::new(HostHardware::new(), KernelConfig::default()).unwrap();
        k.start(
            |_: &mut Context<'_, HostHardware>| -> Result<(), KernelError> {
                panic!("step gave up");
            },
            1,
        )
        .unwrap();

        let fault = KernelError::Hardware {
            call: "process step",
        };
        assert_eq!(k.run(), Err(fault.clone()));
        assert_eq!(k.hardware().faults, [fault]);
    }

    #[test]
    fn test_stop_handle_ends_run() {
        let hw = HostHardware::new();
        let stop = hw.stop_handle();
        let mut k = Kernel::new(hw, KernelConfig::default()).unwrap();
        let c = k.channel().unwrap();
        k.start(
            move |cx: &mut Context<'_, HostHardware>| -> Result<(), KernelError> {
                cx.init_alt([Guard::input(c.input()).activated()])
            },
            1,
        )
        .unwrap();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stop.stop();
        });
        k.run().unwrap();
        stopper.join().unwrap();
        assert_eq!(k.processes(), 1);
    }
}
