//! Kernel — the concurrency engine as one value
//!
//! Owns the process table (and with it the memory pool), ready queues,
//! channels, timer queue and interrupt layer, all driven over one
//! `Hardware`. Process steps see the kernel through a `Context`, which
//! carries the process's own identity.
//!
//! A step normally runs on the kernel's stack and its `Context` calls
//! straight into the kernel. A backend that runs steps on threads of
//! their own hands the step a remote `Context` instead: every call is
//! posted to the kernel thread, which serves it between interrupts.
//!
//! Author: Moroya Sakamoto

#[cfg(feature = "std")]
use alloc::boxed::Box;
#[cfg(feature = "std")]
use alloc::sync::Arc;
use core::mem::size_of;

use bytemuck::Pod;
use log::{debug, info};

use crate::alt::Guard;
use crate::channel::{ChanIn, Channel, ChannelTable};
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::hardware::Hardware;
use crate::interrupt::{user_interrupt, InterruptLayer, IrqSource};
use crate::memory::MemoryPool;
use crate::process::{Pid, Priority, ProcState, Process, ProcessRecord, ProcessTable};
use crate::scheduler::ReadyQueues;
use crate::timer::{Clock, Time, TimerQueue};

/// Kernel execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Processes started
    pub started: u64,
    /// Processes terminated and reclaimed
    pub terminated: u64,
    /// Process steps executed
    pub steps: u64,
    /// Switches between distinct processes
    pub context_switches: u64,
    /// Partners run ahead of the process that readied them
    pub preemptions: u64,
    /// Interrupts delivered
    pub interrupts: u64,
    /// Outermost interrupt exits that ran the scheduler
    pub reschedules: u64,
}

/// CSP kernel over hardware `H`
pub struct Kernel<H: Hardware> {
    pub(crate) hw: H,
    pub(crate) procs: ProcessTable<H>,
    pub(crate) ready: ReadyQueues,
    pub(crate) channels: ChannelTable,
    pub(crate) irq: InterruptLayer<H>,
    pub(crate) clock: Clock,
    pub(crate) timeouts: TimerQueue,
    /// Process whose step is running (or last ran)
    pub(crate) current: Pid,
    idle: Pid,
    /// Application processes not yet reclaimed
    live: usize,
    pub(crate) stats: KernelStats,
}

impl<H: Hardware> Kernel<H> {
    /// Bring up a kernel: memory pool, idle process, interrupt handlers
    /// and the elapsed-time tick. Interrupts stay masked until `run`.
    pub fn new(mut hw: H, config: KernelConfig) -> Result<Self, KernelError> {
        config.validate()?;
        hw.disable_interrupts();

        let arena = hw.allocate(config.pool_bytes)?;
        let mut procs = ProcessTable::new(MemoryPool::new(arena, &config.size_classes)?);
        let idle = procs.insert_idle()?;
        procs.record_mut(idle)?.queued = true;
        let mut ready = ReadyQueues::new();
        ready.append(idle, Priority::IDLE);

        let mut kernel = Self {
            hw,
            procs,
            ready,
            channels: ChannelTable::new(),
            irq: InterruptLayer::new(),
            clock: Clock::new(config.tick_ns),
            timeouts: TimerQueue::new(),
            current: idle,
            idle,
            live: 0,
            stats: KernelStats::default(),
        };

        for source in [IrqSource::User0, IrqSource::User1, IrqSource::User2] {
            kernel.irq.define_handler(source, user_interrupt);
        }
        kernel.timer_init()?;

        debug!(
            "kernel up: {} byte pool, {} classes, tick {} ns",
            config.pool_bytes,
            config.size_classes.len(),
            config.tick_ns
        );
        Ok(kernel)
    }

    /// Start a process at `priority` (1..=7).
    ///
    /// Control block and body are placed in one pool block and queued;
    /// the process first runs when the scheduler reaches it.
    pub fn start<P>(&mut self, process: P, priority: u8) -> Result<Pid, KernelError>
    where
        P: Process<H> + 'static,
    {
        let priority = Priority::new(priority)?;
        let pid = self.critical(|k| {
            let pid = k.procs.insert(process, priority)?;
            k.procs.record_mut(pid)?.queued = true;
            k.ready.append(pid, priority);
            k.live += 1;
            Ok::<Pid, KernelError>(pid)
        })??;
        self.stats.started += 1;
        debug!("start {pid:?} at {priority:?} ({} byte body)", size_of::<P>());
        Ok(pid)
    }

    /// Declare a channel
    pub fn channel(&mut self) -> Result<Channel, KernelError> {
        let chan = self.channels.create()?;
        debug!("channel {}", chan.id());
        Ok(chan)
    }

    /// Run the scheduler.
    ///
    /// Returns `Ok` once no application process remains or the hardware
    /// reports that no interrupt can arrive again. Any kernel error is
    /// passed to the hardware's fatal sink and returned.
    pub fn run(&mut self) -> Result<(), KernelError> {
        info!("run: {} processes", self.live);
        self.disable_interrupts();
        let result = self.schedule(None);
        self.disable_interrupts();
        match &result {
            Ok(()) => info!("stopped: {} processes left", self.live),
            Err(err) => self.hw.fatal(err),
        }
        result
    }

    /// Shut down and hand back the hardware
    pub fn teardown(mut self) -> H {
        self.disable_interrupts();
        debug!("teardown: {} processes dropped", self.live);
        self.hw
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Pool holding every process's control block and body
    pub fn pool(&self) -> &MemoryPool {
        self.procs.pool()
    }

    pub fn stats(&self) -> KernelStats {
        self.stats
    }

    /// Application processes not yet reclaimed
    pub fn processes(&self) -> usize {
        self.live
    }

    /// State of a live process
    pub fn state(&self, pid: Pid) -> Option<ProcState> {
        self.procs.get(pid).map(ProcessRecord::state)
    }

    /// One turn of the idle process: sleep until an interrupt and
    /// deliver it. Returns false when the kernel should stop.
    pub(crate) fn idle_turn(&mut self) -> Result<bool, KernelError> {
        self.current = self.idle;
        if self.live == 0 {
            return Ok(false);
        }
        if !self.hw.wait_for_interrupt() {
            debug!("hardware halted with {} processes waiting", self.live);
            return Ok(false);
        }
        self.enable_interrupts()?;
        self.disable_interrupts();
        Ok(true)
    }

    /// Run one step of `pid`'s body. Interrupts must be enabled.
    pub(crate) fn run_step(&mut self, pid: Pid) -> Result<(), KernelError> {
        let Some(mut body) = self.procs.record_mut(pid)?.body.take() else {
            return Ok(());
        };
        self.stats.steps += 1;
        // SAFETY: the body sits in the block of `pid`, which stays
        // allocated while the record lives, and a running process is never
        // reclaimed. With the pointer out of its record this is the only
        // reference until it is put back.
        let result = H::execute(self, pid, unsafe { body.as_mut() });
        if let Some(rec) = self.procs.get_mut(pid) {
            rec.body = Some(body);
        }
        result
    }

    /// Free a terminated process. Interrupts must be disabled.
    pub(crate) fn reclaim(&mut self, pid: Pid) -> Result<(), KernelError> {
        self.procs.remove(pid)?;
        self.live -= 1;
        self.stats.terminated += 1;
        debug!("{pid:?} terminated");
        Ok(())
    }

    /// Mark `pid` done; it is reclaimed once its step returns
    pub(crate) fn terminate(&mut self, pid: Pid) {
        if let Some(rec) = self.procs.get_mut(pid) {
            rec.state = ProcState::Done;
        }
    }

    pub(crate) fn guard_mut(&mut self, pid: Pid, i: usize) -> Result<&mut Guard, KernelError> {
        self.procs.record_mut(pid)?.alt.guard_mut(i)
    }

    /// What a step of `pid` may read without asking the kernel
    pub(crate) fn step_info(&self, pid: Pid) -> StepInfo {
        match self.procs.get(pid) {
            Some(rec) => StepInfo {
                priority: rec.priority,
                initial: rec.state == ProcState::Initial,
                selected: rec.alt.selected(),
            },
            None => StepInfo {
                priority: Priority::IDLE,
                initial: false,
                selected: None,
            },
        }
    }
}

/// Snapshot taken when a step starts; none of it changes during the step
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepInfo {
    priority: Priority,
    initial: bool,
    selected: Option<usize>,
}

/// Kernel work posted by a step running off the kernel thread
#[cfg(feature = "std")]
pub(crate) type Request<H> = Box<dyn FnOnce(&mut Kernel<H>) + Send>;

/// Where a remote step posts its requests
#[cfg(feature = "std")]
pub(crate) trait Mailbox<H: Hardware>: Send + Sync {
    /// Queue `request` for the kernel thread, in order
    fn post(&self, request: Request<H>);
}

enum Access<'k, H: Hardware> {
    /// Step on the kernel's own stack
    Local(&'k mut Kernel<H>),
    /// Step on a thread of its own
    #[cfg(feature = "std")]
    Remote(Arc<dyn Mailbox<H>>),
}

/// A process's view of the kernel during its step
pub struct Context<'k, H: Hardware> {
    access: Access<'k, H>,
    pid: Pid,
    info: StepInfo,
}

impl<'k, H: Hardware> Context<'k, H> {
    pub(crate) fn local(kernel: &'k mut Kernel<H>, pid: Pid) -> Self {
        let info = kernel.step_info(pid);
        Self {
            access: Access::Local(kernel),
            pid,
            info,
        }
    }

    #[cfg(feature = "std")]
    pub(crate) fn remote(mailbox: Arc<dyn Mailbox<H>>, pid: Pid, info: StepInfo) -> Self {
        Self {
            access: Access::Remote(mailbox),
            pid,
            info,
        }
    }

    /// Run `f` against the kernel, on the kernel thread
    fn call<R, F>(&mut self, f: F) -> Result<R, KernelError>
    where
        F: FnOnce(&mut Kernel<H>, Pid) -> Result<R, KernelError> + Send + 'static,
        R: Send + 'static,
    {
        let pid = self.pid;
        match self.access {
            Access::Local(ref mut kernel) => f(&mut **kernel, pid),
            #[cfg(feature = "std")]
            Access::Remote(ref mailbox) => {
                let (reply, answer) = std::sync::mpsc::sync_channel(1);
                mailbox.post(Box::new(move |kernel: &mut Kernel<H>| {
                    let _ = reply.send(f(kernel, pid));
                }));
                answer
                    .recv()
                    .map_err(|_| KernelError::Hardware { call: "step request" })?
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn priority(&self) -> Priority {
        self.info.priority
    }

    /// True only during the process's first step
    pub fn initial(&self) -> bool {
        self.info.initial
    }

    /// Branch selected by the ALT that led to this step, `None` before
    /// the first ALT
    pub fn selected(&self) -> Option<usize> {
        self.info.selected
    }

    /// End this process once the current step returns
    pub fn terminate(&mut self) {
        let pid = self.pid;
        match self.access {
            Access::Local(ref mut kernel) => kernel.terminate(pid),
            #[cfg(feature = "std")]
            Access::Remote(ref mailbox) => {
                mailbox.post(Box::new(move |kernel: &mut Kernel<H>| kernel.terminate(pid)));
            }
        }
    }

    /// Elapsed time
    pub fn now(&mut self) -> Result<Time, KernelError> {
        self.call(|k, _| Ok(k.now()))
    }

    /// Replace the guard set with fair (round-robin) selection
    pub fn init_alt<I>(&mut self, guards: I) -> Result<(), KernelError>
    where
        I: IntoIterator<Item = Guard>,
        I::IntoIter: Send + 'static,
    {
        let guards = guards.into_iter();
        self.call(move |k, pid| {
            k.procs.record_mut(pid)?.alt.reset(guards, false);
            Ok(())
        })
    }

    /// Replace the guard set with priority (lowest index first) selection
    pub fn init_alt_pri<I>(&mut self, guards: I) -> Result<(), KernelError>
    where
        I: IntoIterator<Item = Guard>,
        I::IntoIter: Send + 'static,
    {
        let guards = guards.into_iter();
        self.call(move |k, pid| {
            k.procs.record_mut(pid)?.alt.reset(guards, true);
            Ok(())
        })
    }

    /// Replace branch `i`, keeping its active flag
    pub fn set_guard(&mut self, i: usize, guard: Guard) -> Result<(), KernelError> {
        self.call(move |k, pid| k.procs.record_mut(pid)?.alt.set_guard(i, guard))
    }

    /// Re-arm timeout branch `i` for absolute time `time`
    pub fn set_timeout(&mut self, i: usize, time: Time) -> Result<(), KernelError> {
        self.set_guard(i, Guard::timeout(time))
    }

    pub fn activate(&mut self, i: usize) -> Result<(), KernelError> {
        self.set_active(i, true)
    }

    pub fn deactivate(&mut self, i: usize) -> Result<(), KernelError> {
        self.set_active(i, false)
    }

    pub fn set_active(&mut self, i: usize, active: bool) -> Result<(), KernelError> {
        self.call(move |k, pid| {
            k.guard_mut(pid, i)?.set_active(active);
            Ok(())
        })
    }

    pub fn is_active(&mut self, i: usize) -> Result<bool, KernelError> {
        self.call(move |k, pid| Ok(k.guard_mut(pid, i)?.is_active()))
    }

    /// Stage `value` for output on branch `i`
    pub fn offer<T: Pod>(&mut self, i: usize, value: &T) -> Result<(), KernelError> {
        self.offer_bytes(i, bytemuck::bytes_of(value))
    }

    /// Stage raw bytes for output on branch `i` (empty for a pure signal)
    pub fn offer_bytes(&mut self, i: usize, bytes: &[u8]) -> Result<(), KernelError> {
        let pid = self.pid;
        match self.access {
            Access::Local(ref mut kernel) => {
                kernel.guard_mut(pid, i)?.stage(bytes);
                Ok(())
            }
            #[cfg(feature = "std")]
            Access::Remote(_) => {
                let bytes = bytes.to_vec();
                self.call(move |k, pid| {
                    k.guard_mut(pid, i)?.stage(&bytes);
                    Ok(())
                })
            }
        }
    }

    /// Value received on input branch `i`
    pub fn received<T: Pod>(&mut self, i: usize) -> Result<T, KernelError> {
        let mut value = T::zeroed();
        let len = self.received_bytes(i, bytemuck::bytes_of_mut(&mut value))?;
        if len != size_of::<T>() {
            return Err(KernelError::TransferSize {
                offered: len,
                expected: size_of::<T>(),
            });
        }
        Ok(value)
    }

    /// Copy the bytes received on input branch `i` into `buf`.
    /// Returns how many there were.
    pub fn received_bytes(&mut self, i: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let pid = self.pid;
        match self.access {
            Access::Local(ref mut kernel) => {
                copy_received(kernel.procs.record(pid)?.alt.guard(i)?.data(), buf)
            }
            #[cfg(feature = "std")]
            Access::Remote(_) => {
                let data =
                    self.call(move |k, pid| Ok(k.procs.record(pid)?.alt.guard(i)?.data().to_vec()))?;
                copy_received(&data, buf)
            }
        }
    }

    /// Interrupts observed when interrupt branch `i` was selected
    pub fn interrupt_count(&mut self, i: usize) -> Result<u32, KernelError> {
        self.call(move |k, pid| Ok(k.procs.record(pid)?.alt.guard(i)?.count()))
    }

    /// Start another process
    pub fn start<P>(&mut self, process: P, priority: u8) -> Result<Pid, KernelError>
    where
        P: Process<H> + 'static,
    {
        self.call(move |k, _| k.start(process, priority))
    }

    /// Declare a channel
    pub fn channel(&mut self) -> Result<Channel, KernelError> {
        self.call(|k, _| k.channel())
    }

    pub fn connect_interrupt(&mut self, chan: ChanIn, n: usize) -> Result<(), KernelError> {
        self.call(move |k, _| k.connect_interrupt(chan, n))
    }

    pub fn disconnect_interrupt(&mut self, n: usize) -> Result<(), KernelError> {
        self.call(move |k, _| k.disconnect_interrupt(n))
    }

    /// Raise user interrupt `n`; a process it readies runs before this
    /// call returns if it is more urgent
    pub fn send_software_interrupt(&mut self, n: usize) -> Result<(), KernelError> {
        self.call(move |k, _| k.send_software_interrupt(n))
    }
}

fn copy_received(data: &[u8], buf: &mut [u8]) -> Result<usize, KernelError> {
    let room = buf.len();
    let dest = buf.get_mut(..data.len()).ok_or(KernelError::TransferSize {
        offered: data.len(),
        expected: room,
    })?;
    dest.copy_from_slice(data);
    Ok(data.len())
}
