//! Priority scheduler — ready queues and the run loop
//!
//! One FIFO per priority level, with an occupancy mask for an O(1)
//! highest-ready query. Level 0 holds the idle process and is never
//! empty.
//!
//! Preemption is expressed as nesting: when an interrupt or a partner
//! readies a process more urgent than the running one, `schedule` is
//! entered again with the running priority as its base, runs everything
//! above that base to its next block point, and returns to the
//! interrupted level.
//!
//! Author: Moroya Sakamoto

use alloc::collections::VecDeque;

use log::{trace, warn};

use crate::config::NUM_PRIORITIES;
use crate::error::KernelError;
use crate::hardware::Hardware;
use crate::kernel::Kernel;
use crate::process::{Pid, Priority, ProcState};

/// Per-priority FIFO ready queues
pub struct ReadyQueues {
    queues: [VecDeque<Pid>; NUM_PRIORITIES],
    /// Bit `p` set iff level `p` is non-empty
    mask: u8,
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            mask: 0,
        }
    }

    /// Append to the tail of its level
    pub fn append(&mut self, pid: Pid, priority: Priority) {
        let level = priority.level();
        self.queues[level].push_back(pid);
        self.mask |= 1 << level;
    }

    /// Remove the head of `level`
    pub fn take(&mut self, level: usize) -> Option<Pid> {
        let queue = &mut self.queues[level];
        let pid = queue.pop_front()?;
        if queue.is_empty() {
            self.mask &= !(1 << level);
        }
        Some(pid)
    }

    /// Most urgent non-empty level (0 if none)
    pub fn highest_ready(&self) -> usize {
        let m = self.mask;
        if m & 0b1111_0000 != 0 {
            if m & 0b1100_0000 != 0 {
                if m & 0b1000_0000 != 0 {
                    7
                } else {
                    6
                }
            } else if m & 0b0010_0000 != 0 {
                5
            } else {
                4
            }
        } else if m & 0b0000_1100 != 0 {
            if m & 0b0000_1000 != 0 {
                3
            } else {
                2
            }
        } else if m & 0b0000_0010 != 0 {
            1
        } else {
            0
        }
    }
}

impl Default for ReadyQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hardware> Kernel<H> {
    /// Priority of the running process (idle if it has been reclaimed)
    pub(crate) fn current_priority(&self) -> Priority {
        self.procs
            .get(self.current)
            .map_or(Priority::IDLE, |rec| rec.priority)
    }

    /// Run ready processes more urgent than `base` until none remain.
    ///
    /// `None` is the outermost invocation, which also drives the idle
    /// process and returns only when the kernel stops. Called and returns
    /// with interrupts disabled.
    pub(crate) fn schedule(&mut self, base: Option<Priority>) -> Result<(), KernelError> {
        let mut cursor: Option<Pid> = None;
        loop {
            let pid = match cursor {
                Some(pid) => pid,
                None => {
                    let highest = self.ready.highest_ready();
                    if base.is_some_and(|b| highest <= b.level()) {
                        return Ok(());
                    }
                    if highest == Priority::IDLE.level() {
                        if !self.idle_turn()? {
                            return Ok(());
                        }
                        continue;
                    }
                    let Some(pid) = self.ready.take(highest) else {
                        return Ok(());
                    };
                    self.procs.record_mut(pid)?.queued = false;
                    if self.current != pid {
                        self.stats.context_switches += 1;
                    }
                    cursor = Some(pid);
                    pid
                }
            };
            self.current = pid;
            let state = self.procs.record(pid)?.state;
            self.enable_interrupts()?;

            let mut execute = false;
            let mut partner = None;
            match state {
                ProcState::Initial => {
                    self.run_step(pid)?;
                    let rec = self.procs.record_mut(pid)?;
                    if rec.state != ProcState::Done {
                        rec.state = ProcState::Quiescent;
                    }
                }
                ProcState::Quiescent => {
                    self.procs.record_mut(pid)?.state = ProcState::Enabling;
                    let (ready, outputter) = self.enable_alt(pid)?;
                    partner = outputter;

                    let rec = self.procs.record_mut(pid)?;
                    if rec.state == ProcState::Enabling {
                        rec.state = if ready {
                            ProcState::Ready
                        } else {
                            ProcState::Waiting
                        };
                    }
                    let state = rec.state;
                    self.enable_interrupts()?;

                    if state == ProcState::Ready {
                        partner = self.disable_alt(pid)?;
                        execute = true;
                        self.procs.record_mut(pid)?.state = ProcState::Quiescent;
                    }
                }
                ProcState::Ready => {
                    partner = self.disable_alt(pid)?;
                    execute = true;
                    self.procs.record_mut(pid)?.state = ProcState::Quiescent;
                }
                ProcState::Enabling | ProcState::Waiting | ProcState::Done => {
                    warn!("{pid:?} scheduled in state {state:?}");
                }
            }

            if let Some(partner) = partner {
                self.disable_interrupts();
                self.ready_if_necessary(partner)?;
                self.enable_interrupts()?;
            }

            if execute {
                self.run_step(pid)?;
            }

            self.disable_interrupts();
            let (state, queued) = {
                let rec = self.procs.record(pid)?;
                (rec.state, rec.queued)
            };
            match state {
                ProcState::Done => {
                    self.reclaim(pid)?;
                    cursor = None;
                }
                ProcState::Waiting => cursor = None,
                // Readied again meanwhile: it runs from its queue
                ProcState::Ready if queued => cursor = None,
                _ => {}
            }
        }
    }

    /// Make `pid` ready if it is enabling or waiting.
    ///
    /// A waiting process is queued; outside interrupt handlers it runs
    /// at once if it is more urgent than the current process. Interrupts
    /// must be disabled.
    pub(crate) fn ready_if_necessary(&mut self, pid: Pid) -> Result<(), KernelError> {
        let Some(rec) = self.procs.get_mut(pid) else {
            warn!("readying reclaimed process {pid:?}");
            return Ok(());
        };
        match rec.state {
            ProcState::Enabling => rec.state = ProcState::Ready,
            ProcState::Waiting => {
                rec.state = ProcState::Ready;
                let priority = rec.priority;
                if !rec.queued {
                    rec.queued = true;
                    self.ready.append(pid, priority);
                }
                trace!("{pid:?} ready at {priority:?}");

                let running = self.current_priority();
                if !self.irq.in_handler() && priority > running {
                    let interrupted = self.current;
                    self.stats.preemptions += 1;
                    self.schedule(Some(running))?;
                    self.current = interrupted;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::hardware::SimulatedHardware;
    use crate::kernel::Context;

    fn noop(_: &mut Context<'_, SimulatedHardware>) -> Result<(), KernelError> {
        Ok(())
    }

    fn pids(n: usize) -> alloc::vec::Vec<Pid> {
        let mut k = Kernel::new(SimulatedHardware::new(), KernelConfig::default()).unwrap();
        (0..n).map(|_| k.start(noop, 1).unwrap()).collect()
    }

    #[test]
    fn test_highest_ready_empty_is_zero() {
        assert_eq!(ReadyQueues::new().highest_ready(), 0);
    }

    #[test]
    fn test_highest_ready_every_mask() {
        let mut q = ReadyQueues::new();
        for mask in 0..=u8::MAX {
            q.mask = mask;
            let expected = if mask == 0 { 0 } else { 7 - mask.leading_zeros() as usize };
            assert_eq!(q.highest_ready(), expected, "mask {mask:#010b}");
        }
    }

    #[test]
    fn test_fifo_within_level() {
        let p = pids(3);
        let mut q = ReadyQueues::new();
        q.append(p[0], Priority(3));
        q.append(p[1], Priority(3));
        q.append(p[2], Priority(5));

        assert_eq!(q.highest_ready(), 5);
        assert_eq!(q.take(5), Some(p[2]));
        assert_eq!(q.highest_ready(), 3);
        assert_eq!(q.take(3), Some(p[0]));
        assert_eq!(q.take(3), Some(p[1]));
        assert_eq!(q.mask, 0);
        assert_eq!(q.take(3), None);
    }

    #[test]
    fn test_ready_if_necessary_only_readies_enabling_or_waiting() {
        let mut k = Kernel::new(SimulatedHardware::new(), KernelConfig::default()).unwrap();
        let pid = k.start(noop, 2).unwrap();
        let queued = k.ready.queues[2].len();

        // Quiescent processes are left alone
        k.procs.record_mut(pid).unwrap().state = ProcState::Quiescent;
        k.ready_if_necessary(pid).unwrap();
        assert_eq!(k.procs.record(pid).unwrap().state(), ProcState::Quiescent);
        assert_eq!(k.ready.queues[2].len(), queued);

        k.procs.record_mut(pid).unwrap().state = ProcState::Enabling;
        k.ready_if_necessary(pid).unwrap();
        assert_eq!(k.procs.record(pid).unwrap().state(), ProcState::Ready);
        assert_eq!(k.ready.queues[2].len(), queued);
    }

    #[test]
    fn test_waiting_process_is_queued_once() {
        let mut k = Kernel::new(SimulatedHardware::new(), KernelConfig::default()).unwrap();
        let low = k.start(noop, 2).unwrap();
        let high = k.start(noop, 7).unwrap();
        k.current = high;

        // Still on its queue from start
        k.procs.record_mut(low).unwrap().state = ProcState::Waiting;
        k.ready_if_necessary(low).unwrap();

        assert_eq!(k.procs.record(low).unwrap().state(), ProcState::Ready);
        assert_eq!(k.ready.queues[2].len(), 1);
    }
}
