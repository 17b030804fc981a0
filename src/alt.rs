//! Alternation — two-phase resolution of a guard set
//!
//! Enable walks the active guards in scan order and registers the process
//! with each channel, timeout and interrupt until one is found ready.
//! Disable walks back over exactly the guards enable touched, withdrawing
//! every registration; the ready guard nearest the scan start is selected.
//! A fair ALT starts each scan just past its last selection, a priority
//! ALT always starts at branch 0.
//!
//! Interrupts are masked around each individual guard check only, so a
//! more urgent process may run between two guards of the same scan.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;

use log::trace;

use crate::channel::{ChanIn, ChanOut, Channel};
use crate::error::KernelError;
use crate::hardware::Hardware;
use crate::kernel::Kernel;
use crate::process::Pid;
use crate::timer::Time;

/// What a guard waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    /// Input from a channel
    Input(Channel),
    /// Output to a channel
    Output(Channel),
    /// Always ready
    Skip,
    /// Absolute time reached
    Timeout(Time),
    /// User interrupt delivered on an interrupt channel
    Interrupt(Channel),
}

/// One branch of an ALT. New guards are inactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    kind: GuardKind,
    active: bool,
    /// Bytes offered (output) or received (input)
    pub(crate) data: Vec<u8>,
    /// Interrupts observed at selection (interrupt guards)
    pub(crate) count: u32,
}

impl Guard {
    const fn new(kind: GuardKind) -> Self {
        Self {
            kind,
            active: false,
            data: Vec::new(),
            count: 0,
        }
    }

    pub const fn input(chan: ChanIn) -> Self {
        Self::new(GuardKind::Input(chan.channel()))
    }

    pub const fn output(chan: ChanOut) -> Self {
        Self::new(GuardKind::Output(chan.channel()))
    }

    pub const fn skip() -> Self {
        Self::new(GuardKind::Skip)
    }

    /// Ready once elapsed time reaches `time`
    pub const fn timeout(time: Time) -> Self {
        Self::new(GuardKind::Timeout(time))
    }

    /// Ready once the user interrupt wired to `chan` has occurred
    pub const fn interrupt(chan: ChanIn) -> Self {
        Self::new(GuardKind::Interrupt(chan.channel()))
    }

    /// The same guard, active
    pub fn activated(mut self) -> Self {
        self.active = true;
        self
    }

    pub fn kind(&self) -> GuardKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Stage bytes for output
    pub(crate) fn stage(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    /// Become `guard`, keeping this guard's transfer buffer
    fn replace(&mut self, guard: Guard) {
        let mut data = core::mem::take(&mut self.data);
        if guard.data.is_empty() {
            data.clear();
        } else {
            data.clone_from(&guard.data);
        }
        *self = Guard { data, ..guard };
    }
}

/// A process's guard set and selection state
#[derive(Debug, Clone, Default)]
pub struct Alternation {
    guards: Vec<Guard>,
    /// Where the last scan stopped, or the selected branch
    pub(crate) index: usize,
    /// Guards examined by the last scan, minus one
    pub(crate) count: usize,
    /// Branch chosen by the last completed ALT
    selected: Option<usize>,
    prioritized: bool,
}

impl Alternation {
    /// Replace the guard set.
    ///
    /// The guard vector and the transfer buffers of replaced guards are
    /// kept, so re-arming an ALT of the same shape allocates nothing. A
    /// fair ALT's first scan starts at branch 0.
    pub(crate) fn reset<I>(&mut self, guards: I, prioritized: bool)
    where
        I: IntoIterator<Item = Guard>,
    {
        let mut n = 0;
        for guard in guards {
            match self.guards.get_mut(n) {
                Some(slot) => slot.replace(guard),
                None => self.guards.push(guard),
            }
            n += 1;
        }
        self.guards.truncate(n);
        self.prioritized = prioritized;
        self.index = if prioritized { 0 } else { n.saturating_sub(1) };
        self.count = 0;
        self.selected = None;
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Branch chosen by the last completed ALT, `None` before the first
    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn guard(&self, i: usize) -> Result<&Guard, KernelError> {
        self.guards.get(i).ok_or(KernelError::NoSuchGuard(i))
    }

    pub fn guard_mut(&mut self, i: usize) -> Result<&mut Guard, KernelError> {
        self.guards.get_mut(i).ok_or(KernelError::NoSuchGuard(i))
    }

    /// Replace branch `i`, keeping its active flag
    pub fn set_guard(&mut self, i: usize, mut guard: Guard) -> Result<(), KernelError> {
        let slot = self.guard_mut(i)?;
        guard.active = slot.active;
        slot.replace(guard);
        Ok(())
    }

    /// An active output guard must be the only active guard
    fn check_outputs(&self) -> Result<(), KernelError> {
        let active = self.guards.iter().filter(|g| g.active);
        let outputs = active
            .clone()
            .filter(|g| matches!(g.kind, GuardKind::Output(_)))
            .count();
        if outputs > 0 && active.count() > 1 {
            return Err(KernelError::MultipleOutputGuards);
        }
        Ok(())
    }

    fn scan_start(&self) -> usize {
        if self.prioritized || self.guards.is_empty() {
            0
        } else {
            next(self.index, self.guards.len())
        }
    }

    fn entry(&self, i: usize) -> (bool, GuardKind) {
        let guard = &self.guards[i];
        (guard.active, guard.kind)
    }
}

const fn next(i: usize, n: usize) -> usize {
    (i + 1) % n
}

const fn prev(i: usize, n: usize) -> usize {
    (i + n - 1) % n
}

impl<H: Hardware> Kernel<H> {
    /// Phase 1: register `pid` with its active guards in scan order,
    /// stopping at the first ready one.
    ///
    /// Called with interrupts enabled, returns with them disabled.
    /// Yields readiness and the partner to ready, if any.
    pub(crate) fn enable_alt(&mut self, pid: Pid) -> Result<(bool, Option<Pid>), KernelError> {
        let (n, start) = {
            let alt = &self.procs.record(pid)?.alt;
            alt.check_outputs()?;
            (alt.len(), alt.scan_start())
        };

        let mut partner = None;
        let mut i = start;
        for k in 0..n {
            let (active, kind) = self.procs.record(pid)?.alt.entry(i);
            if active {
                self.disable_interrupts();
                let ready = match kind {
                    GuardKind::Input(chan) => {
                        let (ready, outputter) = self.channels.enable_input(chan, pid)?;
                        partner = outputter.or(partner);
                        ready
                    }
                    GuardKind::Output(chan) => {
                        partner = self.channels.enable_output(chan, pid, i)?;
                        false
                    }
                    GuardKind::Skip => true,
                    GuardKind::Timeout(time) => self.enable_timeout(time, pid)?,
                    GuardKind::Interrupt(chan) => self.channels.enable_interrupt(chan, pid)?,
                };
                if ready {
                    let alt = &mut self.procs.record_mut(pid)?.alt;
                    alt.index = i;
                    alt.count = k;
                    trace!("{pid:?} enable: branch {i} ready");
                    return Ok((true, partner));
                }
                self.enable_interrupts()?;
            }
            i = next(i, n);
        }

        self.disable_interrupts();
        let alt = &mut self.procs.record_mut(pid)?.alt;
        if n > 0 {
            alt.index = prev(i, n);
            alt.count = n - 1;
        }
        trace!("{pid:?} enable: nothing ready");
        Ok((false, partner))
    }

    /// Phase 2: withdraw every registration made by phase 1 and select
    /// the ready branch nearest the scan start.
    ///
    /// Called with interrupts enabled. Returns the outputter to ready when
    /// the selected branch is an input.
    pub(crate) fn disable_alt(&mut self, pid: Pid) -> Result<Option<Pid>, KernelError> {
        let (n, mut i, count) = {
            let alt = &self.procs.record(pid)?.alt;
            (alt.len(), alt.index, alt.count)
        };
        if n == 0 {
            return Err(KernelError::NoReadyBranch);
        }

        let mut selected = None;
        for _ in 0..=count {
            let (active, kind) = self.procs.record(pid)?.alt.entry(i);
            if active {
                let ready = match kind {
                    GuardKind::Input(chan) => {
                        self.critical(|k| k.channels.disable_input(chan, pid))??
                    }
                    GuardKind::Output(_) | GuardKind::Skip => true,
                    GuardKind::Timeout(time) => self.critical(|k| k.disable_timeout(time, pid))?,
                    GuardKind::Interrupt(chan) => {
                        self.critical(|k| k.channels.disable_interrupt(chan, pid))??
                    }
                };
                if ready {
                    selected = Some(i);
                }
            }
            i = prev(i, n);
        }

        let branch = selected.ok_or(KernelError::NoReadyBranch)?;
        let kind = {
            let alt = &mut self.procs.record_mut(pid)?.alt;
            alt.index = branch;
            alt.selected = Some(branch);
            alt.guards[branch].kind
        };
        trace!("{pid:?} disable: selected branch {branch}");

        match kind {
            GuardKind::Input(chan) => self.critical(|k| k.complete_input(pid, branch, chan))?,
            GuardKind::Interrupt(chan) => {
                let count = self.critical(|k| k.channels.take_count(chan))??;
                self.procs.record_mut(pid)?.alt.guard_mut(branch)?.count = count;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Copy the waiting outputter's offer into the selected input guard
    fn complete_input(
        &mut self,
        pid: Pid,
        branch: usize,
        chan: Channel,
    ) -> Result<Option<Pid>, KernelError> {
        let offer = self
            .channels
            .take_offer(chan)?
            .ok_or(KernelError::NoReadyBranch)?;

        let mut buf = core::mem::take(&mut self.procs.record_mut(pid)?.alt.guard_mut(branch)?.data);
        buf.clear();
        buf.extend_from_slice(self.procs.record(offer.pid)?.alt.guard(offer.branch)?.data());
        self.procs.record_mut(pid)?.alt.guard_mut(branch)?.data = buf;
        Ok(Some(offer.pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    use crate::config::KernelConfig;
    use crate::hardware::SimulatedHardware;
    use crate::kernel::Context;

    type TestKernel = Kernel<SimulatedHardware>;

    fn noop(_: &mut Context<'_, SimulatedHardware>) -> Result<(), KernelError> {
        Ok(())
    }

    fn setup() -> TestKernel {
        Kernel::new(SimulatedHardware::new(), KernelConfig::default()).unwrap()
    }

    fn fair(guards: Vec<Guard>) -> Alternation {
        let mut alt = Alternation::default();
        alt.reset(guards, false);
        alt
    }

    fn prioritized(guards: Vec<Guard>) -> Alternation {
        let mut alt = Alternation::default();
        alt.reset(guards, true);
        alt
    }

    fn with_alt(k: &mut TestKernel, alt: Alternation) -> Pid {
        let pid = k.start(noop, 1).unwrap();
        k.procs.record_mut(pid).unwrap().alt = alt;
        pid
    }

    /// Run both phases and return the selected branch
    fn select(k: &mut TestKernel, pid: Pid) -> usize {
        let (ready, _) = k.enable_alt(pid).unwrap();
        assert!(ready);
        k.enable_interrupts().unwrap();
        k.disable_alt(pid).unwrap();
        k.procs.record(pid).unwrap().alt.selected().unwrap()
    }

    #[test]
    fn test_guards_start_inactive() {
        let g = Guard::skip();
        assert!(!g.is_active());
        assert!(g.activated().is_active());
    }

    #[test]
    fn test_set_guard_keeps_active_flag() {
        let mut alt = fair(vec![Guard::timeout(5).activated()]);
        alt.set_guard(0, Guard::timeout(9)).unwrap();
        assert!(alt.guard(0).unwrap().is_active());
        assert_eq!(alt.guard(0).unwrap().kind(), GuardKind::Timeout(9));
        assert_eq!(alt.set_guard(1, Guard::skip()), Err(KernelError::NoSuchGuard(1)));
    }

    #[test]
    fn test_nothing_selected_before_first_alt() {
        let alt = fair(vec![Guard::skip().activated()]);
        assert_eq!(alt.selected(), None);

        let mut k = setup();
        let pid = with_alt(&mut k, alt);
        assert_eq!(select(&mut k, pid), 0);
        k.procs.record_mut(pid).unwrap().alt.reset([Guard::skip()], false);
        assert_eq!(k.procs.record(pid).unwrap().alt.selected(), None);
    }

    #[test]
    fn test_reset_reuses_transfer_buffers() {
        let mut k = setup();
        let c = k.channel().unwrap();
        let mut alt = fair(vec![Guard::output(c.output()).activated()]);
        alt.guard_mut(0).unwrap().stage(&[7; 48]);
        let buffer = alt.guard(0).unwrap().data().as_ptr();

        alt.reset([Guard::output(c.output()).activated()], false);
        assert!(alt.guard(0).unwrap().data().is_empty());
        alt.guard_mut(0).unwrap().stage(&[9; 32]);
        assert_eq!(alt.guard(0).unwrap().data().as_ptr(), buffer);

        alt.set_guard(0, Guard::output(c.output())).unwrap();
        alt.guard_mut(0).unwrap().stage(&[1; 16]);
        assert_eq!(alt.guard(0).unwrap().data().as_ptr(), buffer);
        assert!(alt.guard(0).unwrap().is_active());
    }

    #[test]
    fn test_fair_alt_round_robin() {
        let mut k = setup();
        let guards = vec![Guard::skip().activated(), Guard::skip().activated()];
        let pid = with_alt(&mut k, fair(guards));

        let picks: Vec<usize> = (0..6).map(|_| select(&mut k, pid)).collect();
        assert_eq!(picks, [0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_priority_alt_always_lowest_ready() {
        let mut k = setup();
        let guards = vec![Guard::skip().activated(), Guard::skip().activated()];
        let pid = with_alt(&mut k, prioritized(guards));

        for _ in 0..4 {
            assert_eq!(select(&mut k, pid), 0);
        }
    }

    #[test]
    fn test_inactive_guards_are_skipped() {
        let mut k = setup();
        let guards = vec![Guard::skip(), Guard::skip().activated()];
        let pid = with_alt(&mut k, prioritized(guards));
        assert_eq!(select(&mut k, pid), 1);
    }

    #[test]
    fn test_disable_withdraws_unselected_input() {
        let mut k = setup();
        let c = k.channel().unwrap();
        let guards = vec![Guard::input(c.input()).activated(), Guard::skip().activated()];
        let pid = with_alt(&mut k, prioritized(guards));

        assert_eq!(select(&mut k, pid), 1);
        assert_eq!(k.channels.waiting(c), Ok(None));
    }

    #[test]
    fn test_nothing_ready_leaves_process_registered() {
        let mut k = setup();
        let c = k.channel().unwrap();
        let guards = vec![
            Guard::input(c.input()).activated(),
            Guard::timeout(5_000).activated(),
        ];
        let pid = with_alt(&mut k, fair(guards));

        assert_eq!(k.enable_alt(pid).unwrap(), (false, None));
        assert_eq!(k.channels.waiting(c), Ok(Some(pid)));
        assert_eq!(k.timeouts.len(), 1);
        let alt = &k.procs.record(pid).unwrap().alt;
        assert_eq!((alt.index, alt.count), (1, 1));
    }

    #[test]
    fn test_output_must_be_alone() {
        let mut k = setup();
        let c = k.channel().unwrap();
        let guards = vec![Guard::output(c.output()).activated(), Guard::skip().activated()];
        let pid = with_alt(&mut k, fair(guards));
        assert_eq!(k.enable_alt(pid), Err(KernelError::MultipleOutputGuards));
    }

    #[test]
    fn test_rendezvous_copies_offer_once() {
        let mut k = setup();
        let c = k.channel().unwrap();

        let mut out = Guard::output(c.output()).activated();
        out.stage(&123u32.to_le_bytes());
        let tx = with_alt(&mut k, fair(vec![out]));
        let rx = with_alt(
            &mut k,
            fair(vec![Guard::input(c.input()).activated()]),
        );

        // Outputter never completes on its own
        assert_eq!(k.enable_alt(tx).unwrap(), (false, None));
        k.enable_interrupts().unwrap();

        assert_eq!(k.enable_alt(rx).unwrap(), (true, Some(tx)));
        k.enable_interrupts().unwrap();
        assert_eq!(k.disable_alt(rx).unwrap(), Some(tx));

        let got = k.procs.record(rx).unwrap().alt.guard(0).unwrap().data().to_vec();
        assert_eq!(got, 123u32.to_le_bytes());
        assert_eq!(k.channels.waiting(c), Ok(None));

        // The outputter's branch is now selected
        assert_eq!(k.disable_alt(tx).unwrap(), None);
    }

    #[test]
    fn test_empty_alt_never_ready() {
        let mut k = setup();
        let pid = with_alt(&mut k, fair(Vec::new()));
        assert_eq!(k.enable_alt(pid).unwrap(), (false, None));
        k.enable_interrupts().unwrap();
        assert_eq!(k.disable_alt(pid), Err(KernelError::NoReadyBranch));
    }
}
