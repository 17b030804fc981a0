//! Channels — unbuffered rendezvous between exactly two processes
//!
//! A channel records at most one waiting process. Whoever arrives second
//! finds the first as its partner. The outputter always waits: its offer
//! stays staged in its own guard until the inputter disables and copies
//! it, so a value is transferred exactly once and never buffered.
//!
//! A channel wired to a user interrupt stops carrying data and counts
//! occurrences instead.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::process::Pid;

/// Channel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel(u32);

impl Channel {
    /// Input end
    pub const fn input(self) -> ChanIn {
        ChanIn(self)
    }

    /// Output end
    pub const fn output(self) -> ChanOut {
        ChanOut(self)
    }

    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Input end of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChanIn(Channel);

impl ChanIn {
    pub const fn channel(self) -> Channel {
        self.0
    }
}

/// Output end of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChanOut(Channel);

impl ChanOut {
    pub const fn channel(self) -> Channel {
        self.0
    }
}

/// Which end a process waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub pid: Pid,
    pub side: Side,
}

/// The outputter's guard staging the offered bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Offer {
    pub pid: Pid,
    pub branch: usize,
}

/// Per-channel state
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelState {
    waiting: Option<Waiter>,
    offer: Option<Offer>,
    /// Wired to a user interrupt
    interrupt: bool,
    /// Interrupts not yet observed
    count: u32,
}

/// All channels of one kernel
#[derive(Debug, Default)]
pub struct ChannelTable {
    states: Vec<ChannelState>,
}

impl ChannelTable {
    pub const fn new() -> Self {
        Self { states: Vec::new() }
    }

    /// Declare a fresh, empty channel
    pub fn create(&mut self) -> Result<Channel, KernelError> {
        let id = u32::try_from(self.states.len()).map_err(|_| KernelError::TooManyChannels)?;
        self.states.push(ChannelState::default());
        Ok(Channel(id))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn state(&self, chan: Channel) -> Result<&ChannelState, KernelError> {
        self.states
            .get(chan.0 as usize)
            .ok_or(KernelError::UnknownChannel(chan.0))
    }

    fn state_mut(&mut self, chan: Channel) -> Result<&mut ChannelState, KernelError> {
        self.states
            .get_mut(chan.0 as usize)
            .ok_or(KernelError::UnknownChannel(chan.0))
    }

    /// Data channel state, rejecting interrupt channels
    fn data_mut(&mut self, chan: Channel) -> Result<&mut ChannelState, KernelError> {
        let state = self.state_mut(chan)?;
        if state.interrupt {
            return Err(KernelError::InterruptChannelMisuse);
        }
        Ok(state)
    }

    /// Interrupt channel state, rejecting data channels
    fn interrupt_mut(&mut self, chan: Channel) -> Result<&mut ChannelState, KernelError> {
        let state = self.state_mut(chan)?;
        if !state.interrupt {
            return Err(KernelError::NotInterruptChannel);
        }
        Ok(state)
    }

    /// Process waiting on the channel, if any
    pub fn waiting(&self, chan: Channel) -> Result<Option<Pid>, KernelError> {
        Ok(self.state(chan)?.waiting.map(|w| w.pid))
    }

    /// Enable an input guard.
    ///
    /// Ready with the outputter as partner if one is waiting, otherwise
    /// `pid` waits in the channel.
    pub(crate) fn enable_input(
        &mut self,
        chan: Channel,
        pid: Pid,
    ) -> Result<(bool, Option<Pid>), KernelError> {
        let state = self.data_mut(chan)?;
        match state.waiting {
            None => {
                state.waiting = Some(Waiter {
                    pid,
                    side: Side::Input,
                });
                Ok((false, None))
            }
            Some(w) if w.pid == pid => Ok((false, None)),
            Some(w) if w.side == Side::Output => Ok((true, Some(w.pid))),
            Some(_) => Err(KernelError::ChannelEndBusy),
        }
    }

    /// Disable an input guard. Ready if an outputter is waiting.
    pub(crate) fn disable_input(&mut self, chan: Channel, pid: Pid) -> Result<bool, KernelError> {
        let state = self.data_mut(chan)?;
        match state.waiting {
            Some(w) if w.pid == pid => {
                state.waiting = None;
                Ok(false)
            }
            Some(w) => Ok(w.side == Side::Output),
            None => Ok(false),
        }
    }

    /// Enable an output guard.
    ///
    /// Never ready: the outputter waits until the inputter has copied the
    /// offer. Returns the inputter already waiting, if any.
    pub(crate) fn enable_output(
        &mut self,
        chan: Channel,
        pid: Pid,
        branch: usize,
    ) -> Result<Option<Pid>, KernelError> {
        let state = self.data_mut(chan)?;
        let partner = match state.waiting {
            Some(w) if w.side == Side::Output && w.pid != pid => {
                return Err(KernelError::ChannelEndBusy)
            }
            Some(w) if w.side == Side::Input => Some(w.pid),
            _ => None,
        };
        state.waiting = Some(Waiter {
            pid,
            side: Side::Output,
        });
        state.offer = Some(Offer { pid, branch });
        Ok(partner)
    }

    /// Complete a rendezvous: empty the channel and hand back the offer
    pub(crate) fn take_offer(&mut self, chan: Channel) -> Result<Option<Offer>, KernelError> {
        let state = self.data_mut(chan)?;
        state.waiting = None;
        Ok(state.offer.take())
    }

    /// Turn `chan` into an interrupt channel with a zero count
    pub(crate) fn make_interrupt(&mut self, chan: Channel) -> Result<(), KernelError> {
        let state = self.state_mut(chan)?;
        *state = ChannelState {
            interrupt: true,
            ..ChannelState::default()
        };
        Ok(())
    }

    /// Count one interrupt. Returns the process waiting for it, if any.
    pub(crate) fn record_interrupt(&mut self, chan: Channel) -> Option<Pid> {
        let state = self.states.get_mut(chan.0 as usize)?;
        state.count = state.count.saturating_add(1);
        state.waiting.map(|w| w.pid)
    }

    /// Enable an interrupt guard. Ready if interrupts have accumulated.
    pub(crate) fn enable_interrupt(&mut self, chan: Channel, pid: Pid) -> Result<bool, KernelError> {
        let state = self.interrupt_mut(chan)?;
        if state.count > 0 {
            return Ok(true);
        }
        match state.waiting {
            Some(w) if w.pid != pid => Err(KernelError::ChannelEndBusy),
            _ => {
                state.waiting = Some(Waiter {
                    pid,
                    side: Side::Input,
                });
                Ok(false)
            }
        }
    }

    /// Disable an interrupt guard. Ready if interrupts have accumulated.
    pub(crate) fn disable_interrupt(&mut self, chan: Channel, pid: Pid) -> Result<bool, KernelError> {
        let state = self.interrupt_mut(chan)?;
        if state.waiting.is_some_and(|w| w.pid == pid) {
            state.waiting = None;
        }
        Ok(state.count > 0)
    }

    /// Take the accumulated interrupt count, resetting it to zero
    pub(crate) fn take_count(&mut self, chan: Channel) -> Result<u32, KernelError> {
        let state = self.interrupt_mut(chan)?;
        Ok(core::mem::take(&mut state.count))
    }
}
