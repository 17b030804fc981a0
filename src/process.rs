//! Processes — control blocks, handles and the step abstraction
//!
//! A process is a value implementing `Process`: its fields are its local
//! state and `step` is its run-to-completion body, invoked once per
//! scheduling turn. Each process occupies one pool block: the control
//! block sits at the start, the body value right behind it. The table
//! maps generation-checked `Pid`s to those blocks, so a `Pid` from a
//! reclaimed process never resolves to the slot's next occupant.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::{self, NonNull};

use crate::alt::Alternation;
use crate::config::{BLOCK_ALIGN, PRI_DEFAULT, PRI_MAX, PRI_MIN};
use crate::error::KernelError;
use crate::hardware::Hardware;
use crate::kernel::Context;
use crate::memory::{Block, MemoryPool};

/// Process priority (higher number = more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// The idle process
    pub const IDLE: Priority = Priority(PRI_MIN);
    /// Least urgent application priority
    pub const LOW: Priority = Priority(PRI_DEFAULT);
    /// Most urgent application priority
    pub const HIGH: Priority = Priority(PRI_MAX);

    /// Application priority, validated to 1..=7
    pub fn new(level: u8) -> Result<Self, KernelError> {
        if (PRI_DEFAULT..=PRI_MAX).contains(&level) {
            Ok(Priority(level))
        } else {
            Err(KernelError::InvalidPriority(level))
        }
    }

    pub const fn level(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::LOW
    }
}

/// Scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Started, first step not yet run
    Initial,
    /// No ALT in progress
    Quiescent,
    /// ALT being enabled
    Enabling,
    /// ALT enabled, no branch ready
    Waiting,
    /// Some branch is ready
    Ready,
    /// Terminated, awaiting reclamation
    Done,
}

/// Process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid {
    slot: u32,
    generation: u32,
}

impl Pid {
    pub const fn slot(self) -> u32 {
        self.slot
    }
}

/// Run-to-completion process body.
///
/// Bodies are `Send` because a backend may run a step on a thread of its
/// own (see `Hardware::execute`).
pub trait Process<H: Hardware>: Send {
    /// One scheduling turn. Must not block.
    fn step(&mut self, cx: &mut Context<'_, H>) -> Result<(), KernelError>;
}

impl<H, F> Process<H> for F
where
    H: Hardware,
    F: FnMut(&mut Context<'_, H>) -> Result<(), KernelError> + Send,
{
    fn step(&mut self, cx: &mut Context<'_, H>) -> Result<(), KernelError> {
        self(cx)
    }
}

/// Process control block
pub struct ProcessRecord<H: Hardware> {
    /// Body in the same block; taken out while its step runs, absent for
    /// the idle process
    pub(crate) body: Option<NonNull<dyn Process<H>>>,
    pub(crate) alt: Alternation,
    pub(crate) priority: Priority,
    pub(crate) state: ProcState,
    /// Allocation holding this record and its body
    pub(crate) block: Block,
    /// On a ready queue right now
    pub(crate) queued: bool,
}

impl<H: Hardware> ProcessRecord<H> {
    fn new(body: Option<NonNull<dyn Process<H>>>, priority: Priority, block: Block) -> Self {
        Self {
            body,
            alt: Alternation::default(),
            priority,
            state: ProcState::Initial,
            block,
            queued: false,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ProcState {
        self.state
    }
}

/// Block layout of a process with body `P`: total size and body offset
pub(crate) fn footprint<H: Hardware, P>() -> Result<(usize, usize), KernelError> {
    let body = Layout::new::<P>();
    if body.align() > BLOCK_ALIGN {
        return Err(KernelError::UnsupportedAlignment(body.align()));
    }
    let (whole, offset) = Layout::new::<ProcessRecord<H>>()
        .extend(body)
        .map_err(|_| KernelError::NoSizeClass(usize::MAX))?;
    Ok((whole.size(), offset))
}

struct Slot<H: Hardware> {
    generation: u32,
    record: Option<NonNull<ProcessRecord<H>>>,
}

/// Generation-checked table of processes stored in the memory pool
pub struct ProcessTable<H: Hardware> {
    pool: MemoryPool,
    slots: Vec<Slot<H>>,
    free: Vec<u32>,
    live: usize,
}

impl<H: Hardware> ProcessTable<H> {
    pub fn new(pool: MemoryPool) -> Self {
        Self {
            pool,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Place `process` in a fresh block: control block first, body after
    pub fn insert<P>(&mut self, process: P, priority: Priority) -> Result<Pid, KernelError>
    where
        P: Process<H> + 'static,
    {
        let (size, offset) = footprint::<H, P>()?;
        let block = self.pool.allocate(self.pool.class_for(size)?)?;
        let base = self.pool.block_ptr(block);
        // SAFETY: the block is fresh, aligned to BLOCK_ALIGN (which covers
        // `P`) and at least `size` bytes long, so `offset` leaves room for
        // the body
        let body: NonNull<dyn Process<H>> = unsafe {
            let at = base.as_ptr().add(offset).cast::<P>();
            at.write(process);
            NonNull::new_unchecked(at)
        };
        Ok(self.place(block, base, Some(body), priority))
    }

    /// Place the body-less idle process
    pub fn insert_idle(&mut self) -> Result<Pid, KernelError> {
        let (size, _) = footprint::<H, ()>()?;
        let block = self.pool.allocate(self.pool.class_for(size)?)?;
        let base = self.pool.block_ptr(block);
        Ok(self.place(block, base, None, Priority::IDLE))
    }

    fn place(
        &mut self,
        block: Block,
        base: NonNull<u8>,
        body: Option<NonNull<dyn Process<H>>>,
        priority: Priority,
    ) -> Pid {
        let record = base.cast::<ProcessRecord<H>>();
        // SAFETY: start of a fresh block that `footprint` sized and aligned
        // for the record
        unsafe { record.as_ptr().write(ProcessRecord::new(body, priority, block)) };

        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.record = Some(record);
            return Pid {
                slot,
                generation: entry.generation,
            };
        }
        // Every slot holds a block of a pool under 4 GiB, so this fits
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        Pid {
            slot,
            generation: 0,
        }
    }

    /// Drop the record and body of `pid` and give its block back
    pub fn remove(&mut self, pid: Pid) -> Result<(), KernelError> {
        let entry = self
            .slots
            .get_mut(pid.slot as usize)
            .filter(|e| e.generation == pid.generation)
            .ok_or(KernelError::StaleProcess)?;
        let record = entry.record.take().ok_or(KernelError::StaleProcess)?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(pid.slot);
        self.live -= 1;

        // SAFETY: the slot owned the record and is now empty, so record
        // and body are dropped exactly once
        let block = unsafe { drop_record(record) };
        self.pool.release(block);
        Ok(())
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord<H>> {
        let record = self
            .slots
            .get(pid.slot as usize)
            .filter(|e| e.generation == pid.generation)?
            .record?;
        // SAFETY: a live slot points at an initialised record in the
        // pool, borrowed no longer than the table
        Some(unsafe { record.as_ref() })
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessRecord<H>> {
        let mut record = self
            .slots
            .get(pid.slot as usize)
            .filter(|e| e.generation == pid.generation)?
            .record?;
        // SAFETY: as for `get`, exclusive through `&mut self`
        Some(unsafe { record.as_mut() })
    }

    /// Control block of a live process
    pub fn record(&self, pid: Pid) -> Result<&ProcessRecord<H>, KernelError> {
        self.get(pid).ok_or(KernelError::StaleProcess)
    }

    /// Mutable control block of a live process
    pub fn record_mut(&mut self, pid: Pid) -> Result<&mut ProcessRecord<H>, KernelError> {
        self.get_mut(pid).ok_or(KernelError::StaleProcess)
    }

    /// Number of live records (idle included)
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// Drop a record and the body it owns, returning the block they used.
///
/// # Safety
///
/// `record` must point at a live record placed by `ProcessTable::place`
/// that nothing else will touch again.
unsafe fn drop_record<H: Hardware>(record: NonNull<ProcessRecord<H>>) -> Block {
    let rec = record.as_ptr();
    if let Some(body) = (*rec).body {
        ptr::drop_in_place(body.as_ptr());
    }
    let block = (*rec).block;
    ptr::drop_in_place(rec);
    block
}

impl<H: Hardware> Drop for ProcessTable<H> {
    fn drop(&mut self) {
        for entry in self.slots.iter_mut() {
            if let Some(record) = entry.record.take() {
                // SAFETY: each live slot is visited once; the pool itself
                // is freed after this
                unsafe { drop_record(record) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec;

    use crate::config::DEFAULT_SIZE_CLASSES;
    use crate::hardware::SimulatedHardware;

    type Sim = SimulatedHardware;
    type Table = ProcessTable<Sim>;

    fn table() -> Table {
        let arena = vec![0u8; 4096].into_boxed_slice();
        ProcessTable::new(MemoryPool::new(arena, &DEFAULT_SIZE_CLASSES).unwrap())
    }

    fn noop(_: &mut Context<'_, Sim>) -> Result<(), KernelError> {
        Ok(())
    }

    /// Holds a reference count so drops are observable
    struct Counted {
        _token: Arc<()>,
        _payload: [u64; 8],
    }

    impl Process<Sim> for Counted {
        fn step(&mut self, _: &mut Context<'_, Sim>) -> Result<(), KernelError> {
            Ok(())
        }
    }

    #[test]
    fn test_priority_validation() {
        assert_eq!(Priority::new(1), Ok(Priority::LOW));
        assert_eq!(Priority::new(7), Ok(Priority::HIGH));
        assert_eq!(Priority::new(0), Err(KernelError::InvalidPriority(0)));
        assert_eq!(Priority::new(8), Err(KernelError::InvalidPriority(8)));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::IDLE < Priority::LOW);
        assert!(Priority::LOW < Priority::HIGH);
    }

    #[test]
    fn test_new_record_is_initial() {
        let mut table = table();
        let pid = table.insert(noop, Priority(3)).unwrap();
        let rec = table.record(pid).unwrap();
        assert_eq!(rec.state(), ProcState::Initial);
        assert_eq!(rec.priority(), Priority(3));
        assert!(!rec.queued);
        assert!(rec.body.is_some());
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = table();
        let a = table.insert(noop, Priority(1)).unwrap();
        let b = table.insert(noop, Priority(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.record(b).unwrap().priority(), Priority(2));
    }

    #[test]
    fn test_record_and_body_live_in_their_block() {
        let mut table = table();
        let token = Arc::new(());
        let pid = table
            .insert(Counted { _token: token.clone(), _payload: [7; 8] }, Priority(2))
            .unwrap();

        let rec = table.record(pid).unwrap();
        let start = table.pool().block_ptr(rec.block).as_ptr() as usize;
        let end = start + table.pool().block_len(rec.block);
        let record_at = rec as *const ProcessRecord<Sim> as usize;
        let body_at = rec.body.unwrap().as_ptr() as *const u8 as usize;
        assert_eq!(record_at, start);
        assert!(body_at > record_at && body_at < end);
        assert_eq!(Arc::strong_count(&token), 2);
    }

    #[test]
    fn test_remove_drops_body_and_frees_block() {
        let mut table = table();
        let token = Arc::new(());
        let pid = table
            .insert(Counted { _token: token.clone(), _payload: [0; 8] }, Priority(2))
            .unwrap();
        assert_eq!(table.pool().in_use(), 1);

        table.remove(pid).unwrap();
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(table.pool().in_use(), 0);
        assert_eq!(table.remove(pid), Err(KernelError::StaleProcess));
    }

    #[test]
    fn test_dropping_table_drops_live_bodies() {
        let token = Arc::new(());
        {
            let mut table = table();
            table
                .insert(Counted { _token: token.clone(), _payload: [1; 8] }, Priority(4))
                .unwrap();
            table.insert_idle().unwrap();
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_overaligned_body_is_rejected() {
        #[repr(align(64))]
        struct Wide {
            _bytes: [u8; 64],
        }

        impl Process<Sim> for Wide {
            fn step(&mut self, _: &mut Context<'_, Sim>) -> Result<(), KernelError> {
                Ok(())
            }
        }

        let mut table = table();
        assert_eq!(
            table.insert(Wide { _bytes: [0; 64] }, Priority(1)).err(),
            Some(KernelError::UnsupportedAlignment(64))
        );
        assert_eq!(table.pool().in_use(), 0);
    }

    #[test]
    fn test_stale_pid_does_not_resolve_after_reuse() {
        let mut table = table();
        let old = table.insert(noop, Priority(1)).unwrap();
        table.remove(old).unwrap();
        let new = table.insert(noop, Priority(5)).unwrap();

        assert_eq!(old.slot(), new.slot());
        assert!(table.get(old).is_none());
        assert_eq!(table.record(old).err(), Some(KernelError::StaleProcess));
        assert_eq!(table.record(new).unwrap().priority(), Priority(5));
        assert_eq!(table.len(), 1);
    }
}
