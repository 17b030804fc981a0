//! Memory pool — fixed size classes over one backing arena
//!
//! Brinch Hansen's scheme: every allocation size the program can ask for
//! is known ahead of time and mapped to a class. Each class keeps a free
//! list of released blocks; a class with an empty list carves a fresh
//! block off the shrinking tail of the arena. Blocks are never split or
//! merged, so allocate and release are O(1) and fragmentation is bounded
//! by the class granularity.
//!
//! Every block starts on a `BLOCK_ALIGN` boundary, so the process table
//! can place control blocks and process bodies directly in it. Free-list
//! links live inside the released blocks themselves (first four bytes),
//! so the pool needs no side storage.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::{self, NonNull};

use crate::config::BLOCK_ALIGN;
use crate::error::KernelError;

/// End-of-list marker for intrusive free-list links
const NIL: u32 = u32::MAX;

/// A block handed out by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    offset: u32,
    class: u8,
}

impl Block {
    /// Byte offset of the block in the arena
    pub const fn offset(self) -> u32 {
        self.offset
    }

    /// Size class the block belongs to
    pub const fn class(self) -> u8 {
        self.class
    }
}

/// Fixed-size-class allocator
pub struct MemoryPool {
    /// Backing storage, owned; reassembled and freed in `Drop`
    base: NonNull<u8>,
    len: usize,
    /// First aligned offset
    start: u32,
    /// Block length of each class, ascending
    class_len: Vec<u32>,
    /// Head of each class's free list (offset or NIL)
    free_head: Vec<u32>,
    /// Start of the unallocated tail
    tail: u32,
    /// Blocks currently handed out
    in_use: usize,
}

impl MemoryPool {
    /// Create a pool over `arena` with the given ascending classes.
    ///
    /// Classes are validated by `KernelConfig::validate`. Up to
    /// `BLOCK_ALIGN - 1` leading bytes are skipped to align the first block.
    pub fn new(arena: Box<[u8]>, classes: &[u32]) -> Result<Self, KernelError> {
        let len = arena.len();
        let end = u32::try_from(len)
            .map_err(|_| KernelError::InvalidConfig("pool larger than 4 GiB"))?;
        let base = NonNull::from(Box::leak(arena)).cast::<u8>();
        let skew = base.as_ptr().align_offset(BLOCK_ALIGN);
        let start = u32::try_from(skew).map_or(end, |skew| skew.min(end));
        Ok(Self {
            base,
            len,
            start,
            class_len: classes.to_vec(),
            free_head: vec![NIL; classes.len()],
            tail: start,
            in_use: 0,
        })
    }

    /// Smallest class whose blocks hold `size` bytes
    pub fn class_for(&self, size: usize) -> Result<u8, KernelError> {
        self.class_len
            .iter()
            .position(|&len| len as usize >= size)
            .and_then(|i| u8::try_from(i).ok())
            .ok_or(KernelError::NoSizeClass(size))
    }

    /// Allocate a block of class `class`
    pub fn allocate(&mut self, class: u8) -> Result<Block, KernelError> {
        let idx = class as usize;
        let head = self.free_head[idx];
        let offset = if head != NIL {
            // Previously released block: unlink it
            self.free_head[idx] = self.read_link(head);
            head
        } else {
            let len = self.class_len[idx];
            if self.tail_len() < len as usize {
                return Err(KernelError::OutOfMemory);
            }
            let offset = self.tail;
            self.tail += len;
            offset
        };
        self.in_use += 1;
        Ok(Block { offset, class })
    }

    /// Return a block to its class's free list.
    ///
    /// Whatever value lived in the block must already be dropped.
    pub fn release(&mut self, block: Block) {
        let idx = block.class as usize;
        self.write_link(block.offset, self.free_head[idx]);
        self.free_head[idx] = block.offset;
        self.in_use -= 1;
    }

    /// Usable length of a block
    pub fn block_len(&self, block: Block) -> usize {
        self.class_len[block.class as usize] as usize
    }

    /// First byte of a block, aligned to `BLOCK_ALIGN`
    pub(crate) fn block_ptr(&self, block: Block) -> NonNull<u8> {
        debug_assert!(block.offset as usize + self.block_len(block) <= self.len);
        // SAFETY: blocks come from `allocate`, so the offset is inside the
        // arena and the pointer stays non-null
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block.offset as usize)) }
    }

    /// Does `addr` point into the arena?
    pub fn contains(&self, addr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        (base..base + self.len).contains(&(addr as usize))
    }

    /// Bytes carved from the tail so far
    pub fn carved(&self) -> usize {
        (self.tail - self.start) as usize
    }

    /// Bytes still available in the tail
    pub fn tail_len(&self) -> usize {
        self.len - self.tail as usize
    }

    /// Blocks currently allocated
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    fn read_link(&self, offset: u32) -> u32 {
        // SAFETY: released blocks are inside the arena, at least
        // BLOCK_ALIGN long and hold no live value
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<u32>()
                .read_unaligned()
        }
    }

    fn write_link(&mut self, offset: u32, next: u32) {
        // SAFETY: as for `read_link`
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<u32>()
                .write_unaligned(next);
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        // SAFETY: `base` and `len` are exactly what `Box::leak` gave up in `new`
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.len)) });
    }
}
