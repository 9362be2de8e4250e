//! Block-list heap allocator.
//!
//! This module provides the general-purpose boot heap: a single arena carved
//! into variable-sized blocks that are chained in a doubly-linked list in
//! address order. Every block, free or in use, starts with a [`BlockHeader`]
//! embedded in the arena itself.
//!
//! # Algorithm
//!
//! - **Allocation**: requests are rounded up to a multiple of the header size
//!   and served **first-fit** by walking the list from the start of the arena.
//! - **Splitting**: if the chosen block leaves more than
//!   `split_factor * HEADER_SIZE` bytes unused, the tail becomes a new free
//!   block. Otherwise the whole block is handed out.
//! - **Release**: the block is marked free and immediately merged with a free
//!   successor, then with a free predecessor. After every call no two free
//!   blocks are adjacent.
//! - **Resize**: shrinks in place, grows in place by absorbing a free
//!   successor, or relocates and copies.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────┬──────────────┬────────┬──────────────┬────────┬─────────────┐
//! │ header │ payload      │ header │ payload      │ header │ payload     │
//! │ (used) │              │ (free) │              │ (used) │             │
//! └────────┴──────────────┴────────┴──────────────┴────────┴─────────────┘
//! ^ arena start                                              arena end ^
//! ```
//!
//! Neighbour links are byte offsets from the arena start rather than raw
//! pointers. Every header is bounds checked and its links cross-checked
//! before it is trusted, so a corrupted header is reported as
//! [`HeapError::Corrupted`] instead of being followed.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::block_list::BlockHeap;
//!
//! let mut arena = vec![0u8; 4096];
//! let mut heap = BlockHeap::new();
//! unsafe {
//!     heap.init(arena.as_mut_ptr(), arena.len()).unwrap();
//! }
//!
//! let ptr = heap.allocate(100).unwrap();
//! unsafe {
//!     heap.release(ptr).unwrap();
//! }
//! assert!(heap.check().is_ok());
//! ```

use core::{
    alloc::Layout,
    ptr::{self, NonNull},
};

use snafu::{OptionExt as _, Snafu, ensure};

/// Size of the header embedded in front of every block.
///
/// Payload sizes and block addresses are always multiples of this value.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Alignment guaranteed for every payload returned by [`BlockHeap`].
pub const ALIGNMENT: usize = HEADER_SIZE;

/// Default number of header sizes a leftover must exceed to be split off.
pub const DEFAULT_SPLIT_FACTOR: usize = 2;

const FREE_TAG: u64 = 0x4652_4545_424c_4f4b;
const USED_TAG: u64 = 0x5553_4544_424c_4f4b;
const NO_LINK: u64 = u64::MAX;

/// Errors reported by [`BlockHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum HeapError {
    #[snafu(display("heap is not initialized"))]
    NotInitialized,
    #[snafu(display("heap is already initialized"))]
    AlreadyInitialized,
    #[snafu(display("arena of {size} bytes cannot hold a block"))]
    ArenaTooSmall { size: usize },
    #[snafu(display("out of memory: no free block for {requested} bytes"))]
    OutOfMemory { requested: usize },
    #[snafu(display("allocation size overflows: {count} x {size} bytes"))]
    SizeOverflow { count: usize, size: usize },
    #[snafu(display("alignment of {align} bytes is not supported"))]
    UnsupportedAlignment { align: usize },
    #[snafu(display("double free of block at heap offset {offset:#x}"))]
    DoubleFree { offset: usize },
    #[snafu(display("pointer {addr:#x} was not allocated from this heap"))]
    ForeignPointer { addr: usize },
    #[snafu(display("heap corruption detected at offset {offset:#x}"))]
    Corrupted { offset: usize },
}

impl HeapError {
    /// Returns `true` if the heap can no longer be trusted after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree { .. } | Self::ForeignPointer { .. } | Self::Corrupted { .. }
        )
    }
}

/// Metadata stored in front of every block.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    /// [`FREE_TAG`] or [`USED_TAG`]; anything else is not a header.
    tag: u64,
    /// Payload size in bytes, excluding this header.
    size: u64,
    /// Offset of the previous block, or [`NO_LINK`].
    previous: u64,
    /// Offset of the next block, or [`NO_LINK`].
    next: u64,
}
const _: () = assert!(size_of::<BlockHeader>() == 32);
const _: () = assert!(size_of::<BlockHeader>() == align_of::<BlockHeader>());

fn encode_link(link: Option<usize>) -> u64 {
    link.map_or(NO_LINK, |offset| offset as u64)
}

fn decode_link(raw: u64) -> Option<usize> {
    if raw == NO_LINK {
        return None;
    }
    Some(usize::try_from(raw).unwrap_or(usize::MAX))
}

impl BlockHeader {
    const ERASED: Self = Self {
        tag: 0,
        size: 0,
        previous: 0,
        next: 0,
    };

    fn new(free: bool, size: usize, previous: Option<usize>, next: Option<usize>) -> Self {
        Self {
            tag: if free { FREE_TAG } else { USED_TAG },
            size: size as u64,
            previous: encode_link(previous),
            next: encode_link(next),
        }
    }

    fn is_free(&self) -> bool {
        self.tag == FREE_TAG
    }

    fn set_free(&mut self, free: bool) {
        self.tag = if free { FREE_TAG } else { USED_TAG };
    }

    fn size(&self) -> usize {
        usize::try_from(self.size).unwrap_or(usize::MAX)
    }

    fn set_size(&mut self, size: usize) {
        self.size = size as u64;
    }

    fn previous(&self) -> Option<usize> {
        decode_link(self.previous)
    }

    fn set_previous(&mut self, previous: Option<usize>) {
        self.previous = encode_link(previous);
    }

    fn next(&self) -> Option<usize> {
        decode_link(self.next)
    }

    fn set_next(&mut self, next: Option<usize>) {
        self.next = encode_link(next);
    }
}

/// A snapshot of one block, as seen by [`BlockHeap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block header from the arena start.
    pub offset: usize,
    /// Payload size in bytes, excluding the header.
    pub size: usize,
    /// Whether the block is free.
    pub free: bool,
}

impl BlockInfo {
    /// Offset one past the end of the block's payload.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + HEADER_SIZE + self.size
    }
}

/// Usage summary returned by [`BlockHeap::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub arena_size: usize,
    pub blocks: usize,
    pub used: usize,
    pub free: usize,
    pub largest_free: usize,
}

/// Rounds a request up to the payload size actually reserved for it.
fn payload_size(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(HEADER_SIZE)
}

/// A first-fit heap over a single fixed arena.
///
/// The heap is `Send` but not `Sync`; callers that share it must wrap it in a
/// lock.
#[derive(Debug)]
pub struct BlockHeap {
    base: *mut u8,
    arena_size: usize,
    split_factor: usize,
}

unsafe impl Send for BlockHeap {}

impl Default for BlockHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHeap {
    /// Creates an uninitialized heap with [`DEFAULT_SPLIT_FACTOR`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_split_factor(DEFAULT_SPLIT_FACTOR)
    }

    /// Creates an uninitialized heap that splits a block only when the
    /// leftover exceeds `split_factor` header sizes.
    #[must_use]
    pub const fn with_split_factor(split_factor: usize) -> Self {
        Self {
            base: ptr::null_mut(),
            arena_size: 0,
            split_factor,
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    /// Size of the managed arena after alignment, in bytes.
    #[must_use]
    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    #[must_use]
    pub fn split_factor(&self) -> usize {
        self.split_factor
    }

    /// Changes the split threshold for subsequent allocations.
    pub fn set_split_factor(&mut self, split_factor: usize) {
        self.split_factor = split_factor;
    }

    /// Takes ownership of `start..start + size` as the heap arena.
    ///
    /// The start is aligned up and the size aligned down to [`HEADER_SIZE`].
    /// The whole arena becomes one free block.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `start..start + size` is valid for reads and writes
    /// - the region is not used by anything else for the lifetime of the heap
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) -> Result<(), HeapError> {
        ensure!(!self.is_initialized(), AlreadyInitializedSnafu);
        ensure!(!start.is_null(), ArenaTooSmallSnafu { size: 0_usize });

        let align_offset = start.align_offset(HEADER_SIZE);
        let arena_size = size.saturating_sub(align_offset) / HEADER_SIZE * HEADER_SIZE;
        ensure!(arena_size >= 2 * HEADER_SIZE, ArenaTooSmallSnafu { size });

        self.base = start.wrapping_add(align_offset);
        self.arena_size = arena_size;
        self.store(
            0,
            BlockHeader::new(true, arena_size - HEADER_SIZE, None, None),
        )
    }

    /// Allocates at least `size` bytes.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`]. Running out of memory
    /// is reported as [`HeapError::OutOfMemory`] and leaves the heap as it was.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        ensure!(self.is_initialized(), NotInitializedSnafu);
        let payload = payload_size(size).context(SizeOverflowSnafu {
            count: 1_usize,
            size,
        })?;

        let Some((offset, mut header)) = self.find_free_block(payload)? else {
            return OutOfMemorySnafu { requested: size }.fail();
        };
        header.set_free(false);
        if self.should_split(&header, payload) {
            self.insert_free_block(offset, &mut header, payload)?;
        }
        self.store(offset, header)?;
        self.payload_ptr(offset)
    }

    /// Allocates memory for `layout`.
    ///
    /// Alignments above [`ALIGNMENT`] are rejected.
    pub fn allocate_layout(&mut self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        ensure!(
            layout.align() <= ALIGNMENT,
            UnsupportedAlignmentSnafu {
                align: layout.align()
            }
        );
        self.allocate(layout.size())
    }

    /// Allocates `count * size` bytes and zero-fills the whole block.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let total = count
            .checked_mul(size)
            .context(SizeOverflowSnafu { count, size })?;
        let ptr = self.allocate(total)?;
        let (_offset, header) = self.used_block(ptr)?;
        unsafe {
            ptr.as_ptr().write_bytes(0, header.size());
        }
        Ok(ptr)
    }

    /// Changes the size of the allocation at `ptr` to `new_size` bytes.
    ///
    /// The first `min(old size, new_size)` bytes are preserved. On error the
    /// original allocation is left untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by this heap and has not been released
    /// - if a different pointer is returned, `ptr` is not used afterwards
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        ensure!(self.is_initialized(), NotInitializedSnafu);
        let (offset, mut header) = self.used_block(ptr)?;
        let payload = payload_size(new_size).context(SizeOverflowSnafu {
            count: 1_usize,
            size: new_size,
        })?;

        if payload <= header.size() {
            if self.should_split(&header, payload) {
                self.insert_free_block(offset, &mut header, payload)?;
                self.store(offset, header)?;
            }
            return Ok(ptr);
        }

        if let Some(next) = header.next() {
            let next_header = self.load(next)?;
            let combined = header.size() + HEADER_SIZE + next_header.size();
            if next_header.is_free() && combined >= payload {
                header.set_size(combined);
                header.set_next(next_header.next());
                self.relink_previous(next_header.next(), Some(offset))?;
                self.erase(next)?;
                if self.should_split(&header, payload) {
                    self.insert_free_block(offset, &mut header, payload)?;
                }
                self.store(offset, header)?;
                return Ok(ptr);
            }
        }

        let new_ptr = self.allocate(new_size)?;
        let len = header.size().min(new_size);
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), len);
            self.release(ptr)?;
        }
        Ok(new_ptr)
    }

    /// Releases the allocation at `ptr` and merges it with free neighbours.
    ///
    /// Releasing a block twice is reported as [`HeapError::DoubleFree`];
    /// pointers that do not belong to the heap as
    /// [`HeapError::ForeignPointer`]. Both are fatal for the caller.
    ///
    /// # Safety
    ///
    /// The caller must not access the memory behind `ptr` afterwards.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        ensure!(self.is_initialized(), NotInitializedSnafu);
        let (offset, mut header) = self.used_block(ptr)?;
        header.set_free(true);
        self.store(offset, header)?;
        self.coalesce(offset)
    }

    /// Returns the number of usable bytes behind an allocation.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        ensure!(self.is_initialized(), NotInitializedSnafu);
        let (_offset, header) = self.used_block(ptr)?;
        Ok(header.size())
    }

    /// Returns `true` if `ptr` points into the arena.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.is_initialized()
            && ptr
                .addr()
                .checked_sub(self.base.addr())
                .is_some_and(|offset| offset < self.arena_size)
    }

    /// Iterates over all blocks in address order.
    ///
    /// Iteration stops early at a corrupted header; use
    /// [`check`](Self::check) to find out why.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            next: self.is_initialized().then_some(0),
        }
    }

    /// Summarizes the current usage of the arena.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_size: self.arena_size,
            ..HeapStats::default()
        };
        for block in self.blocks() {
            stats.blocks += 1;
            if block.free {
                stats.free += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used += block.size;
            }
        }
        stats
    }

    /// Walks the whole list and validates every structural invariant.
    ///
    /// Checks that headers are in bounds and tagged, that the list is
    /// address-ordered and contiguous, that back links match, that the
    /// blocks cover the arena exactly and that no two free blocks are
    /// adjacent.
    pub fn check(&self) -> Result<(), HeapError> {
        ensure!(self.is_initialized(), NotInitializedSnafu);
        let mut offset = 0;
        let mut previous = None;
        let mut previous_free = false;
        loop {
            let header = self.load(offset)?;
            ensure!(header.previous() == previous, CorruptedSnafu { offset });
            ensure!(!(previous_free && header.is_free()), CorruptedSnafu { offset });
            previous = Some(offset);
            previous_free = header.is_free();
            match self.successor(offset, &header)? {
                Some(next) => offset = next,
                None => return Ok(()),
            }
        }
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn header_ptr(&self, offset: usize) -> *mut BlockHeader {
        self.base.wrapping_add(offset).cast::<BlockHeader>()
    }

    fn check_offset(&self, offset: usize) -> Result<(), HeapError> {
        let in_bounds = offset
            .checked_add(HEADER_SIZE)
            .is_some_and(|end| end <= self.arena_size);
        ensure!(
            in_bounds && offset.is_multiple_of(HEADER_SIZE),
            CorruptedSnafu { offset }
        );
        Ok(())
    }

    fn load(&self, offset: usize) -> Result<BlockHeader, HeapError> {
        self.check_offset(offset)?;
        let header = unsafe { self.header_ptr(offset).read() };
        ensure!(
            header.tag == FREE_TAG || header.tag == USED_TAG,
            CorruptedSnafu { offset }
        );
        let fits = usize::try_from(header.size)
            .ok()
            .and_then(|size| (offset + HEADER_SIZE).checked_add(size))
            .is_some_and(|end| end <= self.arena_size);
        ensure!(
            fits && header.size().is_multiple_of(HEADER_SIZE),
            CorruptedSnafu { offset }
        );
        Ok(header)
    }

    fn store(&mut self, offset: usize, header: BlockHeader) -> Result<(), HeapError> {
        self.check_offset(offset)?;
        unsafe {
            self.header_ptr(offset).write(header);
        }
        Ok(())
    }

    fn erase(&mut self, offset: usize) -> Result<(), HeapError> {
        self.store(offset, BlockHeader::ERASED)
    }

    fn payload_ptr(&self, offset: usize) -> Result<NonNull<u8>, HeapError> {
        NonNull::new(self.base.wrapping_add(offset + HEADER_SIZE)).context(CorruptedSnafu { offset })
    }

    /// Returns the offset of the block following `offset`, validating that it
    /// starts exactly where this block ends.
    fn successor(&self, offset: usize, header: &BlockHeader) -> Result<Option<usize>, HeapError> {
        let end = offset + HEADER_SIZE + header.size();
        match header.next() {
            Some(next) => {
                ensure!(next == end && end < self.arena_size, CorruptedSnafu { offset });
                Ok(Some(next))
            }
            None => {
                ensure!(end == self.arena_size, CorruptedSnafu { offset });
                Ok(None)
            }
        }
    }

    fn relink_previous(
        &mut self,
        block: Option<usize>,
        previous: Option<usize>,
    ) -> Result<(), HeapError> {
        if let Some(offset) = block {
            let mut header = self.load(offset)?;
            header.set_previous(previous);
            self.store(offset, header)?;
        }
        Ok(())
    }

    fn find_free_block(&self, payload: usize) -> Result<Option<(usize, BlockHeader)>, HeapError> {
        let mut offset = 0;
        loop {
            let header = self.load(offset)?;
            if header.is_free() && header.size() >= payload {
                return Ok(Some((offset, header)));
            }
            match self.successor(offset, &header)? {
                Some(next) => offset = next,
                None => return Ok(None),
            }
        }
    }

    fn should_split(&self, header: &BlockHeader, payload: usize) -> bool {
        header.size() - payload > self.split_factor.saturating_mul(HEADER_SIZE)
    }

    /// Shrinks the block at `offset` to `payload` bytes and turns the rest
    /// into a free block right behind it.
    ///
    /// A free successor is absorbed into the new block immediately. The
    /// caller stores `header` afterwards.
    fn insert_free_block(
        &mut self,
        offset: usize,
        header: &mut BlockHeader,
        payload: usize,
    ) -> Result<(), HeapError> {
        let new_offset = offset + HEADER_SIZE + payload;
        let mut new_block = BlockHeader::new(
            true,
            header.size() - payload - HEADER_SIZE,
            Some(offset),
            header.next(),
        );

        if let Some(next) = header.next() {
            let next_header = self.load(next)?;
            if next_header.is_free() {
                new_block.set_size(new_block.size() + HEADER_SIZE + next_header.size());
                new_block.set_next(next_header.next());
                self.erase(next)?;
            }
        }
        self.relink_previous(new_block.next(), Some(new_offset))?;

        header.set_size(payload);
        header.set_next(Some(new_offset));
        self.store(new_offset, new_block)
    }

    fn coalesce(&mut self, mut offset: usize) -> Result<(), HeapError> {
        loop {
            let header = self.load(offset)?;
            let Some(next) = self.successor(offset, &header)? else {
                break;
            };
            if !self.load(next)?.is_free() {
                break;
            }
            self.fuse(offset, next)?;
        }
        loop {
            let header = self.load(offset)?;
            let Some(previous) = header.previous() else {
                break;
            };
            if !self.load(previous)?.is_free() {
                break;
            }
            self.fuse(previous, offset)?;
            offset = previous;
        }
        Ok(())
    }

    /// Merges the block at `second` into the block at `first` in front of it.
    fn fuse(&mut self, first: usize, second: usize) -> Result<(), HeapError> {
        let mut head = self.load(first)?;
        let tail = self.load(second)?;
        ensure!(
            head.next() == Some(second) && tail.previous() == Some(first),
            CorruptedSnafu { offset: second }
        );

        head.set_size(head.size() + HEADER_SIZE + tail.size());
        head.set_next(tail.next());
        self.relink_previous(tail.next(), Some(first))?;
        self.erase(second)?;
        self.store(first, head)
    }

    /// Resolves a pointer returned by [`allocate`](Self::allocate) to its
    /// in-use block, rejecting anything else.
    fn used_block(&self, ptr: NonNull<u8>) -> Result<(usize, BlockHeader), HeapError> {
        let addr = ptr.addr().get();
        let offset = addr
            .checked_sub(self.base.addr())
            .and_then(|offset| offset.checked_sub(HEADER_SIZE))
            .filter(|&offset| self.check_offset(offset).is_ok())
            .context(ForeignPointerSnafu { addr })?;

        let tag = unsafe { self.header_ptr(offset).read() }.tag;
        if tag != USED_TAG {
            return Err(self.classify_unused(addr, offset, tag));
        }

        let header = self.load(offset)?;
        self.verify_links(offset, &header)?;
        Ok((offset, header))
    }

    fn classify_unused(&self, addr: usize, offset: usize, tag: u64) -> HeapError {
        if tag == FREE_TAG {
            return HeapError::DoubleFree { offset };
        }
        // The header may have been absorbed into a free neighbour already.
        let absorbed = self
            .blocks()
            .any(|block| block.free && block.offset < offset && offset < block.end());
        if absorbed {
            HeapError::DoubleFree { offset }
        } else {
            HeapError::ForeignPointer { addr }
        }
    }

    fn verify_links(&self, offset: usize, header: &BlockHeader) -> Result<(), HeapError> {
        match header.previous() {
            Some(previous) => {
                let previous_header = self.load(previous)?;
                ensure!(
                    self.successor(previous, &previous_header)? == Some(offset),
                    CorruptedSnafu { offset }
                );
            }
            None => ensure!(offset == 0, CorruptedSnafu { offset }),
        }
        if let Some(next) = self.successor(offset, header)? {
            ensure!(
                self.load(next)?.previous() == Some(offset),
                CorruptedSnafu { offset: next }
            );
        }
        Ok(())
    }
}

/// Iterator returned by [`BlockHeap::blocks`].
#[derive(Debug)]
pub struct Blocks<'a> {
    heap: &'a BlockHeap,
    next: Option<usize>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        let header = self.heap.load(offset).ok()?;
        self.next = self.heap.successor(offset, &header).ok().flatten();
        Some(BlockInfo {
            offset,
            size: header.size(),
            free: header.is_free(),
        })
    }
}
