//! Fixed-size object pool.
//!
//! A [`Slab`] divides a region into equally sized slots and tracks their
//! occupancy in a bitmap. All bookkeeping lives at the start of the region
//! itself:
//!
//! ```text
//! ┌────────────┬────────┬─────────┬────────┬────────┬─────┬────────┐
//! │ SlabHeader │ bitmap │ padding │ slot 0 │ slot 1 │ ... │ slot n │
//! └────────────┴────────┴─────────┴────────┴────────┴─────┴────────┘
//! ^ region start        ^ rounded up to the object size
//! ```
//!
//! Allocation is a linear scan for the first clear bit, which is fine for
//! the small pools used during boot.

use core::ptr::NonNull;

use snafu::{Snafu, ensure};

use crate::bitmap::{self, Bitmap};

/// Errors reported by [`Slab`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SlabError {
    #[snafu(display("region of {size} bytes has no room for {object_size}-byte slots"))]
    RegionTooSmall { size: usize, object_size: usize },
    #[snafu(display("object size must not be zero"))]
    InvalidObjectSize,
    #[snafu(display("slab region at {addr:#x} is not aligned for its header"))]
    Misaligned { addr: usize },
    #[snafu(display("all slots are in use"))]
    Full,
    #[snafu(display("address {addr:#x} is not a slot of this slab"))]
    ForeignAddress { addr: usize },
    #[snafu(display("slot {index} is already free"))]
    DoubleFree { index: usize },
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SlabHeader {
    allocation_size: usize,
    num_entries: usize,
    bitmap_size: usize,
}

const SLAB_HEADER_SIZE: usize = size_of::<SlabHeader>();

/// A pool of fixed-size slots backed by a caller-provided region.
#[derive(Debug)]
pub struct Slab {
    header: NonNull<SlabHeader>,
}

unsafe impl Send for Slab {}

impl Slab {
    /// Lays out a slab over `start..start + size` holding `object_size`-byte
    /// objects.
    ///
    /// Slots that would overlap the header and bitmap are subtracted from the
    /// naive `size / object_size` count. All slots start out free.
    ///
    /// # Safety
    ///
    /// `start..start + size` must be valid for reads and writes and must not
    /// be used by anything else while the slab is alive.
    pub unsafe fn init(start: *mut u8, size: usize, object_size: usize) -> Result<Self, SlabError> {
        ensure!(object_size > 0, InvalidObjectSizeSnafu);
        let header = NonNull::new(start.cast::<SlabHeader>())
            .filter(|header| header.is_aligned())
            .ok_or(SlabError::Misaligned { addr: start.addr() })?;

        let raw_entries = size / object_size;
        let overhead = SLAB_HEADER_SIZE + bitmap::byte_len(raw_entries);
        let num_entries = raw_entries.saturating_sub(overhead.div_ceil(object_size));
        ensure!(num_entries > 0, RegionTooSmallSnafu { size, object_size });

        let mut slab = Self { header };
        unsafe {
            header.write(SlabHeader {
                allocation_size: object_size,
                num_entries,
                bitmap_size: bitmap::byte_len(num_entries),
            });
        }
        slab.bitmap_mut().clear_all();
        Ok(slab)
    }

    fn header(&self) -> SlabHeader {
        unsafe { self.header.read() }
    }

    fn base(&self) -> *mut u8 {
        self.header.as_ptr().cast()
    }

    fn bitmap(&self) -> Bitmap<&[u8]> {
        let len = self.header().bitmap_size;
        let bytes = unsafe { core::slice::from_raw_parts(self.base().add(SLAB_HEADER_SIZE), len) };
        Bitmap::new(bytes)
    }

    fn bitmap_mut(&mut self) -> Bitmap<&mut [u8]> {
        let len = self.header().bitmap_size;
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(self.base().add(SLAB_HEADER_SIZE), len)
        };
        Bitmap::new(bytes)
    }

    #[must_use]
    pub fn object_size(&self) -> usize {
        self.header().allocation_size
    }

    /// Number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.header().num_entries
    }

    #[must_use]
    pub fn bitmap_size(&self) -> usize {
        self.header().bitmap_size
    }

    /// Offset of slot 0 from the region start.
    #[must_use]
    pub fn overhead(&self) -> usize {
        let header = self.header();
        (SLAB_HEADER_SIZE + header.bitmap_size).next_multiple_of(header.allocation_size)
    }

    /// Number of slots currently allocated.
    #[must_use]
    pub fn in_use(&self) -> usize {
        let capacity = self.capacity();
        self.bitmap().count_set(capacity)
    }

    /// Returns the address of slot `index`, or `None` if out of range.
    #[must_use]
    pub fn slot_address(&self, index: usize) -> Option<NonNull<u8>> {
        if index >= self.capacity() {
            return None;
        }
        let offset = self.overhead() + index * self.object_size();
        NonNull::new(self.base().wrapping_add(offset))
    }

    /// Returns the slot index of `addr`, the inverse of
    /// [`slot_address`](Self::slot_address).
    pub fn slot_index(&self, addr: NonNull<u8>) -> Result<usize, SlabError> {
        let addr = addr.addr().get();
        let object_size = self.object_size();
        let index = addr
            .checked_sub(self.base().addr() + self.overhead())
            .filter(|offset| offset.is_multiple_of(object_size))
            .map(|offset| offset / object_size)
            .filter(|&index| index < self.capacity());
        index.ok_or(SlabError::ForeignAddress { addr })
    }

    /// Allocates the first free slot.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, SlabError> {
        let capacity = self.capacity();
        let mut bitmap = self.bitmap_mut();
        let index = bitmap.first_clear(capacity).ok_or(SlabError::Full)?;
        bitmap.set(index);
        self.slot_address(index).ok_or(SlabError::Full)
    }

    /// Returns the slot at `addr` to the pool.
    ///
    /// # Safety
    ///
    /// The caller must not access the slot afterwards.
    pub unsafe fn release(&mut self, addr: NonNull<u8>) -> Result<(), SlabError> {
        let index = self.slot_index(addr)?;
        let mut bitmap = self.bitmap_mut();
        ensure!(bitmap.get(index), DoubleFreeSnafu { index });
        bitmap.clear(index);
        Ok(())
    }
}
