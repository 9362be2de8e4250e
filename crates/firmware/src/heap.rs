//! The firmware heap.
//!
//! [`Heap`] is the handle every subsystem allocates from. It wraps a
//! [`BlockHeap`] in a spin lock and offers the classic
//! `malloc`/`calloc`/`realloc`/`free` quartet, plus two owning wrappers:
//!
//! - [`HeapBox`] holds a single value and releases its block on drop
//! - [`HeapVec`] is a growable array whose growth goes through `realloc`
//!
//! Running out of memory is an ordinary error. Releasing memory the heap
//! does not consider allocated is not: [`Heap::free`] takes the fatal path.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    slice,
};

use allocator::block_list::{ALIGNMENT, BlockHeap, HeapError, HeapStats};
use spin::Mutex;

use crate::error;

pub struct Heap {
    inner: Mutex<BlockHeap>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Heap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(BlockHeap::new()),
        }
    }

    /// Hands `start..start + size` to the heap.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes and reserved for the heap
    /// from now on.
    pub unsafe fn init(&self, start: *mut u8, size: usize) -> Result<(), HeapError> {
        let mut heap = self.inner.lock();
        unsafe { heap.init(start, size)?; }
        info!(
            "heap: {} bytes at {:#x}, split factor {}",
            heap.arena_size(),
            start.addr(),
            heap.split_factor()
        );
        Ok(())
    }

    pub fn set_split_factor(&self, split_factor: usize) {
        self.inner.lock().set_split_factor(split_factor);
    }

    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let result = self.inner.lock().allocate(size);
        if let Err(err) = &result {
            trace!("malloc({size}) failed: {err}");
        }
        result
    }

    /// Allocates zero-filled memory for `count` elements of `size` bytes.
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.inner.lock().allocate_zeroed(count, size)
    }

    /// Allocates memory for `layout`, rejecting alignments the heap cannot
    /// provide.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        self.inner.lock().allocate_layout(layout)
    }

    /// Resizes the allocation at `ptr`, possibly moving it.
    ///
    /// On error `ptr` stays valid and keeps its contents.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap. If the returned pointer
    /// differs, `ptr` must not be used anymore.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, HeapError> {
        unsafe { self.inner.lock().resize(ptr, size) }
    }

    /// Releases `ptr`, reporting misuse to the caller.
    ///
    /// # Safety
    ///
    /// The memory behind `ptr` must not be accessed afterwards.
    pub unsafe fn try_free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe { self.inner.lock().release(ptr) }
    }

    /// Releases `ptr`.
    ///
    /// Double frees, foreign pointers and corrupted headers are fatal.
    ///
    /// # Safety
    ///
    /// The memory behind `ptr` must not be accessed afterwards.
    #[track_caller]
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        if let Err(err) = unsafe { self.try_free(ptr) } {
            error::report(err);
        }
    }

    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.inner.lock().usable_size(ptr)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    pub fn check(&self) -> Result<(), HeapError> {
        self.inner.lock().check()
    }
}

unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate(layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) if err.is_fatal() => error::report(err),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.free(ptr) }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        match unsafe { Heap::realloc(self, ptr, new_size) } {
            Ok(new_ptr) => new_ptr.as_ptr(),
            Err(err) if err.is_fatal() => error::report(err),
            Err(_) => ptr::null_mut(),
        }
    }
}

/// A single value stored on a [`Heap`].
pub struct HeapBox<'h, T> {
    heap: &'h Heap,
    ptr: NonNull<T>,
}

impl<'h, T> HeapBox<'h, T> {
    /// Moves `value` onto the heap.
    pub fn new(heap: &'h Heap, value: T) -> Result<Self, HeapError> {
        let ptr = heap.allocate(Layout::new::<T>())?.cast::<T>();
        unsafe {
            ptr.write(value);
        }
        Ok(Self { heap, ptr })
    }

    #[must_use]
    pub fn heap(this: &Self) -> &'h Heap {
        this.heap
    }

    #[must_use]
    pub fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }
}

impl<T> Deref for HeapBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for HeapBox<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for HeapBox<'_, T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.heap.free(self.ptr.cast());
        }
    }
}

impl<T> fmt::Debug for HeapBox<'_, T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A growable array stored on a [`Heap`].
///
/// The capacity starts at four elements and doubles; every growth after the
/// first goes through [`Heap::realloc`].
pub struct HeapVec<'h, T> {
    heap: &'h Heap,
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
}

impl<'h, T> HeapVec<'h, T> {
    const MIN_CAPACITY: usize = 4;

    #[must_use]
    pub fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            ptr: NonNull::dangling(),
            len: 0,
            capacity: if size_of::<T>() == 0 { usize::MAX } else { 0 },
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `value`, growing the storage if needed.
    ///
    /// If growing fails the vector is left unchanged.
    pub fn push(&mut self, value: T) -> Result<(), HeapError> {
        if self.len == self.capacity {
            self.grow()?;
        }
        unsafe {
            self.ptr.add(self.len).write(value);
        }
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(unsafe { self.ptr.add(self.len).read() })
    }

    pub fn clear(&mut self) {
        let elements: *mut [T] = &raw mut **self;
        self.len = 0;
        unsafe {
            ptr::drop_in_place(elements);
        }
    }

    fn grow(&mut self) -> Result<(), HeapError> {
        if align_of::<T>() > ALIGNMENT {
            return Err(HeapError::UnsupportedAlignment {
                align: align_of::<T>(),
            });
        }
        let capacity = if self.capacity == 0 {
            Self::MIN_CAPACITY
        } else {
            self.capacity
                .checked_mul(2)
                .ok_or(HeapError::SizeOverflow {
                    count: self.capacity,
                    size: 2,
                })?
        };
        let bytes = capacity
            .checked_mul(size_of::<T>())
            .ok_or(HeapError::SizeOverflow {
                count: capacity,
                size: size_of::<T>(),
            })?;

        let ptr = if self.capacity == 0 {
            self.heap.malloc(bytes)?
        } else {
            unsafe { self.heap.realloc(self.ptr.cast(), bytes)? }
        };
        self.ptr = ptr.cast();
        self.capacity = capacity;
        Ok(())
    }
}

impl<T> Deref for HeapVec<'_, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for HeapVec<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for HeapVec<'_, T> {
    fn drop(&mut self) {
        self.clear();
        if self.capacity > 0 && size_of::<T>() > 0 {
            unsafe {
                self.heap.free(self.ptr.cast());
            }
        }
    }
}

impl<'a, T> IntoIterator for &'a HeapVec<'_, T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> fmt::Debug for HeapVec<'_, T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
