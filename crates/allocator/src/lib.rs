//! Freestanding memory allocators for early-boot firmware.
//!
//! Nothing in this crate depends on an operating system or on a global
//! allocator. Every allocator manages a region handed to it by the caller and
//! keeps its bookkeeping inside that region.
//!
//! # Available Allocators
//!
//! ## [`BlockHeap`](block_list::BlockHeap)
//!
//! A general-purpose first-fit heap over a doubly-linked list of blocks.
//! Best suited for:
//!
//! - Variable-sized allocations such as device tables and identify buffers
//! - Growing arrays through [`resize`](block_list::BlockHeap::resize)
//! - Catching misuse early: double frees, foreign pointers and corrupted
//!   headers are reported as errors
//!
//! **Performance**: O(n) allocation and O(1) release (plus pointer
//! validation), where n is the number of blocks.
//!
//! ## [`Slab`](slab::Slab)
//!
//! A pool of fixed-size slots tracked by a [`Bitmap`](bitmap::Bitmap).
//! Best suited for many objects of one size.
//!
//! **Performance**: O(n) allocation by bitmap scan, O(1) release.
//!
//! # Usage Examples
//!
//! ```rust
//! use allocator::{block_list::BlockHeap, slab::Slab};
//!
//! let mut heap_region = vec![0u8; 4096];
//! let mut heap = BlockHeap::new();
//! unsafe {
//!     heap.init(heap_region.as_mut_ptr(), heap_region.len()).unwrap();
//! }
//! let table = heap.allocate_zeroed(8, 16).unwrap();
//! let table = unsafe { heap.resize(table, 512).unwrap() };
//! unsafe {
//!     heap.release(table).unwrap();
//! }
//!
//! let mut slab_region = vec![0u64; 128];
//! let mut slab = unsafe { Slab::init(slab_region.as_mut_ptr().cast(), 1024, 32).unwrap() };
//! let object = slab.allocate().unwrap();
//! unsafe {
//!     slab.release(object).unwrap();
//! }
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Initialization and release are `unsafe`. Users must ensure:
//!
//! - Regions are valid and exclusive to the allocator
//! - Released memory is not accessed afterwards
//!
//! ## Thread Safety
//!
//! The allocators are `Send` but not `Sync`. They require external
//! synchronization (e.g. `spin::Mutex`) for shared access.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod bitmap;
pub mod block_list;
pub mod slab;
