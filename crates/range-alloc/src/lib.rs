//! Virtual address range allocation for kernel-space usage.
//!
//! This crate manages a single contiguous span of virtual address space and
//! hands out sub-ranges on request. Free space is tracked as a sorted,
//! maximally coalesced sequence of [`VirtRange`](vm_range::VirtRange)
//! intervals; releasing a range merges it back with any touching neighbor.
//! An allocator can also inherit the free layout of a parent, which is how a
//! forked address space starts from a snapshot of its parent's state.
//!
//! Allocation is strictly first-fit. Requests can ask for space anywhere
//! (with an alignment, and optionally padded by guard pages) or for one
//! exact range. Failure is reported in-band: the allocating calls return
//! `None` and never panic for an unsatisfiable request.
//!
//! All state is guarded by a spinlock, so a single allocator may be shared
//! across CPUs. Critical sections are bounded and never call back into the
//! allocator; the free list's backing storage comes from the kernel heap,
//! not from the managed span itself.
//!
//! # Examples
//!
//! ```
//! use range_alloc::{GuardPages, RangeAllocator};
//! use vm_range::VirtAddr;
//!
//! let allocator = RangeAllocator::new(GuardPages::Disabled);
//! allocator
//!     .initialize_with_range(VirtAddr::new(0x1000), 0x10000)
//!     .unwrap();
//!
//! let range = allocator.allocate_anywhere(0x2000, 0x1000).unwrap();
//! assert_eq!(range.size(), 0x2000);
//!
//! allocator.deallocate(range);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod allocator;
mod free_list;

pub use self::allocator::{GuardPages, InitError, RangeAllocator};
