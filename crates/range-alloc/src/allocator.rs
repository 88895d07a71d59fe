use core::fmt;

use snafu::{OptionExt as _, Snafu, ensure};
use spin::mutex::SpinMutex;
use vm_range::{PAGE_SIZE, VirtAddr, VirtRange};

use crate::free_list::FreeList;

/// Guard page policy for [`RangeAllocator::allocate_anywhere`].
///
/// With guards enabled, anywhere-allocations leave one unallocatable page
/// of slack on each side of the returned range, so stray accesses just past
/// either end fault instead of landing in a neighboring allocation.
/// [`RangeAllocator::allocate_specific`] is the explicit "I know what I'm
/// doing" path and never applies padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPages {
    Enabled,
    Disabled,
}

/// Errors from allocator initialization.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum InitError {
    #[snafu(display("allocator is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("total range must not be empty"))]
    EmptyTotalRange {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("parent allocator is not initialized"))]
    UninitializedParent {
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

#[derive(Debug)]
struct Inner {
    total: Option<VirtRange>,
    free: FreeList,
}

/// First-fit allocator for one contiguous span of virtual address space.
///
/// The allocator owns a free list of non-overlapping, non-touching ranges
/// covering exactly the unallocated part of the span. All access goes
/// through an internal spinlock; the allocator itself can be shared freely.
///
/// A fresh allocator manages nothing. It becomes usable after exactly one
/// call to [`initialize_with_range`](Self::initialize_with_range) or
/// [`initialize_from_parent`](Self::initialize_from_parent).
pub struct RangeAllocator {
    inner: SpinMutex<Inner>,
    guard_pages: GuardPages,
}

impl RangeAllocator {
    /// Creates an uninitialized allocator with the given guard page policy.
    ///
    /// The policy is fixed for the lifetime of the allocator and is not
    /// inherited through [`initialize_from_parent`](Self::initialize_from_parent).
    #[must_use]
    pub const fn new(guard_pages: GuardPages) -> Self {
        Self {
            inner: SpinMutex::new(Inner {
                total: None,
                free: FreeList::new(),
            }),
            guard_pages,
        }
    }

    /// Puts the span `[base, base + size)` under management, with all of it
    /// initially free.
    ///
    /// # Errors
    ///
    /// Fails if `size` is zero or the allocator is already initialized.
    pub fn initialize_with_range(&self, base: VirtAddr, size: usize) -> Result<(), InitError> {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::init_error::*;

        ensure!(size > 0, EmptyTotalRangeSnafu);
        let total = VirtRange::new(base, size);

        let mut inner = self.inner.lock();
        ensure!(inner.total.is_none(), AlreadyInitializedSnafu);
        inner.total = Some(total);
        inner.free.insert(total);
        Ok(())
    }

    /// Initializes this allocator with a snapshot of `parent`'s span and
    /// free layout.
    ///
    /// The snapshot is taken under the parent's lock; afterwards the two
    /// allocators are fully independent and neither observes the other's
    /// mutations.
    ///
    /// # Errors
    ///
    /// Fails if `parent` is uninitialized or this allocator is already
    /// initialized.
    pub fn initialize_from_parent(&self, parent: &Self) -> Result<(), InitError> {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::init_error::*;

        let (total, free) = {
            let parent_inner = parent.inner.lock();
            let total = parent_inner.total.context(UninitializedParentSnafu)?;
            (total, parent_inner.free.clone())
        };

        let mut inner = self.inner.lock();
        ensure!(inner.total.is_none(), AlreadyInitializedSnafu);
        inner.total = Some(total);
        inner.free = free;
        Ok(())
    }

    /// Allocates `size` bytes at the lowest free address aligned to
    /// `alignment`, or `None` when no free range can satisfy the request.
    ///
    /// With [`GuardPages::Enabled`], placement additionally leaves
    /// [`PAGE_SIZE`] of slack on each side of the returned range.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn allocate_anywhere(&self, size: usize, alignment: usize) -> Option<VirtRange> {
        assert!(
            alignment.is_power_of_two(),
            "alignment {alignment:#x} must be a power of two"
        );
        if size == 0 {
            return None;
        }

        let (effective_size, offset) = match self.guard_pages {
            GuardPages::Enabled => (size.checked_add(2 * PAGE_SIZE)?, PAGE_SIZE),
            GuardPages::Disabled => (size, 0),
        };
        // No address could satisfy a request this large; report exhaustion
        // rather than wrapping.
        let min_candidate_size = effective_size.checked_add(alignment)?;

        let mut inner = self.inner.lock();
        for index in 0..inner.free.len() {
            let candidate = inner.free.as_slice()[index];
            // TODO: requiring `effective_size + alignment` over-rejects
            // candidates when the alignment is large; revisit the bound once
            // a caller actually needs huge alignments.
            if candidate.size() < min_candidate_size {
                continue;
            }

            let aligned = candidate.base().add(offset).align_up(alignment);
            let allocated = VirtRange::new(aligned, size);
            if candidate == allocated {
                inner.free.remove(index);
            } else {
                inner.free.carve_at(index, allocated);
            }
            log::trace!("allocated anywhere({size:#x}, {alignment:#x}): {allocated:?}");
            return Some(allocated);
        }

        log::warn!("out of virtual address space: anywhere({size:#x}, {alignment:#x})");
        None
    }

    /// Allocates exactly `[base, base + size)` if that span currently lies
    /// within a single free range, or `None` otherwise.
    ///
    /// A request outside the managed span, or one crossing a free/allocated
    /// boundary, fails in-band; it is not a usage error. Guard padding is
    /// never applied on this path.
    pub fn allocate_specific(&self, base: VirtAddr, size: usize) -> Option<VirtRange> {
        if size == 0 {
            return None;
        }

        let mut inner = self.inner.lock();
        for index in 0..inner.free.len() {
            let candidate = inner.free.as_slice()[index];
            if !candidate.contains_span(base, size) {
                continue;
            }

            let allocated = VirtRange::new(base, size);
            if candidate == allocated {
                inner.free.remove(index);
            } else {
                inner.free.carve_at(index, allocated);
            }
            log::trace!("allocated specific: {allocated:?}");
            return Some(allocated);
        }

        log::warn!("failed to allocate specific range {base:#x} ({size:#x} bytes)");
        None
    }

    /// Returns `range` to the free pool, coalescing with any touching free
    /// neighbor.
    ///
    /// The caller must own `range`, i.e. it was previously returned by one
    /// of the allocation methods and has not been deallocated since.
    /// Releasing an overlapping or never-allocated range corrupts the free
    /// list.
    ///
    /// # Panics
    ///
    /// Panics if the allocator is uninitialized or `range` lies outside the
    /// managed span.
    pub fn deallocate(&self, range: VirtRange) {
        let mut inner = self.inner.lock();
        let total = inner.total.expect("deallocate on an uninitialized allocator");
        assert!(
            total.contains(range),
            "deallocated range {range:?} is outside the managed span {total:?}"
        );
        log::trace!("deallocate {range:?}");
        inner.free.insert(range);
    }

    /// The managed span, or `None` before initialization.
    #[must_use]
    pub fn total_range(&self) -> Option<VirtRange> {
        self.inner.lock().total
    }

    /// Calls `f` for each free range, in ascending address order.
    pub fn for_each_free_range<F>(&self, mut f: F)
    where
        F: FnMut(VirtRange),
    {
        let inner = self.inner.lock();
        for entry in inner.free.iter() {
            f(*entry);
        }
    }

    /// Number of fragments currently on the free list.
    #[must_use]
    pub fn free_range_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Writes the free list to the debug log.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        log::debug!("RangeAllocator total={:?}", inner.total);
        for entry in inner.free.iter() {
            log::debug!("    {entry:?}");
        }
    }
}

impl fmt::Debug for RangeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RangeAllocator");
        match self.inner.try_lock() {
            Some(inner) => {
                d.field("total", &inner.total);
                d.field("free", &inner.free.as_slice());
            }
            None => {
                d.field("state", &"<locked>");
            }
        }
        d.field("guard_pages", &self.guard_pages);
        d.finish()
    }
}
