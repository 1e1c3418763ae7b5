//! The module containing the [`PagePool`] trait, the microkernel's
//! interface to the physical page allocator.
//!
//! The pool is the only mutable resource shared across physical
//! processors; implementations must make each allocation atomic. Every
//! allocation is 4KB page-granular.

use crate::Page;
use core::ptr::NonNull;

/// The purpose a page was drawn from the pool for.
///
/// Deallocation must name the same tag the page was allocated with so the
/// pool can keep per-purpose accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocTag {
    /// A guest VMCB owned by a VPS.
    GuestVmcb,
    /// A host VMCB owned by a VPS.
    HostVmcb,
    /// A general purpose page handed to an extension.
    Extension,
}

/// The interface to the physical page pool.
pub trait PagePool {
    /// Draws one zeroable page from the pool, or `None` if the pool is
    /// exhausted.
    fn allocate(&self, tag: AllocTag) -> Option<NonNull<Page>>;

    /// Returns `page` to the pool.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by [`PagePool::allocate`] on this
    /// pool with the same `tag`, and must not be accessed afterwards.
    unsafe fn deallocate(&self, page: NonNull<Page>, tag: AllocTag);

    /// Resolves the physical address backing `page`, or `None` if the
    /// page is not pool-managed.
    fn virt_to_phys(&self, page: NonNull<Page>) -> Option<u64>;
}
