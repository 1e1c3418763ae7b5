//! The module containing the [`VpsPool`] type.

use crate::config::MAX_VPSS;
use crate::error::Error;
use crate::intrinsics::Intrinsics;
use crate::page_pool::PagePool;
use crate::vps::Vps;
use crate::{Vpsid, INVALID_ID};
use core::fmt;
use log::error;

/// The fixed table of every VPS the microkernel can hand out.
///
/// Slot indexes are the VPS IDs. Free slots are threaded on a singly
/// linked list; allocation pops the head, so slots are reused
/// most-recently-freed first.
pub struct VpsPool<'a, I: Intrinsics, P: PagePool> {
    entries: [Vps<'a, I, P>; MAX_VPSS],
    free_head: Option<u16>,
    initialized: bool,
}

impl<'a, I: Intrinsics, P: PagePool> VpsPool<'a, I, P> {
    /// Returns a pool of uninitialized slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| Vps::new()),
            free_head: None,
            initialized: false,
        }
    }

    /// Gives every slot its identity and threads the free list.
    ///
    /// After this, slot `0` is the head of the free list and is the first
    /// ID handed out.
    pub fn initialize(&mut self, intrinsics: &'a I, page_pool: &'a P) -> Result<(), Error> {
        if self.initialized {
            error!("vps pool already initialized");
            return Err(Error::InvalidState);
        }

        for i in (0..MAX_VPSS).rev() {
            let id = i as u16;
            self.entries[i].initialize(intrinsics, page_pool, id)?;
            self.entries[i].set_next_free(self.free_head);
            self.free_head = Some(id);
        }

        self.initialized = true;
        Ok(())
    }

    /// Detaches a free slot, allocates its VMCB backing, and returns its
    /// ID.
    pub fn allocate(&mut self) -> Result<Vpsid, Error> {
        let Some(id) = self.free_head else {
            error!("vps pool exhausted");
            return Err(Error::ResourceExhausted);
        };

        let entry = &mut self.entries[usize::from(id)];
        let next = entry.next_free();
        entry.set_next_free(None);

        if let Err(err) = entry.allocate() {
            // Leave the slot where it was so a later attempt can reuse it.
            entry.set_next_free(next);
            return Err(err);
        }

        self.free_head = next;
        Ok(id)
    }

    /// Releases the VPS `vpsid` and re-attaches its slot to the free
    /// list.
    pub fn deallocate(&mut self, vpsid: Vpsid) -> Result<(), Error> {
        let index = usize::from(vpsid);
        if vpsid == INVALID_ID || index >= MAX_VPSS {
            error!("invalid vpsid: {vpsid:#06x}");
            return Err(Error::InvalidArgument);
        }

        let free_head = self.free_head;
        let entry = &mut self.entries[index];
        if !entry.is_allocated() {
            error!("vps {vpsid:#06x} not allocated");
            return Err(Error::InvalidState);
        }

        entry.deallocate();
        entry.set_next_free(free_head);
        self.free_head = Some(vpsid);
        Ok(())
    }

    /// Looks the slot `vpsid` up. [`INVALID_ID`] never resolves.
    #[must_use]
    pub fn entry(&self, vpsid: Vpsid) -> Option<&Vps<'a, I, P>> {
        if vpsid == INVALID_ID {
            return None;
        }
        self.entries.get(usize::from(vpsid))
    }

    /// Looks the slot `vpsid` up for mutation. [`INVALID_ID`] never
    /// resolves.
    #[must_use]
    pub fn entry_mut(&mut self, vpsid: Vpsid) -> Option<&mut Vps<'a, I, P>> {
        if vpsid == INVALID_ID {
            return None;
        }
        self.entries.get_mut(usize::from(vpsid))
    }

    /// Returns whether `vpsid` names an allocated VPS.
    #[must_use]
    pub fn is_allocated(&self, vpsid: Vpsid) -> bool {
        self.entry(vpsid).is_some_and(Vps::is_allocated)
    }
}

impl<I: Intrinsics, P: PagePool> Default for VpsPool<'_, I, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Intrinsics, P: PagePool> fmt::Debug for VpsPool<'_, I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpsPool")
            .field("free_head", &self.free_head)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
