//! The module containing the [`Vp`] and [`VpPool`] types.
//!
//! A VP is an abstract virtualized CPU. It is bound to a VM at creation,
//! and a VPS is in turn bound to exactly one VP.

use crate::config::MAX_VPS;
use crate::error::Error;
use crate::{SlotState, Vmid, Vpid, INVALID_ID};
use log::{debug, error};

/// One virtual processor slot.
#[derive(Debug)]
pub struct Vp {
    id: Vpid,
    assigned_vm: Vmid,
    state: SlotState,
    next_free: Option<u16>,
}

impl Vp {
    /// Returns a slot in the `Uninitialized` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            id: INVALID_ID,
            assigned_vm: INVALID_ID,
            state: SlotState::Uninitialized,
            next_free: None,
        }
    }

    /// Gives this slot its identity, moving it to the `Free` state.
    pub fn initialize(&mut self, id: Vpid) -> Result<(), Error> {
        if self.state != SlotState::Uninitialized {
            error!("vp {:#06x} already initialized", self.id);
            return Err(Error::InvalidState);
        }

        if id == INVALID_ID {
            error!("invalid id");
            return Err(Error::InvalidArgument);
        }

        self.id = id;
        self.state = SlotState::Free;
        Ok(())
    }

    /// Returns the ID of this VP.
    #[must_use]
    pub const fn id(&self) -> Vpid {
        self.id
    }

    /// Returns the lifecycle state of this VP.
    #[must_use]
    pub const fn state(&self) -> SlotState {
        self.state
    }

    /// Returns whether this VP is handed out.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.state == SlotState::Allocated
    }

    /// Returns the ID of the VM this VP is bound to, or [`INVALID_ID`].
    #[must_use]
    pub const fn assigned_vm(&self) -> Vmid {
        self.assigned_vm
    }

    /// Hands this slot out.
    pub fn allocate(&mut self) -> Result<(), Error> {
        match self.state {
            SlotState::Uninitialized => {
                error!("vp not initialized");
                Err(Error::InvalidState)
            }
            SlotState::Allocated => {
                error!("vp {:#06x} already allocated", self.id);
                Err(Error::InvalidState)
            }
            SlotState::Free => {
                self.state = SlotState::Allocated;
                Ok(())
            }
        }
    }

    /// Binds this VP to the VM `vmid`.
    pub fn assign_vm(&mut self, vmid: Vmid) -> Result<(), Error> {
        if !self.is_allocated() {
            error!("invalid vp");
            return Err(Error::InvalidState);
        }

        if vmid == INVALID_ID {
            error!("invalid vmid");
            return Err(Error::InvalidArgument);
        }

        self.assigned_vm = vmid;
        Ok(())
    }

    /// Returns this slot to the `Free` state, clearing the VM binding.
    /// A no-op on a free slot.
    pub fn deallocate(&mut self) {
        self.assigned_vm = INVALID_ID;
        if self.state == SlotState::Allocated {
            self.state = SlotState::Free;
        }
    }

    /// Dumps the VP on the debug channel.
    pub fn dump(&self) {
        debug!(
            "vp [{:#06x}] dump: allocated {}, assigned vm {:#06x}",
            self.id,
            if self.is_allocated() { "yes" } else { "no" },
            self.assigned_vm,
        );
    }

    const fn next_free(&self) -> Option<u16> {
        self.next_free
    }

    fn set_next_free(&mut self, next: Option<u16>) {
        self.next_free = next;
    }
}

impl Default for Vp {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed table of every VP the microkernel can host. Slot indexes are
/// the VP IDs; free slots are reused most-recently-freed first.
#[derive(Debug)]
pub struct VpPool {
    vps: [Vp; MAX_VPS],
    free_head: Option<u16>,
    initialized: bool,
}

impl VpPool {
    /// Returns a pool of uninitialized slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vps: core::array::from_fn(|_| Vp::new()),
            free_head: None,
            initialized: false,
        }
    }

    /// Gives every slot its identity and threads the free list.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.initialized {
            error!("vp pool already initialized");
            return Err(Error::InvalidState);
        }

        for i in (0..MAX_VPS).rev() {
            let id = i as u16;
            self.vps[i].initialize(id)?;
            self.vps[i].set_next_free(self.free_head);
            self.free_head = Some(id);
        }

        self.initialized = true;
        Ok(())
    }

    /// Detaches a free slot, binds it to the VM `vmid`, and returns its
    /// ID.
    pub fn allocate(&mut self, vmid: Vmid) -> Result<Vpid, Error> {
        if vmid == INVALID_ID {
            error!("invalid vmid");
            return Err(Error::InvalidArgument);
        }

        let Some(id) = self.free_head else {
            error!("vp pool exhausted");
            return Err(Error::ResourceExhausted);
        };

        let entry = &mut self.vps[usize::from(id)];
        self.free_head = entry.next_free();
        entry.set_next_free(None);
        entry.allocate()?;
        entry.assign_vm(vmid)?;
        Ok(id)
    }

    /// Releases the VP `vpid` and re-attaches its slot to the free list.
    pub fn deallocate(&mut self, vpid: Vpid) -> Result<(), Error> {
        let index = usize::from(vpid);
        if vpid == INVALID_ID || index >= MAX_VPS {
            error!("invalid vpid: {vpid:#06x}");
            return Err(Error::InvalidArgument);
        }

        let free_head = self.free_head;
        let entry = &mut self.vps[index];
        if !entry.is_allocated() {
            error!("vp {vpid:#06x} not allocated");
            return Err(Error::InvalidState);
        }

        entry.deallocate();
        entry.set_next_free(free_head);
        self.free_head = Some(vpid);
        Ok(())
    }

    /// Looks the slot `vpid` up. [`INVALID_ID`] never resolves.
    #[must_use]
    pub fn entry(&self, vpid: Vpid) -> Option<&Vp> {
        if vpid == INVALID_ID {
            return None;
        }
        self.vps.get(usize::from(vpid))
    }

    /// Returns whether `vpid` names an allocated VP.
    #[must_use]
    pub fn is_allocated(&self, vpid: Vpid) -> bool {
        self.entry(vpid).is_some_and(Vp::is_allocated)
    }
}

impl Default for VpPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> VpPool {
        let mut pool = VpPool::new();
        pool.initialize().unwrap();
        pool
    }

    #[test]
    fn allocation_binds_the_vm() {
        let mut pool = pool();
        let id = pool.allocate(2).unwrap();
        assert_eq!(id, 0);
        assert_eq!(pool.entry(id).unwrap().assigned_vm(), 2);

        pool.deallocate(id).unwrap();
        assert_eq!(pool.entry(id).unwrap().assigned_vm(), INVALID_ID);
    }

    #[test]
    fn allocation_requires_a_valid_vm() {
        let mut pool = pool();
        assert_eq!(pool.allocate(INVALID_ID), Err(Error::InvalidArgument));
    }

    #[test]
    fn slots_are_reused_most_recently_freed_first() {
        let mut pool = pool();
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(1).unwrap();
        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
        assert_eq!(pool.allocate(1).unwrap(), b);
    }
}
