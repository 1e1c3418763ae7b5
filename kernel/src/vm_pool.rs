//! The module containing the [`Vm`] and [`VmPool`] types.
//!
//! A VM slot carries no hardware state of its own; it is the identity
//! that VPs (and through them, VPSs) are grouped under.

use crate::config::MAX_VMS;
use crate::error::Error;
use crate::{SlotState, Vmid, INVALID_ID};
use log::{debug, error};

/// One virtual machine slot.
#[derive(Debug)]
pub struct Vm {
    id: Vmid,
    state: SlotState,
    next_free: Option<u16>,
}

impl Vm {
    /// Returns a slot in the `Uninitialized` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            id: INVALID_ID,
            state: SlotState::Uninitialized,
            next_free: None,
        }
    }

    /// Gives this slot its identity, moving it to the `Free` state.
    pub fn initialize(&mut self, id: Vmid) -> Result<(), Error> {
        if self.state != SlotState::Uninitialized {
            error!("vm {:#06x} already initialized", self.id);
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

    /// Returns the ID of this VM.
    #[must_use]
    pub const fn id(&self) -> Vmid {
        self.id
    }

    /// Returns the lifecycle state of this VM.
    #[must_use]
    pub const fn state(&self) -> SlotState {
        self.state
    }

    /// Returns whether this VM is handed out.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.state == SlotState::Allocated
    }

    /// Hands this slot out.
    pub fn allocate(&mut self) -> Result<(), Error> {
        match self.state {
            SlotState::Uninitialized => {
                error!("vm not initialized");
                Err(Error::InvalidState)
            }
            SlotState::Allocated => {
                error!("vm {:#06x} already allocated", self.id);
                Err(Error::InvalidState)
            }
            SlotState::Free => {
                self.state = SlotState::Allocated;
                Ok(())
            }
        }
    }

    /// Returns this slot to the `Free` state. A no-op on a free slot.
    pub fn deallocate(&mut self) {
        if self.state == SlotState::Allocated {
            self.state = SlotState::Free;
        }
    }

    /// Dumps the VM on the debug channel.
    pub fn dump(&self) {
        debug!(
            "vm [{:#06x}] dump: allocated {}",
            self.id,
            if self.is_allocated() { "yes" } else { "no" },
        );
    }

    const fn next_free(&self) -> Option<u16> {
        self.next_free
    }

    fn set_next_free(&mut self, next: Option<u16>) {
        self.next_free = next;
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed table of every VM the microkernel can host. Slot indexes are
/// the VM IDs; free slots are reused most-recently-freed first.
#[derive(Debug)]
pub struct VmPool {
    vms: [Vm; MAX_VMS],
    free_head: Option<u16>,
    initialized: bool,
}

impl VmPool {
    /// Returns a pool of uninitialized slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vms: core::array::from_fn(|_| Vm::new()),
            free_head: None,
            initialized: false,
        }
    }

    /// Gives every slot its identity and threads the free list.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.initialized {
            error!("vm pool already initialized");
            return Err(Error::InvalidState);
        }

        for i in (0..MAX_VMS).rev() {
            let id = i as u16;
            self.vms[i].initialize(id)?;
            self.vms[i].set_next_free(self.free_head);
            self.free_head = Some(id);
        }

        self.initialized = true;
        Ok(())
    }

    /// Detaches a free slot and returns its ID.
    pub fn allocate(&mut self) -> Result<Vmid, Error> {
        let Some(id) = self.free_head else {
            error!("vm pool exhausted");
            return Err(Error::ResourceExhausted);
        };

        let entry = &mut self.vms[usize::from(id)];
        self.free_head = entry.next_free();
        entry.set_next_free(None);
        entry.allocate()?;
        Ok(id)
    }

    /// Releases the VM `vmid` and re-attaches its slot to the free list.
    pub fn deallocate(&mut self, vmid: Vmid) -> Result<(), Error> {
        let index = usize::from(vmid);
        if vmid == INVALID_ID || index >= MAX_VMS {
            error!("invalid vmid: {vmid:#06x}");
            return Err(Error::InvalidArgument);
        }

        let free_head = self.free_head;
        let entry = &mut self.vms[index];
        if !entry.is_allocated() {
            error!("vm {vmid:#06x} not allocated");
            return Err(Error::InvalidState);
        }

        entry.deallocate();
        entry.set_next_free(free_head);
        self.free_head = Some(vmid);
        Ok(())
    }

    /// Looks the slot `vmid` up. [`INVALID_ID`] never resolves.
    #[must_use]
    pub fn entry(&self, vmid: Vmid) -> Option<&Vm> {
        if vmid == INVALID_ID {
            return None;
        }
        self.vms.get(usize::from(vmid))
    }

    /// Returns whether `vmid` names an allocated VM.
    #[must_use]
    pub fn is_allocated(&self, vmid: Vmid) -> bool {
        self.entry(vmid).is_some_and(Vm::is_allocated)
    }
}

impl Default for VmPool {
    fn default() -> Self {
        Self::new()
    }
}
