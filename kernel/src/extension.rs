//! The module containing the [`Extension`] type, the microkernel's record
//! of one hosted policy extension.

use crate::error::Error;
use crate::syscall;
use crate::Extid;
use bitflags::bitflags;
use log::error;

bitflags! {
    /// The syscall families an extension is granted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perms: u16 {
        /// The `CONTROL` family.
        const CONTROL = 1 << 0;
        /// The `HANDLE` family.
        const HANDLE = 1 << 1;
        /// The `DEBUG` family.
        const DEBUG = 1 << 2;
        /// The `CALLBACK` family.
        const CALLBACK = 1 << 3;
        /// The `VM` family.
        const VM = 1 << 4;
        /// The `VP` family.
        const VP = 1 << 5;
        /// The `VPS` family.
        const VPS = 1 << 6;
        /// The `INTRINSIC` family.
        const INTRINSIC = 1 << 7;
        /// The `MEM` family.
        const MEM = 1 << 8;
    }
}

/// The entry point invoked once per physical processor during bootstrap.
pub type BootstrapHandler = extern "C" fn(ppid: u16);
/// The entry point invoked on every VMExit of a guest the extension runs.
pub type VmExitHandler = extern "C" fn(vpsid: u16, exit_reason: u64);
/// The entry point invoked when the microkernel catches an unrecoverable
/// fault attributed to the extension.
pub type FailHandler = extern "C" fn(status: u64);

/// The extension entry points the microkernel re-enters extension code
/// through.
///
/// Pointers are validated non-null once, at registration, and invoked by
/// indirect call afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct Callbacks {
    bootstrap: Option<BootstrapHandler>,
    vmexit: Option<VmExitHandler>,
    fail: Option<FailHandler>,
}

/// One hosted extension: its identity, its open handle, the syscall
/// families it is granted, and its registered entry points.
#[derive(Debug)]
pub struct Extension {
    id: Extid,
    handle: Option<u64>,
    perms: Perms,
    debug_allowed: bool,
    callbacks: Callbacks,
}

impl Extension {
    /// Returns an extension record with no open handle and no registered
    /// callbacks.
    #[must_use]
    pub const fn new(id: Extid, perms: Perms) -> Self {
        Self {
            id,
            handle: None,
            perms,
            debug_allowed: true,
            callbacks: Callbacks {
                bootstrap: None,
                vmexit: None,
                fail: None,
            },
        }
    }

    /// Returns the ID of this extension.
    #[must_use]
    pub const fn id(&self) -> Extid {
        self.id
    }

    /// Returns the syscall families this extension is granted.
    #[must_use]
    pub const fn perms(&self) -> Perms {
        self.perms
    }

    /// Grants or revokes syscall families.
    pub fn set_perms(&mut self, perms: Perms) {
        self.perms = perms;
    }

    /// Returns whether policy allows this extension to use the `DEBUG`
    /// family.
    #[must_use]
    pub const fn debug_allowed(&self) -> bool {
        self.debug_allowed
    }

    /// Allows or denies the `DEBUG` family at the policy level.
    pub fn set_debug_allowed(&mut self, allowed: bool) {
        self.debug_allowed = allowed;
    }

    /// Performs the specification version handshake and returns the
    /// extension's handle.
    ///
    /// Fails if `version` names a specification this microkernel does not
    /// implement, or if the extension already holds a handle.
    pub fn open_handle(&mut self, version: u64) -> Result<u64, Error> {
        if !syscall::version_supported(version) {
            error!("unsupported specification version: {version:#x}");
            return Err(Error::InvalidArgument);
        }

        if self.handle.is_some() {
            error!("ext {:#06x} already holds a handle", self.id);
            return Err(Error::InvalidState);
        }

        let handle = u64::from(self.id) + 1;
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Invalidates the extension's handle.
    pub fn close_handle(&mut self, handle: u64) -> Result<(), Error> {
        if !self.is_handle_valid(handle) {
            error!("ext {:#06x}: close of a handle it does not hold", self.id);
            return Err(Error::InvalidArgument);
        }

        self.handle = None;
        Ok(())
    }

    /// Returns whether `handle` is the handle this extension was issued.
    #[must_use]
    pub fn is_handle_valid(&self, handle: u64) -> bool {
        self.handle == Some(handle)
    }

    /// Registers the bootstrap entry point from its raw address.
    pub fn register_bootstrap(&mut self, addr: u64) -> Result<(), Error> {
        if addr == 0 {
            error!("null bootstrap handler");
            return Err(Error::InvalidArgument);
        }
        if self.callbacks.bootstrap.is_some() {
            error!("bootstrap handler already registered");
            return Err(Error::InvalidState);
        }

        // Safety: function pointers and u64 share a representation on
        // x86-64, and the address was validated non-null above. The
        // extension vouches for the target being code with this signature.
        self.callbacks.bootstrap = Some(unsafe { core::mem::transmute::<u64, BootstrapHandler>(addr) });
        Ok(())
    }

    /// Registers the VMExit entry point from its raw address.
    pub fn register_vmexit(&mut self, addr: u64) -> Result<(), Error> {
        if addr == 0 {
            error!("null vmexit handler");
            return Err(Error::InvalidArgument);
        }
        if self.callbacks.vmexit.is_some() {
            error!("vmexit handler already registered");
            return Err(Error::InvalidState);
        }

        // Safety: same as `register_bootstrap`.
        self.callbacks.vmexit = Some(unsafe { core::mem::transmute::<u64, VmExitHandler>(addr) });
        Ok(())
    }

    /// Registers the fast-fail entry point from its raw address.
    pub fn register_fail(&mut self, addr: u64) -> Result<(), Error> {
        if addr == 0 {
            error!("null fail handler");
            return Err(Error::InvalidArgument);
        }
        if self.callbacks.fail.is_some() {
            error!("fail handler already registered");
            return Err(Error::InvalidState);
        }

        // Safety: same as `register_bootstrap`.
        self.callbacks.fail = Some(unsafe { core::mem::transmute::<u64, FailHandler>(addr) });
        Ok(())
    }

    /// Returns the registered bootstrap entry point.
    #[must_use]
    pub const fn bootstrap_handler(&self) -> Option<BootstrapHandler> {
        self.callbacks.bootstrap
    }

    /// Returns the registered VMExit entry point.
    #[must_use]
    pub const fn vmexit_handler(&self) -> Option<VmExitHandler> {
        self.callbacks.vmexit
    }

    /// Returns the registered fast-fail entry point.
    #[must_use]
    pub const fn fail_handler(&self) -> Option<FailHandler> {
        self.callbacks.fail
    }
}
