//! The module containing the [`Microkernel`] type and the syscall
//! dispatch.
//!
//! An extension invokes the microkernel by executing `SYSCALL` with the
//! opcode word in RAX and its arguments in RDI, RSI, RDX and R10. The
//! entry assembly spills those registers into the calling PP's TLS
//! region, and [`Microkernel::dispatch`] reads the fingerprint back out,
//! validates it, and routes to the owning subsystem. Results travel the
//! same way: output values are written to the RDI/RSI TLS slots and the
//! packed [`Status`] is returned for the exit path to place in RAX.
//!
//! Validation happens in a fixed order for every syscall: signature,
//! flags, handle, extension permission, arguments, and only then the
//! operation itself.

use crate::config::{MAX_EXTENSIONS, MAX_PPS};
use crate::error::Error;
use crate::exit_log::ExitLog;
use crate::extension::{Extension, Perms};
use crate::intrinsics::Intrinsics;
use crate::page_pool::{AllocTag, PagePool};
use crate::state::StateSave;
use crate::syscall::{
    callback_op, control_op, debug_op, handle_op, intrinsic_op, mem_op, vm_op, vp_op, vps_op, Reg,
    Status, SyscallWord, OPCODE_CALLBACK, OPCODE_CONTROL, OPCODE_DEBUG, OPCODE_HANDLE,
    OPCODE_INTRINSIC, OPCODE_MEM, OPCODE_VM, OPCODE_VP, OPCODE_VPS, SYSCALL_SIG,
};
use crate::tls::{
    Tls, TLS_OFFSET_ACTIVE_VPS, TLS_OFFSET_R10, TLS_OFFSET_RAX, TLS_OFFSET_RDI, TLS_OFFSET_RDX,
    TLS_OFFSET_RSI,
};
use crate::vm_pool::VmPool;
use crate::vp_pool::VpPool;
use crate::vps_pool::VpsPool;
use crate::{Page, Ppid, INVALID_ID};
use core::fmt;
use core::ptr::NonNull;
use log::{debug, error};

/// The TLS slot carrying syscall argument 0 (the handle) and result 0.
const TLS_REG0: u64 = TLS_OFFSET_RDI;
/// The TLS slot carrying syscall argument 1 and result 1.
const TLS_REG1: u64 = TLS_OFFSET_RSI;
/// The TLS slot carrying syscall argument 2.
const TLS_REG2: u64 = TLS_OFFSET_RDX;
/// The TLS slot carrying syscall argument 3.
const TLS_REG3: u64 = TLS_OFFSET_R10;

/// Parses an ID argument: it must fit 16 bits and must not be the
/// reserved sentinel.
fn id_arg(reg: u64) -> Option<u16> {
    let id = u16::try_from(reg).ok()?;
    (id != INVALID_ID).then_some(id)
}

/// The microkernel: every pool, the exit reporter, the per-PP root state
/// saves, and the hosted extensions, behind the syscall dispatch.
pub struct Microkernel<'a, I: Intrinsics, P: PagePool> {
    intrinsics: &'a I,
    page_pool: &'a P,
    vm_pool: VmPool,
    vp_pool: VpPool,
    vps_pool: VpsPool<'a, I, P>,
    exit_log: ExitLog,
    root_states: [StateSave; MAX_PPS],
    extensions: [Extension; MAX_EXTENSIONS],
}

impl<'a, I: Intrinsics, P: PagePool> Microkernel<'a, I, P> {
    /// Builds the microkernel and initializes every pool.
    pub fn new(intrinsics: &'a I, page_pool: &'a P) -> Result<Self, Error> {
        let mut vm_pool = VmPool::new();
        vm_pool.initialize()?;

        let mut vp_pool = VpPool::new();
        vp_pool.initialize()?;

        let mut vps_pool = VpsPool::new();
        vps_pool.initialize(intrinsics, page_pool)?;

        Ok(Self {
            intrinsics,
            page_pool,
            vm_pool,
            vp_pool,
            vps_pool,
            exit_log: ExitLog::new(),
            root_states: [StateSave::default(); MAX_PPS],
            extensions: core::array::from_fn(|i| Extension::new(i as u16, Perms::all())),
        })
    }

    /// Returns the VPS pool.
    #[must_use]
    pub fn vps_pool(&self) -> &VpsPool<'a, I, P> {
        &self.vps_pool
    }

    /// Returns the VM pool.
    #[must_use]
    pub fn vm_pool(&self) -> &VmPool {
        &self.vm_pool
    }

    /// Returns the VP pool.
    #[must_use]
    pub fn vp_pool(&self) -> &VpPool {
        &self.vp_pool
    }

    /// Returns the VMExit reporter.
    #[must_use]
    pub fn exit_log(&self) -> &ExitLog {
        &self.exit_log
    }

    /// Returns the extension `extid`.
    #[must_use]
    pub fn extension(&self, extid: u16) -> Option<&Extension> {
        self.extensions.get(usize::from(extid))
    }

    /// Returns the extension `extid` for mutation.
    #[must_use]
    pub fn extension_mut(&mut self, extid: u16) -> Option<&mut Extension> {
        self.extensions.get_mut(usize::from(extid))
    }

    /// Installs the boot-time root OS state for the physical processor
    /// `ppid`, consumed by the `init_as_root` and `promote` operations.
    pub fn set_root_state(&mut self, ppid: Ppid, state: StateSave) -> Result<(), Error> {
        let Some(slot) = self.root_states.get_mut(usize::from(ppid)) else {
            error!("invalid ppid: {ppid:#06x}");
            return Err(Error::InvalidArgument);
        };
        *slot = state;
        Ok(())
    }

    /// Returns the root OS state recorded for the physical processor
    /// `ppid`.
    #[must_use]
    pub fn root_state(&self, ppid: Ppid) -> Option<&StateSave> {
        self.root_states.get(usize::from(ppid))
    }

    fn set_reg0(&self, value: u64) {
        self.intrinsics.set_tls_reg(TLS_REG0, value);
    }

    fn set_reg1(&self, value: u64) {
        self.intrinsics.set_tls_reg(TLS_REG1, value);
    }

    /// Decodes and executes the syscall described by the calling PP's TLS
    /// register fingerprint.
    pub fn dispatch(&mut self, tls: &mut Tls) -> Status {
        let word = SyscallWord(self.intrinsics.tls_reg(TLS_OFFSET_RAX));
        if word.sig() != SYSCALL_SIG {
            error!("invalid syscall signature: {:#018x}", word.0);
            return Status::FAILURE_UNSUPPORTED;
        }

        if word.flags() != 0 {
            error!("invalid syscall flags: {:#018x}", word.0);
            return Status::INVALID_PARAMS0;
        }

        let reg0 = self.intrinsics.tls_reg(TLS_REG0);
        let reg1 = self.intrinsics.tls_reg(TLS_REG1);
        let reg2 = self.intrinsics.tls_reg(TLS_REG2);
        let reg3 = self.intrinsics.tls_reg(TLS_REG3);

        let extid = usize::from(tls.active_extid);
        let Some(ext) = self.extensions.get(extid) else {
            error!("invalid extid: {:#06x}", tls.active_extid);
            return Status::FAILURE_UNKNOWN;
        };

        // `open_handle` is the one call that cannot carry a handle yet.
        let opens_handle =
            word.opcode() == OPCODE_HANDLE && word.index() == handle_op::OPEN_HANDLE;
        if !opens_handle && !ext.is_handle_valid(reg0) {
            error!("invalid handle: {reg0:#018x}");
            return Status::FAILURE_INVALID_HANDLE;
        }

        let family_perm = match word.opcode() {
            OPCODE_CONTROL => Perms::CONTROL,
            OPCODE_HANDLE => Perms::HANDLE,
            OPCODE_DEBUG => Perms::DEBUG,
            OPCODE_CALLBACK => Perms::CALLBACK,
            OPCODE_VM => Perms::VM,
            OPCODE_VP => Perms::VP,
            OPCODE_VPS => Perms::VPS,
            OPCODE_INTRINSIC => Perms::INTRINSIC,
            OPCODE_MEM => Perms::MEM,
            opcode => {
                error!("unknown opcode family: {opcode:#06x}");
                return Status::FAILURE_UNSUPPORTED;
            }
        };

        if !ext.perms().contains(family_perm) {
            error!(
                "ext {:#06x} is not granted opcode family {:#06x}",
                tls.active_extid,
                word.opcode(),
            );
            return Status::INVALID_PERM_EXT;
        }

        if family_perm == Perms::DEBUG && !ext.debug_allowed() {
            error!("ext {:#06x} is denied the debug ops", tls.active_extid);
            return Status::INVALID_PERM_DENIED;
        }

        match word.opcode() {
            OPCODE_CONTROL => Self::control_op(tls, word.index()),
            OPCODE_HANDLE => self.handle_op(extid, word.index(), reg0),
            OPCODE_DEBUG => self.debug_op(word.index(), reg1, reg2),
            OPCODE_CALLBACK => self.callback_op(extid, word.index(), reg1),
            OPCODE_VM => self.vm_op(word.index(), reg1),
            OPCODE_VP => self.vp_op(word.index(), reg1),
            OPCODE_VPS => self.vps_op(tls, word.index(), reg1, reg2, reg3),
            OPCODE_INTRINSIC => self.intrinsic_op(word.index(), reg1, reg2),
            OPCODE_MEM => self.mem_op(word.index(), reg1),
            _ => Status::FAILURE_UNSUPPORTED,
        }
    }

    fn control_op(tls: &mut Tls, index: u16) -> Status {
        match index {
            control_op::EXIT => {
                debug!("ext {:#06x} requested exit", tls.active_extid);
                tls.exit_requested = true;
                Status::SUCCESS
            }
            _ => {
                error!("unknown control op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }

    fn handle_op(&mut self, extid: usize, index: u16, reg0: u64) -> Status {
        let ext = &mut self.extensions[extid];
        match index {
            handle_op::OPEN_HANDLE => match ext.open_handle(reg0) {
                Ok(handle) => {
                    self.set_reg0(handle);
                    Status::SUCCESS
                }
                Err(Error::InvalidArgument) => Status::INVALID_PARAMS0,
                Err(_) => Status::FAILURE_UNKNOWN,
            },
            handle_op::CLOSE_HANDLE => match ext.close_handle(reg0) {
                Ok(()) => Status::SUCCESS,
                Err(_) => Status::FAILURE_INVALID_HANDLE,
            },
            _ => {
                error!("unknown handle op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }

    fn debug_op(&mut self, index: u16, reg1: u64, reg2: u64) -> Status {
        match index {
            debug_op::OUT => {
                debug!("{reg1:#018x} {reg2:#018x}");
                Status::SUCCESS
            }
            debug_op::DUMP_VM => {
                let Some(vm) = id_arg(reg1).and_then(|vmid| self.vm_pool.entry(vmid)) else {
                    error!("invalid vmid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                vm.dump();
                Status::SUCCESS
            }
            debug_op::DUMP_VP => {
                let Some(vp) = id_arg(reg1).and_then(|vpid| self.vp_pool.entry(vpid)) else {
                    error!("invalid vpid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                vp.dump();
                Status::SUCCESS
            }
            debug_op::DUMP_VPS => {
                let Some(vps) = id_arg(reg1).and_then(|vpsid| self.vps_pool.entry(vpsid)) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                vps.dump();
                Status::SUCCESS
            }
            debug_op::DUMP_VMEXIT_LOG => {
                let Some(ppid) = id_arg(reg1).filter(|&id| usize::from(id) < MAX_PPS) else {
                    error!("invalid ppid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                self.exit_log.dump(ppid);
                Status::SUCCESS
            }
            debug_op::WRITE_C => {
                let Some(c) = u32::try_from(reg1).ok().and_then(char::from_u32) else {
                    error!("invalid character: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                debug!("{c}");
                Status::SUCCESS
            }
            debug_op::WRITE_STR => self.debug_write_str(reg1),
            _ => {
                error!("unknown debug op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }

    fn debug_write_str(&self, addr: u64) -> Status {
        // One page bounds how much an extension can pump through the
        // debug channel per call.
        const MAX_LEN: usize = 0x1000;

        if addr == 0 {
            error!("null string");
            return Status::INVALID_PARAMS1;
        }

        // Safety: the ABI requires the extension to pass a NUL-terminated
        // string mapped readable at `addr`; the scan is bounded either
        // way.
        let bytes = unsafe {
            let ptr = addr as *const u8;
            let mut len = 0_usize;
            while len < MAX_LEN && ptr.add(len).read() != 0 {
                len += 1;
            }
            core::slice::from_raw_parts(ptr, len)
        };

        match core::str::from_utf8(bytes) {
            Ok(s) => {
                debug!("{s}");
                Status::SUCCESS
            }
            Err(_) => {
                error!("string is not valid utf-8");
                Status::INVALID_PARAMS1
            }
        }
    }

    fn callback_op(&mut self, extid: usize, index: u16, reg1: u64) -> Status {
        let ext = &mut self.extensions[extid];
        let result = match index {
            callback_op::WAIT => {
                // The bootstrap event loop lives in the loader handshake,
                // which this build does not carry.
                error!("callback wait is not supported");
                return Status::FAILURE_UNSUPPORTED;
            }
            callback_op::REGISTER_BOOTSTRAP => ext.register_bootstrap(reg1),
            callback_op::REGISTER_VMEXIT => ext.register_vmexit(reg1),
            callback_op::REGISTER_FAIL => ext.register_fail(reg1),
            _ => {
                error!("unknown callback op index: {index:#06x}");
                return Status::FAILURE_UNSUPPORTED;
            }
        };

        match result {
            Ok(()) => Status::SUCCESS,
            Err(Error::InvalidArgument) => Status::INVALID_PARAMS1,
            Err(_) => Status::FAILURE_UNKNOWN,
        }
    }

    fn vm_op(&mut self, index: u16, reg1: u64) -> Status {
        match index {
            vm_op::CREATE_VM => match self.vm_pool.allocate() {
                Ok(vmid) => {
                    self.set_reg0(u64::from(vmid));
                    Status::SUCCESS
                }
                Err(_) => Status::FAILURE_UNKNOWN,
            },
            vm_op::DESTROY_VM => {
                let Some(vmid) = id_arg(reg1) else {
                    error!("invalid vmid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match self.vm_pool.deallocate(vmid) {
                    Ok(()) => Status::SUCCESS,
                    Err(Error::InvalidArgument) => Status::INVALID_PARAMS1,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            _ => {
                error!("unknown vm op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }

    fn vp_op(&mut self, index: u16, reg1: u64) -> Status {
        match index {
            vp_op::CREATE_VP => {
                let Some(vmid) = id_arg(reg1).filter(|&id| self.vm_pool.is_allocated(id)) else {
                    error!("invalid vmid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match self.vp_pool.allocate(vmid) {
                    Ok(vpid) => {
                        self.set_reg0(u64::from(vpid));
                        Status::SUCCESS
                    }
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            vp_op::DESTROY_VP => {
                let Some(vpid) = id_arg(reg1) else {
                    error!("invalid vpid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match self.vp_pool.deallocate(vpid) {
                    Ok(()) => Status::SUCCESS,
                    Err(Error::InvalidArgument) => Status::INVALID_PARAMS1,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            _ => {
                error!("unknown vp op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn vps_op(&mut self, tls: &mut Tls, index: u16, reg1: u64, reg2: u64, reg3: u64) -> Status {
        match index {
            vps_op::CREATE_VPS => match self.vps_pool.allocate() {
                Ok(vpsid) => {
                    self.set_reg0(u64::from(vpsid));
                    Status::SUCCESS
                }
                Err(_) => Status::FAILURE_UNKNOWN,
            },
            vps_op::DESTROY_VPS => {
                let Some(vpsid) = id_arg(reg1) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match self.vps_pool.deallocate(vpsid) {
                    Ok(()) => Status::SUCCESS,
                    Err(Error::InvalidArgument) => Status::INVALID_PARAMS1,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            vps_op::INIT_AS_ROOT => {
                let Some(state) = self
                    .root_states
                    .get(usize::from(tls.ppid))
                    .copied()
                else {
                    error!("invalid ppid: {:#06x}", tls.ppid);
                    return Status::FAILURE_UNKNOWN;
                };
                let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry_mut(id)) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match vps.state_save_to_vps(&state) {
                    Ok(()) => Status::SUCCESS,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            vps_op::READ8 => self.vps_read(reg1, reg2, |vps, index| {
                vps.read8(index).map(u64::from)
            }),
            vps_op::READ16 => self.vps_read(reg1, reg2, |vps, index| {
                vps.read16(index).map(u64::from)
            }),
            vps_op::READ32 => self.vps_read(reg1, reg2, |vps, index| {
                vps.read32(index).map(u64::from)
            }),
            vps_op::READ64 => self.vps_read(reg1, reg2, crate::vps::Vps::read64),
            vps_op::WRITE8 => {
                let Ok(value) = u8::try_from(reg3) else {
                    error!("value does not fit the field: {reg3:#018x}");
                    return Status::INVALID_PARAMS3;
                };
                self.vps_write(reg1, reg2, |vps, index| vps.write8(index, value))
            }
            vps_op::WRITE16 => {
                let Ok(value) = u16::try_from(reg3) else {
                    error!("value does not fit the field: {reg3:#018x}");
                    return Status::INVALID_PARAMS3;
                };
                self.vps_write(reg1, reg2, |vps, index| vps.write16(index, value))
            }
            vps_op::WRITE32 => {
                let Ok(value) = u32::try_from(reg3) else {
                    error!("value does not fit the field: {reg3:#018x}");
                    return Status::INVALID_PARAMS3;
                };
                self.vps_write(reg1, reg2, |vps, index| vps.write32(index, value))
            }
            vps_op::WRITE64 => self.vps_write(reg1, reg2, |vps, index| vps.write64(index, reg3)),
            vps_op::READ_REG => {
                let Ok(reg) = Reg::try_from(reg2) else {
                    error!("unknown register tag: {reg2:#018x}");
                    return Status::INVALID_PARAMS2;
                };
                let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry(id)) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match vps.read_reg(reg) {
                    Ok(value) => {
                        self.set_reg0(value);
                        Status::SUCCESS
                    }
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            vps_op::WRITE_REG => {
                let Ok(reg) = Reg::try_from(reg2) else {
                    error!("unknown register tag: {reg2:#018x}");
                    return Status::INVALID_PARAMS2;
                };
                let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry_mut(id)) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match vps.write_reg(reg, reg3) {
                    Ok(()) => Status::SUCCESS,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            vps_op::RUN => {
                let Some(vpsid) = id_arg(reg1).filter(|&id| self.vps_pool.entry(id).is_some())
                else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                let Some(vpid) = id_arg(reg2).filter(|&id| self.vp_pool.is_allocated(id)) else {
                    error!("invalid vpid: {reg2:#018x}");
                    return Status::INVALID_PARAMS2;
                };
                let Some(vmid) = id_arg(reg3).filter(|&id| self.vm_pool.is_allocated(id)) else {
                    error!("invalid vmid: {reg3:#018x}");
                    return Status::INVALID_PARAMS3;
                };

                tls.active_vmid = vmid;
                tls.active_vpid = vpid;
                tls.active_vpsid = vpsid;
                self.intrinsics
                    .set_tls_reg(TLS_OFFSET_ACTIVE_VPS, u64::from(vpsid));
                self.run_active(tls)
            }
            vps_op::RUN_CURRENT => self.run_active(tls),
            vps_op::ADVANCE_IP => {
                let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry_mut(id)) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match vps.advance_ip() {
                    Ok(()) => Status::SUCCESS,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            vps_op::ADVANCE_IP_AND_RUN_CURRENT => {
                let Some(vps) = self.vps_pool.entry_mut(tls.active_vpsid) else {
                    error!("no active vps");
                    return Status::FAILURE_UNKNOWN;
                };
                if vps.advance_ip().is_err() {
                    return Status::FAILURE_UNKNOWN;
                }
                self.run_active(tls)
            }
            vps_op::PROMOTE => {
                let Some(slot) = self.root_states.get_mut(usize::from(tls.ppid)) else {
                    error!("invalid ppid: {:#06x}", tls.ppid);
                    return Status::FAILURE_UNKNOWN;
                };
                let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry(id)) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match vps.vps_to_state_save(slot) {
                    Ok(()) => Status::SUCCESS,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            vps_op::CLEAR_VPS => {
                let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry_mut(id)) else {
                    error!("invalid vpsid: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                match vps.clear() {
                    Ok(()) => Status::SUCCESS,
                    Err(_) => Status::FAILURE_UNKNOWN,
                }
            }
            _ => {
                error!("unknown vps op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }

    fn vps_read<F>(&mut self, reg1: u64, index: u64, read: F) -> Status
    where
        F: FnOnce(&crate::vps::Vps<'a, I, P>, u64) -> Result<u64, Error>,
    {
        let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry(id)) else {
            error!("invalid vpsid: {reg1:#018x}");
            return Status::INVALID_PARAMS1;
        };
        match read(vps, index) {
            Ok(value) => {
                self.set_reg0(value);
                Status::SUCCESS
            }
            Err(Error::InvalidArgument) => Status::INVALID_PARAMS2,
            Err(_) => Status::FAILURE_UNKNOWN,
        }
    }

    fn vps_write<F>(&mut self, reg1: u64, index: u64, write: F) -> Status
    where
        F: FnOnce(&mut crate::vps::Vps<'a, I, P>, u64) -> Result<(), Error>,
    {
        let Some(vps) = id_arg(reg1).and_then(|id| self.vps_pool.entry_mut(id)) else {
            error!("invalid vpsid: {reg1:#018x}");
            return Status::INVALID_PARAMS1;
        };
        match write(vps, index) {
            Ok(()) => Status::SUCCESS,
            Err(Error::InvalidArgument) => Status::INVALID_PARAMS2,
            Err(_) => Status::FAILURE_UNKNOWN,
        }
    }

    /// Runs the VPS recorded as active in `tls` and reports the exit
    /// reason in result register 0.
    fn run_active(&mut self, tls: &mut Tls) -> Status {
        let exit_log = &self.exit_log;
        let Some(vps) = self.vps_pool.entry_mut(tls.active_vpsid) else {
            error!("no active vps");
            return Status::FAILURE_UNKNOWN;
        };
        match vps.run(tls, exit_log) {
            Ok(exit_reason) => {
                self.set_reg0(exit_reason);
                Status::SUCCESS
            }
            Err(_) => Status::FAILURE_UNKNOWN,
        }
    }

    fn intrinsic_op(&mut self, index: u16, reg1: u64, reg2: u64) -> Status {
        match index {
            intrinsic_op::RDMSR => {
                let Ok(msr) = u32::try_from(reg1) else {
                    error!("invalid msr: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                self.set_reg0(self.intrinsics.rdmsr(msr));
                Status::SUCCESS
            }
            intrinsic_op::WRMSR => {
                let Ok(msr) = u32::try_from(reg1) else {
                    error!("invalid msr: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                self.intrinsics.wrmsr(msr, reg2);
                Status::SUCCESS
            }
            intrinsic_op::INVLPGA => {
                let Ok(asid) = u32::try_from(reg2) else {
                    error!("invalid asid: {reg2:#018x}");
                    return Status::INVALID_PARAMS2;
                };
                self.intrinsics.invlpga(reg1, asid);
                Status::SUCCESS
            }
            _ => {
                error!("unknown intrinsic op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }

    fn mem_op(&mut self, index: u16, reg1: u64) -> Status {
        match index {
            mem_op::ALLOC_PAGE => {
                let Some(page) = self.page_pool.allocate(AllocTag::Extension) else {
                    error!("page pool exhausted");
                    return Status::FAILURE_UNKNOWN;
                };
                let Some(phys) = self.page_pool.virt_to_phys(page) else {
                    // Safety: the page was just drawn from this pool.
                    unsafe { self.page_pool.deallocate(page, AllocTag::Extension) };
                    error!("page has no physical address");
                    return Status::FAILURE_UNKNOWN;
                };
                self.set_reg0(page.as_ptr() as u64);
                self.set_reg1(phys);
                Status::SUCCESS
            }
            mem_op::FREE_PAGE => {
                let Some(page) = NonNull::new(reg1 as *mut Page) else {
                    error!("null page");
                    return Status::INVALID_PARAMS1;
                };
                // Safety: the ABI requires the extension to pass a page it
                // was handed by `ALLOC_PAGE` and to never touch it again.
                unsafe { self.page_pool.deallocate(page, AllocTag::Extension) };
                Status::SUCCESS
            }
            mem_op::VIRT_TO_PHYS => {
                let Some(page) = NonNull::new(reg1 as *mut Page) else {
                    error!("null page");
                    return Status::INVALID_PARAMS1;
                };
                let Some(phys) = self.page_pool.virt_to_phys(page) else {
                    error!("address is not pool managed: {reg1:#018x}");
                    return Status::INVALID_PARAMS1;
                };
                self.set_reg0(phys);
                Status::SUCCESS
            }
            _ => {
                error!("unknown mem op index: {index:#06x}");
                Status::FAILURE_UNSUPPORTED
            }
        }
    }
}

impl<I: Intrinsics, P: PagePool> fmt::Debug for Microkernel<'_, I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microkernel")
            .field("vm_pool", &self.vm_pool)
            .field("vp_pool", &self.vp_pool)
            .field("vps_pool", &self.vps_pool)
            .finish_non_exhaustive()
    }
}
