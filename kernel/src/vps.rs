//! The module containing the [`Vps`] type, the microkernel's notion of a
//! virtual processor state.
//!
//! A VPS couples one guest VMCB and one host VMCB (both drawn from the
//! page pool) with a lifecycle and an identity, and is the unit the
//! syscall ABI's register access and world-switch operations act on. A
//! VPS is bound to exactly one VP and may only be manipulated by the
//! physical processor it is active on.

use crate::error::Error;
use crate::exit_log::{ExitLog, VmExitRecord};
use crate::intrinsics::{Intrinsics, INVALID_EXIT_REASON};
use crate::page_pool::{AllocTag, PagePool};
use crate::state::{compress_attrib, decompress_attrib, StateSave};
use crate::syscall::Reg;
use crate::tls::{
    Tls, TLS_OFFSET_R10, TLS_OFFSET_R11, TLS_OFFSET_R12, TLS_OFFSET_R13, TLS_OFFSET_R14,
    TLS_OFFSET_R15, TLS_OFFSET_R8, TLS_OFFSET_R9, TLS_OFFSET_RAX, TLS_OFFSET_RBP, TLS_OFFSET_RBX,
    TLS_OFFSET_RCX, TLS_OFFSET_RDI, TLS_OFFSET_RDX, TLS_OFFSET_RSI,
};
use crate::vmcb::{StateSaveArea, Vmcb};
use crate::{SlotState, Vpid, Vpsid, INVALID_ID};
use core::fmt;
use core::mem::offset_of;
use core::ptr::NonNull;
use log::{debug, error};

/// The byte offset of the state save area within the VMCB.
const SSA: u64 = offset_of!(Vmcb, state_save_area) as u64;

/// Computes the VMCB byte offset of a state save area field.
macro_rules! ssa_off {
    ($field:ident) => {
        SSA + offset_of!(StateSaveArea, $field) as u64
    };
}

/// The VMCB byte offsets of the eight segment attribute fields.
///
/// These fields hold the compressed `0x0FFF` attribute form; the
/// width-16 accessors convert so that extensions only ever observe the
/// architectural `0xF0FF` form.
const SEG_ATTRIB_INDEXES: [u64; 8] = [
    ssa_off!(es_attrib),
    ssa_off!(cs_attrib),
    ssa_off!(ss_attrib),
    ssa_off!(ds_attrib),
    ssa_off!(fs_attrib),
    ssa_off!(gs_attrib),
    ssa_off!(ldtr_attrib),
    ssa_off!(tr_attrib),
];

fn is_seg_attrib_index(index: u64) -> bool {
    SEG_ATTRIB_INDEXES.contains(&index)
}

/// Where a [`Reg`] tag resolves to.
#[derive(Debug, Clone, Copy)]
enum RegLocation {
    /// A general purpose register slot in the caller's TLS region.
    TlsGpr(u64),
    /// A 64-bit VMCB field at the given byte offset.
    Vmcb64(u64),
    /// A 32-bit VMCB field; widened on read, truncated on write.
    Vmcb32(u64),
    /// A 16-bit VMCB field; widened on read, truncated on write.
    Vmcb16(u64),
    /// A 16-bit segment attribute field; converted between the
    /// architectural and the compressed form at the boundary.
    SegAttrib(u64),
}

/// Maps every register tag to its storage location.
const fn location(reg: Reg) -> RegLocation {
    use RegLocation::{SegAttrib, TlsGpr, Vmcb16, Vmcb32, Vmcb64};

    match reg {
        Reg::Rax => TlsGpr(TLS_OFFSET_RAX),
        Reg::Rbx => TlsGpr(TLS_OFFSET_RBX),
        Reg::Rcx => TlsGpr(TLS_OFFSET_RCX),
        Reg::Rdx => TlsGpr(TLS_OFFSET_RDX),
        Reg::Rbp => TlsGpr(TLS_OFFSET_RBP),
        Reg::Rsi => TlsGpr(TLS_OFFSET_RSI),
        Reg::Rdi => TlsGpr(TLS_OFFSET_RDI),
        Reg::R8 => TlsGpr(TLS_OFFSET_R8),
        Reg::R9 => TlsGpr(TLS_OFFSET_R9),
        Reg::R10 => TlsGpr(TLS_OFFSET_R10),
        Reg::R11 => TlsGpr(TLS_OFFSET_R11),
        Reg::R12 => TlsGpr(TLS_OFFSET_R12),
        Reg::R13 => TlsGpr(TLS_OFFSET_R13),
        Reg::R14 => TlsGpr(TLS_OFFSET_R14),
        Reg::R15 => TlsGpr(TLS_OFFSET_R15),
        Reg::Rip => Vmcb64(ssa_off!(rip)),
        Reg::Rsp => Vmcb64(ssa_off!(rsp)),
        Reg::Rflags => Vmcb64(ssa_off!(rflags)),
        Reg::GdtrBaseAddr => Vmcb64(ssa_off!(gdtr_base)),
        Reg::GdtrLimit => Vmcb32(ssa_off!(gdtr_limit)),
        Reg::IdtrBaseAddr => Vmcb64(ssa_off!(idtr_base)),
        Reg::IdtrLimit => Vmcb32(ssa_off!(idtr_limit)),
        Reg::Es => Vmcb16(ssa_off!(es_selector)),
        Reg::EsBaseAddr => Vmcb64(ssa_off!(es_base)),
        Reg::EsLimit => Vmcb32(ssa_off!(es_limit)),
        Reg::EsAttributes => SegAttrib(ssa_off!(es_attrib)),
        Reg::Cs => Vmcb16(ssa_off!(cs_selector)),
        Reg::CsBaseAddr => Vmcb64(ssa_off!(cs_base)),
        Reg::CsLimit => Vmcb32(ssa_off!(cs_limit)),
        Reg::CsAttributes => SegAttrib(ssa_off!(cs_attrib)),
        Reg::Ss => Vmcb16(ssa_off!(ss_selector)),
        Reg::SsBaseAddr => Vmcb64(ssa_off!(ss_base)),
        Reg::SsLimit => Vmcb32(ssa_off!(ss_limit)),
        Reg::SsAttributes => SegAttrib(ssa_off!(ss_attrib)),
        Reg::Ds => Vmcb16(ssa_off!(ds_selector)),
        Reg::DsBaseAddr => Vmcb64(ssa_off!(ds_base)),
        Reg::DsLimit => Vmcb32(ssa_off!(ds_limit)),
        Reg::DsAttributes => SegAttrib(ssa_off!(ds_attrib)),
        Reg::Fs => Vmcb16(ssa_off!(fs_selector)),
        Reg::FsBaseAddr => Vmcb64(ssa_off!(fs_base)),
        Reg::FsLimit => Vmcb32(ssa_off!(fs_limit)),
        Reg::FsAttributes => SegAttrib(ssa_off!(fs_attrib)),
        Reg::Gs => Vmcb16(ssa_off!(gs_selector)),
        Reg::GsBaseAddr => Vmcb64(ssa_off!(gs_base)),
        Reg::GsLimit => Vmcb32(ssa_off!(gs_limit)),
        Reg::GsAttributes => SegAttrib(ssa_off!(gs_attrib)),
        Reg::Ldtr => Vmcb16(ssa_off!(ldtr_selector)),
        Reg::LdtrBaseAddr => Vmcb64(ssa_off!(ldtr_base)),
        Reg::LdtrLimit => Vmcb32(ssa_off!(ldtr_limit)),
        Reg::LdtrAttributes => SegAttrib(ssa_off!(ldtr_attrib)),
        Reg::Tr => Vmcb16(ssa_off!(tr_selector)),
        Reg::TrBaseAddr => Vmcb64(ssa_off!(tr_base)),
        Reg::TrLimit => Vmcb32(ssa_off!(tr_limit)),
        Reg::TrAttributes => SegAttrib(ssa_off!(tr_attrib)),
        Reg::Cr0 => Vmcb64(ssa_off!(cr0)),
        Reg::Cr2 => Vmcb64(ssa_off!(cr2)),
        Reg::Cr3 => Vmcb64(ssa_off!(cr3)),
        Reg::Cr4 => Vmcb64(ssa_off!(cr4)),
        Reg::Dr6 => Vmcb64(ssa_off!(dr6)),
        Reg::Dr7 => Vmcb64(ssa_off!(dr7)),
        Reg::Ia32Efer => Vmcb64(ssa_off!(efer)),
        Reg::Ia32Star => Vmcb64(ssa_off!(star)),
        Reg::Ia32Lstar => Vmcb64(ssa_off!(lstar)),
        Reg::Ia32Cstar => Vmcb64(ssa_off!(cstar)),
        Reg::Ia32Fmask => Vmcb64(ssa_off!(sf_mask)),
        Reg::Ia32FsBase => Vmcb64(ssa_off!(fs_base)),
        Reg::Ia32GsBase => Vmcb64(ssa_off!(gs_base)),
        Reg::Ia32KernelGsBase => Vmcb64(ssa_off!(kernel_gs_base)),
        Reg::Ia32SysenterCs => Vmcb64(ssa_off!(sysenter_cs)),
        Reg::Ia32SysenterEsp => Vmcb64(ssa_off!(sysenter_esp)),
        Reg::Ia32SysenterEip => Vmcb64(ssa_off!(sysenter_eip)),
        Reg::Ia32Pat => Vmcb64(ssa_off!(gpat)),
        Reg::Ia32Debugctl => Vmcb64(ssa_off!(dbg_ctl)),
    }
}

/// The two hardware state blocks an allocated VPS owns, with the physical
/// address of each for the `VMRUN` operands.
///
/// Either all four values are present, or the VPS is not allocated and
/// carries none of them.
#[derive(Debug, Clone, Copy)]
pub struct VmcbBacking {
    pub(crate) guest: NonNull<Vmcb>,
    pub(crate) guest_phys: u64,
    pub(crate) host: NonNull<Vmcb>,
    pub(crate) host_phys: u64,
}

/// One virtual processor state slot.
pub struct Vps<'a, I: Intrinsics, P: PagePool> {
    intrinsics: Option<&'a I>,
    page_pool: Option<&'a P>,
    id: Vpsid,
    assigned_vp: Vpid,
    state: SlotState,
    next_free: Option<u16>,
    backing: Option<VmcbBacking>,
}

impl<'a, I: Intrinsics, P: PagePool> Vps<'a, I, P> {
    /// Returns a slot in the `Uninitialized` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            intrinsics: None,
            page_pool: None,
            id: INVALID_ID,
            assigned_vp: INVALID_ID,
            state: SlotState::Uninitialized,
            next_free: None,
            backing: None,
        }
    }

    /// Gives this slot its identity and its collaborators, moving it to
    /// the `Free` state.
    pub fn initialize(
        &mut self,
        intrinsics: &'a I,
        page_pool: &'a P,
        id: Vpsid,
    ) -> Result<(), Error> {
        if self.state != SlotState::Uninitialized {
            error!("vps {:#06x} already initialized", self.id);
            return Err(Error::InvalidState);
        }

        if id == INVALID_ID {
            error!("invalid id");
            self.release();
            return Err(Error::InvalidArgument);
        }

        self.intrinsics = Some(intrinsics);
        self.page_pool = Some(page_pool);
        self.id = id;
        self.state = SlotState::Free;
        Ok(())
    }

    /// Returns the slot to the `Uninitialized` state, releasing any
    /// backing it still owns.
    pub fn release(&mut self) {
        self.deallocate();
        self.id = INVALID_ID;
        self.assigned_vp = INVALID_ID;
        self.next_free = None;
        self.intrinsics = None;
        self.page_pool = None;
        self.state = SlotState::Uninitialized;
    }

    /// Returns the ID of this VPS.
    #[must_use]
    pub const fn id(&self) -> Vpsid {
        self.id
    }

    /// Returns the lifecycle state of this VPS.
    #[must_use]
    pub const fn state(&self) -> SlotState {
        self.state
    }

    /// Returns whether this VPS currently owns its VMCBs.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.state == SlotState::Allocated
    }

    /// Returns the ID of the VP this VPS is bound to, or [`INVALID_ID`].
    #[must_use]
    pub const fn assigned_vp(&self) -> Vpid {
        self.assigned_vp
    }

    pub(crate) const fn next_free(&self) -> Option<u16> {
        self.next_free
    }

    pub(crate) fn set_next_free(&mut self, next: Option<u16>) {
        self.next_free = next;
    }

    /// Returns the backing of this VPS, if it is allocated.
    #[must_use]
    pub const fn backing(&self) -> Option<&VmcbBacking> {
        self.backing.as_ref()
    }

    /// Draws the guest and host VMCB from the page pool and moves the
    /// slot to the `Allocated` state.
    ///
    /// All-or-nothing: if any sub-step fails, everything acquired by this
    /// call is returned to the pool in reverse acquisition order and the
    /// slot stays `Free`.
    pub fn allocate(&mut self) -> Result<(), Error> {
        match self.state {
            SlotState::Uninitialized => {
                error!("vps not initialized");
                return Err(Error::InvalidState);
            }
            SlotState::Allocated => {
                error!("vps {:#06x} already allocated", self.id);
                return Err(Error::InvalidState);
            }
            SlotState::Free => {}
        }

        let page_pool = self.page_pool.ok_or(Error::InvalidState)?;

        let Some(guest) = page_pool.allocate(AllocTag::GuestVmcb) else {
            error!("vps {:#06x}: guest VMCB allocation failed", self.id);
            return Err(Error::ResourceExhausted);
        };
        let guest: NonNull<Vmcb> = guest.cast();

        let Some(guest_phys) = page_pool.virt_to_phys(guest.cast()) else {
            // Safety: `guest` was just drawn from this pool with this tag.
            unsafe { page_pool.deallocate(guest.cast(), AllocTag::GuestVmcb) };
            error!("vps {:#06x}: guest VMCB has no physical address", self.id);
            return Err(Error::InvalidArgument);
        };

        let Some(host) = page_pool.allocate(AllocTag::HostVmcb) else {
            // Safety: same as above.
            unsafe { page_pool.deallocate(guest.cast(), AllocTag::GuestVmcb) };
            error!("vps {:#06x}: host VMCB allocation failed", self.id);
            return Err(Error::ResourceExhausted);
        };
        let host: NonNull<Vmcb> = host.cast();

        let Some(host_phys) = page_pool.virt_to_phys(host.cast()) else {
            // Safety: same as above, reverse acquisition order.
            unsafe {
                page_pool.deallocate(host.cast(), AllocTag::HostVmcb);
                page_pool.deallocate(guest.cast(), AllocTag::GuestVmcb);
            }
            error!("vps {:#06x}: host VMCB has no physical address", self.id);
            return Err(Error::InvalidArgument);
        };

        // Safety: both blocks are exclusively ours and exactly one page.
        unsafe {
            core::ptr::write_bytes(guest.as_ptr().cast::<u8>(), 0, 0x1000);
            core::ptr::write_bytes(host.as_ptr().cast::<u8>(), 0, 0x1000);
        }

        self.backing = Some(VmcbBacking {
            guest,
            guest_phys,
            host,
            host_phys,
        });
        self.state = SlotState::Allocated;
        Ok(())
    }

    /// Returns the VMCBs to the page pool, clears the VP binding, and
    /// moves the slot back to the `Free` state.
    ///
    /// A no-op on a slot that owns nothing.
    pub fn deallocate(&mut self) {
        if let Some(backing) = self.backing.take() {
            if let Some(page_pool) = self.page_pool {
                // Safety: the backing pages were drawn from this pool with
                // these tags and are not referenced past this point.
                unsafe {
                    page_pool.deallocate(backing.host.cast(), AllocTag::HostVmcb);
                    page_pool.deallocate(backing.guest.cast(), AllocTag::GuestVmcb);
                }
            }
        }

        self.assigned_vp = INVALID_ID;
        if self.state == SlotState::Allocated {
            self.state = SlotState::Free;
        }
    }

    /// Binds this VPS to the VP `vpid`.
    pub fn assign_vp(&mut self, vpid: Vpid) -> Result<(), Error> {
        if !self.is_allocated() {
            error!("invalid vps");
            return Err(Error::InvalidState);
        }

        if vpid == INVALID_ID {
            error!("invalid vpid");
            return Err(Error::InvalidArgument);
        }

        self.assigned_vp = vpid;
        Ok(())
    }

    fn intrinsics_ref(&self) -> Result<&'a I, Error> {
        self.intrinsics.ok_or_else(|| {
            error!("vps not initialized");
            Error::InvalidState
        })
    }

    fn guest_vmcb(&self) -> Result<&Vmcb, Error> {
        match &self.backing {
            // Safety: the guest VMCB is exclusively owned by this VPS for
            // as long as the backing exists.
            Some(backing) => Ok(unsafe { backing.guest.as_ref() }),
            None => {
                error!("invalid vps");
                Err(Error::InvalidState)
            }
        }
    }

    fn guest_vmcb_mut(&mut self) -> Result<&mut Vmcb, Error> {
        match &mut self.backing {
            // Safety: same as `guest_vmcb`, and the caller holds
            // `&mut self`.
            Some(backing) => Ok(unsafe { backing.guest.as_mut() }),
            None => {
                error!("invalid vps");
                Err(Error::InvalidState)
            }
        }
    }

    /// Loads `state` into this VPS: the 15 general purpose registers go
    /// to the caller's TLS slots, everything else to the guest VMCB.
    pub fn state_save_to_vps(&mut self, state: &StateSave) -> Result<(), Error> {
        let intrinsics = self.intrinsics_ref()?;
        let vmcb = self.guest_vmcb_mut()?;

        intrinsics.set_tls_reg(TLS_OFFSET_RAX, state.rax);
        intrinsics.set_tls_reg(TLS_OFFSET_RBX, state.rbx);
        intrinsics.set_tls_reg(TLS_OFFSET_RCX, state.rcx);
        intrinsics.set_tls_reg(TLS_OFFSET_RDX, state.rdx);
        intrinsics.set_tls_reg(TLS_OFFSET_RBP, state.rbp);
        intrinsics.set_tls_reg(TLS_OFFSET_RSI, state.rsi);
        intrinsics.set_tls_reg(TLS_OFFSET_RDI, state.rdi);
        intrinsics.set_tls_reg(TLS_OFFSET_R8, state.r8);
        intrinsics.set_tls_reg(TLS_OFFSET_R9, state.r9);
        intrinsics.set_tls_reg(TLS_OFFSET_R10, state.r10);
        intrinsics.set_tls_reg(TLS_OFFSET_R11, state.r11);
        intrinsics.set_tls_reg(TLS_OFFSET_R12, state.r12);
        intrinsics.set_tls_reg(TLS_OFFSET_R13, state.r13);
        intrinsics.set_tls_reg(TLS_OFFSET_R14, state.r14);
        intrinsics.set_tls_reg(TLS_OFFSET_R15, state.r15);

        vmcb.state_save_area.rsp = state.rsp;
        vmcb.state_save_area.rip = state.rip;
        vmcb.state_save_area.rflags = state.rflags;

        vmcb.state_save_area.gdtr_limit = u32::from(state.gdtr_limit);
        vmcb.state_save_area.gdtr_base = state.gdtr_base;
        vmcb.state_save_area.idtr_limit = u32::from(state.idtr_limit);
        vmcb.state_save_area.idtr_base = state.idtr_base;

        vmcb.state_save_area.es_selector = state.es_selector;
        vmcb.state_save_area.es_attrib = compress_attrib(state.es_attrib);
        vmcb.state_save_area.es_limit = state.es_limit;
        vmcb.state_save_area.es_base = state.es_base;

        vmcb.state_save_area.cs_selector = state.cs_selector;
        vmcb.state_save_area.cs_attrib = compress_attrib(state.cs_attrib);
        vmcb.state_save_area.cs_limit = state.cs_limit;
        vmcb.state_save_area.cs_base = state.cs_base;

        vmcb.state_save_area.ss_selector = state.ss_selector;
        vmcb.state_save_area.ss_attrib = compress_attrib(state.ss_attrib);
        vmcb.state_save_area.ss_limit = state.ss_limit;
        vmcb.state_save_area.ss_base = state.ss_base;

        vmcb.state_save_area.ds_selector = state.ds_selector;
        vmcb.state_save_area.ds_attrib = compress_attrib(state.ds_attrib);
        vmcb.state_save_area.ds_limit = state.ds_limit;
        vmcb.state_save_area.ds_base = state.ds_base;

        vmcb.state_save_area.fs_selector = state.fs_selector;
        vmcb.state_save_area.fs_attrib = compress_attrib(state.fs_attrib);
        vmcb.state_save_area.fs_limit = state.fs_limit;

        vmcb.state_save_area.gs_selector = state.gs_selector;
        vmcb.state_save_area.gs_attrib = compress_attrib(state.gs_attrib);
        vmcb.state_save_area.gs_limit = state.gs_limit;

        vmcb.state_save_area.ldtr_selector = state.ldtr_selector;
        vmcb.state_save_area.ldtr_attrib = compress_attrib(state.ldtr_attrib);
        vmcb.state_save_area.ldtr_limit = state.ldtr_limit;
        vmcb.state_save_area.ldtr_base = state.ldtr_base;

        vmcb.state_save_area.tr_selector = state.tr_selector;
        vmcb.state_save_area.tr_attrib = compress_attrib(state.tr_attrib);
        vmcb.state_save_area.tr_limit = state.tr_limit;
        vmcb.state_save_area.tr_base = state.tr_base;

        vmcb.state_save_area.cr0 = state.cr0;
        vmcb.state_save_area.cr2 = state.cr2;
        vmcb.state_save_area.cr3 = state.cr3;
        vmcb.state_save_area.cr4 = state.cr4;

        vmcb.state_save_area.dr6 = state.dr6;
        vmcb.state_save_area.dr7 = state.dr7;

        vmcb.state_save_area.efer = state.ia32_efer;
        vmcb.state_save_area.star = state.ia32_star;
        vmcb.state_save_area.lstar = state.ia32_lstar;
        vmcb.state_save_area.cstar = state.ia32_cstar;
        vmcb.state_save_area.sf_mask = state.ia32_fmask;
        vmcb.state_save_area.fs_base = state.ia32_fs_base;
        vmcb.state_save_area.gs_base = state.ia32_gs_base;
        vmcb.state_save_area.kernel_gs_base = state.ia32_kernel_gs_base;
        vmcb.state_save_area.sysenter_cs = state.ia32_sysenter_cs;
        vmcb.state_save_area.sysenter_esp = state.ia32_sysenter_esp;
        vmcb.state_save_area.sysenter_eip = state.ia32_sysenter_eip;
        vmcb.state_save_area.gpat = state.ia32_pat;
        vmcb.state_save_area.dbg_ctl = state.ia32_debugctl;

        Ok(())
    }

    /// Stores this VPS's state into `state`, the inverse of
    /// [`Vps::state_save_to_vps`].
    ///
    /// GDTR/IDTR limits are read back truncated to their architectural
    /// 16 bits.
    pub fn vps_to_state_save(&self, state: &mut StateSave) -> Result<(), Error> {
        let intrinsics = self.intrinsics_ref()?;
        let vmcb = self.guest_vmcb()?;

        state.rax = intrinsics.tls_reg(TLS_OFFSET_RAX);
        state.rbx = intrinsics.tls_reg(TLS_OFFSET_RBX);
        state.rcx = intrinsics.tls_reg(TLS_OFFSET_RCX);
        state.rdx = intrinsics.tls_reg(TLS_OFFSET_RDX);
        state.rbp = intrinsics.tls_reg(TLS_OFFSET_RBP);
        state.rsi = intrinsics.tls_reg(TLS_OFFSET_RSI);
        state.rdi = intrinsics.tls_reg(TLS_OFFSET_RDI);
        state.r8 = intrinsics.tls_reg(TLS_OFFSET_R8);
        state.r9 = intrinsics.tls_reg(TLS_OFFSET_R9);
        state.r10 = intrinsics.tls_reg(TLS_OFFSET_R10);
        state.r11 = intrinsics.tls_reg(TLS_OFFSET_R11);
        state.r12 = intrinsics.tls_reg(TLS_OFFSET_R12);
        state.r13 = intrinsics.tls_reg(TLS_OFFSET_R13);
        state.r14 = intrinsics.tls_reg(TLS_OFFSET_R14);
        state.r15 = intrinsics.tls_reg(TLS_OFFSET_R15);

        state.rsp = vmcb.state_save_area.rsp;
        state.rip = vmcb.state_save_area.rip;
        state.rflags = vmcb.state_save_area.rflags;

        state.gdtr_limit = vmcb.state_save_area.gdtr_limit as u16;
        state.gdtr_base = vmcb.state_save_area.gdtr_base;
        state.idtr_limit = vmcb.state_save_area.idtr_limit as u16;
        state.idtr_base = vmcb.state_save_area.idtr_base;

        state.es_selector = vmcb.state_save_area.es_selector;
        state.es_attrib = decompress_attrib(vmcb.state_save_area.es_attrib);
        state.es_limit = vmcb.state_save_area.es_limit;
        state.es_base = vmcb.state_save_area.es_base;

        state.cs_selector = vmcb.state_save_area.cs_selector;
        state.cs_attrib = decompress_attrib(vmcb.state_save_area.cs_attrib);
        state.cs_limit = vmcb.state_save_area.cs_limit;
        state.cs_base = vmcb.state_save_area.cs_base;

        state.ss_selector = vmcb.state_save_area.ss_selector;
        state.ss_attrib = decompress_attrib(vmcb.state_save_area.ss_attrib);
        state.ss_limit = vmcb.state_save_area.ss_limit;
        state.ss_base = vmcb.state_save_area.ss_base;

        state.ds_selector = vmcb.state_save_area.ds_selector;
        state.ds_attrib = decompress_attrib(vmcb.state_save_area.ds_attrib);
        state.ds_limit = vmcb.state_save_area.ds_limit;
        state.ds_base = vmcb.state_save_area.ds_base;

        state.fs_selector = vmcb.state_save_area.fs_selector;
        state.fs_attrib = decompress_attrib(vmcb.state_save_area.fs_attrib);
        state.fs_limit = vmcb.state_save_area.fs_limit;

        state.gs_selector = vmcb.state_save_area.gs_selector;
        state.gs_attrib = decompress_attrib(vmcb.state_save_area.gs_attrib);
        state.gs_limit = vmcb.state_save_area.gs_limit;

        state.ldtr_selector = vmcb.state_save_area.ldtr_selector;
        state.ldtr_attrib = decompress_attrib(vmcb.state_save_area.ldtr_attrib);
        state.ldtr_limit = vmcb.state_save_area.ldtr_limit;
        state.ldtr_base = vmcb.state_save_area.ldtr_base;

        state.tr_selector = vmcb.state_save_area.tr_selector;
        state.tr_attrib = decompress_attrib(vmcb.state_save_area.tr_attrib);
        state.tr_limit = vmcb.state_save_area.tr_limit;
        state.tr_base = vmcb.state_save_area.tr_base;

        state.cr0 = vmcb.state_save_area.cr0;
        state.cr2 = vmcb.state_save_area.cr2;
        state.cr3 = vmcb.state_save_area.cr3;
        state.cr4 = vmcb.state_save_area.cr4;

        state.dr6 = vmcb.state_save_area.dr6;
        state.dr7 = vmcb.state_save_area.dr7;

        state.ia32_efer = vmcb.state_save_area.efer;
        state.ia32_star = vmcb.state_save_area.star;
        state.ia32_lstar = vmcb.state_save_area.lstar;
        state.ia32_cstar = vmcb.state_save_area.cstar;
        state.ia32_fmask = vmcb.state_save_area.sf_mask;
        state.ia32_fs_base = vmcb.state_save_area.fs_base;
        state.ia32_gs_base = vmcb.state_save_area.gs_base;
        state.ia32_kernel_gs_base = vmcb.state_save_area.kernel_gs_base;
        state.ia32_sysenter_cs = vmcb.state_save_area.sysenter_cs;
        state.ia32_sysenter_esp = vmcb.state_save_area.sysenter_esp;
        state.ia32_sysenter_eip = vmcb.state_save_area.sysenter_eip;
        state.ia32_pat = vmcb.state_save_area.gpat;
        state.ia32_debugctl = vmcb.state_save_area.dbg_ctl;

        Ok(())
    }

    /// Reads the 8-bit guest VMCB field at byte offset `index`.
    pub fn read8(&self, index: u64) -> Result<u8, Error> {
        self.guest_vmcb()?.read::<u8>(index)
    }

    /// Reads the 16-bit guest VMCB field at byte offset `index`.
    ///
    /// Segment attribute fields are returned in the architectural form.
    pub fn read16(&self, index: u64) -> Result<u16, Error> {
        let value = self.guest_vmcb()?.read::<u16>(index)?;
        if is_seg_attrib_index(index) {
            Ok(decompress_attrib(value))
        } else {
            Ok(value)
        }
    }

    /// Reads the 32-bit guest VMCB field at byte offset `index`.
    pub fn read32(&self, index: u64) -> Result<u32, Error> {
        self.guest_vmcb()?.read::<u32>(index)
    }

    /// Reads the 64-bit guest VMCB field at byte offset `index`.
    pub fn read64(&self, index: u64) -> Result<u64, Error> {
        self.guest_vmcb()?.read::<u64>(index)
    }

    /// Writes the 8-bit guest VMCB field at byte offset `index`.
    pub fn write8(&mut self, index: u64, value: u8) -> Result<(), Error> {
        self.guest_vmcb_mut()?.write(index, value)
    }

    /// Writes the 16-bit guest VMCB field at byte offset `index`.
    ///
    /// Segment attribute fields are given in the architectural form and
    /// stored compressed.
    pub fn write16(&mut self, index: u64, value: u16) -> Result<(), Error> {
        let vmcb = self.guest_vmcb_mut()?;
        if is_seg_attrib_index(index) {
            vmcb.write(index, compress_attrib(value))
        } else {
            vmcb.write(index, value)
        }
    }

    /// Writes the 32-bit guest VMCB field at byte offset `index`.
    pub fn write32(&mut self, index: u64, value: u32) -> Result<(), Error> {
        self.guest_vmcb_mut()?.write(index, value)
    }

    /// Writes the 64-bit guest VMCB field at byte offset `index`.
    pub fn write64(&mut self, index: u64, value: u64) -> Result<(), Error> {
        self.guest_vmcb_mut()?.write(index, value)
    }

    /// Reads the register named by `reg`.
    ///
    /// Fields narrower than 64 bits are zero-extended; segment attributes
    /// are returned in the architectural form.
    pub fn read_reg(&self, reg: Reg) -> Result<u64, Error> {
        if !self.is_allocated() {
            error!("invalid vps");
            return Err(Error::InvalidState);
        }

        match location(reg) {
            RegLocation::TlsGpr(offset) => Ok(self.intrinsics_ref()?.tls_reg(offset)),
            RegLocation::Vmcb64(offset) => self.guest_vmcb()?.read::<u64>(offset),
            RegLocation::Vmcb32(offset) => self.guest_vmcb()?.read::<u32>(offset).map(u64::from),
            RegLocation::Vmcb16(offset) => self.guest_vmcb()?.read::<u16>(offset).map(u64::from),
            RegLocation::SegAttrib(offset) => self
                .guest_vmcb()?
                .read::<u16>(offset)
                .map(|raw| u64::from(decompress_attrib(raw))),
        }
    }

    /// Writes `value` to the register named by `reg`.
    ///
    /// Fields narrower than 64 bits are truncated; segment attributes are
    /// given in the architectural form.
    pub fn write_reg(&mut self, reg: Reg, value: u64) -> Result<(), Error> {
        if !self.is_allocated() {
            error!("invalid vps");
            return Err(Error::InvalidState);
        }

        match location(reg) {
            RegLocation::TlsGpr(offset) => {
                self.intrinsics_ref()?.set_tls_reg(offset, value);
                Ok(())
            }
            RegLocation::Vmcb64(offset) => self.guest_vmcb_mut()?.write(offset, value),
            RegLocation::Vmcb32(offset) => self.guest_vmcb_mut()?.write(offset, value as u32),
            RegLocation::Vmcb16(offset) => self.guest_vmcb_mut()?.write(offset, value as u16),
            RegLocation::SegAttrib(offset) => self
                .guest_vmcb_mut()?
                .write(offset, compress_attrib(value as u16)),
        }
    }

    /// Runs the VPS. Does not return until a VMExit occurs; returns the
    /// VMExit reason.
    ///
    /// On entry failure the full VPS state is dumped on the debug channel
    /// and an error is returned; the VPS stays allocated so that the
    /// caller may decide whether to zombify it or to retry.
    pub fn run(&mut self, tls: &Tls, exit_log: &ExitLog) -> Result<u64, Error> {
        let intrinsics = self.intrinsics_ref()?;
        let Some(backing) = self.backing else {
            error!("invalid vps");
            return Err(Error::InvalidState);
        };

        let exit_reason = intrinsics.vmrun(
            backing.guest,
            backing.guest_phys,
            backing.host,
            backing.host_phys,
        );

        if exit_reason == INVALID_EXIT_REASON {
            // The guest context was never loaded, so TLS and the VMCB
            // still describe the attempted entry.
            self.dump();
            error!("vmrun failed");
            return Err(Error::HardwareEntryFailure);
        }

        if log::log_enabled!(log::Level::Debug) {
            let vmcb = self.guest_vmcb()?;
            exit_log.add(
                tls.ppid,
                VmExitRecord {
                    vmid: tls.active_vmid,
                    vpid: tls.active_vpid,
                    vpsid: tls.active_vpsid,
                    exit_reason,
                    exit_info1: vmcb.control_area.exit_info1,
                    exit_info2: vmcb.control_area.exit_info2,
                    exit_int_info: vmcb.control_area.exit_int_info,
                    rax: intrinsics.tls_reg(TLS_OFFSET_RAX),
                    rbx: intrinsics.tls_reg(TLS_OFFSET_RBX),
                    rcx: intrinsics.tls_reg(TLS_OFFSET_RCX),
                    rdx: intrinsics.tls_reg(TLS_OFFSET_RDX),
                    rbp: intrinsics.tls_reg(TLS_OFFSET_RBP),
                    rsi: intrinsics.tls_reg(TLS_OFFSET_RSI),
                    rdi: intrinsics.tls_reg(TLS_OFFSET_RDI),
                    r8: intrinsics.tls_reg(TLS_OFFSET_R8),
                    r9: intrinsics.tls_reg(TLS_OFFSET_R9),
                    r10: intrinsics.tls_reg(TLS_OFFSET_R10),
                    r11: intrinsics.tls_reg(TLS_OFFSET_R11),
                    r12: intrinsics.tls_reg(TLS_OFFSET_R12),
                    r13: intrinsics.tls_reg(TLS_OFFSET_R13),
                    r14: intrinsics.tls_reg(TLS_OFFSET_R14),
                    r15: intrinsics.tls_reg(TLS_OFFSET_R15),
                    rsp: vmcb.state_save_area.rsp,
                    rip: vmcb.state_save_area.rip,
                },
            );
        }

        Ok(exit_reason)
    }

    /// Sets the guest `rip` to the next-RIP the hardware decoded for the
    /// intercepted instruction.
    ///
    /// The current VMExit must be one for which the processor populates
    /// next-RIP (see 15.7.1 Next Sequential Instruction Pointer); on
    /// other exits this reads a stale value.
    pub fn advance_ip(&mut self) -> Result<(), Error> {
        let vmcb = self.guest_vmcb_mut()?;
        vmcb.state_save_area.rip = vmcb.control_area.nrip;
        Ok(())
    }

    /// Zeroes the VMCB clean bits, forcing the processor to reload the
    /// whole VMCB on the next `VMRUN`.
    ///
    /// Hardware specific; does not change the architectural state stored
    /// in the VPS.
    ///
    /// See: 15.15 VMCB State Caching
    pub fn clear(&mut self) -> Result<(), Error> {
        self.guest_vmcb_mut()?.control_area.vmcb_clean = 0;
        Ok(())
    }

    /// Dumps the VPS on the debug channel: identity, assignment, the TLS
    /// general purpose registers, and the guest VMCB.
    pub fn dump(&self) {
        if self.id == INVALID_ID {
            error!("dump of an uninitialized vps");
            return;
        }

        debug!("vps [{:#06x}] dump:", self.id);
        debug!("  allocated                   {}", if self.is_allocated() { "yes" } else { "no" });
        if self.assigned_vp == INVALID_ID {
            debug!("  assigned vp                 unassigned");
        } else {
            dump_field("assigned vp", u64::from(self.assigned_vp));
        }

        if !self.is_allocated() {
            return;
        }

        let (Ok(intrinsics), Ok(vmcb)) = (self.intrinsics_ref(), self.guest_vmcb()) else {
            return;
        };

        dump_field("rax", intrinsics.tls_reg(TLS_OFFSET_RAX));
        dump_field("rbx", intrinsics.tls_reg(TLS_OFFSET_RBX));
        dump_field("rcx", intrinsics.tls_reg(TLS_OFFSET_RCX));
        dump_field("rdx", intrinsics.tls_reg(TLS_OFFSET_RDX));
        dump_field("rbp", intrinsics.tls_reg(TLS_OFFSET_RBP));
        dump_field("rsi", intrinsics.tls_reg(TLS_OFFSET_RSI));
        dump_field("rdi", intrinsics.tls_reg(TLS_OFFSET_RDI));
        dump_field("r8", intrinsics.tls_reg(TLS_OFFSET_R8));
        dump_field("r9", intrinsics.tls_reg(TLS_OFFSET_R9));
        dump_field("r10", intrinsics.tls_reg(TLS_OFFSET_R10));
        dump_field("r11", intrinsics.tls_reg(TLS_OFFSET_R11));
        dump_field("r12", intrinsics.tls_reg(TLS_OFFSET_R12));
        dump_field("r13", intrinsics.tls_reg(TLS_OFFSET_R13));
        dump_field("r14", intrinsics.tls_reg(TLS_OFFSET_R14));
        dump_field("r15", intrinsics.tls_reg(TLS_OFFSET_R15));

        let ctrl = &vmcb.control_area;
        dump_field("intercept_cr_read", u64::from(ctrl.intercept_cr_read));
        dump_field("intercept_cr_write", u64::from(ctrl.intercept_cr_write));
        dump_field("intercept_dr_read", u64::from(ctrl.intercept_dr_read));
        dump_field("intercept_dr_write", u64::from(ctrl.intercept_dr_write));
        dump_field("intercept_exception", u64::from(ctrl.intercept_exception));
        dump_field("intercept_misc1", u64::from(ctrl.intercept_misc1));
        dump_field("intercept_misc2", u64::from(ctrl.intercept_misc2));
        dump_field("intercept_misc3", u64::from(ctrl.intercept_misc3));
        dump_field("pause_filter_threshold", u64::from(ctrl.pause_filter_threshold));
        dump_field("pause_filter_count", u64::from(ctrl.pause_filter_count));
        dump_field("iopm_base_pa", ctrl.iopm_base_pa);
        dump_field("msrpm_base_pa", ctrl.msrpm_base_pa);
        dump_field("tsc_offset", ctrl.tsc_offset);
        dump_field("guest_asid", u64::from(ctrl.guest_asid));
        dump_field("tlb_control", u64::from(ctrl.tlb_control));
        dump_field("vintr", ctrl.vintr);
        dump_field("interrupt_shadow", ctrl.interrupt_shadow);
        dump_field("exit_code", ctrl.exit_code);
        dump_field("exit_info1", ctrl.exit_info1);
        dump_field("exit_info2", ctrl.exit_info2);
        dump_field("exit_int_info", ctrl.exit_int_info);
        dump_field("np_enable", ctrl.np_enable);
        dump_field("event_inj", ctrl.event_inj);
        dump_field("ncr3", ctrl.ncr3);
        dump_field("vmcb_clean", ctrl.vmcb_clean);
        dump_field("nrip", ctrl.nrip);
        dump_field("num_of_bytes_fetched", u64::from(ctrl.num_of_bytes_fetched));

        let ssa = &vmcb.state_save_area;
        dump_field("es_selector", u64::from(ssa.es_selector));
        dump_field("es_attrib", u64::from(ssa.es_attrib));
        dump_field("es_limit", u64::from(ssa.es_limit));
        dump_field("es_base", ssa.es_base);
        dump_field("cs_selector", u64::from(ssa.cs_selector));
        dump_field("cs_attrib", u64::from(ssa.cs_attrib));
        dump_field("cs_limit", u64::from(ssa.cs_limit));
        dump_field("cs_base", ssa.cs_base);
        dump_field("ss_selector", u64::from(ssa.ss_selector));
        dump_field("ss_attrib", u64::from(ssa.ss_attrib));
        dump_field("ss_limit", u64::from(ssa.ss_limit));
        dump_field("ss_base", ssa.ss_base);
        dump_field("ds_selector", u64::from(ssa.ds_selector));
        dump_field("ds_attrib", u64::from(ssa.ds_attrib));
        dump_field("ds_limit", u64::from(ssa.ds_limit));
        dump_field("ds_base", ssa.ds_base);
        dump_field("fs_selector", u64::from(ssa.fs_selector));
        dump_field("fs_attrib", u64::from(ssa.fs_attrib));
        dump_field("fs_limit", u64::from(ssa.fs_limit));
        dump_field("fs_base", ssa.fs_base);
        dump_field("gs_selector", u64::from(ssa.gs_selector));
        dump_field("gs_attrib", u64::from(ssa.gs_attrib));
        dump_field("gs_limit", u64::from(ssa.gs_limit));
        dump_field("gs_base", ssa.gs_base);
        dump_field("gdtr_limit", u64::from(ssa.gdtr_limit));
        dump_field("gdtr_base", ssa.gdtr_base);
        dump_field("idtr_limit", u64::from(ssa.idtr_limit));
        dump_field("idtr_base", ssa.idtr_base);
        dump_field("ldtr_selector", u64::from(ssa.ldtr_selector));
        dump_field("ldtr_attrib", u64::from(ssa.ldtr_attrib));
        dump_field("ldtr_limit", u64::from(ssa.ldtr_limit));
        dump_field("ldtr_base", ssa.ldtr_base);
        dump_field("tr_selector", u64::from(ssa.tr_selector));
        dump_field("tr_attrib", u64::from(ssa.tr_attrib));
        dump_field("tr_limit", u64::from(ssa.tr_limit));
        dump_field("tr_base", ssa.tr_base);
        dump_field("cpl", u64::from(ssa.cpl));
        dump_field("efer", ssa.efer);
        dump_field("cr4", ssa.cr4);
        dump_field("cr3", ssa.cr3);
        dump_field("cr0", ssa.cr0);
        dump_field("dr7", ssa.dr7);
        dump_field("dr6", ssa.dr6);
        dump_field("rflags", ssa.rflags);
        dump_field("rip", ssa.rip);
        dump_field("rsp", ssa.rsp);
        dump_field("rax (vmcb)", ssa.rax);
        dump_field("star", ssa.star);
        dump_field("lstar", ssa.lstar);
        dump_field("cstar", ssa.cstar);
        dump_field("sf_mask", ssa.sf_mask);
        dump_field("kernel_gs_base", ssa.kernel_gs_base);
        dump_field("sysenter_cs", ssa.sysenter_cs);
        dump_field("sysenter_esp", ssa.sysenter_esp);
        dump_field("sysenter_eip", ssa.sysenter_eip);
        dump_field("cr2", ssa.cr2);
        dump_field("gpat", ssa.gpat);
        dump_field("dbg_ctl", ssa.dbg_ctl);
    }
}

fn dump_field(name: &str, value: u64) {
    debug!("  {name:<28}{value:#018x}");
}

impl<I: Intrinsics, P: PagePool> Default for Vps<'_, I, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Intrinsics, P: PagePool> fmt::Debug for Vps<'_, I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vps")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("assigned_vp", &self.assigned_vp)
            .field("next_free", &self.next_free)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_test_logging, MockIntrinsics, MockPagePool};
    use crate::tls::TLS_OFFSET_ACTIVE_VPS;

    fn allocated_vps<'a>(
        intrinsics: &'a MockIntrinsics,
        pool: &'a MockPagePool,
    ) -> Vps<'a, MockIntrinsics, MockPagePool> {
        let mut vps = Vps::new();
        vps.initialize(intrinsics, pool, 0).unwrap();
        vps.allocate().unwrap();
        vps
    }

    #[test]
    fn lifecycle_walks_uninitialized_free_allocated() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = Vps::new();
        assert_eq!(vps.state(), SlotState::Uninitialized);
        assert_eq!(vps.allocate(), Err(Error::InvalidState));

        vps.initialize(&intrinsics, &pool, 3).unwrap();
        assert_eq!(vps.state(), SlotState::Free);
        assert_eq!(vps.id(), 3);
        assert_eq!(
            vps.initialize(&intrinsics, &pool, 3),
            Err(Error::InvalidState)
        );

        vps.allocate().unwrap();
        assert_eq!(vps.state(), SlotState::Allocated);
        assert_eq!(vps.allocate(), Err(Error::InvalidState));

        let backing = vps.backing().unwrap();
        assert_ne!(backing.guest_phys, backing.host_phys);
        assert_eq!(backing.guest_phys % 0x1000, 0);
        assert_eq!(backing.host_phys % 0x1000, 0);

        vps.deallocate();
        assert_eq!(vps.state(), SlotState::Free);
        assert!(vps.backing().is_none());
        assert_eq!(pool.outstanding(), 0);

        // Deallocating a free slot is a no-op.
        vps.deallocate();
        assert_eq!(vps.state(), SlotState::Free);

        vps.release();
        assert_eq!(vps.state(), SlotState::Uninitialized);
    }

    #[test]
    fn initialize_rejects_the_sentinel_id() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps: Vps<'_, _, _> = Vps::new();
        assert_eq!(
            vps.initialize(&intrinsics, &pool, INVALID_ID),
            Err(Error::InvalidArgument)
        );
        assert_eq!(vps.state(), SlotState::Uninitialized);
    }

    #[test]
    fn partial_allocation_rolls_back() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(1);
        let mut vps = Vps::new();
        vps.initialize(&intrinsics, &pool, 0).unwrap();

        // The pool can serve the guest VMCB but not the host VMCB.
        assert_eq!(vps.allocate(), Err(Error::ResourceExhausted));
        assert_eq!(vps.state(), SlotState::Free);
        assert!(vps.backing().is_none());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn unmapped_backing_rolls_back() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        pool.set_fail_virt_to_phys(true);

        let mut vps = Vps::new();
        vps.initialize(&intrinsics, &pool, 0).unwrap();
        assert_eq!(vps.allocate(), Err(Error::InvalidArgument));
        assert_eq!(vps.state(), SlotState::Free);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn assign_vp_requires_allocation_and_a_valid_id() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = Vps::new();
        vps.initialize(&intrinsics, &pool, 0).unwrap();
        assert_eq!(vps.assign_vp(1), Err(Error::InvalidState));

        vps.allocate().unwrap();
        assert_eq!(vps.assign_vp(INVALID_ID), Err(Error::InvalidArgument));
        vps.assign_vp(1).unwrap();
        assert_eq!(vps.assigned_vp(), 1);

        vps.deallocate();
        assert_eq!(vps.assigned_vp(), INVALID_ID);
    }

    #[test]
    fn indexed_access_round_trips() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = allocated_vps(&intrinsics, &pool);

        let rip = ssa_off!(rip);
        vps.write64(rip, 0xdead_beef).unwrap();
        assert_eq!(vps.read64(rip).unwrap(), 0xdead_beef);
        assert_eq!(vps.read_reg(Reg::Rip).unwrap(), 0xdead_beef);

        assert_eq!(vps.write64(0x1000, 1), Err(Error::InvalidArgument));
        assert_eq!(vps.write64(4089, 1), Err(Error::InvalidArgument));
        vps.write64(4088, 1).unwrap();
        vps.write8(4095, 1).unwrap();
        assert_eq!(vps.write8(4096, 1), Err(Error::InvalidArgument));
    }

    #[test]
    fn attrib_fields_are_stored_compressed() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = allocated_vps(&intrinsics, &pool);

        let cs_attrib = ssa_off!(cs_attrib);
        vps.write16(cs_attrib, 0xA09B).unwrap();
        assert_eq!(vps.read16(cs_attrib).unwrap(), 0xA09B);
        assert_eq!(vps.guest_vmcb().unwrap().state_save_area.cs_attrib, 0x0A9B);

        // A 16-bit field that is not an attribute stays raw.
        let cs_selector = ssa_off!(cs_selector);
        vps.write16(cs_selector, 0xA09B).unwrap();
        assert_eq!(vps.guest_vmcb().unwrap().state_save_area.cs_selector, 0xA09B);
    }

    #[test]
    fn reg_access_covers_tls_and_vmcb_locations() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = allocated_vps(&intrinsics, &pool);

        vps.write_reg(Reg::Rax, 0x1111).unwrap();
        assert_eq!(intrinsics.tls_reg(TLS_OFFSET_RAX), 0x1111);
        assert_eq!(vps.read_reg(Reg::Rax).unwrap(), 0x1111);

        vps.write_reg(Reg::Rflags, 0x202).unwrap();
        assert_eq!(vps.read_reg(Reg::Rflags).unwrap(), 0x202);

        // 32-bit fields truncate on write and widen on read.
        vps.write_reg(Reg::GdtrLimit, 0xFFFF_FFFF_0000_00F7).unwrap();
        assert_eq!(vps.read_reg(Reg::GdtrLimit).unwrap(), 0xF7);

        // 16-bit fields likewise.
        vps.write_reg(Reg::Cs, 0x10008).unwrap();
        assert_eq!(vps.read_reg(Reg::Cs).unwrap(), 0x8);

        // Attribute tags speak the architectural form.
        vps.write_reg(Reg::CsAttributes, 0xA09B).unwrap();
        assert_eq!(vps.read_reg(Reg::CsAttributes).unwrap(), 0xA09B);
        assert_eq!(vps.guest_vmcb().unwrap().state_save_area.cs_attrib, 0x0A9B);
    }

    #[test]
    fn every_register_tag_round_trips() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = allocated_vps(&intrinsics, &pool);

        // 0x93 survives every width and has bits 8-11 clear, so it also
        // round trips through the attribute compression.
        for tag in 0..=72_u64 {
            let reg = Reg::try_from(tag).unwrap();
            vps.write_reg(reg, 0x93).unwrap();
            assert_eq!(vps.read_reg(reg).unwrap(), 0x93, "tag {tag}");
        }
    }

    #[test]
    fn reg_access_requires_allocation() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = Vps::new();
        vps.initialize(&intrinsics, &pool, 0).unwrap();

        assert_eq!(vps.read_reg(Reg::Rip), Err(Error::InvalidState));
        assert_eq!(vps.write_reg(Reg::Rip, 1), Err(Error::InvalidState));
        assert_eq!(vps.read64(0), Err(Error::InvalidState));
    }

    fn sample_state() -> StateSave {
        let mut state = StateSave::default();
        state.rax = 0x1;
        state.rbx = 0x2;
        state.rcx = 0x3;
        state.rdx = 0x4;
        state.rbp = 0x5;
        state.rsi = 0x6;
        state.rdi = 0x7;
        state.r8 = 0x8;
        state.r9 = 0x9;
        state.r10 = 0xa;
        state.r11 = 0xb;
        state.r12 = 0xc;
        state.r13 = 0xd;
        state.r14 = 0xe;
        state.r15 = 0xf;
        state.rsp = 0x7000;
        state.rip = 0xffff_8000_0000_1000;
        state.rflags = 0x202;
        state.gdtr_limit = 0x57;
        state.gdtr_base = 0x6000;
        state.idtr_limit = 0xfff;
        state.idtr_base = 0x5000;
        state.es_selector = 0x10;
        state.es_attrib = 0xC093;
        state.es_limit = 0xffff_ffff;
        state.es_base = 0;
        state.cs_selector = 0x8;
        state.cs_attrib = 0xA09B;
        state.cs_limit = 0xffff_ffff;
        state.cs_base = 0;
        state.ss_selector = 0x10;
        state.ss_attrib = 0xC093;
        state.ss_limit = 0xffff_ffff;
        state.ds_selector = 0x10;
        state.ds_attrib = 0xC093;
        state.ds_limit = 0xffff_ffff;
        state.fs_selector = 0x18;
        state.fs_attrib = 0x0093;
        state.fs_limit = 0xfff;
        state.gs_selector = 0x18;
        state.gs_attrib = 0x0093;
        state.gs_limit = 0xfff;
        state.ldtr_selector = 0x20;
        state.ldtr_attrib = 0x0082;
        state.ldtr_limit = 0xffff;
        state.ldtr_base = 0x4000;
        state.tr_selector = 0x28;
        state.tr_attrib = 0x008B;
        state.tr_limit = 0x67;
        state.tr_base = 0x3000;
        state.cr0 = 0x8005_0033;
        state.cr2 = 0x0;
        state.cr3 = 0x1000;
        state.cr4 = 0x20;
        state.dr6 = 0xffff_0ff0;
        state.dr7 = 0x400;
        state.ia32_efer = 0x1d01;
        state.ia32_star = 0x23_0008_0000_0000;
        state.ia32_lstar = 0xffff_8000_0000_2000;
        state.ia32_cstar = 0xffff_8000_0000_3000;
        state.ia32_fmask = 0x4700;
        state.ia32_fs_base = 0x1234_0000;
        state.ia32_gs_base = 0x5678_0000;
        state.ia32_kernel_gs_base = 0x9abc_0000;
        state.ia32_sysenter_cs = 0x10;
        state.ia32_sysenter_esp = 0x8000;
        state.ia32_sysenter_eip = 0x9000;
        state.ia32_pat = 0x0007_0406_0007_0406;
        state.ia32_debugctl = 0x1;
        state
    }

    #[test]
    fn state_save_round_trips() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = allocated_vps(&intrinsics, &pool);

        let state = sample_state();
        vps.state_save_to_vps(&state).unwrap();

        // Attributes land compressed in the VMCB.
        assert_eq!(vps.guest_vmcb().unwrap().state_save_area.cs_attrib, 0x0A9B);

        let mut restored = StateSave::default();
        vps.vps_to_state_save(&mut restored).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn marshal_requires_allocation() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = Vps::new();
        vps.initialize(&intrinsics, &pool, 0).unwrap();

        let mut state = StateSave::default();
        assert_eq!(vps.state_save_to_vps(&state.clone()), Err(Error::InvalidState));
        assert_eq!(vps.vps_to_state_save(&mut state), Err(Error::InvalidState));
    }

    #[test]
    fn run_reports_the_exit_reason_and_logs_it() {
        init_test_logging();
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let exit_log = ExitLog::new();
        let mut vps = allocated_vps(&intrinsics, &pool);

        let mut tls = Tls::new(0);
        tls.active_vmid = 1;
        tls.active_vpid = 2;
        tls.active_vpsid = vps.id();
        intrinsics.set_tls_reg(TLS_OFFSET_ACTIVE_VPS, u64::from(vps.id()));

        intrinsics.queue_vmrun_result(0x400);
        assert_eq!(vps.run(&tls, &exit_log).unwrap(), 0x400);

        assert_eq!(exit_log.len(0), 1);
        let record = exit_log.last(0).unwrap();
        assert_eq!(record.exit_reason, 0x400);
        assert_eq!(record.vmid, 1);
        assert_eq!(record.vpid, 2);
        assert_eq!(record.vpsid, vps.id());
    }

    #[test]
    fn run_surfaces_entry_failure_and_keeps_the_vps() {
        init_test_logging();
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let exit_log = ExitLog::new();
        let mut vps = allocated_vps(&intrinsics, &pool);

        intrinsics.queue_vmrun_result(INVALID_EXIT_REASON);
        let tls = Tls::new(0);
        assert_eq!(vps.run(&tls, &exit_log), Err(Error::HardwareEntryFailure));

        // The decision to zombify is the caller's.
        assert!(vps.is_allocated());
        assert_eq!(exit_log.len(0), 0);
    }

    #[test]
    fn run_requires_allocation() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let exit_log = ExitLog::new();
        let mut vps = Vps::new();
        vps.initialize(&intrinsics, &pool, 0).unwrap();

        let tls = Tls::new(0);
        assert_eq!(vps.run(&tls, &exit_log), Err(Error::InvalidState));
        assert_eq!(intrinsics.vmrun_count(), 0);
    }

    #[test]
    fn advance_ip_copies_nrip() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = allocated_vps(&intrinsics, &pool);

        vps.guest_vmcb_mut().unwrap().control_area.nrip = 0x1007;
        vps.advance_ip().unwrap();
        assert_eq!(vps.read_reg(Reg::Rip).unwrap(), 0x1007);
    }

    #[test]
    fn clear_zeroes_the_clean_bits() {
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let mut vps = allocated_vps(&intrinsics, &pool);

        vps.guest_vmcb_mut().unwrap().control_area.vmcb_clean = 0xffff_ffff;
        vps.clear().unwrap();
        assert_eq!(vps.guest_vmcb().unwrap().control_area.vmcb_clean, 0);
    }

    #[test]
    fn dump_renders_without_panicking() {
        init_test_logging();
        let intrinsics = MockIntrinsics::new();
        let pool = MockPagePool::new(8);
        let vps = allocated_vps(&intrinsics, &pool);
        vps.dump();

        let unallocated: Vps<'_, MockIntrinsics, MockPagePool> = Vps::new();
        unallocated.dump();
    }
}
