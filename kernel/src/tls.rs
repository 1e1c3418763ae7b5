//! The module containing the per-PP thread local storage definitions.
//!
//! Each physical processor owns one TLS region. The world-switch entry
//! assembly spills the interrupted extension's general purpose registers
//! into the region at the offsets below, and the syscall dispatch reads
//! its register fingerprint back out through
//! [`crate::intrinsics::Intrinsics::tls_reg`]. The offsets are ABI;
//! extensions hard-code them.

use crate::{Extid, Ppid, Vmid, Vpid, Vpsid, INVALID_ID};

/// The TLS offset of the saved RAX register.
pub const TLS_OFFSET_RAX: u64 = 0x800;
/// The TLS offset of the saved RBX register.
pub const TLS_OFFSET_RBX: u64 = 0x808;
/// The TLS offset of the saved RCX register.
pub const TLS_OFFSET_RCX: u64 = 0x810;
/// The TLS offset of the saved RDX register.
pub const TLS_OFFSET_RDX: u64 = 0x818;
/// The TLS offset of the saved RBP register.
pub const TLS_OFFSET_RBP: u64 = 0x820;
/// The TLS offset of the saved RSI register.
pub const TLS_OFFSET_RSI: u64 = 0x828;
/// The TLS offset of the saved RDI register.
pub const TLS_OFFSET_RDI: u64 = 0x830;
/// The TLS offset of the saved R8 register.
pub const TLS_OFFSET_R8: u64 = 0x838;
/// The TLS offset of the saved R9 register.
pub const TLS_OFFSET_R9: u64 = 0x840;
/// The TLS offset of the saved R10 register.
pub const TLS_OFFSET_R10: u64 = 0x848;
/// The TLS offset of the saved R11 register.
pub const TLS_OFFSET_R11: u64 = 0x850;
/// The TLS offset of the saved R12 register.
pub const TLS_OFFSET_R12: u64 = 0x858;
/// The TLS offset of the saved R13 register.
pub const TLS_OFFSET_R13: u64 = 0x860;
/// The TLS offset of the saved R14 register.
pub const TLS_OFFSET_R14: u64 = 0x868;
/// The TLS offset of the saved R15 register.
pub const TLS_OFFSET_R15: u64 = 0x870;
/// The TLS offset of the ID of the VPS active on this PP.
pub const TLS_OFFSET_ACTIVE_VPS: u64 = 0xFF0;
/// The TLS offset of this PP's thread ID.
pub const TLS_OFFSET_THREAD_ID: u64 = 0xFF8;

/// The kernel-side per-PP context handed to the syscall dispatch.
///
/// This is the structured view of the TLS block; the raw register slots
/// are reached through the intrinsics layer instead so that the entry
/// assembly and the dispatcher agree on a single storage location.
#[derive(Debug, Clone)]
pub struct Tls {
    /// The ID of the physical processor this block belongs to.
    pub ppid: Ppid,
    /// The ID of the extension executing on this PP.
    pub active_extid: Extid,
    /// The ID of the VM active on this PP, or [`INVALID_ID`].
    pub active_vmid: Vmid,
    /// The ID of the VP active on this PP, or [`INVALID_ID`].
    pub active_vpid: Vpid,
    /// The ID of the VPS active on this PP, or [`INVALID_ID`].
    pub active_vpsid: Vpsid,
    /// Set when the extension asked the microkernel to unload.
    pub exit_requested: bool,
}

impl Tls {
    /// Returns a TLS block for the physical processor `ppid` with no
    /// active VM, VP or VPS.
    #[must_use]
    pub const fn new(ppid: Ppid) -> Self {
        Self {
            ppid,
            active_extid: 0,
            active_vmid: INVALID_ID,
            active_vpid: INVALID_ID,
            active_vpsid: INVALID_ID,
            exit_requested: false,
        }
    }
}
