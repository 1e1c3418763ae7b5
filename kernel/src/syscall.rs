//! The module containing the syscall ABI definitions shared between the
//! microkernel and its extensions.
//!
//! An extension invokes the microkernel by loading a 64-bit opcode word
//! into RAX, up to five arguments into the argument registers, and
//! executing `SYSCALL`. The opcode word packs a signature, a flags field
//! (reserved, zero), an opcode family, and an index within the family.
//! The microkernel answers with a packed [`Status`] word.
//!
//! Every value in this module is ABI: extensions hard-code them, so none
//! of them may change without revving the specification ID handed to
//! [`open_handle`](crate::microkernel::Microkernel::dispatch).

use bitfield::bitfield;

/// The signature every syscall opcode word must carry in bits 63:48.
pub const SYSCALL_SIG: u16 = 0x6642;

/// The bit that must be set in the version passed to `open_handle`.
pub const SPEC_ID1_MASK: u64 = 0x2;

/// Returns whether `version` names a specification this microkernel
/// implements.
#[must_use]
pub const fn version_supported(version: u64) -> bool {
    version & SPEC_ID1_MASK != 0
}

bitfield! {
    /// The register fingerprint of a syscall: the 64-bit opcode word the
    /// extension loads into RAX.
    /*
         6         4         3         1
         3         7         1         5
        +----------+---------+---------+---------+
        |   sig    |  flags  | opcode  |  index  |
        +----------+---------+---------+---------+
    */
    #[derive(Clone, Copy)]
    pub struct SyscallWord(u64);
    impl Debug;
    /// The opcode index within the family.
    pub u16, index, _: 15, 0;
    /// The opcode family.
    pub u16, opcode, _: 31, 16;
    /// Reserved; must be zero.
    pub u16, flags, _: 47, 32;
    /// Must equal [`SYSCALL_SIG`].
    pub u16, sig, _: 63, 48;
}

/// Packs a family and an index into a well-formed syscall opcode word.
#[must_use]
pub const fn syscall_word(family: u16, index: u16) -> u64 {
    ((SYSCALL_SIG as u64) << 48) | ((family as u64) << 16) | index as u64
}

/// The `CONTROL` opcode family.
pub const OPCODE_CONTROL: u16 = 0x0000;
/// The `HANDLE` opcode family.
pub const OPCODE_HANDLE: u16 = 0x0001;
/// The `DEBUG` opcode family.
pub const OPCODE_DEBUG: u16 = 0x0002;
/// The `CALLBACK` opcode family.
pub const OPCODE_CALLBACK: u16 = 0x0003;
/// The `VM` opcode family.
pub const OPCODE_VM: u16 = 0x0004;
/// The `VP` opcode family.
pub const OPCODE_VP: u16 = 0x0005;
/// The `VPS` opcode family.
pub const OPCODE_VPS: u16 = 0x0006;
/// The `INTRINSIC` opcode family.
pub const OPCODE_INTRINSIC: u16 = 0x0007;
/// The `MEM` opcode family.
pub const OPCODE_MEM: u16 = 0x0008;

/// `CONTROL` indexes.
pub mod control_op {
    /// Asks the microkernel to unload the calling extension.
    pub const EXIT: u16 = 0x0000;
}

/// `HANDLE` indexes.
pub mod handle_op {
    /// Performs the version handshake and returns the caller's handle.
    pub const OPEN_HANDLE: u16 = 0x0000;
    /// Invalidates the caller's handle.
    pub const CLOSE_HANDLE: u16 = 0x0001;
}

/// `DEBUG` indexes.
pub mod debug_op {
    /// Prints two 64-bit values on the debug channel.
    pub const OUT: u16 = 0x0000;
    /// Dumps a VM slot.
    pub const DUMP_VM: u16 = 0x0001;
    /// Dumps a VP slot.
    pub const DUMP_VP: u16 = 0x0002;
    /// Dumps a VPS, including its guest VMCB.
    pub const DUMP_VPS: u16 = 0x0003;
    /// Dumps a physical processor's VMExit ring.
    pub const DUMP_VMEXIT_LOG: u16 = 0x0004;
    /// Prints one character on the debug channel.
    pub const WRITE_C: u16 = 0x0005;
    /// Prints a NUL-terminated string on the debug channel.
    pub const WRITE_STR: u16 = 0x0006;
}

/// `CALLBACK` indexes.
pub mod callback_op {
    /// Parks the calling processor until an event fires.
    pub const WAIT: u16 = 0x0000;
    /// Registers the bootstrap entry point.
    pub const REGISTER_BOOTSTRAP: u16 = 0x0001;
    /// Registers the VMExit entry point.
    pub const REGISTER_VMEXIT: u16 = 0x0002;
    /// Registers the fast-fail entry point.
    pub const REGISTER_FAIL: u16 = 0x0003;
}

/// `VM` indexes.
pub mod vm_op {
    /// Allocates a VM slot and returns its ID.
    pub const CREATE_VM: u16 = 0x0000;
    /// Releases a VM slot.
    pub const DESTROY_VM: u16 = 0x0001;
}

/// `VP` indexes.
pub mod vp_op {
    /// Allocates a VP slot, binds it to a VM, and returns its ID.
    pub const CREATE_VP: u16 = 0x0000;
    /// Releases a VP slot.
    pub const DESTROY_VP: u16 = 0x0001;
}

/// `VPS` indexes.
pub mod vps_op {
    /// Allocates a VPS and returns its ID.
    pub const CREATE_VPS: u16 = 0x0000;
    /// Releases a VPS.
    pub const DESTROY_VPS: u16 = 0x0001;
    /// Loads the boot-time root state into a VPS.
    pub const INIT_AS_ROOT: u16 = 0x0002;
    /// Reads an 8-bit VMCB field by index.
    pub const READ8: u16 = 0x0003;
    /// Reads a 16-bit VMCB field by index.
    pub const READ16: u16 = 0x0004;
    /// Reads a 32-bit VMCB field by index.
    pub const READ32: u16 = 0x0005;
    /// Reads a 64-bit VMCB field by index.
    pub const READ64: u16 = 0x0006;
    /// Writes an 8-bit VMCB field by index.
    pub const WRITE8: u16 = 0x0007;
    /// Writes a 16-bit VMCB field by index.
    pub const WRITE16: u16 = 0x0008;
    /// Writes a 32-bit VMCB field by index.
    pub const WRITE32: u16 = 0x0009;
    /// Writes a 64-bit VMCB field by index.
    pub const WRITE64: u16 = 0x000A;
    /// Reads a register by [`Reg`](super::Reg) tag.
    pub const READ_REG: u16 = 0x000B;
    /// Writes a register by [`Reg`](super::Reg) tag.
    pub const WRITE_REG: u16 = 0x000C;
    /// Runs a VPS on the calling processor until the guest VM-exits.
    pub const RUN: u16 = 0x000D;
    /// Re-runs the VPS active on the calling processor.
    pub const RUN_CURRENT: u16 = 0x000E;
    /// Skips the instruction the guest exited on.
    pub const ADVANCE_IP: u16 = 0x000F;
    /// Combines `ADVANCE_IP` and `RUN_CURRENT`.
    pub const ADVANCE_IP_AND_RUN_CURRENT: u16 = 0x0010;
    /// Hands a VPS's state back to the root OS.
    pub const PROMOTE: u16 = 0x0011;
    /// Invalidates the processor's cached copy of a VPS's VMCB.
    pub const CLEAR_VPS: u16 = 0x0012;
}

/// `INTRINSIC` indexes.
pub mod intrinsic_op {
    /// Reads an MSR.
    pub const RDMSR: u16 = 0x0000;
    /// Writes an MSR.
    pub const WRMSR: u16 = 0x0001;
    /// Invalidates a TLB entry in a tagged address space.
    pub const INVLPGA: u16 = 0x0002;
}

/// `MEM` indexes.
pub mod mem_op {
    /// Allocates one page and returns its virtual and physical address.
    pub const ALLOC_PAGE: u16 = 0x0000;
    /// Frees a page previously returned by `ALLOC_PAGE`.
    pub const FREE_PAGE: u16 = 0x0001;
    /// Resolves a virtual address to its physical address.
    pub const VIRT_TO_PHYS: u16 = 0x0005;
}

/// The packed status word a syscall returns.
///
/// Bits 63:48 carry a signature (`0xDEAD` for failures, zero for
/// success), bits 47:16 identify the failure class, and bits 15:0 the
/// specific failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u64);

impl Status {
    /// The operation completed.
    pub const SUCCESS: Self = Self(0x0000_0000_0000_0000);
    /// The operation failed for an operation-specific reason; a
    /// diagnostic was emitted on the debug channel.
    pub const FAILURE_UNKNOWN: Self = Self(0xDEAD_0000_0001_0001);
    /// The handle argument does not match the caller's open handle.
    pub const FAILURE_INVALID_HANDLE: Self = Self(0xDEAD_0000_0002_0001);
    /// The signature, opcode or index did not decode.
    pub const FAILURE_UNSUPPORTED: Self = Self(0xDEAD_0000_0004_0001);
    /// The calling extension is not granted this opcode family.
    pub const INVALID_PERM_EXT: Self = Self(0xDEAD_0000_0001_0002);
    /// Policy denied the call even though the family is granted.
    pub const INVALID_PERM_DENIED: Self = Self(0xDEAD_0000_0002_0002);
    /// Argument 0 failed validation.
    pub const INVALID_PARAMS0: Self = Self(0xDEAD_0000_0001_0003);
    /// Argument 1 failed validation.
    pub const INVALID_PARAMS1: Self = Self(0xDEAD_0000_0002_0003);
    /// Argument 2 failed validation.
    pub const INVALID_PARAMS2: Self = Self(0xDEAD_0000_0004_0003);
    /// Argument 3 failed validation.
    pub const INVALID_PARAMS3: Self = Self(0xDEAD_0000_0008_0003);
    /// Argument 4 failed validation.
    pub const INVALID_PARAMS4: Self = Self(0xDEAD_0000_0010_0003);
    /// Argument 5 failed validation.
    pub const INVALID_PARAMS5: Self = Self(0xDEAD_0000_0020_0003);

    /// Returns the status whose class marks argument `n` as invalid.
    #[must_use]
    pub const fn invalid_params(n: usize) -> Self {
        match n {
            0 => Self::INVALID_PARAMS0,
            1 => Self::INVALID_PARAMS1,
            2 => Self::INVALID_PARAMS2,
            3 => Self::INVALID_PARAMS3,
            4 => Self::INVALID_PARAMS4,
            _ => Self::INVALID_PARAMS5,
        }
    }

    /// Returns the signature field.
    #[must_use]
    pub const fn sig(self) -> u64 {
        self.0 & 0xFFFF_0000_0000_0000
    }

    /// Returns the failure-class field.
    #[must_use]
    pub const fn flags(self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_0000
    }

    /// Returns the failure-value field.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0 & 0x0000_0000_0000_FFFF
    }

    /// Returns whether the status reports success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

/// The tag naming each architectural register an extension may touch
/// through `read_reg`/`write_reg`.
///
/// Discriminant values are ABI and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
#[allow(missing_docs)]
pub enum Reg {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rbp = 4,
    Rsi = 5,
    Rdi = 6,
    R8 = 7,
    R9 = 8,
    R10 = 9,
    R11 = 10,
    R12 = 11,
    R13 = 12,
    R14 = 13,
    R15 = 14,
    Rip = 15,
    Rsp = 16,
    Rflags = 17,
    GdtrBaseAddr = 18,
    GdtrLimit = 19,
    IdtrBaseAddr = 20,
    IdtrLimit = 21,
    Es = 22,
    EsBaseAddr = 23,
    EsLimit = 24,
    EsAttributes = 25,
    Cs = 26,
    CsBaseAddr = 27,
    CsLimit = 28,
    CsAttributes = 29,
    Ss = 30,
    SsBaseAddr = 31,
    SsLimit = 32,
    SsAttributes = 33,
    Ds = 34,
    DsBaseAddr = 35,
    DsLimit = 36,
    DsAttributes = 37,
    Fs = 38,
    FsBaseAddr = 39,
    FsLimit = 40,
    FsAttributes = 41,
    Gs = 42,
    GsBaseAddr = 43,
    GsLimit = 44,
    GsAttributes = 45,
    Ldtr = 46,
    LdtrBaseAddr = 47,
    LdtrLimit = 48,
    LdtrAttributes = 49,
    Tr = 50,
    TrBaseAddr = 51,
    TrLimit = 52,
    TrAttributes = 53,
    Cr0 = 54,
    Cr2 = 55,
    Cr3 = 56,
    Cr4 = 57,
    Dr6 = 58,
    Dr7 = 59,
    Ia32Efer = 60,
    Ia32Star = 61,
    Ia32Lstar = 62,
    Ia32Cstar = 63,
    Ia32Fmask = 64,
    Ia32FsBase = 65,
    Ia32GsBase = 66,
    Ia32KernelGsBase = 67,
    Ia32SysenterCs = 68,
    Ia32SysenterEsp = 69,
    Ia32SysenterEip = 70,
    Ia32Pat = 71,
    Ia32Debugctl = 72,
}

impl TryFrom<u64> for Reg {
    type Error = &'static str;

    fn try_from(tag: u64) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Rax),
            1 => Ok(Self::Rbx),
            2 => Ok(Self::Rcx),
            3 => Ok(Self::Rdx),
            4 => Ok(Self::Rbp),
            5 => Ok(Self::Rsi),
            6 => Ok(Self::Rdi),
            7 => Ok(Self::R8),
            8 => Ok(Self::R9),
            9 => Ok(Self::R10),
            10 => Ok(Self::R11),
            11 => Ok(Self::R12),
            12 => Ok(Self::R13),
            13 => Ok(Self::R14),
            14 => Ok(Self::R15),
            15 => Ok(Self::Rip),
            16 => Ok(Self::Rsp),
            17 => Ok(Self::Rflags),
            18 => Ok(Self::GdtrBaseAddr),
            19 => Ok(Self::GdtrLimit),
            20 => Ok(Self::IdtrBaseAddr),
            21 => Ok(Self::IdtrLimit),
            22 => Ok(Self::Es),
            23 => Ok(Self::EsBaseAddr),
            24 => Ok(Self::EsLimit),
            25 => Ok(Self::EsAttributes),
            26 => Ok(Self::Cs),
            27 => Ok(Self::CsBaseAddr),
            28 => Ok(Self::CsLimit),
            29 => Ok(Self::CsAttributes),
            30 => Ok(Self::Ss),
            31 => Ok(Self::SsBaseAddr),
            32 => Ok(Self::SsLimit),
            33 => Ok(Self::SsAttributes),
            34 => Ok(Self::Ds),
            35 => Ok(Self::DsBaseAddr),
            36 => Ok(Self::DsLimit),
            37 => Ok(Self::DsAttributes),
            38 => Ok(Self::Fs),
            39 => Ok(Self::FsBaseAddr),
            40 => Ok(Self::FsLimit),
            41 => Ok(Self::FsAttributes),
            42 => Ok(Self::Gs),
            43 => Ok(Self::GsBaseAddr),
            44 => Ok(Self::GsLimit),
            45 => Ok(Self::GsAttributes),
            46 => Ok(Self::Ldtr),
            47 => Ok(Self::LdtrBaseAddr),
            48 => Ok(Self::LdtrLimit),
            49 => Ok(Self::LdtrAttributes),
            50 => Ok(Self::Tr),
            51 => Ok(Self::TrBaseAddr),
            52 => Ok(Self::TrLimit),
            53 => Ok(Self::TrAttributes),
            54 => Ok(Self::Cr0),
            55 => Ok(Self::Cr2),
            56 => Ok(Self::Cr3),
            57 => Ok(Self::Cr4),
            58 => Ok(Self::Dr6),
            59 => Ok(Self::Dr7),
            60 => Ok(Self::Ia32Efer),
            61 => Ok(Self::Ia32Star),
            62 => Ok(Self::Ia32Lstar),
            63 => Ok(Self::Ia32Cstar),
            64 => Ok(Self::Ia32Fmask),
            65 => Ok(Self::Ia32FsBase),
            66 => Ok(Self::Ia32GsBase),
            67 => Ok(Self::Ia32KernelGsBase),
            68 => Ok(Self::Ia32SysenterCs),
            69 => Ok(Self::Ia32SysenterEsp),
            70 => Ok(Self::Ia32SysenterEip),
            71 => Ok(Self::Ia32Pat),
            72 => Ok(Self::Ia32Debugctl),
            _ => Err("tag does not name a register"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_word_packs_the_fields() {
        let word = SyscallWord(syscall_word(OPCODE_VPS, vps_op::RUN));
        assert_eq!(word.0, 0x6642_0000_0006_000D);
        assert_eq!(word.sig(), SYSCALL_SIG);
        assert_eq!(word.flags(), 0);
        assert_eq!(word.opcode(), OPCODE_VPS);
        assert_eq!(word.index(), vps_op::RUN);
    }

    #[test]
    fn status_fields_unpack() {
        assert!(Status::SUCCESS.is_success());
        assert_eq!(Status::FAILURE_UNSUPPORTED.sig(), 0xDEAD_0000_0000_0000);
        assert_eq!(Status::INVALID_PARAMS2.flags(), 0x0000_0000_0004_0000);
        assert_eq!(Status::INVALID_PARAMS2.value(), 0x3);
        assert_eq!(Status::invalid_params(1), Status::INVALID_PARAMS1);
    }

    #[test]
    fn version_handshake_requires_bit_1() {
        assert!(!version_supported(0x0));
        assert!(!version_supported(0x1));
        assert!(version_supported(0x2));
        assert!(version_supported(0x3123_6642));
    }

    #[test]
    fn register_tags_are_stable() {
        assert_eq!(Reg::try_from(0).unwrap(), Reg::Rax);
        assert_eq!(Reg::try_from(15).unwrap(), Reg::Rip);
        assert_eq!(Reg::try_from(17).unwrap(), Reg::Rflags);
        assert_eq!(Reg::try_from(29).unwrap(), Reg::CsAttributes);
        assert_eq!(Reg::try_from(72).unwrap(), Reg::Ia32Debugctl);
        assert!(Reg::try_from(73).is_err());
        for tag in 0..=72 {
            assert_eq!(Reg::try_from(tag).unwrap() as u64, tag);
        }
    }
}
