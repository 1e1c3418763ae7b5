//! The module containing the [`Intrinsics`] trait, the microkernel's
//! interface to privileged instructions.
//!
//! The microkernel proper never issues a privileged instruction directly;
//! it goes through this trait so that the same code compiles against the
//! real hardware backend and against a test double without runtime
//! indirection (callers are generic over the implementation and the
//! compiler monomorphizes the calls away).

use crate::vmcb::Vmcb;
use core::ptr::NonNull;

/// The value `vmrun` reports when the world switch failed instead of
/// entering the guest.
///
/// Any other return value is the architectural exit code saved by the
/// processor in the VMCB's EXITCODE field.
/// See: Appendix C SVM Intercept Exit Codes
pub const INVALID_EXIT_REASON: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// The interface to the privileged-instruction layer.
///
/// Implementations exist per physical processor context: the TLS accessors
/// operate on the calling processor's thread-local storage region, which
/// holds the interrupted extension's general purpose registers at the
/// offsets defined in [`crate::tls`].
pub trait Intrinsics {
    /// Returns the value stored in the current TLS region at `offset`.
    fn tls_reg(&self, offset: u64) -> u64;

    /// Stores `value` in the current TLS region at `offset`.
    fn set_tls_reg(&self, offset: u64, value: u64);

    /// Enters the guest described by `guest_vmcb` and does not return
    /// until the guest VM-exits.
    ///
    /// The processor saves host state into `host_vmcb` for the duration of
    /// the world switch. Returns the architectural exit code, or
    /// [`INVALID_EXIT_REASON`] if the entry itself failed. On entry
    /// failure the guest context was never loaded and the caller's TLS
    /// region is left intact.
    ///
    /// See: 15.5 VMRUN Instruction
    fn vmrun(
        &self,
        guest_vmcb: NonNull<Vmcb>,
        guest_vmcb_phys: u64,
        host_vmcb: NonNull<Vmcb>,
        host_vmcb_phys: u64,
    ) -> u64;

    /// Reads an MSR.
    fn rdmsr(&self, msr: u32) -> u64;

    /// Writes a value to an MSR.
    fn wrmsr(&self, msr: u32, value: u64);

    /// Invalidates the TLB mapping for `addr` in the address space tagged
    /// with `asid`.
    ///
    /// See: 15.16.2 INVLPGA Instruction
    fn invlpga(&self, addr: u64, asid: u32);
}
