//! The module containing the [`Error`] type shared by every microkernel
//! operation.

use core::fmt;

/// The reason a microkernel operation failed.
///
/// Failures are local to the operation that produced them; the syscall
/// boundary converts this type into the packed status word of
/// [`crate::syscall::Status`]. The only variant treated as fatal for the
/// affected VPS (but not for the microkernel) is `HardwareEntryFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument was a reserved sentinel, null, out of range, or
    /// mis-widened.
    InvalidArgument,
    /// The target entity is in the wrong lifecycle state for the requested
    /// operation.
    InvalidState,
    /// The calling extension is not authorized for this operation.
    PermissionDenied,
    /// The page pool has no free pages, or a pool has no free slots.
    ResourceExhausted,
    /// `VMRUN` reported an entry failure instead of entering the guest.
    HardwareEntryFailure,
    /// The syscall signature or opcode did not decode.
    UnknownSyscall,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidState => write!(f, "invalid lifecycle state"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::HardwareEntryFailure => write!(f, "VMRUN entry failure"),
            Self::UnknownSyscall => write!(f, "unknown syscall"),
        }
    }
}
