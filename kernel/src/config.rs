//! The module containing various constants that may be modified by
//! developers.

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// The number of virtual machine slots the microkernel manages.
pub const MAX_VMS: usize = 16;

/// The number of virtual processor (VP) slots the microkernel manages.
pub const MAX_VPS: usize = 16;

/// The number of virtual processor state (VPS) slots the microkernel
/// manages. Each allocated slot owns a guest and a host VMCB.
pub const MAX_VPSS: usize = 16;

/// The number of physical processors the microkernel supports. Each gets
/// its own TLS region and VMExit ring.
pub const MAX_PPS: usize = 8;

/// The number of extensions the microkernel hosts. Extensions are loaded
/// at boot; there is no dynamic loading afterwards.
pub const MAX_EXTENSIONS: usize = 2;

/// The number of VMExit records each physical processor's ring retains
/// for post-mortem rendering.
pub const VMEXIT_LOG_CAPACITY: usize = 32;
