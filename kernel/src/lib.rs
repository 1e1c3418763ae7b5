//! The microkernel of a type-1 hypervisor for AMD processors.
//!
//! The microkernel owns exactly those hardware resources that require
//! privileged execution: virtual machine state, virtual processor state
//! (VPS), physical page accounting and the world-switch entry (`VMRUN`).
//! Everything else -- VM policy, device models, scheduling decisions -- is
//! implemented by untrusted "extensions" that drive the microkernel through
//! a numbered syscall ABI defined in [`syscall`].
//!
//! The crate is built around a small set of collaborator traits
//! ([`intrinsics::Intrinsics`] and [`page_pool::PagePool`]) so that the same
//! code compiles against the real hardware backends and against test
//! doubles, without runtime indirection. See [`microkernel::Microkernel`]
//! for the top-level aggregate and the syscall dispatch entry point.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::cast_possible_truncation)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

pub mod config;
pub mod error;
pub mod exit_log;
pub mod extension;
pub mod intrinsics;
pub mod logger;
pub mod microkernel;
pub mod page_pool;
pub mod state;
pub mod syscall;
pub mod tls;
pub mod vm_pool;
pub mod vmcb;
pub mod vp_pool;
pub mod vps;
pub mod vps_pool;

#[cfg(test)]
pub(crate) mod test_support;

use x86::current::paging::BASE_PAGE_SIZE;

/// The reserved sentinel value for every ID namespace.
///
/// A valid VM, VP, VPS, PP or extension ID is any 16-bit value other than
/// this one.
pub const INVALID_ID: u16 = 0xFFFF;

/// The ID of a virtual machine.
pub type Vmid = u16;
/// The ID of a virtual processor.
pub type Vpid = u16;
/// The ID of a virtual processor state.
pub type Vpsid = u16;
/// The ID of a physical processor.
pub type Ppid = u16;
/// The ID of an extension.
pub type Extid = u16;

/// The lifecycle state shared by every pool-managed slot type.
///
/// Slots start `Uninitialized`, become `Free` once they are given an
/// identity, and cycle between `Free` and `Allocated` for the rest of the
/// microkernel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// The slot has no identity and owns no resources.
    #[default]
    Uninitialized,
    /// The slot has an identity and is linked on its pool's free list.
    Free,
    /// The slot is handed out and owns its backing resources.
    Allocated,
}

/// The structure representing a single memory page (4KB).
//
// This does not _always_ have to be allocated at the page aligned address,
// but very often it is, so let us specify the alignment.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; BASE_PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<Page>() == 0x1000);

impl Page {
    /// Returns a zero-filled page.
    #[must_use]
    pub const fn new() -> Self {
        Self([0; BASE_PAGE_SIZE])
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
