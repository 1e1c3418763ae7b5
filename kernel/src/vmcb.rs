//! The module containing the [`Vmcb`] type.
//!
//! The virtual machine control block (VMCB) is the 4KB architectural
//! structure holding a guest's complete CPU state and the intercept
//! configuration for AMD-V.
//!
//! All references to external resources (denoted with "See:") refers to
//! "AMD64 Architecture Programmer’s Manual Volume 2: System Programming"
//! Revision 3.40 (January 2023) at
//! <https://developer.amd.com/resources/developer-guides-manuals/> unless
//! otherwise stated.

use crate::error::Error;
use core::mem::size_of;
use log::error;

/// The size of the VMCB in bytes.
pub const VMCB_SIZE: u64 = 0x1000;

/// The virtual machine control block (VMCB), which describes a virtual
/// machine (guest) to be executed.
///
/// See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
pub struct Vmcb {
    pub(crate) control_area: ControlArea,
    pub(crate) state_save_area: StateSaveArea,
}
const _: () = assert!(size_of::<Vmcb>() == 0x1000);

/// The "metadata" area where the hypervisor specifies what operations to
/// intercept and reads details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
pub(crate) struct ControlArea {
    pub(crate) intercept_cr_read: u16,   // +0x000
    pub(crate) intercept_cr_write: u16,  // +0x002
    pub(crate) intercept_dr_read: u16,   // +0x004
    pub(crate) intercept_dr_write: u16,  // +0x006
    pub(crate) intercept_exception: u32, // +0x008
    pub(crate) intercept_misc1: u32,     // +0x00c
    pub(crate) intercept_misc2: u32,     // +0x010
    pub(crate) intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    pub(crate) _padding1: [u8; 0x03c - 0x018], // +0x018
    pub(crate) pause_filter_threshold: u16, // +0x03c
    pub(crate) pause_filter_count: u16,  // +0x03e
    pub(crate) iopm_base_pa: u64,        // +0x040
    pub(crate) msrpm_base_pa: u64,       // +0x048
    pub(crate) tsc_offset: u64,          // +0x050
    pub(crate) guest_asid: u32,          // +0x058
    pub(crate) tlb_control: u32,         // +0x05c
    pub(crate) vintr: u64,               // +0x060
    pub(crate) interrupt_shadow: u64,    // +0x068
    pub(crate) exit_code: u64,           // +0x070
    pub(crate) exit_info1: u64,          // +0x078
    pub(crate) exit_info2: u64,          // +0x080
    pub(crate) exit_int_info: u64,       // +0x088
    pub(crate) np_enable: u64,           // +0x090
    pub(crate) avic_apic_bar: u64,       // +0x098
    pub(crate) guest_pa_pf_ghcb: u64,    // +0x0a0
    pub(crate) event_inj: u64,           // +0x0a8
    pub(crate) ncr3: u64,                // +0x0b0
    pub(crate) lbr_virtualization_enable: u64, // +0x0b8
    pub(crate) vmcb_clean: u64,          // +0x0c0
    pub(crate) nrip: u64,                // +0x0c8
    pub(crate) num_of_bytes_fetched: u8, // +0x0d0
    pub(crate) guest_instruction_bytes: [u8; 15], // +0x0d1
    pub(crate) avic_apic_backing_page_pointer: u64, // +0x0e0
    #[derivative(Debug = "ignore")]
    pub(crate) _padding2: u64, // +0x0e8
    pub(crate) avic_logical_table_pointer: u64, // +0x0f0
    pub(crate) avic_physical_table_pointer: u64, // +0x0f8
    #[derivative(Debug = "ignore")]
    pub(crate) _padding3: u64, // +0x100
    pub(crate) vmcb_save_state_pointer: u64, // +0x108
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    pub(crate) _padding4: [u8; 0x3e0 - 0x110], // +0x110
    pub(crate) reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(size_of::<ControlArea>() == 0x400);

/// The area to specify and read guest register values.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
pub(crate) struct StateSaveArea {
    pub(crate) es_selector: u16,   // +0x000
    pub(crate) es_attrib: u16,     // +0x002
    pub(crate) es_limit: u32,      // +0x004
    pub(crate) es_base: u64,       // +0x008
    pub(crate) cs_selector: u16,   // +0x010
    pub(crate) cs_attrib: u16,     // +0x012
    pub(crate) cs_limit: u32,      // +0x014
    pub(crate) cs_base: u64,       // +0x018
    pub(crate) ss_selector: u16,   // +0x020
    pub(crate) ss_attrib: u16,     // +0x022
    pub(crate) ss_limit: u32,      // +0x024
    pub(crate) ss_base: u64,       // +0x028
    pub(crate) ds_selector: u16,   // +0x030
    pub(crate) ds_attrib: u16,     // +0x032
    pub(crate) ds_limit: u32,      // +0x034
    pub(crate) ds_base: u64,       // +0x038
    pub(crate) fs_selector: u16,   // +0x040
    pub(crate) fs_attrib: u16,     // +0x042
    pub(crate) fs_limit: u32,      // +0x044
    pub(crate) fs_base: u64,       // +0x048
    pub(crate) gs_selector: u16,   // +0x050
    pub(crate) gs_attrib: u16,     // +0x052
    pub(crate) gs_limit: u32,      // +0x054
    pub(crate) gs_base: u64,       // +0x058
    pub(crate) gdtr_selector: u16, // +0x060
    pub(crate) gdtr_attrib: u16,   // +0x062
    pub(crate) gdtr_limit: u32,    // +0x064
    pub(crate) gdtr_base: u64,     // +0x068
    pub(crate) ldtr_selector: u16, // +0x070
    pub(crate) ldtr_attrib: u16,   // +0x072
    pub(crate) ldtr_limit: u32,    // +0x074
    pub(crate) ldtr_base: u64,     // +0x078
    pub(crate) idtr_selector: u16, // +0x080
    pub(crate) idtr_attrib: u16,   // +0x082
    pub(crate) idtr_limit: u32,    // +0x084
    pub(crate) idtr_base: u64,     // +0x088
    pub(crate) tr_selector: u16,   // +0x090
    pub(crate) tr_attrib: u16,     // +0x092
    pub(crate) tr_limit: u32,      // +0x094
    pub(crate) tr_base: u64,       // +0x098
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    pub(crate) _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    pub(crate) cpl: u8,            // +0x0cb
    #[derivative(Debug = "ignore")]
    pub(crate) _padding2: u32, // +0x0cc
    pub(crate) efer: u64,          // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    pub(crate) _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    pub(crate) cr4: u64,           // +0x148
    pub(crate) cr3: u64,           // +0x150
    pub(crate) cr0: u64,           // +0x158
    pub(crate) dr7: u64,           // +0x160
    pub(crate) dr6: u64,           // +0x168
    pub(crate) rflags: u64,        // +0x170
    pub(crate) rip: u64,           // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    pub(crate) _padding4: [u8; 0x1d8 - 0x180], // +0x180
    pub(crate) rsp: u64,           // +0x1d8
    pub(crate) s_cet: u64,         // +0x1e0
    pub(crate) ssp: u64,           // +0x1e8
    pub(crate) isst_addr: u64,     // +0x1f0
    pub(crate) rax: u64,           // +0x1f8
    pub(crate) star: u64,          // +0x200
    pub(crate) lstar: u64,         // +0x208
    pub(crate) cstar: u64,         // +0x210
    pub(crate) sf_mask: u64,       // +0x218
    pub(crate) kernel_gs_base: u64, // +0x220
    pub(crate) sysenter_cs: u64,   // +0x228
    pub(crate) sysenter_esp: u64,  // +0x230
    pub(crate) sysenter_eip: u64,  // +0x238
    pub(crate) cr2: u64,           // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    pub(crate) _padding5: [u8; 0x268 - 0x248], // +0x248
    pub(crate) gpat: u64,          // +0x268
    pub(crate) dbg_ctl: u64,       // +0x270
    pub(crate) br_from: u64,       // +0x278
    pub(crate) br_to: u64,         // +0x280
    pub(crate) last_excep_from: u64, // +0x288
    pub(crate) last_excep_to: u64, // +0x290
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    pub(crate) _padding6: [u8; 0x2df - 0x298], // +0x298
    pub(crate) spec_ctl: u64,      // +0x2e0
}
const _: () = assert!(size_of::<StateSaveArea>() == 0x2e8);

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// The element widths the VMCB may be viewed with for field-by-index
/// access.
pub trait VmcbField: Copy + sealed::Sealed {}
impl VmcbField for u8 {}
impl VmcbField for u16 {}
impl VmcbField for u32 {}
impl VmcbField for u64 {}

impl Vmcb {
    /// Reads the `W`-sized field at byte offset `index`.
    ///
    /// `index` must be a multiple of the field size and the field must lie
    /// entirely within the VMCB; anything else fails without touching
    /// state.
    pub(crate) fn read<W: VmcbField>(&self, index: u64) -> Result<W, Error> {
        let size = size_of::<W>() as u64;
        if index % size != 0 || index > VMCB_SIZE - size {
            error!("invalid index: {index:#x}");
            return Err(Error::InvalidArgument);
        }

        // Safety: the index is bounds checked above, the VMCB is exactly
        // `VMCB_SIZE` bytes, and the modulo check plus the 4KB alignment of
        // `Vmcb` make the resulting pointer aligned for `W`.
        Ok(unsafe {
            core::ptr::from_ref(self)
                .cast::<u8>()
                .add(index as usize)
                .cast::<W>()
                .read()
        })
    }

    /// Writes `value` to the `W`-sized field at byte offset `index`.
    ///
    /// The same index constraints as [`Vmcb::read`] apply.
    pub(crate) fn write<W: VmcbField>(&mut self, index: u64, value: W) -> Result<(), Error> {
        let size = size_of::<W>() as u64;
        if index % size != 0 || index > VMCB_SIZE - size {
            error!("invalid index: {index:#x}");
            return Err(Error::InvalidArgument);
        }

        // Safety: same as `Vmcb::read`, and the caller holds `&mut self`.
        unsafe {
            core::ptr::from_mut(self)
                .cast::<u8>()
                .add(index as usize)
                .cast::<W>()
                .write(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_aligned_u64_slot_round_trips(slot in 0_u64..512, value in any::<u64>()) {
            let mut vmcb = Vmcb::default();
            let index = slot * 8;
            vmcb.write::<u64>(index, value).unwrap();
            prop_assert_eq!(vmcb.read::<u64>(index).unwrap(), value);
        }

        #[test]
        fn any_misaligned_u64_index_fails(index in 0_u64..4096) {
            prop_assume!(index % 8 != 0);
            let mut vmcb = Vmcb::default();
            prop_assert_eq!(vmcb.write::<u64>(index, 1), Err(Error::InvalidArgument));
        }
    }

    #[test]
    fn aligned_access_round_trips() {
        let mut vmcb = Vmcb::default();
        vmcb.write::<u64>(0x578, 0xdead_beef_u64).unwrap();
        assert_eq!(vmcb.read::<u64>(0x578).unwrap(), 0xdead_beef);
        assert_eq!(vmcb.state_save_area.rip, 0xdead_beef);
    }

    #[test]
    fn last_byte_is_accessible() {
        let mut vmcb = Vmcb::default();
        vmcb.write::<u8>(4095, 0xaa).unwrap();
        assert_eq!(vmcb.read::<u8>(4095).unwrap(), 0xaa);
    }

    #[test]
    fn out_of_range_fails() {
        let mut vmcb = Vmcb::default();
        assert_eq!(vmcb.write::<u8>(4096, 1), Err(Error::InvalidArgument));
        assert_eq!(vmcb.write::<u64>(4096, 1), Err(Error::InvalidArgument));
        assert!(vmcb.read::<u64>(u64::MAX - 7).is_err());
    }

    #[test]
    fn misaligned_fails() {
        let mut vmcb = Vmcb::default();
        assert_eq!(vmcb.write::<u64>(4089, 1), Err(Error::InvalidArgument));
        assert_eq!(vmcb.read::<u32>(2).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn widest_aligned_index_succeeds() {
        let mut vmcb = Vmcb::default();
        vmcb.write::<u64>(4088, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(vmcb.read::<u64>(4088).unwrap(), 0x1122_3344_5566_7788);
    }
}
