//! Test doubles for the microkernel's collaborator traits, shared by the
//! unit tests of every module.

use crate::intrinsics::{Intrinsics, INVALID_EXIT_REASON};
use crate::page_pool::{AllocTag, PagePool};
use crate::vmcb::Vmcb;
use crate::Page;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use std::collections::{BTreeMap, VecDeque};

/// A scripted intrinsics layer backed by an in-memory TLS register file.
pub(crate) struct MockIntrinsics {
    tls: RefCell<[u64; 512]>,
    vmrun_results: RefCell<VecDeque<u64>>,
    vmrun_count: Cell<usize>,
    invlpga_count: Cell<usize>,
    msrs: RefCell<BTreeMap<u32, u64>>,
}

impl MockIntrinsics {
    pub(crate) fn new() -> Self {
        Self {
            tls: RefCell::new([0; 512]),
            vmrun_results: RefCell::new(VecDeque::new()),
            vmrun_count: Cell::new(0),
            invlpga_count: Cell::new(0),
            msrs: RefCell::new(BTreeMap::new()),
        }
    }

    /// Scripts the result of the next `vmrun` call. Unscripted calls
    /// report an external-interrupt exit (`0x60`).
    pub(crate) fn queue_vmrun_result(&self, exit_reason: u64) {
        self.vmrun_results.borrow_mut().push_back(exit_reason);
    }

    pub(crate) fn vmrun_count(&self) -> usize {
        self.vmrun_count.get()
    }

    pub(crate) fn invlpga_count(&self) -> usize {
        self.invlpga_count.get()
    }
}

impl Intrinsics for MockIntrinsics {
    fn tls_reg(&self, offset: u64) -> u64 {
        self.tls.borrow()[usize::try_from(offset / 8).unwrap()]
    }

    fn set_tls_reg(&self, offset: u64, value: u64) {
        self.tls.borrow_mut()[usize::try_from(offset / 8).unwrap()] = value;
    }

    fn vmrun(
        &self,
        guest_vmcb: NonNull<Vmcb>,
        _guest_vmcb_phys: u64,
        _host_vmcb: NonNull<Vmcb>,
        _host_vmcb_phys: u64,
    ) -> u64 {
        self.vmrun_count.set(self.vmrun_count.get() + 1);
        let exit_reason = self.vmrun_results.borrow_mut().pop_front().unwrap_or(0x60);
        if exit_reason != INVALID_EXIT_REASON {
            // Mirror the hardware: the exit code lands in the VMCB too.
            unsafe { (*guest_vmcb.as_ptr()).control_area.exit_code = exit_reason };
        }
        exit_reason
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.borrow().get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        let _ = self.msrs.borrow_mut().insert(msr, value);
    }

    fn invlpga(&self, _addr: u64, _asid: u32) {
        self.invlpga_count.set(self.invlpga_count.get() + 1);
    }
}

/// A heap-backed page pool with a capacity cap and failure injection.
pub(crate) struct MockPagePool {
    capacity: Cell<usize>,
    outstanding: RefCell<Vec<(*mut Page, AllocTag)>>,
    fail_virt_to_phys: Cell<bool>,
}

impl MockPagePool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: Cell::new(capacity),
            outstanding: RefCell::new(Vec::new()),
            fail_virt_to_phys: Cell::new(false),
        }
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.set(capacity);
    }

    pub(crate) fn set_fail_virt_to_phys(&self, fail: bool) {
        self.fail_virt_to_phys.set(fail);
    }

    /// The number of pages currently handed out.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.borrow().len()
    }
}

impl PagePool for MockPagePool {
    fn allocate(&self, tag: AllocTag) -> Option<NonNull<Page>> {
        let mut outstanding = self.outstanding.borrow_mut();
        if outstanding.len() >= self.capacity.get() {
            return None;
        }

        let page = Box::into_raw(Box::new(Page::new()));
        outstanding.push((page, tag));
        NonNull::new(page)
    }

    unsafe fn deallocate(&self, page: NonNull<Page>, tag: AllocTag) {
        let mut outstanding = self.outstanding.borrow_mut();
        let index = outstanding
            .iter()
            .position(|&(ptr, t)| ptr == page.as_ptr() && t == tag)
            .expect("deallocate of a page this pool did not allocate");
        let (ptr, _) = outstanding.swap_remove(index);
        drop(unsafe { Box::from_raw(ptr) });
    }

    fn virt_to_phys(&self, page: NonNull<Page>) -> Option<u64> {
        if self.fail_virt_to_phys.get() {
            return None;
        }
        Some(page.as_ptr() as u64)
    }
}

impl Drop for MockPagePool {
    fn drop(&mut self) {
        for (ptr, _) in self.outstanding.borrow_mut().drain(..) {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

struct TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        println!("{}: {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static TEST_LOGGER: TestLogger = TestLogger;

/// Installs a stdout logger at debug severity so that debug-gated paths
/// (the VMExit ring, the dumps) are exercised. Idempotent.
pub(crate) fn init_test_logging() {
    let _ = log::set_logger(&TEST_LOGGER);
    log::set_max_level(log::LevelFilter::Debug);
}
