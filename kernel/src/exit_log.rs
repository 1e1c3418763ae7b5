//! The module containing the [`ExitLog`] type, the per-PP ring of VMExit
//! records rendered for post-mortem debugging.

use crate::config::{MAX_PPS, VMEXIT_LOG_CAPACITY};
use crate::{Ppid, Vmid, Vpid, Vpsid, INVALID_ID};
use log::{debug, error};
use spin::Mutex;

/// One VMExit as observed by [`crate::vps::Vps::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct VmExitRecord {
    pub vmid: Vmid,
    pub vpid: Vpid,
    pub vpsid: Vpsid,
    pub exit_reason: u64,
    pub exit_info1: u64,
    pub exit_info2: u64,
    pub exit_int_info: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl Default for VmExitRecord {
    fn default() -> Self {
        Self {
            vmid: INVALID_ID,
            vpid: INVALID_ID,
            vpsid: INVALID_ID,
            exit_reason: 0,
            exit_info1: 0,
            exit_info2: 0,
            exit_int_info: 0,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
        }
    }
}

#[derive(Debug)]
struct Ring {
    records: [VmExitRecord; VMEXIT_LOG_CAPACITY],
    next: usize,
    len: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            records: [VmExitRecord::default(); VMEXIT_LOG_CAPACITY],
            next: 0,
            len: 0,
        }
    }

    fn push(&mut self, record: VmExitRecord) {
        self.records[self.next] = record;
        self.next = (self.next + 1) % VMEXIT_LOG_CAPACITY;
        self.len = self.len.saturating_add(1).min(VMEXIT_LOG_CAPACITY);
    }

    // Oldest record first.
    fn iter(&self) -> impl Iterator<Item = &VmExitRecord> {
        let start = if self.len == VMEXIT_LOG_CAPACITY {
            self.next
        } else {
            0
        };
        (0..self.len).map(move |i| &self.records[(start + i) % VMEXIT_LOG_CAPACITY])
    }
}

/// The per-PP VMExit rings.
///
/// Each physical processor is the sole writer of its own ring, so records
/// within one ring are totally ordered by issue sequence. Nothing is
/// guaranteed across rings. The locks exist because `dump` may be asked
/// for any PP's ring from the debug syscalls.
#[derive(Debug)]
pub struct ExitLog {
    rings: [Mutex<Ring>; MAX_PPS],
}

impl ExitLog {
    /// Returns empty rings for every physical processor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rings: core::array::from_fn(|_| Mutex::new(Ring::new())),
        }
    }

    /// Appends `record` to `ppid`'s ring, evicting the oldest record once
    /// the ring is full.
    pub fn add(&self, ppid: Ppid, record: VmExitRecord) {
        let Some(ring) = self.rings.get(usize::from(ppid)) else {
            error!("invalid ppid: {ppid:#06x}");
            return;
        };
        ring.lock().push(record);
    }

    /// Renders `ppid`'s ring on the debug channel, oldest record first.
    pub fn dump(&self, ppid: Ppid) {
        let Some(ring) = self.rings.get(usize::from(ppid)) else {
            error!("invalid ppid: {ppid:#06x}");
            return;
        };

        let ring = ring.lock();
        debug!("vmexit log [pp {ppid:#06x}]: {} record(s)", ring.len);
        for (i, rec) in ring.iter().enumerate() {
            debug!(
                "  [{i:>2}] vm {:#06x} vp {:#06x} vps {:#06x} reason {:#018x}",
                rec.vmid, rec.vpid, rec.vpsid, rec.exit_reason,
            );
            debug!(
                "       info1 {:#018x} info2 {:#018x} intinfo {:#018x}",
                rec.exit_info1, rec.exit_info2, rec.exit_int_info,
            );
            debug!(
                "       rip {:#018x} rsp {:#018x} rax {:#018x} rbx {:#018x}",
                rec.rip, rec.rsp, rec.rax, rec.rbx,
            );
            debug!(
                "       rcx {:#018x} rdx {:#018x} rbp {:#018x} rsi {:#018x}",
                rec.rcx, rec.rdx, rec.rbp, rec.rsi,
            );
            debug!(
                "       rdi {:#018x} r8  {:#018x} r9  {:#018x} r10 {:#018x}",
                rec.rdi, rec.r8, rec.r9, rec.r10,
            );
            debug!(
                "       r11 {:#018x} r12 {:#018x} r13 {:#018x} r14 {:#018x} r15 {:#018x}",
                rec.r11, rec.r12, rec.r13, rec.r14, rec.r15,
            );
        }
    }

    /// Returns the number of records retained in `ppid`'s ring.
    #[must_use]
    pub fn len(&self, ppid: Ppid) -> usize {
        self.rings
            .get(usize::from(ppid))
            .map_or(0, |ring| ring.lock().len)
    }

    /// Returns the most recent record in `ppid`'s ring.
    #[must_use]
    pub fn last(&self, ppid: Ppid) -> Option<VmExitRecord> {
        let ring = self.rings.get(usize::from(ppid))?;
        let ring = ring.lock();
        if ring.len == 0 {
            return None;
        }
        let last = (ring.next + VMEXIT_LOG_CAPACITY - 1) % VMEXIT_LOG_CAPACITY;
        Some(ring.records[last])
    }
}

impl Default for ExitLog {
    fn default() -> Self {
        Self::new()
    }
}
