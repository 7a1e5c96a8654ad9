// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Command control blocks and the pool that owns them.
//!
//! Each command in flight has a CCB. SCRIPTS refers to a CCB
//! by its bus address (the DSA), and reads the CCB's
//! firmware-visible part (its [`CcbPhys`]) while running the
//! job. The host refers to CCBs by [`CcbIndex`] and only
//! converts a bus address back into an index through
//! [`CcbPool::from_dsa`], which checks the address first.

use crate::command::{Command, CommandResult};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::{Index, IndexMut};
use scsi::message::TaskAttribute;
use scsi::HostByte;

/// Offsets of the tables SCRIPTS reads from a CCB,
/// as used by table-indirect instructions.
///
pub(crate) mod phys {
    pub const SELECT: u32 = 0x10;
    pub const WRESID: u32 = 0x18;
    pub const SMSG: u32 = 0x20;
    pub const CMD: u32 = 0x28;
    pub const SENSE: u32 = 0x30;
    pub const PM0_SG: u32 = 0x38;
    pub const PM1_SG: u32 = 0x48;
    pub const DATA: u32 = 0x58;

    /// Returns the offset of data table entry `i`.
    ///
    pub const fn data(i: usize) -> u32 {
        DATA + 8 * i as u32
    }

    // The host buffers follow the data table.
    pub const SMSG_BUF: u32 = 0x00;
    pub const SMSG2_BUF: u32 = 0x10;
    pub const CMD_BUF: u32 = 0x20;
    pub const SENSECMD_BUF: u32 = 0x30;
    pub const SNS_BUF: u32 = 0x38;
    pub const BUFFERS_LEN: u32 = 0x58;
}

/// The largest command descriptor block a CCB holds.
///
pub const MAX_CDB_LEN: usize = 16;

/// The state of a job, as kept by SCRIPTS in HS_PRT
/// and copied into the CCB.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostStatus {
    Idle = 0,
    Busy = 1,
    Negotiate = 2,
    Disconnect = 3,
    Wait = 4,
    Complete = 0x84,
    SelTimeout = 0x85,
    Unexpected = 0x86,
    CompErr = 0x87,
}

impl HostStatus {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(HostStatus::Idle),
            1 => Some(HostStatus::Busy),
            2 => Some(HostStatus::Negotiate),
            3 => Some(HostStatus::Disconnect),
            4 => Some(HostStatus::Wait),
            0x84 => Some(HostStatus::Complete),
            0x85 => Some(HostStatus::SelTimeout),
            0x86 => Some(HostStatus::Unexpected),
            0x87 => Some(HostStatus::CompErr),
            _ => None,
        }
    }

    /// Returns whether SCRIPTS has not yet selected
    /// the target for this job.
    ///
    pub fn is_not_started(self) -> bool {
        matches!(self, HostStatus::Busy | HostStatus::Negotiate)
    }
}

bitflags! {
    /// Host flags, kept by SCRIPTS in HF_PRT.
    ///
    pub struct HostFlags: u8 {
        /// The data pointer is inside PM context 0.
        const IN_PM0 = 0x01;

        /// The data pointer is inside PM context 1.
        const IN_PM1 = 0x02;

        /// PM context 1 is the active one.
        const ACT_PM = 0x04;

        /// The target sent SAVE DATA POINTER.
        const DP_SAVED = 0x08;

        /// The job is an automatic REQUEST SENSE.
        const SENSE = 0x10;

        /// An extended error was recorded.
        const EXT_ERR = 0x20;

        /// Data flows from the target.
        const DATA_IN = 0x40;

        /// Use immediate arbitration after this job.
        const HINT_IARB = 0x80;
    }
}

bitflags! {
    /// Extended error conditions.
    ///
    pub struct XerrStatus: u8 {
        /// The target sent more data than expected.
        const EXTRA_DATA = 0x01;

        /// The target entered an illegal phase.
        const BAD_PHASE = 0x02;

        /// A parity error was detected.
        const PARITY = 0x04;

        /// A byte was left in SODL on a wide
        /// output.
        const SODL_UNRUN = 0x08;

        /// A byte was left in SWIDE on a wide
        /// input.
        const SWIDE_OVRUN = 0x10;
    }
}

/// Why a command is being aborted.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// The upper layers asked for the abort.
    User,

    /// The command timed out.
    Timeout,
}

impl AbortReason {
    /// Returns the host byte a command aborted for
    /// this reason completes with.
    ///
    pub fn host_byte(self) -> HostByte {
        match self {
            AbortReason::User => HostByte::Abort,
            AbortReason::Timeout => HostByte::TimeOut,
        }
    }
}

/// A transfer negotiation message.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nego {
    Sync,
    Wide,
    Ppr,
}

/// A scatter/gather entry, laid out as SCRIPTS
/// reads it for a table-indirect MOVE.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SgEntry {
    // size holds the byte count in its low 24
    // bits.
    pub size: u32,
    pub addr: u32,
}

/// A phase mismatch context: the remainder of an
/// interrupted data MOVE and where to go next.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmContext {
    pub sg: SgEntry,
    pub ret: u32,
}

/// The selection parameters SCRIPTS loads into the
/// chip before selecting or reselecting a target.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Select {
    pub sel_id: u8,
    pub sel_scntl3: u8,
    pub sel_sxfer: u8,
    pub sel_scntl4: u8,
}

/// The part of a CCB shared with SCRIPTS.
///
#[derive(Clone, Debug)]
pub struct CcbPhys {
    // Current and saved data pointers.
    pub lastp: u32,
    pub savep: u32,

    // Where SCRIPTS starts and resumes the job.
    pub go_start: u32,
    pub go_restart: u32,

    pub select: Select,
    pub wresid: SgEntry,
    pub smsg: SgEntry,
    pub cmd: SgEntry,
    pub sense: SgEntry,
    pub pm0: PmContext,
    pub pm1: PmContext,

    // data is used from the tail: a job with n
    // segments uses the last n entries.
    pub data: Vec<SgEntry>,
}

impl CcbPhys {
    fn new(max_sg: usize) -> Self {
        CcbPhys {
            lastp: 0,
            savep: 0,
            go_start: 0,
            go_restart: 0,
            select: Select::default(),
            wresid: SgEntry::default(),
            smsg: SgEntry::default(),
            cmd: SgEntry::default(),
            sense: SgEntry::default(),
            pm0: PmContext::default(),
            pm1: PmContext::default(),
            data: alloc::vec![SgEntry::default(); max_sg],
        }
    }

    /// Returns the table entry at `offset`, as a
    /// table-indirect instruction would read it.
    ///
    pub fn table(&self, offset: u32) -> Option<SgEntry> {
        match offset {
            phys::WRESID => Some(self.wresid),
            phys::SMSG => Some(self.smsg),
            phys::CMD => Some(self.cmd),
            phys::SENSE => Some(self.sense),
            phys::PM0_SG => Some(self.pm0.sg),
            phys::PM1_SG => Some(self.pm1.sg),
            _ if offset >= phys::DATA && (offset - phys::DATA) % 8 == 0 => {
                self.data.get(((offset - phys::DATA) / 8) as usize).copied()
            }
            _ => None,
        }
    }
}

/// Identifies a CCB in its pool.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CcbIndex(pub(crate) usize);

/// A command control block.
///
#[derive(Debug)]
pub struct Ccb {
    // ba is the CCB's bus address, which SCRIPTS
    // uses as the DSA.
    pub(crate) ba: u32,

    // The command, while the CCB is in use.
    pub(crate) cmd: Option<Command>,

    pub(crate) target: u8,
    pub(crate) lun: u8,
    pub(crate) tag: Option<u8>,
    pub(crate) order: Option<TaskAttribute>,

    // Status, as last reported by SCRIPTS.
    pub(crate) host_status: HostStatus,
    pub(crate) ssss_status: u8,
    pub(crate) host_flags: HostFlags,
    pub(crate) xerr_status: XerrStatus,
    pub(crate) extra_bytes: i32,

    pub(crate) nego_status: Option<Nego>,
    pub(crate) to_abort: Option<AbortReason>,

    // started is set once the job is in the
    // start queue.
    pub(crate) started: bool,

    // cam_status is the result chosen by the
    // recovery code, overriding the usual one.
    pub(crate) cam_status: Option<HostByte>,

    // result is built when the job finishes and
    // handed up once the CCB is freed.
    pub(crate) result: Option<CommandResult>,

    pub(crate) phys: CcbPhys,

    // Data pointer bounds of the job.
    pub(crate) startp: u32,
    pub(crate) goalp: u32,

    // The furthest data pointer reached, as a
    // data table index and signed offset.
    pub(crate) ext_sg: i32,
    pub(crate) ext_ofs: i32,

    pub(crate) data_len: u32,
    pub(crate) segments: usize,

    // Host buffers read by SCRIPTS.
    pub(crate) scsi_smsg: [u8; 16],
    pub(crate) scsi_smsg2: [u8; 16],
    pub(crate) cdb: [u8; MAX_CDB_LEN],
    pub(crate) sensecmd: [u8; 6],
    pub(crate) sns_bbuf: [u8; crate::SENSE_BUFFER_LEN],

    // The original job's results, saved across an
    // automatic REQUEST SENSE.
    pub(crate) sv_scsi_status: u8,
    pub(crate) sv_xerr_status: XerrStatus,
    pub(crate) sv_resid: i32,

    // tags_si is the ordered-tag window the
    // command was counted in.
    pub(crate) tags_si: usize,
}

impl Ccb {
    fn new(ba: u32, max_sg: usize) -> Self {
        Ccb {
            ba,
            cmd: None,
            target: 0,
            lun: 0,
            tag: None,
            order: None,
            host_status: HostStatus::Idle,
            ssss_status: 0xff,
            host_flags: HostFlags::empty(),
            xerr_status: XerrStatus::empty(),
            extra_bytes: 0,
            nego_status: None,
            to_abort: None,
            started: false,
            cam_status: None,
            result: None,
            phys: CcbPhys::new(max_sg),
            startp: 0,
            goalp: 0,
            ext_sg: -1,
            ext_ofs: 0,
            data_len: 0,
            segments: 0,
            scsi_smsg: [0; 16],
            scsi_smsg2: [0; 16],
            cdb: [0; MAX_CDB_LEN],
            sensecmd: [0; 6],
            sns_bbuf: [0; crate::SENSE_BUFFER_LEN],
            sv_scsi_status: 0,
            sv_xerr_status: XerrStatus::empty(),
            sv_resid: 0,
            tags_si: 0,
        }
    }

    /// Returns the CCB's bus address.
    ///
    pub fn bus_address(&self) -> u32 {
        self.ba
    }

    // Returns the bus address of one of the host
    // buffers, given its offset after the data
    // table.
    pub(crate) fn buffer_address(&self, buffer: u32) -> u32 {
        self.ba + phys::data(self.phys.data.len()) + buffer
    }
}

/// Owns every CCB, and the free, busy and completion
/// queues they move between.
///
#[derive(Debug)]
pub struct CcbPool {
    ccbs: Vec<Ccb>,
    base: u32,
    stride: u32,

    // CCBs ready for use.
    pub(crate) free: VecDeque<CcbIndex>,

    // CCBs holding a command, whether waiting,
    // started or disconnected.
    pub(crate) busy: VecDeque<CcbIndex>,

    // CCBs being completed.
    pub(crate) comp: VecDeque<CcbIndex>,
}

impl CcbPool {
    /// Returns a pool of `count` CCBs, laid out from
    /// bus address `base`.
    ///
    pub fn new(base: u32, count: usize, max_sg: usize) -> Self {
        let size = phys::data(max_sg) + phys::BUFFERS_LEN;
        let stride = (size + 0x3f) & !0x3f;
        let mut ccbs = Vec::with_capacity(count);
        let mut free = VecDeque::with_capacity(count);
        for i in 0..count {
            ccbs.push(Ccb::new(base + stride * i as u32, max_sg));
            free.push_back(CcbIndex(i));
        }

        CcbPool {
            ccbs,
            base,
            stride,
            free,
            busy: VecDeque::with_capacity(count),
            comp: VecDeque::new(),
        }
    }

    /// Returns the CCB with the bus address `dsa`.
    ///
    /// Any other value, including addresses inside a
    /// CCB, returns `None`.
    ///
    pub fn from_dsa(&self, dsa: u32) -> Option<CcbIndex> {
        let offset = dsa.checked_sub(self.base)?;
        if offset % self.stride != 0 {
            return None;
        }

        let index = (offset / self.stride) as usize;
        if index < self.ccbs.len() {
            Some(CcbIndex(index))
        } else {
            None
        }
    }

    /// Returns the CCBs on the busy queue, in order.
    ///
    pub fn busy(&self) -> Vec<CcbIndex> {
        self.busy.iter().copied().collect()
    }

    /// Moves a CCB from the busy queue to the tail
    /// of the completion queue.
    ///
    pub fn busy_to_comp(&mut self, index: CcbIndex) {
        self.busy.retain(|&i| i != index);
        self.comp.retain(|&i| i != index);
        self.comp.push_back(index);
    }

    /// Returns a CCB to the head of the free queue.
    ///
    pub fn release(&mut self, index: CcbIndex) {
        self.busy.retain(|&i| i != index);
        self.comp.retain(|&i| i != index);
        self.free.push_front(index);
    }

    pub fn len(&self) -> usize {
        self.ccbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ccbs.is_empty()
    }
}

impl Index<CcbIndex> for CcbPool {
    type Output = Ccb;

    fn index(&self, index: CcbIndex) -> &Ccb {
        &self.ccbs[index.0]
    }
}

impl IndexMut<CcbIndex> for CcbPool {
    fn index_mut(&mut self, index: CcbIndex) -> &mut Ccb {
        &mut self.ccbs[index.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsa_lookup() {
        let pool = CcbPool::new(0x10_0000, 4, 8);
        for i in 0..4 {
            let ba = pool[CcbIndex(i)].bus_address();
            assert_eq!(pool.from_dsa(ba), Some(CcbIndex(i)));
            assert_eq!(pool.from_dsa(ba + 4), None);
        }

        assert_eq!(pool.from_dsa(0), None);
        assert_eq!(pool.from_dsa(0x0f_fff0), None);
        let past = pool[CcbIndex(3)].bus_address() + pool.stride;
        assert_eq!(pool.from_dsa(past), None);
        assert_eq!(pool.from_dsa(0xffff_ffff), None);
    }

    #[test]
    fn queues() {
        let mut pool = CcbPool::new(0x10_0000, 3, 8);
        let first = pool.free.pop_front().unwrap();
        pool.busy.push_back(first);
        pool.busy_to_comp(first);
        assert!(pool.busy.is_empty());
        assert_eq!(pool.comp.front(), Some(&first));

        pool.release(first);
        assert!(pool.comp.is_empty());
        assert_eq!(pool.free.front(), Some(&first));
        assert_eq!(pool.free.len(), 3);
    }

    #[test]
    fn tables() {
        let mut phys = CcbPhys::new(4);
        phys.data[3] = SgEntry {
            size: 512,
            addr: 0x8000,
        };
        phys.smsg = SgEntry { size: 3, addr: 0x100 };

        assert_eq!(phys.table(phys::data(3)), Some(phys.data[3]));
        assert_eq!(phys.table(phys::SMSG).map(|t| t.size), Some(3));
        assert_eq!(phys.table(phys::data(4)), None);
        assert_eq!(phys.table(phys::DATA + 4), None);
        assert_eq!(phys.table(0x04), None);
    }
}
