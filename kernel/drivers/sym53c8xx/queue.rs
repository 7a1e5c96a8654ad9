// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The start and done queues shared with SCRIPTS, and the
//! CCB scheduling built on top of them.
//!
//! Both queues are rings of 32-bit bus addresses with
//! `2 * max_queue` slots. Jobs live in the even slots. In
//! the start queue, each odd slot holds the bus address of
//! the next even slot, so SCRIPTS can follow the ring
//! without arithmetic, and the slot after the last job
//! always holds the idle task. In the done queue, SCRIPTS
//! writes the DSA of each completed job into the next even
//! slot, and zero marks an empty slot.

use crate::ccb::{CcbIndex, HostFlags, HostStatus, SgEntry};
use crate::command::{Command, DataDirection};
use crate::hcb::Hcb;
use crate::regs::{Istat, Register, Registers};
use crate::scripts::{Label, INSTRUCTION_SIZE};
use crate::target::Lcb;
use crate::Error;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicU32, Ordering};
use log::{debug, trace, warn};
use scsi::message::{self, TaskAttribute};
use scsi::OperationCode;

/// A ring of bus addresses in memory shared with
/// SCRIPTS.
///
#[derive(Debug)]
pub struct BusRing {
    // ba is the bus address of slot 0.
    ba: u32,
    slots: Vec<AtomicU32>,
}

impl BusRing {
    fn new(ba: u32, len: usize) -> Self {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, || AtomicU32::new(0));
        BusRing { ba, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// load reads slot `i`, as last written by
    /// either side.
    ///
    pub fn load(&self, i: usize) -> u32 {
        self.slots[i].load(Ordering::Acquire)
    }

    /// store writes slot `i`, making every earlier
    /// write visible to SCRIPTS first.
    ///
    pub fn store(&self, i: usize, value: u32) {
        self.slots[i].store(value, Ordering::Release);
    }

    /// slot_address returns the bus address of
    /// slot `i`.
    ///
    pub fn slot_address(&self, i: usize) -> u32 {
        self.ba + 4 * i as u32
    }

    /// slot_index returns the index of the slot at
    /// bus address `addr`.
    ///
    pub fn slot_index(&self, addr: u32) -> Option<usize> {
        let offset = addr.checked_sub(self.ba)?;
        let index = (offset / 4) as usize;
        if offset % 4 == 0 && index < self.slots.len() {
            Some(index)
        } else {
            None
        }
    }

    // next returns the even slot after `i`.
    fn next(&self, i: usize) -> usize {
        let next = i + 2;
        if next >= self.slots.len() {
            0
        } else {
            next
        }
    }

    // link fills the odd slots with the address of
    // the following even slot, wrapping at the end.
    fn link(&self, even: u32) {
        for i in (0..self.slots.len()).step_by(2) {
            self.store(i, even);
            self.store(i + 1, self.slot_address(self.next(i)));
        }
    }
}

/// The start queue, where the host places new jobs.
///
#[derive(Debug)]
pub struct StartQueue {
    ring: BusRing,

    // put is the slot the next job goes into,
    // which always holds the idle task.
    put: usize,

    idle_task: u32,
}

impl StartQueue {
    pub fn new(ba: u32, max_queue: usize, idle_task: u32) -> Self {
        let mut queue = StartQueue {
            ring: BusRing::new(ba, 2 * max_queue),
            put: 0,
            idle_task,
        };

        queue.reset();
        queue
    }

    /// reset empties the queue.
    ///
    pub fn reset(&mut self) {
        self.ring.link(self.idle_task);
        self.put = 0;
    }

    /// push adds a job to the tail of the queue.
    ///
    /// The idle task is written into the next slot
    /// before the job replaces the current idle task,
    /// so SCRIPTS never runs off the end of the queue.
    ///
    pub fn push(&mut self, dsa: u32) {
        let next = self.ring.next(self.put);
        self.ring.store(next, self.idle_task);
        fence(Ordering::Release);
        self.ring.store(self.put, dsa);
        self.put = next;
        fence(Ordering::Release);
    }

    /// put returns the index of the slot holding
    /// the idle task.
    ///
    pub fn put(&self) -> usize {
        self.put
    }

    pub fn slot(&self, i: usize) -> u32 {
        self.ring.load(i)
    }

    /// position returns the index of the job slot at
    /// bus address `addr`, as SCRIPTS reports its
    /// position in the queue.
    ///
    pub fn position(&self, addr: u32) -> Option<usize> {
        self.ring.slot_index(addr).filter(|i| i % 2 == 0)
    }

    /// retain walks the jobs from slot `start` to the
    /// tail, keeping those for which `keep` returns
    /// true and closing up the gaps. It returns the
    /// number of jobs removed.
    ///
    pub fn retain<F>(&mut self, start: usize, mut keep: F) -> usize
    where
        F: FnMut(u32) -> bool,
    {
        let mut i = start;
        let mut j = start;
        let mut removed = 0;
        while i != self.put {
            let dsa = self.ring.load(i);
            if keep(dsa) {
                if i != j {
                    self.ring.store(j, dsa);
                }

                j = self.ring.next(j);
            } else {
                removed += 1;
            }

            i = self.ring.next(i);
        }

        if i != j {
            self.ring.store(j, self.ring.load(i));
        }

        self.put = j;
        removed
    }

    /// jobs returns the DSAs of the queued jobs from
    /// slot `start` to the tail.
    ///
    pub fn jobs(&self, start: usize) -> Vec<u32> {
        let mut jobs = Vec::new();
        let mut i = start;
        while i != self.put {
            jobs.push(self.ring.load(i));
            i = self.ring.next(i);
        }

        jobs
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// The done queue, where SCRIPTS returns completed
/// jobs.
///
#[derive(Debug)]
pub struct DoneQueue {
    ring: BusRing,

    // get is the next slot to read.
    get: usize,
}

impl DoneQueue {
    pub fn new(ba: u32, max_queue: usize) -> Self {
        let mut queue = DoneQueue {
            ring: BusRing::new(ba, 2 * max_queue),
            get: 0,
        };

        queue.reset();
        queue
    }

    /// reset empties the queue.
    ///
    pub fn reset(&mut self) {
        self.ring.link(0);
        self.get = 0;
    }

    /// pop takes the next completed DSA, clearing
    /// its slot so it is consumed exactly once.
    ///
    pub fn pop(&mut self) -> Option<u32> {
        let dsa = self.ring.load(self.get);
        if dsa == 0 {
            return None;
        }

        self.ring.store(self.get, 0);
        self.get = self.ring.next(self.get);
        Some(dsa)
    }

    // post writes a completed DSA the way SCRIPTS
    // does, `n` jobs after the host's position.
    #[cfg(test)]
    pub(crate) fn post(&self, n: usize, dsa: u32) {
        let mut i = self.get;
        for _ in 0..n {
            i = self.ring.next(i);
        }

        self.ring.store(i, dsa);
    }
}

impl<R: Registers> Hcb<R> {
    /// put_start_queue places a CCB at the tail of the
    /// start queue and signals SCRIPTS.
    ///
    pub(crate) fn put_start_queue(&mut self, cp: CcbIndex) {
        if self.config.iarb_max > 0 {
            match self.last_cp {
                Some(last) if self.iarb_count < self.config.iarb_max => {
                    self.ccbs[last].host_flags |= HostFlags::HINT_IARB;
                    self.iarb_count += 1;
                }
                _ => self.iarb_count = 0,
            }

            self.last_cp = Some(cp);
        }

        let dsa = self.ccbs[cp].ba;
        self.squeue.push(dsa);
        trace!("{}: queue put {:#x} at {}", self.config.name, dsa, self.squeue.put());
        self.regs.write8(Register::ISTAT, (Istat::SIGP | self.istat_sem).bits());
    }

    /// wakeup_done drains the done queue, completing
    /// every CCB SCRIPTS has returned, and returns the
    /// number completed.
    ///
    pub(crate) fn wakeup_done(&mut self) -> usize {
        fence(Ordering::Acquire);
        let mut n = 0;
        while let Some(dsa) = self.dqueue.pop() {
            match self.ccbs.from_dsa(dsa) {
                Some(cp) if self.ccbs[cp].cmd.is_some() => {
                    fence(Ordering::Acquire);
                    self.complete_ok(cp);
                    n += 1;
                }
                Some(_) => warn!("{}: stale DSA ({:#x}) in done queue", self.config.name, dsa),
                None => warn!("{}: bad DSA ({:#x}) in done queue", self.config.name, dsa),
            }
        }

        n
    }

    /// get_ccb takes a free CCB for `cmd`, allocating
    /// a tag for tagged commands, and queues it to the
    /// busy queue and the logical unit's waiting queue.
    ///
    pub(crate) fn get_ccb(&mut self, cmd: &Command) -> Result<CcbIndex, Error> {
        let cp = *self.ccbs.free.front().ok_or(Error::NoCcb)?;
        let (bad_itl, bad_itlq, bad_lun) = (self.bad_itl_ba(), self.bad_itlq_ba(), self.bad_lun_ba());
        let max_tags = self.config.max_tags as u16;
        let tcb = &mut self.targets[cmd.target as usize];
        let lcb = tcb.luns[cmd.lun as usize].get_or_insert_with(|| Lcb::new(max_tags, bad_itl, bad_itlq, bad_lun));

        let mut tags_si = 0;
        let tag = match cmd.tag_order {
            Some(_) => {
                let tag = lcb.alloc_tag().ok_or(Error::NoTag)?;
                tags_si = lcb.tags_si;
                lcb.tags_sum[tags_si] += 1;
                lcb.tags_since += 1;
                Some(tag)
            }
            None => {
                lcb.busy_itl += 1;
                None
            }
        };

        lcb.waiting.push_back(cp);
        self.ccbs.free.pop_front();
        self.ccbs.busy.push_back(cp);

        let ccb = &mut self.ccbs[cp];
        ccb.to_abort = None;
        ccb.cam_status = None;
        ccb.result = None;
        ccb.started = false;
        ccb.tag = tag;
        ccb.order = cmd.tag_order;
        ccb.tags_si = tags_si;
        ccb.target = cmd.target;
        ccb.lun = cmd.lun;
        if let Some(tag) = tag {
            trace!("{}:{}:{}: ccb {:#x} using tag {}", self.config.name, cmd.target, cmd.lun, ccb.ba, tag);
        }

        Ok(cp)
    }

    /// free_ccb releases a CCB's tag or untagged nexus,
    /// invalidates its reselection path, and returns it
    /// to the free queue.
    ///
    pub(crate) fn free_ccb(&mut self, cp: CcbIndex) {
        let (bad_itl, bad_itlq, bad_lun) = (self.bad_itl_ba(), self.bad_itlq_ba(), self.bad_lun_ba());
        let ccb = &mut self.ccbs[cp];
        let tcb = &mut self.targets[ccb.target as usize];
        if let Some(lcb) = tcb.luns.get_mut(ccb.lun as usize).and_then(|lcb| lcb.as_mut()) {
            match ccb.tag {
                Some(tag) => {
                    lcb.tags_sum[ccb.tags_si] = lcb.tags_sum[ccb.tags_si].saturating_sub(1);
                    lcb.free_tag(tag);
                    lcb.itlq_tbl[tag as usize] = bad_itlq;
                }
                None => {
                    // A waiting untagged CCB never owned
                    // the nexus.
                    if lcb.itl_task_sa == ccb.ba {
                        lcb.itl_task_sa = bad_itl;
                    }

                    lcb.busy_itl = lcb.busy_itl.saturating_sub(1);
                }
            }

            if lcb.is_idle() {
                lcb.resel_sa = bad_lun;
            }

            lcb.waiting.retain(|&i| i != cp);
            lcb.started.retain(|&i| i != cp);
            if ccb.started {
                match ccb.tag {
                    Some(_) => lcb.started_tags = lcb.started_tags.saturating_sub(1),
                    None => lcb.started_no_tag = lcb.started_no_tag.saturating_sub(1),
                }
            }
        }

        if tcb.nego_cp == Some(cp) {
            tcb.nego_cp = None;
        }

        if self.last_cp == Some(cp) {
            self.last_cp = None;
        }

        ccb.cmd = None;
        ccb.started = false;
        ccb.host_status = HostStatus::Idle;
        self.ccbs.release(cp);
    }

    /// start_next_ccbs moves up to `maxn` CCBs from the
    /// logical unit's waiting queue to the start queue,
    /// never mixing tagged and untagged commands and
    /// never exceeding the logical unit's queue depth.
    ///
    pub(crate) fn start_next_ccbs(&mut self, target: u8, lun: u8, maxn: usize) {
        let resel_tag = self.layout.address(Label::ReselTag);
        let resel_no_tag = self.layout.address(Label::ReselNoTag);
        for _ in 0..maxn {
            let lcb = match self.targets[target as usize].lun_mut(lun) {
                Some(lcb) => lcb,
                None => return,
            };

            let cp = match lcb.waiting.front() {
                Some(&cp) => cp,
                None => return,
            };

            let ccb = &mut self.ccbs[cp];
            match ccb.tag {
                Some(tag) => {
                    if lcb.started_no_tag > 0 || lcb.started_tags >= lcb.started_max {
                        return;
                    }

                    lcb.itlq_tbl[tag as usize] = ccb.ba;
                    lcb.resel_sa = resel_tag;
                    lcb.started_tags += 1;
                }
                None => {
                    if lcb.started_no_tag > 0 || lcb.started_tags > 0 {
                        return;
                    }

                    lcb.itl_task_sa = ccb.ba;
                    lcb.resel_sa = resel_no_tag;
                    lcb.started_no_tag += 1;
                }
            }

            lcb.waiting.pop_front();
            lcb.started.push_back(cp);
            ccb.started = true;
            ccb.host_status = if ccb.nego_status.is_some() {
                HostStatus::Negotiate
            } else {
                HostStatus::Busy
            };

            self.put_start_queue(cp);
        }
    }

    /// start_waiting starts a couple of waiting CCBs on
    /// every logical unit that has some.
    ///
    pub(crate) fn start_waiting(&mut self) {
        let mut luns = Vec::new();
        for (target, tcb) in self.targets.iter().enumerate() {
            for (lun, lcb) in tcb.luns.iter().enumerate() {
                if lcb.as_ref().map(|lcb| !lcb.waiting.is_empty()).unwrap_or(false) {
                    luns.push((target as u8, lun as u8));
                }
            }
        }

        for (target, lun) in luns {
            self.start_next_ccbs(target, lun, 2);
        }
    }

    /// queue_scsiio binds a command to a CCB, builds its
    /// messages, command and data tables, and starts it
    /// if the logical unit allows.
    ///
    pub(crate) fn queue_scsiio(&mut self, cmd: Command) -> Result<CcbIndex, Error> {
        if cmd.target >= self.config.max_target || cmd.target == self.config.host_id {
            return Err(Error::InvalidTarget(cmd.target));
        }

        if cmd.lun >= self.config.max_lun {
            return Err(Error::InvalidLun(cmd.lun));
        }

        if cmd.cdb.is_empty() || cmd.cdb.len() > crate::ccb::MAX_CDB_LEN {
            return Err(Error::InvalidCommand);
        }

        let segments = match cmd.direction {
            DataDirection::None => 0,
            _ => cmd.segments.len(),
        };

        if segments > self.config.max_sg {
            return Err(Error::TooManySegments(segments));
        }

        let cp = self.get_ccb(&cmd)?;
        let target = cmd.target;
        let lun = cmd.lun;

        // Build the IDENTIFY and tag messages.
        let mut msg = [0u8; 16];
        let can_disconnect = self.config.disconnect || cmd.tag_order.is_some();
        msg[0] = message::identify(can_disconnect, lun);
        let mut msglen = 1;
        if let Some(tag) = self.ccbs[cp].tag {
            let mut order = cmd.tag_order.unwrap_or(TaskAttribute::Simple);
            if let Some(lcb) = self.targets[target as usize].lun_mut(lun) {
                if lcb.tags_since > 3 * self.config.max_tags as u32 {
                    lcb.tags_si ^= 1;
                    if lcb.tags_sum[lcb.tags_si] > 0 {
                        order = TaskAttribute::Ordered;
                        debug!("{}:{}:{}: ordered tag forced", self.config.name, target, lun);
                    }

                    lcb.tags_since = 0;
                }
            }

            msg[msglen] = order.as_u8();
            msg[msglen + 1] = (tag << 1) + 1;
            msglen += 2;
        }

        // Negotiate when asked to, and always on INQUIRY
        // and REQUEST SENSE.
        self.ccbs[cp].nego_status = None;
        let opcode = cmd.cdb[0];
        let tcb = &self.targets[target as usize];
        let wants_nego = tcb.goal.check_nego
            || opcode == OperationCode::Inquiry as u8
            || opcode == OperationCode::RequestSense as u8;
        if wants_nego && tcb.nego_cp.is_none() {
            let (len, nego) = self.prepare_nego(target, &mut msg[msglen..]);
            msglen += len;
            self.ccbs[cp].nego_status = nego;
            if nego.is_some() {
                self.targets[target as usize].nego_cp = Some(cp);
            }
        }

        let select = self.layout.address(Label::Select);
        let resel_dsa = self.layout.address(Label::ReselDsa);
        let data_end = self.layout.data_end(cmd.direction == DataDirection::In);
        let no_data = self.layout.address(Label::NoData);
        let max_sg = self.config.max_sg;
        let tcb = &self.targets[target as usize];
        let (sval, wval, uval) = (tcb.sval, tcb.wval, tcb.uval);

        let ccb = &mut self.ccbs[cp];
        ccb.phys.go_start = select;
        ccb.phys.go_restart = resel_dsa;
        ccb.phys.select.sel_id = target;
        ccb.phys.select.sel_scntl3 = wval;
        ccb.phys.select.sel_sxfer = sval;
        ccb.phys.select.sel_scntl4 = uval;

        ccb.scsi_smsg = msg;
        ccb.phys.smsg = SgEntry {
            size: msglen as u32,
            addr: ccb.buffer_address(crate::ccb::phys::SMSG_BUF),
        };

        ccb.host_status = HostStatus::Wait;
        ccb.ssss_status = 0xff;
        ccb.xerr_status = crate::ccb::XerrStatus::empty();
        ccb.host_flags = HostFlags::empty();
        ccb.extra_bytes = 0;
        ccb.ext_sg = -1;
        ccb.ext_ofs = 0;

        // The command descriptor block.
        ccb.cdb = [0; crate::ccb::MAX_CDB_LEN];
        ccb.cdb[..cmd.cdb.len()].copy_from_slice(&cmd.cdb);
        ccb.phys.cmd = SgEntry {
            size: cmd.cdb.len() as u32,
            addr: ccb.buffer_address(crate::ccb::phys::CMD_BUF),
        };

        ccb.phys.sense = SgEntry {
            size: crate::SENSE_BUFFER_LEN as u32,
            addr: ccb.buffer_address(crate::ccb::phys::SNS_BUF),
        };

        // The data segments fill the tail of the data
        // table, so the last MOVE is always the last
        // one of the data block.
        for entry in ccb.phys.data.iter_mut() {
            *entry = SgEntry::default();
        }

        ccb.segments = segments;
        ccb.data_len = 0;
        if segments > 0 {
            let first = max_sg - segments;
            for (entry, seg) in ccb.phys.data[first..].iter_mut().zip(cmd.segments.iter()) {
                *entry = SgEntry {
                    size: seg.len & 0xff_ffff,
                    addr: seg.addr,
                };
                ccb.data_len += seg.len & 0xff_ffff;
            }
        }

        let (lastp, goalp) = match cmd.direction {
            DataDirection::None => (no_data, no_data),
            dir => {
                if dir == DataDirection::In {
                    ccb.host_flags |= HostFlags::DATA_IN;
                }

                let goalp = data_end + INSTRUCTION_SIZE;
                (goalp - INSTRUCTION_SIZE - INSTRUCTION_SIZE * segments as u32, goalp)
            }
        };

        ccb.phys.lastp = lastp;
        ccb.phys.savep = lastp;
        ccb.startp = lastp;
        ccb.goalp = goalp;
        ccb.cmd = Some(cmd);

        self.start_next_ccbs(target, lun, 2);
        Ok(cp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_command, test_hcb};

    #[test]
    fn start_queue_wraps() {
        let idle = 0xdead_0000;
        let mut queue = StartQueue::new(0x1000, 4, idle);
        assert_eq!(queue.len(), 8);
        assert_eq!(queue.slot(1), 0x1008);
        assert_eq!(queue.slot(7), 0x1000);

        for (n, dsa) in [0x100u32, 0x200, 0x300, 0x400, 0x500].iter().enumerate() {
            queue.push(*dsa);

            // The idle task always follows the last job.
            assert_eq!(queue.slot(queue.put()), idle);
            assert_eq!(queue.put(), (2 * (n + 1)) % 8);
        }

        // The fifth job wrapped into slot 0.
        assert_eq!(queue.slot(0), 0x500);
        assert_eq!(queue.position(0x1010), Some(4));
        assert_eq!(queue.position(0x1004), None);
        assert_eq!(queue.position(0x0ffc), None);
    }

    #[test]
    fn start_queue_retain() {
        let idle = 0xdead_0000;
        let mut queue = StartQueue::new(0x1000, 8, idle);
        for dsa in [0x100u32, 0x200, 0x300, 0x400] {
            queue.push(dsa);
        }

        let removed = queue.retain(2, |dsa| dsa != 0x200 && dsa != 0x400);
        assert_eq!(removed, 2);
        assert_eq!(queue.jobs(0), [0x100, 0x300]);
        assert_eq!(queue.slot(queue.put()), idle);
    }

    #[test]
    fn done_queue() {
        let mut queue = DoneQueue::new(0x2000, 2);
        assert_eq!(queue.pop(), None);
        queue.post(0, 0x100);
        queue.post(1, 0x200);
        assert_eq!(queue.pop(), Some(0x100));
        assert_eq!(queue.pop(), Some(0x200));
        assert_eq!(queue.pop(), None);

        // Consumed slots are cleared, and the ring wraps.
        queue.post(0, 0x300);
        assert_eq!(queue.get, 0);
        assert_eq!(queue.pop(), Some(0x300));
    }

    #[test]
    fn done_queue_garbage() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        let ba = hcb.ccbs[cp].ba;
        hcb.ccbs[cp].host_status = HostStatus::Complete;
        hcb.ccbs[cp].ssss_status = 0;

        hcb.dqueue.post(0, 0x1234_5678);
        hcb.dqueue.post(1, ba + 4);
        hcb.dqueue.post(2, ba);
        hcb.dqueue.post(3, ba);
        assert_eq!(hcb.wakeup_done(), 1);
        assert_eq!(hcb.finished.len(), 1);
        assert!(hcb.ccbs[cp].cmd.is_none());
        assert_eq!(hcb.dqueue.pop(), None);
    }

    #[test]
    fn start_queue_full() {
        let mut hcb = test_hcb();
        let mut started = Vec::new();
        let mut refused = 0;
        for target in 0..4 {
            for _ in 0..16 {
                match hcb.queue_scsiio(test_command(target, 0, Some(TaskAttribute::Simple))) {
                    Ok(cp) => started.push(hcb.ccbs[cp].ba),
                    Err(err) => {
                        assert_eq!(err, Error::NoCcb);
                        refused += 1;
                    }
                }
            }
        }

        // Every job that was started is still in the
        // queue, in order, with the idle task after it.
        assert_eq!(started.len(), hcb.config.max_queue - 2);
        assert_eq!(refused, 2);
        assert_eq!(hcb.squeue.slot(0), started[0]);
        assert_eq!(hcb.squeue.jobs(0), started);
        assert_eq!(hcb.squeue.slot(hcb.squeue.put()), hcb.ba + crate::hcb::area::IDLE_TASK);
    }

    #[test]
    fn untagged_waits_for_tagged() {
        let mut hcb = test_hcb();
        let tagged = hcb.queue_scsiio(test_command(2, 0, Some(TaskAttribute::Simple))).unwrap();
        let untagged = hcb.queue_scsiio(test_command(2, 0, None)).unwrap();

        let lcb = hcb.targets[2].lun(0).unwrap();
        assert_eq!(lcb.started_tags, 1);
        assert_eq!(lcb.started_no_tag, 0);
        assert_eq!(lcb.waiting.front(), Some(&untagged));
        assert!(hcb.ccbs[tagged].started);
        assert_eq!(hcb.ccbs[untagged].host_status, HostStatus::Wait);
        assert_eq!(hcb.squeue.jobs(0), [hcb.ccbs[tagged].ba]);

        // Once the tagged command finishes, the untagged
        // one goes.
        hcb.ccbs[tagged].host_status = HostStatus::Complete;
        hcb.ccbs[tagged].ssss_status = 0;
        hcb.complete_ok(tagged);
        let lcb = hcb.targets[2].lun(0).unwrap();
        assert_eq!(lcb.started_tags, 0);
        assert_eq!(lcb.started_no_tag, 1);
        assert!(hcb.ccbs[untagged].started);
    }

    #[test]
    fn messages() {
        let mut hcb = test_hcb();
        hcb.targets[3].goal.check_nego = false;
        let cp = hcb.queue_scsiio(test_command(3, 1, Some(TaskAttribute::Ordered))).unwrap();
        let ccb = &hcb.ccbs[cp];
        assert_eq!(ccb.phys.smsg.size, 3);
        assert_eq!(ccb.scsi_smsg[0], 0xc1);
        assert_eq!(ccb.scsi_smsg[1], message::ORDERED_TAG);
        assert_eq!(ccb.scsi_smsg[2], (ccb.tag.unwrap() << 1) + 1);
        assert_eq!(ccb.host_status, HostStatus::Busy);

        // Data pointers cover the tail of the data block.
        assert_eq!(ccb.goalp, hcb.layout.address(Label::DataIn2) + 8);
        assert_eq!(ccb.phys.lastp, hcb.layout.address(Label::DataIn2) - 8);
        assert_eq!(ccb.data_len, 512);

        // Untagged commands may disconnect unless told
        // otherwise.
        let cp = hcb.queue_scsiio(test_command(4, 0, None)).unwrap();
        assert_eq!(hcb.ccbs[cp].scsi_smsg[0], message::identify(true, 0));
        hcb.config.disconnect = false;
        let cp = hcb.queue_scsiio(test_command(5, 0, None)).unwrap();
        assert_eq!(hcb.ccbs[cp].scsi_smsg[0], message::identify(false, 0));
    }

    #[test]
    fn rejects_bad_commands() {
        let mut hcb = test_hcb();
        let host_id = hcb.config.host_id;
        assert_eq!(
            hcb.queue_scsiio(test_command(host_id, 0, None)),
            Err(Error::InvalidTarget(host_id))
        );
        assert_eq!(hcb.queue_scsiio(test_command(1, 200, None)), Err(Error::InvalidLun(200)));

        let mut cmd = test_command(1, 0, None);
        cmd.cdb.clear();
        assert_eq!(hcb.queue_scsiio(cmd), Err(Error::InvalidCommand));
        assert_eq!(hcb.ccbs.free.len(), hcb.ccbs.len());
    }
}
