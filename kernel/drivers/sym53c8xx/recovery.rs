// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Recovers from errors: aborting commands, resetting
//! targets and the bus, and restarting SCRIPTS.
//!
//! Aborts run as a conversation with SCRIPTS. The host
//! marks what it wants cancelled and sets the semaphore
//! bit in ISTAT. SCRIPTS notices the semaphore in its
//! scheduler and stops with `SCRIPT_STOPPED`, so the host
//! can work on the queues without racing it. If a target
//! must be told, SCRIPTS selects it (`TARGET_SELECTED`),
//! sends the message the host prepared, and reports
//! `ABORT_SENT`, after which the host completes every
//! command the target has dropped.

use crate::ccb::{AbortReason, CcbIndex, HostFlags, HostStatus};
use crate::chip::Features;
use crate::config::BusCheck;
use crate::hcb::{area, Hcb};
use crate::regs::{BusMode, Dcntl, Dstat, Istat, Istat1, Register, Registers, Scntl1, Sist, Stest2, Stest3};
use crate::scripts::{Label, Sir};
use crate::target::Transfer;
use crate::Error;
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use scsi::message;
use scsi::HostByte;

// The number of times the chip is polled while
// waiting for it to abort the current operation.
const ABORT_POLLS: u32 = 100_000;

// The bus lines expected while RST is asserted:
// only RST itself.
const BUS_RESET_LINES: u32 = 2 << 7;

/// Why SCRIPTS is being started from scratch.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartReason {
    /// The host adapter is being brought up.
    Init,

    /// The SCSI bus was reset.
    BusReset,

    /// The electrical mode of the bus changed.
    BusModeChange,
}

impl<R: Registers> Hcb<R> {
    /// start_reset resets the SCSI bus, which is the
    /// last resort when the host cannot tell what state
    /// SCRIPTS or the bus is in.
    ///
    pub(crate) fn start_reset(&mut self) {
        if let Err(err) = self.reset_scsi_bus(true) {
            error!("{}: SCSI bus reset failed: {}", self.config.name, err);
        }
    }

    /// reset_scsi_bus resets the chip and pulses the SCSI
    /// RST line. With `enab_int`, the chip reports the
    /// reset, which restarts everything through
    /// [`start_up`](Self::start_up).
    ///
    pub(crate) fn reset_scsi_bus(&mut self, enab_int: bool) -> Result<(), Error> {
        info!("{}: resetting the SCSI bus", self.config.name);
        self.soft_reset();
        if enab_int {
            self.regs.write16(Register::SIEN, Sist::RST.bits());
        }

        self.regs.write8(Register::STEST3, Stest3::TE.bits());
        self.regs.write8(Register::DCNTL, self.rv_dcntl & Dcntl::IRQM.bits());
        self.regs.write8(Register::SCNTL1, Scntl1::CRST.bits());
        self.regs.read8(Register::MBOX1);
        self.regs.delay(200);

        let mut result = Ok(());
        if self.config.bus_check != BusCheck::Off {
            let sstat0 = self.regs.read8(Register::SSTAT0) as u32;
            let sstat2 = self.regs.read8(Register::SSTAT2) as u32;
            let sbdl = self.regs.read16(Register::SBDL) as u32;
            let sbcl = self.regs.read8(Register::SBCL) as u32;

            // Gather every bus line into one word: RST,
            // parity, data and control.
            let mut term = ((sstat0 & 2) << 7) + ((sstat0 & 1) << 17);
            term |= ((sstat2 & 1) << 26) | ((sbdl & 0xff) << 9) | ((sbdl & 0xff00) << 10) | sbcl;
            if self.limits.maxwide == 0 {
                term &= 0x3ffff;
            }

            if term != BUS_RESET_LINES {
                warn!(
                    "{}: suspicious SCSI data while resetting the bus: {:#x}, expected {:#x}",
                    self.config.name, term, BUS_RESET_LINES
                );
                warn!(
                    "{}: {}DP0,D7-0,RST,REQ,ACK,BSY,SEL,ATN,MSG,C/D,I/O = {:#x}/{:#x}",
                    self.config.name,
                    if self.limits.maxwide != 0 { "DP1,D15-8," } else { "" },
                    term,
                    BUS_RESET_LINES
                );

                if self.config.bus_check == BusCheck::Fail {
                    result = Err(Error::BusLines(term));
                }
            }
        }

        self.regs.write8(Register::SCNTL1, 0);
        result
    }

    // soft_reset stops SCRIPTS and resets the chip.
    fn soft_reset(&mut self) {
        let running = self.chip.features.contains(Features::ISTAT1)
            && Istat1::from_bits_truncate(self.regs.read8(Register::ISTAT1)).contains(Istat1::SCRUN);

        if running {
            self.regs.write8(Register::ISTAT, Istat::CABRT.bits());
            let mut aborted = false;
            for _ in 0..ABORT_POLLS {
                let istat = Istat::from_bits_truncate(self.regs.read8(Register::ISTAT));
                if istat.contains(Istat::SIP) {
                    self.regs.read16(Register::SIST);
                } else if istat.contains(Istat::DIP) {
                    let dstat = Dstat::from_bits_truncate(self.regs.read8(Register::DSTAT));
                    if dstat.contains(Dstat::ABRT) {
                        aborted = true;
                        break;
                    }
                }

                self.regs.delay(5);
            }

            self.regs.write8(Register::ISTAT, 0);
            if !aborted {
                warn!("{}: unable to abort current chip operation", self.config.name);
            }
        }

        self.chip_reset();
    }

    fn chip_reset(&mut self) {
        self.regs.write8(Register::ISTAT, Istat::SRST.bits());
        self.regs.read8(Register::MBOX1);
        self.regs.delay(10);
        self.regs.write8(Register::ISTAT, 0);
        self.regs.read8(Register::MBOX1);
        self.regs.delay(2000);
    }

    /// reset_bus resets the SCSI bus on request from
    /// the upper layers.
    ///
    pub(crate) fn reset_bus(&mut self) -> Result<(), Error> {
        self.reset_scsi_bus(true)
    }

    /// reset_target asks the abort machinery to send a
    /// BUS DEVICE RESET to `target`.
    ///
    pub(crate) fn reset_target(&mut self, target: u8) -> Result<(), Error> {
        if target == self.config.host_id || target >= self.config.max_target {
            return Err(Error::InvalidTarget(target));
        }

        debug!("{}:{}: target reset requested", self.config.name, target);
        self.targets[target as usize].to_reset = true;
        self.signal_stop();
        Ok(())
    }

    /// clear_lun asks the abort machinery to abort every
    /// task on a logical unit.
    ///
    pub(crate) fn clear_lun(&mut self, target: u8, lun: u8) -> Result<(), Error> {
        if target == self.config.host_id || target >= self.config.max_target {
            return Err(Error::InvalidTarget(target));
        }

        let lcb = self.targets[target as usize]
            .lun_mut(lun)
            .ok_or(Error::InvalidLun(lun))?;
        lcb.to_clear = true;
        self.signal_stop();
        Ok(())
    }

    /// abort_ccb starts aborting a CCB. A CCB that has
    /// not been started yet completes at once. Aborting
    /// the same CCB twice means the first attempt got
    /// stuck, so the bus is reset.
    ///
    pub(crate) fn abort_ccb(&mut self, cp: CcbIndex, reason: AbortReason) {
        let ccb = &mut self.ccbs[cp];
        if ccb.cmd.is_none() || ccb.host_status == HostStatus::Idle {
            return;
        }

        if ccb.host_status == HostStatus::Wait {
            debug!(
                "{}:{}:{}: aborting waiting ccb {:#x}",
                self.config.name, ccb.target, ccb.lun, ccb.ba
            );
            ccb.cam_status = Some(reason.host_byte());
            self.deliver(cp);
            return;
        }

        if ccb.to_abort.is_some() {
            warn!(
                "{}:{}:{}: abort of ccb {:#x} did not complete",
                self.config.name, ccb.target, ccb.lun, ccb.ba
            );
            self.start_reset();
            return;
        }

        ccb.to_abort = Some(reason);
        self.signal_stop();
    }

    /// abort_command aborts the command with the given
    /// id.
    ///
    pub(crate) fn abort_command(&mut self, id: crate::CommandId, reason: AbortReason) -> Result<(), Error> {
        let cp = self
            .ccbs
            .busy()
            .into_iter()
            .find(|&cp| self.ccbs[cp].cmd.as_ref().map(|cmd| cmd.id) == Some(id))
            .ok_or(Error::NotFound)?;

        self.abort_ccb(cp, reason);
        Ok(())
    }

    /// dequeue_from_squeue takes the jobs matching the
    /// given target and logical unit out of the start
    /// queue, from slot `start` on, and marks them to be
    /// retried. `None` matches anything. It returns the
    /// number of jobs taken out.
    ///
    pub(crate) fn dequeue_from_squeue(&mut self, start: usize, target: Option<u8>, lun: Option<u8>) -> usize {
        let ccbs = &mut self.ccbs;
        let mut dequeued = Vec::new();
        self.squeue.retain(start, |dsa| {
            let cp = match ccbs.from_dsa(dsa) {
                Some(cp) => cp,
                None => return true,
            };

            let ccb = &mut ccbs[cp];
            ccb.host_flags.remove(HostFlags::HINT_IARB);
            let matches = target.map_or(true, |target| ccb.target == target)
                && lun.map_or(true, |lun| ccb.lun == lun);
            if !matches {
                return true;
            }

            ccb.cam_status = Some(HostByte::SoftError);
            dequeued.push(cp);
            false
        });

        for &cp in dequeued.iter() {
            self.ccbs.busy_to_comp(cp);
        }

        dequeued.len()
    }

    /// clear_tasks moves the disconnected CCBs of a target
    /// matching the given logical unit and tag to the
    /// completion queue, to complete with `status`. A CCB
    /// that timed out keeps its timeout status.
    ///
    pub(crate) fn clear_tasks(&mut self, status: HostByte, target: u8, lun: Option<u8>, task: Option<u8>) -> usize {
        let mut cleared = 0;
        for cp in self.ccbs.busy() {
            let ccb = &mut self.ccbs[cp];
            if ccb.host_status != HostStatus::Disconnect
                || ccb.target != target
                || lun.map_or(false, |lun| ccb.lun != lun)
                || (ccb.tag.is_some() && task.map_or(false, |task| ccb.tag != Some(task)))
            {
                continue;
            }

            if ccb.cam_status != Some(HostByte::TimeOut) {
                ccb.cam_status = Some(status);
            }

            self.ccbs.busy_to_comp(cp);
            cleared += 1;
        }

        cleared
    }

    /// task_recovery handles the interrupts of the abort
    /// conversation with SCRIPTS.
    ///
    pub(crate) fn task_recovery(&mut self, sir: Sir) {
        match sir {
            Sir::ScriptStopped => {
                if self.select_for_abort() {
                    return;
                }

                self.abort_not_started();
            }
            Sir::TargetSelected | Sir::AbortSent => match self.current_target() {
                Some(target) if sir == Sir::TargetSelected => self.prepare_abort_message(target),
                Some(target) => self.abort_sent(target),
                None => {
                    // SCRIPTS is talking to an id outside
                    // the bus. Start over.
                    let id = self.sdid();
                    error!("{}: abort conversation with unknown target {}", self.config.name, id);
                    self.start_reset();
                    return;
                }
            },
            _ => {}
        }

        self.resume();
    }

    // select_for_abort looks for a target to send an
    // abort message to, and starts selecting it.
    fn select_for_abort(&mut self) -> bool {
        let target = self
            .targets
            .iter()
            .position(|tcb| tcb.needs_recovery())
            .map(|target| target as u8)
            .or_else(|| {
                self.ccbs
                    .busy
                    .iter()
                    .map(|&cp| &self.ccbs[cp])
                    .find(|ccb| ccb.host_status == HostStatus::Disconnect && ccb.to_abort.is_some())
                    .map(|ccb| ccb.target)
            });

        let target = match target {
            Some(target) => target,
            None => return false,
        };

        let tcb = &self.targets[target as usize];
        self.abrt_sel.sel_id = target;
        self.abrt_sel.sel_scntl3 = tcb.wval;
        self.abrt_sel.sel_sxfer = tcb.sval;
        self.abrt_sel.sel_scntl4 = tcb.uval;

        debug!("{}:{}: selecting to abort", self.config.name, target);
        self.regs.write32(Register::DSA, self.ba);
        self.jump(Label::SelForAbort);
        true
    }

    // abort_not_started aborts a CCB still in the start
    // queue. Once there is none left, SCRIPTS no longer
    // needs to stop for us.
    fn abort_not_started(&mut self) {
        let mut found = None;
        for cp in self.ccbs.busy() {
            let ccb = &mut self.ccbs[cp];
            if !ccb.host_status.is_not_started() || ccb.to_abort.is_none() {
                continue;
            }

            // SCRIPTS may already be arbitrating for
            // the last job queued.
            if self.config.iarb_max > 0 && self.last_cp == Some(cp) {
                ccb.to_abort = None;
                continue;
            }

            found = Some(cp);
            break;
        }

        let cp = match found {
            Some(cp) => cp,
            None => {
                self.istat_sem = Istat::empty();
                self.regs.write8(Register::ISTAT, Istat::SIGP.bits());
                return;
            }
        };

        let (target, lun) = (self.ccbs[cp].target, self.ccbs[cp].lun);
        let start = self.squeue_position();
        self.dequeue_from_squeue(start, Some(target), Some(lun));

        // The job may have been put back on its waiting
        // queue by an earlier flush.
        self.ccbs.busy_to_comp(cp);
        let ccb = &mut self.ccbs[cp];
        let reason = ccb.to_abort.take().unwrap_or(AbortReason::User);
        ccb.cam_status = Some(reason.host_byte());
        debug!(
            "{}:{}:{}: aborted ccb {:#x} before it started",
            self.config.name, target, lun, ccb.ba
        );

        self.flush_comp_queue(None);
        self.start_next_ccbs(target, lun, 2);
    }

    // prepare_abort_message builds the message to send
    // to the target SCRIPTS has just selected.
    fn prepare_abort_message(&mut self, target: u8) {
        self.abrt_tbl.addr = self.ba + area::ABRT_MSG;
        let tcb = &mut self.targets[target as usize];

        if tcb.to_reset {
            self.abrt_msg[0] = message::BUS_DEVICE_RESET;
            self.abrt_tbl.size = 1;
            tcb.to_reset = false;
            return;
        }

        if let Some(lun) = tcb.lun_to_clear() {
            if let Some(lcb) = tcb.lun_mut(lun) {
                lcb.to_clear = false;
            }

            self.abrt_msg[0] = message::identify(false, lun);
            self.abrt_msg[1] = message::ABORT;
            self.abrt_tbl.size = 2;
            return;
        }

        let found = self.ccbs.busy().into_iter().find(|&cp| {
            let ccb = &self.ccbs[cp];
            ccb.host_status == HostStatus::Disconnect && ccb.target == target && ccb.to_abort.is_some()
        });

        // The target probably finished the job while
        // we were selecting it. A lone ABORT just makes
        // it let go of the bus.
        let cp = match found {
            Some(cp) => cp,
            None => {
                self.abrt_msg[0] = message::ABORT;
                self.abrt_tbl.size = 1;
                return;
            }
        };

        let ccb = &mut self.ccbs[cp];
        self.abrt_msg[0] = message::identify(false, ccb.lun);
        match ccb.tag {
            None => {
                self.abrt_msg[1] = message::ABORT;
                self.abrt_tbl.size = 2;
            }
            Some(_) => {
                self.abrt_msg[1] = ccb.scsi_smsg[1];
                self.abrt_msg[2] = ccb.scsi_smsg[2];
                self.abrt_msg[3] = message::ABORT_TAG;
                self.abrt_tbl.size = 4;
            }
        }

        if ccb.to_abort.take() == Some(AbortReason::Timeout) {
            ccb.cam_status = Some(HostByte::TimeOut);
        }

        debug!(
            "{}:{}:{}: abort message: {:x?}",
            self.config.name,
            target,
            ccb.lun,
            &self.abrt_msg[..self.abrt_tbl.size as usize]
        );
    }

    // abort_sent completes everything the target has
    // dropped after our abort message.
    fn abort_sent(&mut self, target: u8) {
        if self.abrt_msg[0] == message::ABORT {
            return;
        }

        let mut lun = None;
        let mut task = None;
        if self.abrt_msg[0] == message::BUS_DEVICE_RESET {
            // The target is back to asynchronous narrow
            // transfers.
            let rv_scntl3 = self.rv_scntl3;
            let tcb = &mut self.targets[target as usize];
            tcb.sval = 0;
            tcb.wval = rv_scntl3;
            tcb.uval = 0;
            tcb.current = Transfer::default();
            tcb.goal.check_nego = true;
            tcb.goal.renego = None;
        } else {
            lun = Some(self.abrt_msg[0] & 0x3f);
            if self.abrt_tbl.size == 4 && self.abrt_msg[3] == message::ABORT_TAG {
                // Tags go on the wire as 2n+1.
                task = Some(self.abrt_msg[2] >> 1);
            }
        }

        let start = self.squeue_position();
        self.dequeue_from_squeue(start, Some(target), lun);
        self.clear_tasks(HostByte::Abort, target, lun, task);
        self.flush_comp_queue(None);

        if self.abrt_msg[0] == message::BUS_DEVICE_RESET {
            info!("{}:{}: target has been reset", self.config.name, target);
        }

        self.start_waiting();
    }

    /// start_up restarts SCRIPTS from scratch. Every
    /// outstanding command fails, so the upper layers
    /// can retry it.
    ///
    pub(crate) fn start_up(&mut self, reason: StartReason) {
        if reason == StartReason::BusReset {
            self.soft_reset();
        } else {
            self.clear_fifos();
        }

        self.squeue.reset();
        self.dqueue.reset();
        self.istat_sem = Istat::empty();
        self.last_cp = None;
        self.iarb_count = 0;
        self.msgout[0] = message::NOOP;

        self.flush_busy_queue(Some(HostByte::SoftError));
        self.init_chip();

        let rv_scntl3 = self.rv_scntl3;
        for tcb in self.targets.iter_mut() {
            tcb.to_reset = false;
            tcb.sval = 0;
            tcb.wval = rv_scntl3;
            tcb.uval = 0;
            tcb.current = Transfer::default();
            tcb.goal.check_nego = true;
            tcb.goal.renego = None;
            tcb.nego_cp = None;
            for lcb in tcb.luns.iter_mut().flatten() {
                lcb.to_clear = false;
            }
        }

        self.regs.write32(Register::DSA, self.ba);
        self.jump(Label::Init);

        if reason != StartReason::Init {
            self.bus_was_reset = true;
        }

        self.start_waiting();
    }

    // init_chip programs the registers SCRIPTS relies
    // on.
    fn init_chip(&mut self) {
        let host_id = self.config.host_id;
        self.regs.write8(Register::ISTAT, 0);
        self.regs.write8(Register::SCNTL0, 0xca); // Full arbitration, parity checking.
        self.regs.write8(Register::SCNTL1, 0);
        self.regs.write8(Register::SCNTL3, self.rv_scntl3);
        self.regs.write8(Register::SCID, 0x40 | host_id); // Respond to reselection.
        self.regs.write16(Register::RESPID, 1u16 << host_id);
        self.regs.write8(Register::STIME0, 0x0c); // Selection timeout of 256 ms.
        self.regs.write8(Register::DCNTL, self.rv_dcntl | Dcntl::NOCOM.bits());
        self.regs.write8(Register::CTEST3, self.rv_ctest3);
        self.regs.write8(Register::STEST3, Stest3::TE.bits());

        let mut sien = Sist::STO | Sist::HTH | Sist::MA | Sist::SGE | Sist::UDC | Sist::RST | Sist::PAR;
        if self.chip.features.intersects(Features::ULTRA2 | Features::ULTRA3) {
            self.regs.write8(Register::STEST2, Stest2::EXT.bits());
            self.scsi_mode = BusMode::from_stest4(self.regs.read8(Register::STEST4));
            sien |= Sist::SBMC;
        }

        self.regs.write16(Register::SIEN, sien.bits());
        let dien = Dstat::MDPE | Dstat::BF | Dstat::SSI | Dstat::SIR | Dstat::IID;
        self.regs.write8(Register::DIEN, dien.bits());
    }

    /// recover_scsi_int recovers from an unexpected bus
    /// condition. Outside the critical regions, SCRIPTS
    /// can be restarted safely: the current job, if any,
    /// completes with `hsts`. Otherwise, the bus is reset.
    ///
    pub(crate) fn recover_scsi_int(&mut self, hsts: HostStatus) {
        let dsp = self.regs.read32(Register::DSP);
        let dsa = self.regs.read32(Register::DSA);
        if let Some(region) = self.layout.critical_region(dsp) {
            warn!("{}: interrupted in critical region {:?}", self.config.name, region);
            self.start_reset();
            return;
        }

        self.clear_fifos();
        match self.ccbs.from_dsa(dsa).filter(|&cp| self.ccbs[cp].cmd.is_some()) {
            Some(cp) => {
                // SCRIPTS calls back with the start queue
                // position, so the device's queue can be
                // frozen.
                self.ccbs[cp].host_status = hsts;
                self.jump(Label::CompleteError);
            }
            None => {
                self.regs.write32(Register::DSA, 0xff_ffff);
                self.jump(Label::Start);
            }
        }
    }
}
