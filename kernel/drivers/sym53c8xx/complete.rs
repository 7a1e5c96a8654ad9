// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Completes commands and hands their results back up.
//!
//! Jobs that finish normally come back through the done
//! queue and go to [`Hcb::complete_ok`]. Everything else,
//! whether a bad SCSI status, an extended error or a job
//! failed by the recovery code, goes through the completion
//! queue: the CCB is moved there with its result decided,
//! and [`Hcb::flush_comp_queue`] either delivers it or puts
//! it back on its logical unit's waiting queue to be tried
//! again.

use crate::ccb::{CcbIndex, HostFlags, HostStatus, XerrStatus};
use crate::command::{CommandResult, Completion};
use crate::hcb::Hcb;
use crate::regs::Registers;
use crate::scripts::Label;
use log::{debug, info, warn};
use scsi::{HostByte, StatusCode};

// The number of good completions after which a reduced
// queue depth is raised again by one.
const QUEUE_DEPTH_RECOVERY: u16 = 200;

// xerr_cam_status returns the host byte for a job with
// the extended errors given.
fn xerr_cam_status(default: HostByte, xerr: XerrStatus) -> HostByte {
    if xerr.is_empty() {
        default
    } else if xerr.contains(XerrStatus::PARITY) {
        HostByte::Parity
    } else {
        HostByte::Error
    }
}

impl<R: Registers> Hcb<R> {
    /// complete_ok completes a job SCRIPTS returned
    /// through the done queue.
    ///
    pub(crate) fn complete_ok(&mut self, cp: CcbIndex) {
        if self.ccbs[cp].cmd.is_none() {
            return;
        }

        let mut resid = 0;
        if self.ccbs[cp].phys.lastp != self.ccbs[cp].goalp {
            resid = self.compute_residual(cp);
        }

        if !self.config.residual {
            resid = 0;
        }

        let ccb = &mut self.ccbs[cp];
        ccb.result = Some(CommandResult {
            host: HostByte::Ok,
            status: ccb.ssss_status,
            resid,
            sense: None,
        });

        // Raise a reduced queue depth again once the
        // device has coped for a while.
        let (target, lun) = (ccb.target, ccb.lun);
        let mut waiting = false;
        if let Some(lcb) = self.targets[target as usize].lun_mut(lun) {
            if lcb.started_max < lcb.started_limit {
                lcb.num_sgood += 1;
                if lcb.num_sgood >= QUEUE_DEPTH_RECOVERY {
                    lcb.num_sgood = 0;
                    lcb.started_max += 1;
                }
            }

            waiting = !lcb.waiting.is_empty();
        }

        self.deliver(cp);
        if waiting {
            self.start_next_ccbs(target, lun, 2);
        }
    }

    /// complete_error completes a job that ended badly,
    /// as SCRIPTS reports with the COMPLETE_ERROR
    /// interrupt, or after a bad status or bus error.
    ///
    /// Jobs for the same logical unit still in the start
    /// queue are taken out and requeued behind it, so
    /// the device sees them after the error has been
    /// dealt with.
    ///
    pub(crate) fn complete_error(&mut self, cp: CcbIndex) {
        if self.ccbs[cp].cmd.is_none() {
            return;
        }

        let xerr = self.ccbs[cp].xerr_status;
        if !xerr.is_empty() {
            if self.config.verbose > 0 {
                self.log_xerr(cp, xerr);
            }

            let ccb = &mut self.ccbs[cp];
            if ccb.host_status == HostStatus::Complete {
                ccb.host_status = HostStatus::CompErr;
            }
        }

        let mut resid = self.compute_residual(cp);
        if !self.config.residual {
            resid = 0;
            self.ccbs[cp].sv_resid = 0;
        }

        let (target, lun) = (self.ccbs[cp].target, self.ccbs[cp].lun);
        let start = self.squeue_position();
        let dequeued = self.dequeue_from_squeue(start, Some(target), Some(lun));
        self.jump(Label::Start);

        let ccb = &self.ccbs[cp];
        let queue_full = ccb.host_status == HostStatus::Complete && ccb.ssss_status == StatusCode::TaskSetFull.as_u8();
        let on_bus = self.targets[target as usize]
            .lun(lun)
            .and_then(|lcb| (lcb.started_tags as usize).checked_sub(dequeued))
            .unwrap_or(0);

        if queue_full && on_bus >= 2 {
            // Lower the queue depth to what the device
            // had when it filled up, and try again.
            let verbose = self.config.verbose;
            if let Some(lcb) = self.targets[target as usize].lun_mut(lun) {
                lcb.started_max = (on_bus - 1) as u16;
                lcb.num_sgood = 0;
                if verbose >= 2 {
                    info!(
                        "{}:{}:{}: queue depth is now {}",
                        self.config.name, target, lun, lcb.started_max
                    );
                }
            }

            let ccb = &mut self.ccbs[cp];
            ccb.host_status = HostStatus::Busy;
            ccb.ssss_status = 0xff;
            ccb.cam_status = Some(HostByte::SoftError);
        } else {
            self.set_cam_result_error(cp, resid);
        }

        self.ccbs.busy.retain(|&i| i != cp);
        self.ccbs.comp.retain(|&i| i != cp);
        self.ccbs.comp.push_front(cp);
        self.flush_comp_queue(None);

        // Only one command goes after an error.
        self.start_next_ccbs(target, lun, 1);
    }

    // set_cam_result_error builds the result of a job
    // that did not complete cleanly.
    fn set_cam_result_error(&mut self, cp: CcbIndex, resid: i32) {
        let verbose = self.config.verbose;
        let ccb = &self.ccbs[cp];
        let target = ccb.target;
        let mut status = ccb.ssss_status;
        let mut resid = resid;
        let mut sense = None;
        let mut sense_failed = false;

        let host = if ccb.host_flags.contains(HostFlags::SENSE) {
            // The job was our REQUEST SENSE. Report the
            // original command's status with the sense
            // data.
            status = ccb.sv_scsi_status;
            resid = ccb.sv_resid;
            let sv_xerr = ccb.sv_xerr_status;
            if ccb.host_status == HostStatus::Complete
                && ccb.ssss_status == StatusCode::Good.as_u8()
                && ccb.xerr_status.is_empty()
            {
                sense = Some(ccb.sns_bbuf.to_vec());
                if verbose > 0 && !sv_xerr.is_empty() {
                    self.log_xerr(cp, sv_xerr);
                }

                xerr_cam_status(HostByte::Ok, sv_xerr)
            } else {
                sense_failed = true;
                HostByte::Error
            }
        } else {
            match ccb.host_status {
                HostStatus::Complete => HostByte::Ok,
                HostStatus::SelTimeout => HostByte::NoConnect,
                HostStatus::Unexpected => HostByte::Error,
                _ => {
                    debug!(
                        "{}:{}:{}: command failed: host status {:?}, xerr {:?}",
                        self.config.name, target, ccb.lun, ccb.host_status, ccb.xerr_status
                    );
                    xerr_cam_status(HostByte::Error, ccb.xerr_status)
                }
            }
        };

        // A failed REQUEST SENSE leaves the device with a
        // contingent allegiance condition that only a
        // reset clears.
        if sense_failed {
            warn!("{}:{}: REQUEST SENSE failed, resetting target", self.config.name, target);
            if let Err(err) = self.reset_target(target) {
                warn!("{}:{}: cannot reset target: {}", self.config.name, target, err);
            }
        }

        self.ccbs[cp].result = Some(CommandResult {
            host,
            status,
            resid,
            sense,
        });
    }

    fn log_xerr(&self, cp: CcbIndex, xerr: XerrStatus) {
        let ccb = &self.ccbs[cp];
        let name = self.config.name;
        if xerr.contains(XerrStatus::PARITY) {
            warn!("{}:{}:{}: unrecovered SCSI parity error", name, ccb.target, ccb.lun);
        }

        if xerr.contains(XerrStatus::EXTRA_DATA) {
            warn!("{}:{}:{}: extraneous data discarded", name, ccb.target, ccb.lun);
        }

        if xerr.contains(XerrStatus::BAD_PHASE) {
            warn!("{}:{}:{}: illegal SCSI phase", name, ccb.target, ccb.lun);
        }

        if xerr.contains(XerrStatus::SODL_UNRUN) {
            warn!("{}:{}:{}: odd transfer in data out phase", name, ccb.target, ccb.lun);
        }

        if xerr.contains(XerrStatus::SWIDE_OVRUN) {
            warn!("{}:{}:{}: odd transfer in data in phase", name, ccb.target, ccb.lun);
        }
    }

    /// flush_comp_queue completes every CCB on the
    /// completion queue. With a `status`, each one
    /// completes with that host byte. Otherwise, those
    /// marked for a soft error go back to their logical
    /// unit's waiting queue and the rest complete with
    /// the result already built.
    ///
    pub(crate) fn flush_comp_queue(&mut self, status: Option<HostByte>) {
        while let Some(cp) = self.ccbs.comp.pop_front() {
            self.ccbs.busy.push_back(cp);
            let ccb = &mut self.ccbs[cp];

            // Waiting CCBs stay where they are.
            if ccb.host_status == HostStatus::Wait || ccb.cmd.is_none() {
                continue;
            }

            match status {
                Some(status) => ccb.cam_status = Some(status),
                None if ccb.cam_status == Some(HostByte::SoftError) => {
                    self.requeue(cp);
                    continue;
                }
                None => {}
            }

            self.deliver(cp);
        }
    }

    /// flush_busy_queue completes every busy CCB with
    /// `status`, apart from those still waiting to be
    /// started.
    ///
    pub(crate) fn flush_busy_queue(&mut self, status: Option<HostByte>) {
        while let Some(cp) = self.ccbs.busy.pop_front() {
            self.ccbs.comp.push_back(cp);
        }

        self.flush_comp_queue(status);
    }

    // requeue puts a CCB back at the tail of its logical
    // unit's waiting queue, to be started again.
    fn requeue(&mut self, cp: CcbIndex) {
        let ccb = &mut self.ccbs[cp];
        if let Some(lcb) = self.targets[ccb.target as usize].lun_mut(ccb.lun) {
            lcb.started.retain(|&i| i != cp);
            lcb.waiting.retain(|&i| i != cp);
            lcb.waiting.push_back(cp);
            if ccb.started {
                match ccb.tag {
                    Some(_) => lcb.started_tags = lcb.started_tags.saturating_sub(1),
                    None => lcb.started_no_tag = lcb.started_no_tag.saturating_sub(1),
                }
            }
        }

        debug!("{}:{}:{}: requeue ccb {:#x}", self.config.name, ccb.target, ccb.lun, ccb.ba);
        ccb.started = false;
        ccb.host_status = HostStatus::Wait;
        ccb.cam_status = None;
        ccb.result = None;
    }

    // deliver frees a CCB and records its command's
    // completion, to be passed up once the lock is
    // released.
    pub(crate) fn deliver(&mut self, cp: CcbIndex) {
        let ccb = &mut self.ccbs[cp];
        let cmd = match ccb.cmd.take() {
            Some(cmd) => cmd,
            None => {
                self.free_ccb(cp);
                return;
            }
        };

        let mut result = ccb.result.take().unwrap_or(CommandResult {
            host: HostByte::Error,
            status: 0,
            resid: ccb.data_len as i32,
            sense: None,
        });

        if let Some(host) = ccb.cam_status.take() {
            result.host = host;
        }

        self.free_ccb(cp);
        self.finished.push(Completion { id: cmd.id, result });
    }
}
