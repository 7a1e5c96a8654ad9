// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Handles the interrupts SCRIPTS raises itself, with an
//! INT instruction, when it needs the host's help.

use crate::ccb::{phys, CcbIndex, HostFlags, HostStatus, SgEntry, XerrStatus};
use crate::hcb::Hcb;
use crate::regs::{Register, Registers};
use crate::scripts::{Label, Sir};
use log::{debug, trace, warn};
use scsi::message::{self, extended};
use scsi::{CommandDescriptorBlock, RequestSense, StatusCode};

// The highest SCSI level that expects the logical unit
// in the CDB.
const SCSI_2: u8 = 2;

// How SCRIPTS continues after an interrupt.
enum Resume {
    // Continue after the INT instruction.
    Continue,

    // Send MESSAGE REJECT.
    Reject,

    // Clear ACK and dispatch on the next phase.
    Clrack,

    // The handler has already restarted SCRIPTS,
    // or it cannot be restarted.
    Done,
}

impl<R: Registers> Hcb<R> {
    /// int_sir handles a SCRIPTS interrupt.
    ///
    pub(crate) fn int_sir(&mut self) {
        let num = self.regs.read8(Register::DSPS);
        let dsa = self.regs.read32(Register::DSA);
        let cp = self.ccbs.from_dsa(dsa).filter(|&cp| self.ccbs[cp].cmd.is_some());
        let target = self.sdid();

        let sir = match Sir::from_u8(num) {
            Some(sir) => sir,
            None => {
                warn!("{}: unknown SCRIPTS interrupt {}", self.config.name, num);
                self.resume();
                return;
            }
        };

        trace!("{}: SCRIPTS interrupt {:?}", self.config.name, sir);
        let resume = match sir {
            Sir::ScriptStopped | Sir::TargetSelected | Sir::AbortSent => {
                self.task_recovery(sir);
                Resume::Done
            }
            Sir::SelAtnNoMsgOut => {
                warn!("{}:{}: no MSG OUT phase after selection with ATN", self.config.name, target);
                Resume::Done
            }
            Sir::ReselNoMsgIn => {
                warn!("{}:{}: no MSG IN phase after reselection", self.config.name, target);
                Resume::Done
            }
            Sir::ReselNoIdentify => {
                warn!("{}:{}: no IDENTIFY after reselection", self.config.name, target);
                Resume::Done
            }
            Sir::ReselBadLun => {
                self.msgout[0] = message::BUS_DEVICE_RESET;
                Resume::Continue
            }
            Sir::ReselBadItl => {
                self.msgout[0] = message::ABORT;
                Resume::Continue
            }
            Sir::ReselBadItlq => {
                self.msgout[0] = message::ABORT_TAG;
                Resume::Continue
            }
            Sir::ReselAborted => {
                self.lastmsg = self.msgout[0];
                self.msgout[0] = message::NOOP;
                warn!(
                    "{}:{}: message {:#x} sent on bad reselection",
                    self.config.name, target, self.lastmsg
                );
                Resume::Continue
            }
            Sir::MsgOutDone => {
                self.lastmsg = self.msgout[0];
                self.msgout[0] = message::NOOP;

                // The target has been told about the parity
                // error, so it no longer counts.
                if self.lastmsg == message::PARITY_ERROR || self.lastmsg == message::INITIATOR_DETECTED_ERROR {
                    if let Some(cp) = cp {
                        let ccb = &mut self.ccbs[cp];
                        ccb.xerr_status.remove(XerrStatus::PARITY);
                        if ccb.xerr_status.is_empty() {
                            self.regs.clear_bits8(Register::HF_PRT, HostFlags::EXT_ERR.bits());
                        }
                    }
                }

                Resume::Continue
            }
            Sir::CompleteError => {
                if let Some(cp) = cp {
                    self.complete_error(cp);
                }

                Resume::Done
            }
            Sir::BadScsiStatus => match cp {
                Some(cp) => {
                    self.bad_scsi_status(cp);
                    Resume::Done
                }
                None => Resume::Continue,
            },
            Sir::RejectToSend => {
                warn!(
                    "{}:{}: sending MESSAGE REJECT for {:x?}",
                    self.config.name, target, self.msgin
                );
                self.msgout[0] = message::REJECT;
                Resume::Continue
            }
            Sir::SwideOverrun => {
                self.extended_error(cp, XerrStatus::SWIDE_OVRUN);
                Resume::Continue
            }
            Sir::SodlUnderrun => {
                self.extended_error(cp, XerrStatus::SODL_UNRUN);
                Resume::Continue
            }
            Sir::DataOverrun => {
                if let Some(cp) = cp {
                    let extra = self.regs.read32(Register::SCRATCHA) as i32;
                    self.ccbs[cp].extra_bytes += extra;
                }

                self.extended_error(cp, XerrStatus::EXTRA_DATA);
                Resume::Continue
            }
            Sir::BadPhase => {
                self.extended_error(cp, XerrStatus::BAD_PHASE);
                Resume::Continue
            }
            Sir::MsgReceived => match cp {
                Some(cp) => self.message_received(cp),
                None => Resume::Done,
            },
            Sir::MsgWeird => {
                warn!("{}:{}: weird message received: {:x?}", self.config.name, target, self.msgin);
                self.jump(Label::MsgWeird);
                Resume::Done
            }
            Sir::NegoFailed | Sir::NegoProto => {
                if sir == Sir::NegoFailed {
                    self.regs.write8(Register::HS_PRT, HostStatus::Busy as u8);
                }

                if let Some(cp) = cp {
                    self.nego_default(cp);
                }

                Resume::Continue
            }
        };

        match resume {
            Resume::Continue => self.resume(),
            Resume::Reject => self.jump(Label::MsgBad),
            Resume::Clrack => self.jump(Label::Clrack),
            Resume::Done => {}
        }
    }

    // extended_error records an error SCRIPTS noticed
    // while moving data.
    fn extended_error(&mut self, cp: Option<CcbIndex>, xerr: XerrStatus) {
        if let Some(cp) = cp {
            self.regs.set_bits8(Register::HF_PRT, HostFlags::EXT_ERR.bits());
            self.ccbs[cp].xerr_status |= xerr;
        }
    }

    // message_received handles a message SCRIPTS
    // could not deal with itself.
    fn message_received(&mut self, cp: CcbIndex) -> Resume {
        match self.msgin[0] {
            message::EXTENDED => match self.msgin[2] {
                extended::MODIFY_DP => {
                    let ofs = i32::from_be_bytes([self.msgin[3], self.msgin[4], self.msgin[5], self.msgin[6]]);
                    debug!("{}: MODIFY DATA POINTER by {}", self.config.name, ofs);
                    self.modify_dp(cp, ofs);
                    Resume::Done
                }
                extended::SDTR => {
                    self.sync_nego(cp);
                    Resume::Done
                }
                extended::PPR => {
                    self.ppr_nego(cp);
                    Resume::Done
                }
                extended::WDTR => {
                    self.wide_nego(cp);
                    Resume::Done
                }
                _ => Resume::Reject,
            },
            message::IGNORE_WIDE_RESIDUE => {
                if self.ccbs[cp].host_flags.contains(HostFlags::SENSE) {
                    Resume::Clrack
                } else {
                    self.modify_dp(cp, -1);
                    Resume::Done
                }
            }
            message::REJECT => {
                if self.regs.read8(Register::HS_PRT) == HostStatus::Negotiate as u8 {
                    self.nego_rejected(cp);
                } else {
                    let ccb = &self.ccbs[cp];
                    warn!(
                        "{}:{}:{}: MESSAGE REJECT received ({:#x}:{:#x})",
                        self.config.name, ccb.target, ccb.lun, self.lastmsg, self.msgout[0]
                    );
                }

                Resume::Clrack
            }
            _ => Resume::Reject,
        }
    }

    /// bad_scsi_status handles a job that ended with a
    /// status other than GOOD. After CHECK CONDITION, the
    /// CCB is turned into a REQUEST SENSE and started
    /// again, so the sense data can be returned with the
    /// original command.
    ///
    pub(crate) fn bad_scsi_status(&mut self, cp: CcbIndex) {
        let start = self.squeue_position();
        self.last_cp = None;

        let ccb = &self.ccbs[cp];
        let status = ccb.ssss_status;
        let sense_pending = status == StatusCode::CheckCondition.as_u8() || status == StatusCode::CommandTerminated.as_u8();
        if !sense_pending || ccb.host_flags.contains(HostFlags::SENSE) {
            if self.config.verbose >= 2 && status != StatusCode::CheckCondition.as_u8() {
                debug!(
                    "{}:{}:{}: SCSI status {:#04x}",
                    self.config.name, ccb.target, ccb.lun, status
                );
            }

            self.complete_error(cp);
            return;
        }

        let (target, lun) = (ccb.target, ccb.lun);
        self.dequeue_from_squeue(start, Some(target), Some(lun));
        self.jump(Label::Start);

        // Keep the results of the original command.
        let resid = self.compute_residual(cp);
        let ccb = &mut self.ccbs[cp];
        ccb.sv_scsi_status = ccb.ssss_status;
        ccb.sv_xerr_status = ccb.xerr_status;
        ccb.sv_resid = resid;

        // The device may want to report a UNIT ATTENTION
        // caused by something we missed, such as a reset,
        // so renegotiate anything but async narrow.
        let mut msg = [0u8; 16];
        msg[0] = message::identify(false, lun);
        ccb.nego_status = None;
        let (len, nego) = self.prepare_nego(target, &mut msg[1..]);
        let msglen = 1 + len;
        if nego.is_some() {
            self.targets[target as usize].nego_cp = Some(cp);
        }

        let legacy_lun = match &self.ccbs[cp].cmd {
            Some(cmd) if cmd.scsi_level <= SCSI_2 => Some(lun),
            _ => None,
        };

        let sdata_in = self.layout.address(Label::SdataIn);
        let select = self.layout.address(Label::Select);
        let ccb = &mut self.ccbs[cp];
        ccb.nego_status = nego;
        ccb.scsi_smsg2 = msg;
        ccb.phys.smsg = SgEntry {
            size: msglen as u32,
            addr: ccb.buffer_address(phys::SMSG2_BUF),
        };

        let request = RequestSense::new(legacy_lun, crate::SENSE_BUFFER_LEN as u8);
        ccb.sensecmd = [0; 6];
        request.serialise(&mut ccb.sensecmd);
        ccb.phys.cmd = SgEntry {
            size: request.len() as u32,
            addr: ccb.buffer_address(phys::SENSECMD_BUF),
        };

        ccb.data_len = crate::SENSE_BUFFER_LEN as u32;
        ccb.sns_bbuf = [0; crate::SENSE_BUFFER_LEN];
        ccb.phys.sense = SgEntry {
            size: crate::SENSE_BUFFER_LEN as u32,
            addr: ccb.buffer_address(phys::SNS_BUF),
        };

        ccb.phys.savep = sdata_in;
        ccb.phys.lastp = sdata_in;
        ccb.startp = sdata_in;
        ccb.goalp = sdata_in + 16;
        ccb.ext_sg = -1;
        ccb.ext_ofs = 0;

        ccb.host_status = if nego.is_some() {
            HostStatus::Negotiate
        } else {
            HostStatus::Busy
        };
        ccb.ssss_status = 0xff;
        ccb.host_flags = HostFlags::SENSE | HostFlags::DATA_IN;
        ccb.xerr_status = XerrStatus::empty();
        ccb.extra_bytes = 0;
        ccb.phys.go_start = select;

        debug!("{}:{}:{}: requesting sense data", self.config.name, target, lun);
        self.put_start_queue(cp);

        // Hand back whatever was dequeued.
        self.flush_comp_queue(None);
    }
}
