// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Decodes chip interrupts and dispatches them to their
//! handlers.

use crate::ccb::{HostFlags, HostStatus, XerrStatus};
use crate::hcb::Hcb;
use crate::recovery::StartReason;
use crate::regs::{BusMode, Dstat, Istat, Register, Registers, Scntl1, Sist};
use crate::scripts::{Label, Phase, Segment};
use log::{error, info, trace, warn};
use scsi::message;

// SIST bits that never occur in normal operation.
const SIST_UNUSUAL: Sist = Sist::from_bits_truncate(
    Sist::STO.bits() | Sist::GEN.bits() | Sist::HTH.bits() | Sist::SGE.bits() | Sist::UDC.bits() | Sist::SBMC.bits() | Sist::RST.bits(),
);

// SIST bits we cannot recover from cleanly.
const SIST_FATAL: Sist = Sist::from_bits_truncate(Sist::GEN.bits() | Sist::HTH.bits() | Sist::SGE.bits());

// DSTAT bits we cannot recover from cleanly.
const DSTAT_FATAL: Dstat =
    Dstat::from_bits_truncate(Dstat::MDPE.bits() | Dstat::BF.bits() | Dstat::ABRT.bits() | Dstat::IID.bits());

// The SBCL bit showing ATN asserted.
const SBCL_ATN: u8 = 0x08;

/// The condition behind an interrupt, in the order
/// they are dealt with.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Cause {
    Parity,
    PhaseMismatch,
    ScriptsInterrupt,
    SingleStep,
    BusReset,
    BusModeChange,
    SelectionTimeout,
    UnexpectedDisconnect,
    Fatal,
    Unknown,
}

impl Cause {
    // Returns whether the FIFOs must be cleared before
    // the cause is handled.
    fn clears_fifos(self) -> bool {
        matches!(
            self,
            Cause::BusModeChange | Cause::SelectionTimeout | Cause::UnexpectedDisconnect | Cause::Fatal
        )
    }
}

/// classify decides what to do about the SCSI and DMA
/// interrupt conditions gathered from the chip.
///
pub(crate) fn classify(sist: Sist, dstat: Dstat) -> Cause {
    // First, the interrupts serviced in normal
    // operation.
    if !sist.intersects(SIST_UNUSUAL) && !dstat.intersects(DSTAT_FATAL) {
        return if sist.contains(Sist::PAR) {
            Cause::Parity
        } else if sist.contains(Sist::MA) {
            Cause::PhaseMismatch
        } else if dstat.contains(Dstat::SIR) {
            Cause::ScriptsInterrupt
        } else if dstat.contains(Dstat::SSI) {
            Cause::SingleStep
        } else {
            Cause::Unknown
        };
    }

    if sist.contains(Sist::RST) {
        return Cause::BusReset;
    }

    if !sist.intersects(SIST_FATAL) && !dstat.intersects(DSTAT_FATAL) {
        return if sist.contains(Sist::SBMC) {
            Cause::BusModeChange
        } else if sist.contains(Sist::STO) {
            Cause::SelectionTimeout
        } else if sist.contains(Sist::UDC) {
            Cause::UnexpectedDisconnect
        } else {
            Cause::Unknown
        };
    }

    Cause::Fatal
}

impl<R: Registers> Hcb<R> {
    /// interrupt services the chip's interrupts. It
    /// returns false if the chip had nothing to report,
    /// or has gone away.
    ///
    pub(crate) fn interrupt(&mut self) -> bool {
        let mut istat = Istat::from_bits_truncate(self.regs.read8(Register::ISTAT));
        let mut handled = false;
        if istat.contains(Istat::INTF) {
            let ack = (istat & Istat::SIGP) | Istat::INTF | self.istat_sem;
            self.regs.write8(Register::ISTAT, ack.bits());
            istat |= Istat::from_bits_truncate(self.regs.read8(Register::ISTAT));
            self.wakeup_done();
            handled = true;
        }

        if !istat.intersects(Istat::SIP | Istat::DIP) {
            return handled;
        }

        // Gather the stacked conditions.
        let mut sist = Sist::empty();
        let mut dstat = Dstat::empty();
        loop {
            if istat.contains(Istat::SIP) {
                sist |= Sist::from_bits_truncate(self.regs.read16(Register::SIST));
            }

            if istat.contains(Istat::DIP) {
                dstat |= Dstat::from_bits_truncate(self.regs.read8(Register::DSTAT));
            }

            let istatc = Istat::from_bits_truncate(self.regs.read8(Register::ISTAT));
            istat |= istatc;

            // A vanished chip reads as all ones forever.
            if sist.is_all() && dstat.is_all() && self.regs.channel_offline() {
                warn!("{}: channel offline", self.config.name);
                return false;
            }

            if !istatc.intersects(Istat::SIP | Istat::DIP) {
                break;
            }
        }

        let cause = classify(sist, dstat);
        trace!(
            "{}: interrupt {:?}: istat {:#04x} sist {:#06x} dstat {:#04x}",
            self.config.name,
            cause,
            istat.bits(),
            sist.bits(),
            dstat.bits()
        );

        if cause.clears_fifos() {
            self.clear_fifos();
        }

        match cause {
            Cause::Parity => self.int_par(sist),
            Cause::PhaseMismatch => self.int_ma(),
            Cause::ScriptsInterrupt => self.int_sir(),
            Cause::SingleStep => self.resume(),
            Cause::BusReset => {
                info!("{}: SCSI bus reset detected", self.config.name);
                self.start_up(StartReason::BusReset);
            }
            Cause::BusModeChange => self.int_sbmc(),
            Cause::SelectionTimeout => self.int_sto(),
            Cause::UnexpectedDisconnect => self.int_udc(),
            Cause::Fatal => {
                self.log_hard_error(sist, dstat);
                self.start_reset();
            }
            Cause::Unknown => warn!(
                "{}: unknown interrupt(s) ignored: ISTAT={:#x} DSTAT={:#x} SIST={:#x}",
                self.config.name,
                istat.bits(),
                dstat.bits(),
                sist.bits()
            ),
        }

        true
    }

    // log_hard_error reports an interrupt we cannot
    // recover from, with where SCRIPTS was.
    fn log_hard_error(&mut self, sist: Sist, dstat: Dstat) {
        let dsp = self.regs.read32(Register::DSP);
        let dbc = self.regs.read32(Register::DBC);
        let dsa = self.regs.read32(Register::DSA);
        let target = self.sdid();
        let (script, ofs) = match self.layout.locate(dsp) {
            Some((Segment::A, ofs)) => ("scripta", ofs + 8),
            Some((Segment::B, ofs)) => ("scriptb", ofs + 8),
            None => ("mem", dsp),
        };

        let insn = self.image.interrupted(&self.layout, dsp).map(|insn| insn.word0).unwrap_or(0);
        let socl = self.regs.read8(Register::SOCL);
        let sbcl = self.regs.read8(Register::SBCL);
        let sbdl = self.regs.read16(Register::SBDL);
        let sxfer = self.regs.read8(Register::SXFER);
        let scntl3 = self.regs.read8(Register::SCNTL3);
        error!(
            "{}:{}: ERROR ({:x}:{:x}) ({:x}-{:x}-{:x}) ({:x}/{:x}) @ ({} {:x}:{:08x})",
            self.config.name,
            target,
            dstat.bits(),
            sist.bits(),
            socl,
            sbcl,
            sbdl,
            sxfer,
            scntl3,
            script,
            ofs,
            insn
        );
        error!("{}: DBC={:#010x} DSA={:#010x}", self.config.name, dbc, dsa);
    }

    // int_par handles a SCSI parity error. Errors on
    // input are reported to the target with
    // INITIATOR DETECTED ERROR, or MESSAGE PARITY ERROR
    // in MSG IN phase, as long as the nexus is known
    // and ATN is already asserted.
    fn int_par(&mut self, sist: Sist) {
        let hsts = self.regs.read8(Register::HS_PRT);
        let dsp = self.regs.read32(Register::DSP);
        let dbc = self.regs.read32(Register::DBC);
        let dsa = self.regs.read32(Register::DSA);
        let sbcl = self.regs.read8(Register::SBCL);
        let cmd = (dbc >> 24) as u8;
        let phase = Phase::from_bits(cmd);
        let cp = self.ccbs.from_dsa(dsa).filter(|&cp| self.ccbs[cp].cmd.is_some());

        warn!(
            "{}: SCSI parity error detected: SCR1={} DBC={:x} SBCL={:x}",
            self.config.name, hsts, dbc, sbcl
        );

        let scntl1 = Scntl1::from_bits_truncate(self.regs.read8(Register::SCNTL1));
        if !scntl1.contains(Scntl1::ISCON) {
            self.recover_scsi_int(HostStatus::Unexpected);
            return;
        }

        let cp = match cp {
            Some(cp) => cp,
            None => {
                self.start_reset();
                return;
            }
        };

        // Only an input MOVE with ATN asserted can be
        // recovered.
        if cmd & 0xc0 != 0 || !phase.is_input() || sbcl & SBCL_ATN == 0 {
            self.start_reset();
            return;
        }

        self.regs.set_bits8(Register::HF_PRT, HostFlags::EXT_ERR.bits());
        self.ccbs[cp].xerr_status |= XerrStatus::PARITY;
        self.msgout[0] = if phase == Phase::MsgIn {
            message::PARITY_ERROR
        } else {
            message::INITIATOR_DETECTED_ERROR
        };

        match phase {
            Phase::DataIn | Phase::DtDataIn => {
                if dsp == self.layout.address(Label::PmHandle) {
                    // SCRIPTS is handling the mismatch
                    // itself.
                    self.regs.write32(Register::DSP, dsp);
                } else if sist.contains(Sist::MA) {
                    self.int_ma();
                } else {
                    self.set_script_dp(cp, dsp);
                    self.jump(Label::Dispatch);
                }
            }

            // The reselection path anticipates messages,
            // so a bad one cannot be retried.
            Phase::MsgIn => self.start_reset(),
            _ => self.jump(Label::Dispatch),
        }
    }

    // int_sto handles a selection timeout. Only a
    // timeout while waiting for the selection to
    // complete is expected.
    fn int_sto(&mut self) {
        let dsp = self.regs.read32(Register::DSP);
        if dsp == self.layout.address(Label::WfSelDone) + 8 {
            self.recover_scsi_int(HostStatus::SelTimeout);
        } else {
            self.start_reset();
        }
    }

    fn int_udc(&mut self) {
        warn!("{}: unexpected disconnect", self.config.name);
        self.recover_scsi_int(HostStatus::Unexpected);
    }

    // int_sbmc handles a change in the bus's electrical
    // mode, which needs everything restarted.
    fn int_sbmc(&mut self) {
        let mode = BusMode::from_stest4(self.regs.read8(Register::STEST4));
        warn!(
            "{}: SCSI bus mode change from {} to {}",
            self.config.name,
            self.scsi_mode.name(),
            mode.name()
        );

        self.scsi_mode = mode;
        self.start_up(StartReason::BusModeChange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Dcntl;
    use crate::testing::{test_command, test_hcb};
    use scsi::HostByte;

    #[test]
    fn classification() {
        assert_eq!(classify(Sist::PAR | Sist::MA, Dstat::empty()), Cause::Parity);
        assert_eq!(classify(Sist::MA, Dstat::SIR), Cause::PhaseMismatch);
        assert_eq!(classify(Sist::empty(), Dstat::SIR), Cause::ScriptsInterrupt);
        assert_eq!(classify(Sist::empty(), Dstat::SSI), Cause::SingleStep);
        assert_eq!(classify(Sist::CMP, Dstat::empty()), Cause::Unknown);
        assert_eq!(classify(Sist::RST | Sist::GEN, Dstat::IID), Cause::BusReset);
        assert_eq!(classify(Sist::SBMC | Sist::STO, Dstat::empty()), Cause::BusModeChange);
        assert_eq!(classify(Sist::STO | Sist::UDC | Sist::PAR, Dstat::empty()), Cause::SelectionTimeout);
        assert_eq!(classify(Sist::UDC, Dstat::SIR), Cause::UnexpectedDisconnect);
        assert_eq!(classify(Sist::STO | Sist::HTH, Dstat::empty()), Cause::Fatal);
        assert_eq!(classify(Sist::MA, Dstat::BF), Cause::Fatal);
    }

    #[test]
    fn done_queue_interrupt() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        let ccb = &mut hcb.ccbs[cp];
        ccb.host_status = HostStatus::Complete;
        ccb.ssss_status = 0;
        ccb.phys.lastp = ccb.goalp;
        hcb.dqueue.post(0, hcb.ccbs[cp].ba);

        // A garbage DSA is skipped.
        hcb.dqueue.post(1, 0x1234_5678);
        hcb.regs.poke8(Register::ISTAT, Istat::INTF.bits());

        assert!(hcb.interrupt());
        assert_eq!(hcb.finished.len(), 1);
        assert_eq!(hcb.finished[0].result.host, HostByte::Ok);
        assert_eq!(hcb.regs.read8(Register::ISTAT) & Istat::INTF.bits(), 0);

        // Nothing pending.
        assert!(!hcb.interrupt());
    }

    #[test]
    fn stacked_conditions() {
        let mut hcb = test_hcb();
        hcb.regs.raise(Sist::empty(), Dstat::SSI);
        hcb.regs.raise(Sist::CMP, Dstat::empty());
        assert!(hcb.interrupt());
        assert!(hcb.regs.pending().is_empty());

        // Single stepping just continues.
        assert_eq!(hcb.regs.last_write(Register::DCNTL), Some((hcb.rv_dcntl | Dcntl::STD.bits()) as u32));
    }

    #[test]
    fn offline_channel() {
        let mut hcb = test_hcb();
        hcb.regs.set_offline();
        assert!(!hcb.interrupt());
        assert!(!hcb.regs.was_reset());
    }

    #[test]
    fn selection_timeout() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(5, 0, None)).unwrap();
        hcb.regs.write32(Register::DSA, hcb.ccbs[cp].ba);
        let dsp = hcb.layout.address(Label::WfSelDone) + 8;
        hcb.regs.write32(Register::DSP, dsp);
        hcb.regs.raise(Sist::STO, Dstat::empty());
        assert!(hcb.interrupt());
        assert_eq!(hcb.ccbs[cp].host_status, HostStatus::SelTimeout);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::CompleteError));

        // SCRIPTS then reports the error.
        hcb.regs.write32(Register::DSPS, crate::scripts::Sir::CompleteError as u32);
        hcb.regs.raise(Sist::empty(), Dstat::SIR);
        assert!(hcb.interrupt());
        assert_eq!(hcb.finished[0].result.host, HostByte::NoConnect);
        assert!(!hcb.regs.was_reset());

        // A timeout anywhere else is a mystery.
        hcb.regs.raise(Sist::STO, Dstat::empty());
        assert!(hcb.interrupt());
        assert!(hcb.regs.was_reset());
    }

    #[test]
    fn bus_reset_interrupt() {
        let mut hcb = test_hcb();
        hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        hcb.regs.raise(Sist::RST, Dstat::empty());
        assert!(hcb.interrupt());
        assert!(hcb.bus_was_reset);
        assert_eq!(hcb.finished[0].result.host, HostByte::SoftError);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::Init));
    }

    #[test]
    fn fatal_errors_reset() {
        let mut hcb = test_hcb();
        hcb.regs.raise(Sist::empty(), Dstat::IID);
        assert!(hcb.interrupt());
        assert!(hcb.regs.was_reset());
    }

    #[test]
    fn parity_errors() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        hcb.regs.write32(Register::DSA, hcb.ccbs[cp].ba);
        hcb.regs.poke8(Register::SCNTL1, Scntl1::ISCON.bits());
        hcb.regs.poke8(Register::SBCL, SBCL_ATN);

        // Parity error in STATUS phase.
        hcb.regs.write32(Register::DBC, 0x0b00_0001);
        hcb.regs.raise(Sist::PAR, Dstat::empty());
        assert!(hcb.interrupt());
        assert_eq!(hcb.ccbs[cp].xerr_status, XerrStatus::PARITY);
        assert_eq!(hcb.msgout[0], message::INITIATOR_DETECTED_ERROR);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::Dispatch));

        // In DATA IN, without a phase mismatch, the
        // data pointer is kept.
        let dsp = hcb.layout.address(Label::DataIn) + 16;
        hcb.regs.write32(Register::DSP, dsp);
        hcb.regs.write32(Register::DBC, 0x1100_0200);
        hcb.regs.raise(Sist::PAR, Dstat::empty());
        assert!(hcb.interrupt());
        assert_eq!(hcb.ccbs[cp].phys.lastp, dsp);
        assert_eq!(hcb.regs.read32(Register::TEMP), dsp);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::Dispatch));
        assert!(!hcb.regs.was_reset());

        // Without ATN, the target cannot be told.
        hcb.regs.poke8(Register::SBCL, 0);
        hcb.regs.raise(Sist::PAR, Dstat::empty());
        assert!(hcb.interrupt());
        assert!(hcb.regs.was_reset());
    }
}
