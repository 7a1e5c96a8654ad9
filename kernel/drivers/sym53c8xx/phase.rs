// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Recovers from phase mismatches and keeps track of data
//! pointers.
//!
//! When a target changes phase in the middle of a data
//! MOVE, the chip stops with the byte count left in DBC. We
//! work out how much of the interrupted MOVE is left, save
//! the remainder in one of the CCB's two phase mismatch (PM)
//! contexts, and point the job's data pointer at the PM
//! context's MOVE, so the transfer picks up where it left
//! off once the target returns to the data phase.
//!
//! A data pointer is the SCRIPTS address of the next data
//! MOVE to run. The helpers at the bottom of this file
//! convert between data pointers and positions in the data
//! table, for the MODIFY DATA POINTER message and for
//! residual calculations.

use crate::ccb::{CcbIndex, HostFlags, HostStatus, Nego, PmContext, SgEntry, XerrStatus};
use crate::chip::FifoCounter;
use crate::hcb::Hcb;
use crate::regs::{Register, Registers, Scntl2, Scntl3, Sstat0, Sstat2};
use crate::scripts::{Label, Phase, INSTRUCTION_SIZE};
use log::{error, trace, warn};
use scsi::message;

// The DCMD bit for table-indirect MOVEs.
const DCMD_TABLE_INDIRECT: u8 = 0x10;

// The DCMD bit that distinguishes DT data phases
// from ST ones.
const DCMD_DT: u8 = 0x04;

impl<R: Registers> Hcb<R> {
    /// int_ma handles a phase mismatch.
    ///
    pub(crate) fn int_ma(&mut self) {
        let dsp = self.regs.read32(Register::DSP);
        let dbc = self.regs.read32(Register::DBC);
        let dsa = self.regs.read32(Register::DSA);

        let cmd = (dbc >> 24) as u8;
        let mut rest = dbc & 0xff_ffff;
        let phase = Phase::from_bits(cmd);

        let cp = self.ccbs.from_dsa(dsa).filter(|&cp| self.ccbs[cp].cmd.is_some());

        // Bytes already taken from memory but not yet
        // sent still count as untransferred.
        if phase != Phase::DataIn && phase != Phase::DtDataIn {
            let delta = match self.chip.fifo_counter() {
                FifoCounter::ByteCount => self.regs.read16(Register::DFBC) as u32,
                counter => {
                    let dfifo = self.regs.read32(Register::DFIFO);
                    counter.from_dfifo(dfifo, rest)
                }
            };

            rest += delta;
            let c10 = self.chip.is_c10();
            let ss0 = Sstat0::from_bits_truncate(self.regs.read8(Register::SSTAT0));
            if ss0.contains(Sstat0::OLF) {
                rest += 1;
            }

            if !c10 && ss0.contains(Sstat0::ORF) {
                rest += 1;
            }

            let wide = cp
                .map(|cp| self.ccbs[cp].phys.select.sel_scntl3 & Scntl3::EWS.bits() != 0)
                .unwrap_or(false);
            if wide {
                let ss2 = Sstat2::from_bits_truncate(self.regs.read8(Register::SSTAT2));
                if ss2.contains(Sstat2::OLF1) {
                    rest += 1;
                }

                if !c10 && ss2.contains(Sstat2::ORF1) {
                    rest += 1;
                }
            }

            self.clear_fifos();
        }

        trace!(
            "{}: phase mismatch: dsp={:#x} dbc={:#x} rest={} phase={:?}",
            self.config.name,
            dsp,
            dbc,
            rest,
            phase
        );

        let insn = match self.image.interrupted(&self.layout, dsp) {
            Some(insn) => insn,
            None => {
                error!("{}: phase mismatch outside SCRIPTS at {:#x}", self.config.name, dsp);
                self.start_reset();
                return;
            }
        };

        let cp = match cp {
            Some(cp) => cp,
            None => {
                error!("{}: phase mismatch with no job (DSA {:#x})", self.config.name, dsa);
                self.start_reset();
                return;
            }
        };

        // Work out the address and length the MOVE
        // started with.
        let (oadr, olen) = if cmd & DCMD_TABLE_INDIRECT != 0 {
            match self.ccbs[cp].phys.table(insn.word1) {
                Some(entry) => (entry.addr, entry.size & 0xff_ffff),
                None => {
                    error!("{}: bad table offset {:#x} at {:#x}", self.config.name, insn.word1, dsp);
                    self.start_reset();
                    return;
                }
            }
        } else {
            (insn.word1, insn.count())
        };

        let expected = if phase.is_data() { cmd & !DCMD_DT } else { cmd };

        if expected != insn.opcode() {
            error!(
                "{}: SCRIPTS command {:#04x} does not match DCMD {:#04x} at {:#x}",
                self.config.name,
                insn.opcode(),
                cmd,
                dsp
            );
            self.start_reset();
            return;
        }

        if !phase.is_data() {
            self.unexpected_phase(cp, phase, dsp, olen, rest);
            return;
        }

        // Choose the PM context to save the remainder in.
        // If the interrupted MOVE was itself a PM context,
        // the remainder returns to where that one would
        // have.
        let hflags0 = HostFlags::from_bits_truncate(self.regs.read8(Register::HF_PRT));
        let mut hflags = hflags0;
        let mut nxtdsp = dsp;
        if hflags.contains(HostFlags::IN_PM0) {
            nxtdsp = self.ccbs[cp].phys.pm0.ret;
        } else if hflags.contains(HostFlags::IN_PM1) {
            nxtdsp = self.ccbs[cp].phys.pm1.ret;
        }

        if hflags.contains(HostFlags::DP_SAVED) {
            hflags.toggle(HostFlags::ACT_PM);
        }

        let pm1 = hflags.contains(HostFlags::ACT_PM);
        let mut newcmd = if pm1 {
            self.layout.address(Label::Pm1Data)
        } else {
            self.layout.address(Label::Pm0Data)
        };

        hflags.remove(HostFlags::IN_PM0 | HostFlags::IN_PM1 | HostFlags::DP_SAVED);
        if hflags != hflags0 {
            self.regs.write8(Register::HF_PRT, hflags.bits());
        }

        let mut pm = PmContext {
            sg: SgEntry {
                size: rest,
                addr: oadr.wrapping_add(olen).wrapping_sub(rest),
            },
            ret: nxtdsp,
        };

        let mut nxtdsp = self.layout.address(Label::Dispatch);

        // On a wide input, a byte may be stuck in SWIDE.
        // It goes through the wide residue entry first,
        // and the PM context takes the rest.
        let wide = self.ccbs[cp].phys.select.sel_scntl3 & Scntl3::EWS.bits() != 0;
        if phase == Phase::DataIn && wide {
            let scntl2 = Scntl2::from_bits_truncate(self.regs.read8(Register::SCNTL2));
            if scntl2.contains(Scntl2::WSR) {
                let addr = pm.sg.addr;
                let size = pm.sg.size;
                trace!(
                    "{}: wide residue on phase mismatch: addr={:#x} size={}",
                    self.config.name,
                    addr,
                    size
                );

                self.ccbs[cp].phys.wresid = SgEntry {
                    size: (size & 0xff00_0000) | 1,
                    addr,
                };

                pm.sg.addr = addr.wrapping_add(1);
                pm.sg.size = size.wrapping_sub(1);
                if size & 0xff_ffff == 1 {
                    newcmd = pm.ret;
                }

                nxtdsp = self.layout.address(Label::WsrMaHelper);
            }
        }

        let ccb = &mut self.ccbs[cp];
        if pm1 {
            ccb.phys.pm1 = pm;
        } else {
            ccb.phys.pm0 = pm;
        }

        self.set_script_dp(cp, newcmd);
        self.regs.write32(Register::DSP, nxtdsp);
    }

    // unexpected_phase handles a target that changed
    // phase during a MOVE outside the data phases.
    fn unexpected_phase(&mut self, cp: CcbIndex, phase: Phase, dsp: u32, olen: u32, rest: u32) {
        let at = dsp.wrapping_sub(INSTRUCTION_SIZE);
        let next = match phase {
            Phase::Command | Phase::Status => Some(Label::Dispatch),
            Phase::MsgOut if at == self.layout.address(Label::SendIdent) => {
                // The target went to message out before
                // taking the tag. Send a plain IDENTIFY so
                // it can at least tell us why.
                let ccb = &mut self.ccbs[cp];
                if ccb.tag.is_some() && olen.wrapping_sub(rest) <= 3 {
                    ccb.host_status = HostStatus::Busy;
                    self.msgout[0] = message::identify(false, ccb.lun);
                    Some(Label::IdentBreakAtn)
                } else {
                    Some(Label::IdentBreak)
                }
            }
            Phase::MsgOut
                if at == self.layout.address(Label::SendWdtr) || at == self.layout.address(Label::SendSdtr) =>
            {
                Some(Label::NegoBadPhase)
            }
            Phase::MsgOut if at == self.layout.address(Label::SendPpr) => {
                let target = self.ccbs[cp].target;
                let tcb = &mut self.targets[target as usize];
                tcb.caps.ppr = false;
                if tcb.goal.renego == Some(Nego::Ppr) {
                    tcb.goal.renego = None;
                }

                warn!("{}:{}: PPR not supported, disabled", self.config.name, target);
                Some(Label::NegoBadPhase)
            }
            Phase::MsgIn => Some(Label::Clrack),
            _ => None,
        };

        match next {
            Some(label) => self.jump(label),
            None => {
                error!(
                    "{}: unexpected phase {:?} at {:#x} (olen={} rest={})",
                    self.config.name,
                    phase,
                    at,
                    olen,
                    rest
                );
                self.start_reset();
            }
        }
    }

    /// get_script_dp returns the job's current data
    /// pointer, which SCRIPTS keeps in TEMP.
    ///
    pub(crate) fn get_script_dp(&mut self) -> u32 {
        self.regs.read32(Register::TEMP)
    }

    /// set_script_dp sets the job's current data pointer.
    ///
    pub(crate) fn set_script_dp(&mut self, cp: CcbIndex, dp: u32) {
        self.ccbs[cp].phys.lastp = dp;
        self.regs.write32(Register::TEMP, dp);
    }

    /// evaluate_dp moves the data pointer `scr` by `ofs`
    /// bytes, returning the data table index and the
    /// offset (zero or negative) from the start of that
    /// entry. The furthest position reached is recorded
    /// for residual calculations.
    ///
    pub(crate) fn evaluate_dp(&mut self, cp: CcbIndex, scr: u32, ofs: i32) -> Option<(usize, i32)> {
        let max_sg = self.config.max_sg as i64;
        let pm0 = self.layout.address(Label::Pm0Data);
        let pm1 = self.layout.address(Label::Pm1Data);
        let ccb = &mut self.ccbs[cp];

        let mut dp_scr = scr;
        let mut dp_ofs = ofs as i64;
        let pm = if scr == pm0 {
            Some(ccb.phys.pm0)
        } else if scr == pm1 {
            Some(ccb.phys.pm1)
        } else {
            None
        };

        if let Some(pm) = pm {
            dp_scr = pm.ret;
            dp_ofs -= (pm.sg.size & 0xff_ffff) as i64;
        }

        if ccb.host_flags.contains(HostFlags::SENSE) {
            return Some((0, dp_ofs as i32));
        }

        let goalp = ccb.goalp as i64;
        let mut dp_sg = max_sg;
        if dp_scr as i64 != goalp {
            dp_sg -= (goalp - INSTRUCTION_SIZE as i64 - dp_scr as i64) / INSTRUCTION_SIZE as i64;
        }

        let dp_sgmin = max_sg - ccb.segments as i64;
        if dp_sg < dp_sgmin || dp_sg > max_sg {
            return None;
        }

        let size = |i: i64| (ccb.phys.data[i as usize].size & 0xff_ffff) as i64;
        if dp_ofs < 0 {
            while dp_sg > dp_sgmin {
                dp_sg -= 1;
                let n = dp_ofs + size(dp_sg);
                if n > 0 {
                    dp_sg += 1;
                    break;
                }

                dp_ofs = n;
            }
        } else if dp_ofs > 0 {
            while dp_sg < max_sg {
                dp_ofs -= size(dp_sg);
                dp_sg += 1;
                if dp_ofs <= 0 {
                    break;
                }
            }
        }

        if dp_sg < dp_sgmin || (dp_sg == dp_sgmin && dp_ofs < 0) {
            return None;
        }

        if dp_sg > max_sg || (dp_sg == max_sg && dp_ofs > 0) {
            return None;
        }

        let ext_sg = ccb.ext_sg as i64;
        if dp_sg > ext_sg || (dp_sg == ext_sg && dp_ofs > ccb.ext_ofs as i64) {
            ccb.ext_sg = dp_sg as i32;
            ccb.ext_ofs = dp_ofs as i32;
        }

        Some((dp_sg as usize, dp_ofs as i32))
    }

    /// modify_dp moves the job's data pointer by `ofs`
    /// bytes, as asked by a MODIFY DATA POINTER or
    /// IGNORE WIDE RESIDUE message, and resumes SCRIPTS.
    ///
    pub(crate) fn modify_dp(&mut self, cp: CcbIndex, ofs: i32) {
        if self.ccbs[cp].host_flags.contains(HostFlags::SENSE) {
            self.jump(Label::MsgBad);
            return;
        }

        let dp_scr = self.get_script_dp();
        let (dp_sg, dp_ofs) = match self.evaluate_dp(cp, dp_scr, ofs) {
            Some(dp) => dp,
            None => {
                self.jump(Label::MsgBad);
                return;
            }
        };

        let max_sg = self.config.max_sg;
        let dp_ret = self.ccbs[cp].goalp - INSTRUCTION_SIZE - (max_sg - dp_sg) as u32 * INSTRUCTION_SIZE;

        // A pointer at the start of an entry is just the
        // MOVE for that entry. Anything else needs a PM
        // context for the tail of the previous entry.
        let dp_scr = if dp_ofs == 0 {
            dp_ret
        } else {
            if dp_sg == 0 {
                self.jump(Label::MsgBad);
                return;
            }

            let mut hflags = HostFlags::from_bits_truncate(self.regs.read8(Register::HF_PRT));
            if hflags.contains(HostFlags::DP_SAVED) {
                hflags.toggle(HostFlags::ACT_PM);
            }

            hflags.remove(HostFlags::DP_SAVED);
            self.regs.write8(Register::HF_PRT, hflags.bits());

            let entry = self.ccbs[cp].phys.data[dp_sg - 1];
            let pm = PmContext {
                sg: SgEntry {
                    size: dp_ofs.wrapping_neg() as u32,
                    addr: entry
                        .addr
                        .wrapping_add(entry.size & 0xff_ffff)
                        .wrapping_add(dp_ofs as u32),
                },
                ret: dp_ret,
            };

            let ccb = &mut self.ccbs[cp];
            if hflags.contains(HostFlags::ACT_PM) {
                ccb.phys.pm1 = pm;
                self.layout.address(Label::Pm1Data)
            } else {
                ccb.phys.pm0 = pm;
                self.layout.address(Label::Pm0Data)
            }
        };

        self.set_script_dp(cp, dp_scr);
        self.jump(Label::Clrack);
    }

    /// compute_residual returns the number of bytes the
    /// job did not transfer. It is negative when the
    /// target sent more than was asked for.
    ///
    pub(crate) fn compute_residual(&mut self, cp: CcbIndex) -> i32 {
        let ccb = &self.ccbs[cp];
        let mut resid = 0i32;
        if ccb.xerr_status.contains(XerrStatus::EXTRA_DATA) {
            resid -= ccb.extra_bytes;
        }

        if ccb.xerr_status.contains(XerrStatus::SODL_UNRUN) {
            resid += 1;
        }

        if ccb.xerr_status.contains(XerrStatus::SWIDE_OVRUN) {
            resid -= 1;
        }

        // All data transferred.
        if ccb.phys.lastp == ccb.goalp {
            return resid;
        }

        // None transferred, or the pointer is
        // nonsense.
        let lastp = ccb.phys.lastp;
        let data_len = ccb.data_len as i32;
        if ccb.startp == lastp {
            return data_len;
        }

        let dp_ofs = match self.evaluate_dp(cp, lastp, 0) {
            Some((_, dp_ofs)) => dp_ofs,
            None => return data_len,
        };

        let ccb = &self.ccbs[cp];
        if ccb.host_flags.contains(HostFlags::SENSE) {
            return resid - dp_ofs;
        }

        let first = ccb.ext_sg.max(0) as usize;
        let rest: u32 = ccb.phys.data[first..]
            .iter()
            .map(|entry| entry.size & 0xff_ffff)
            .sum();

        rest as i32 - ccb.ext_ofs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DataDirection, DmaSegment};
    use crate::testing::{test_command, test_hcb};
    use crate::regs::Istat;
    use scsi::message::TaskAttribute;

    // interrupt_data_move sets up the registers as the
    // chip leaves them after a phase mismatch in data
    // MOVE `i` of a job, with `rest` bytes left.
    fn interrupt_data_move<R: Registers>(hcb: &mut Hcb<R>, cp: CcbIndex, i: usize, rest: u32) {
        let dsp = hcb.layout.address(Label::DataIn) + INSTRUCTION_SIZE * (i as u32 + 1);
        let dsa = hcb.ccbs[cp].ba;
        hcb.regs.write32(Register::DSP, dsp);
        hcb.regs.write32(Register::DSA, dsa);
        hcb.regs.write32(Register::DBC, 0x1100_0000 | rest);
    }

    #[test]
    fn residual_goes_to_pm_context() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        let last = hcb.config.max_sg - 1;
        let entry = hcb.ccbs[cp].phys.data[last];
        assert_eq!(entry.size, 512);

        interrupt_data_move(&mut hcb, cp, last, 200);
        hcb.int_ma();

        let ccb = &hcb.ccbs[cp];
        let resume = hcb.layout.address(Label::DataIn) + INSTRUCTION_SIZE * (last as u32 + 1);
        assert_eq!(ccb.phys.pm0.sg.addr, entry.addr + 512 - 200);
        assert_eq!(ccb.phys.pm0.sg.size, 200);
        assert_eq!(ccb.phys.pm0.ret, resume);
        assert_eq!(ccb.phys.lastp, hcb.layout.address(Label::Pm0Data));
        assert_eq!(hcb.regs.read32(Register::TEMP), hcb.layout.address(Label::Pm0Data));
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::Dispatch));

        // The residual covers what the PM context still
        // has to move.
        assert_eq!(hcb.compute_residual(cp), 200);

        // A second mismatch inside the PM context, after
        // SAVE DATA POINTER, uses the other context and
        // returns to the same place.
        hcb.regs.write8(Register::HF_PRT, (HostFlags::IN_PM0 | HostFlags::DP_SAVED).bits());
        let pm0 = hcb.layout.address(Label::Pm0Data);
        hcb.regs.write32(Register::DSP, pm0 + INSTRUCTION_SIZE);
        hcb.regs.write32(Register::DBC, 0x1100_0000 | 50);
        hcb.int_ma();

        let ccb = &hcb.ccbs[cp];
        assert_eq!(ccb.phys.pm1.sg.addr, entry.addr + 512 - 50);
        assert_eq!(ccb.phys.pm1.sg.size, 50);
        assert_eq!(ccb.phys.pm1.ret, resume);
        assert_eq!(ccb.phys.lastp, hcb.layout.address(Label::Pm1Data));
        assert_eq!(hcb.regs.read8(Register::HF_PRT), HostFlags::ACT_PM.bits());
        assert_eq!(hcb.compute_residual(cp), 50);
    }

    #[test]
    fn wide_residue() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        let last = hcb.config.max_sg - 1;
        let entry = hcb.ccbs[cp].phys.data[last];
        hcb.ccbs[cp].phys.select.sel_scntl3 |= Scntl3::EWS.bits();
        hcb.regs.write8(Register::SCNTL2, Scntl2::WSR.bits());

        interrupt_data_move(&mut hcb, cp, last, 100);
        hcb.int_ma();

        let ccb = &hcb.ccbs[cp];
        assert_eq!(ccb.phys.wresid, SgEntry { size: 1, addr: entry.addr + 412 });
        assert_eq!(ccb.phys.pm0.sg.addr, entry.addr + 413);
        assert_eq!(ccb.phys.pm0.sg.size, 99);
        assert_eq!(ccb.phys.lastp, hcb.layout.address(Label::Pm0Data));
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::WsrMaHelper));

        // With a single byte left, the PM context is
        // skipped altogether.
        interrupt_data_move(&mut hcb, cp, last, 1);
        hcb.int_ma();
        let resume = hcb.layout.address(Label::DataIn) + INSTRUCTION_SIZE * (last as u32 + 1);
        assert_eq!(hcb.ccbs[cp].phys.lastp, resume);
    }

    #[test]
    fn output_fifo_counts_as_residual() {
        let mut hcb = test_hcb();
        let mut cmd = test_command(1, 0, None);
        cmd.direction = DataDirection::Out;
        let cp = hcb.queue_scsiio(cmd).unwrap();
        let last = hcb.config.max_sg - 1;
        let entry = hcb.ccbs[cp].phys.data[last];

        let dsp = hcb.layout.address(Label::DataOut) + INSTRUCTION_SIZE * (last as u32 + 1);
        let dsa = hcb.ccbs[cp].ba;
        hcb.regs.write32(Register::DSP, dsp);
        hcb.regs.write32(Register::DSA, dsa);
        hcb.regs.write32(Register::DBC, 0x1000_0000 | 100);

        // Twelve bytes in the DMA FIFO and one in the
        // output latch.
        hcb.regs.write16(Register::DFBC, 12);
        hcb.regs.write8(Register::SSTAT0, Sstat0::OLF.bits());
        hcb.int_ma();

        let ccb = &hcb.ccbs[cp];
        assert_eq!(ccb.phys.pm0.sg.size, 113);
        assert_eq!(ccb.phys.pm0.sg.addr, entry.addr + 512 - 113);
        assert_eq!(hcb.regs.read8(Register::STEST3), 0x82);
    }

    #[test]
    fn unlocatable_mismatch_resets() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        let dsa = hcb.ccbs[cp].ba;
        hcb.regs.write32(Register::DSP, 0x10);
        hcb.regs.write32(Register::DSA, dsa);
        hcb.regs.write32(Register::DBC, 0x1100_0010);
        hcb.int_ma();
        assert!(hcb.regs.was_reset());

        // A DCMD that does not match the instruction.
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();
        interrupt_data_move(&mut hcb, cp, 0, 10);
        hcb.regs.write32(Register::DBC, 0x0100_0010);
        hcb.int_ma();
        assert!(hcb.regs.was_reset());
    }

    #[test]
    fn unexpected_phases() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, Some(TaskAttribute::Simple))).unwrap();
        let dsa = hcb.ccbs[cp].ba;
        hcb.regs.write32(Register::DSA, dsa);

        // The target leaves message out before taking
        // the tag.
        let send_ident = hcb.layout.address(Label::SendIdent);
        hcb.regs.write32(Register::DSP, send_ident + INSTRUCTION_SIZE);
        hcb.regs.write32(Register::DBC, 0x1600_0000 | (hcb.ccbs[cp].phys.smsg.size - 1));
        hcb.int_ma();
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::IdentBreakAtn));
        assert_eq!(hcb.msgout[0], message::identify(false, 0));
        assert_eq!(hcb.ccbs[cp].host_status, HostStatus::Busy);

        // The target leaves command phase early.
        let command = hcb.layout.address(Label::Command);
        hcb.regs.write32(Register::DSP, command + INSTRUCTION_SIZE);
        hcb.regs.write32(Register::DBC, 0x1200_0004);
        hcb.int_ma();
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::Dispatch));

        // The target leaves message out during a PPR.
        hcb.targets[1].caps.ppr = true;
        hcb.targets[1].goal.renego = Some(Nego::Ppr);
        let send_ppr = hcb.layout.address(Label::SendPpr);
        hcb.regs.write32(Register::DSP, send_ppr + INSTRUCTION_SIZE);
        hcb.regs.write32(Register::DBC, 0x0e00_0008);
        hcb.int_ma();
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::NegoBadPhase));
        assert!(!hcb.targets[1].caps.ppr);
        assert_eq!(hcb.targets[1].goal.renego, None);
        assert!(!hcb.regs.was_reset());
        assert_eq!(hcb.regs.read8(Register::ISTAT) & Istat::SRST.bits(), 0);
    }

    #[test]
    fn modify_data_pointer() {
        let mut hcb = test_hcb();
        let mut cmd = test_command(1, 0, None);
        cmd.segments = alloc::vec![
            DmaSegment { addr: 0x10_0000, len: 256 },
            DmaSegment { addr: 0x20_0000, len: 256 },
        ];
        let cp = hcb.queue_scsiio(cmd).unwrap();
        let max_sg = hcb.config.max_sg;
        let first_move = hcb.ccbs[cp].phys.lastp;

        // Back one byte from the start of the second
        // entry lands in a PM context for the last byte
        // of the first.
        let second_move = first_move + INSTRUCTION_SIZE;
        hcb.regs.write32(Register::TEMP, second_move);
        hcb.modify_dp(cp, -1);
        let ccb = &hcb.ccbs[cp];
        assert_eq!(ccb.phys.pm0.sg, SgEntry { size: 1, addr: 0x10_00ff });
        assert_eq!(ccb.phys.pm0.ret, second_move);
        assert_eq!(ccb.phys.lastp, hcb.layout.address(Label::Pm0Data));
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::Clrack));
        assert_eq!(ccb.ext_sg, (max_sg - 1) as i32);

        // Forward a whole entry is just the next MOVE.
        hcb.regs.write32(Register::TEMP, first_move);
        hcb.modify_dp(cp, 256);
        assert_eq!(hcb.ccbs[cp].phys.lastp, second_move);

        // Before the start of the data is refused.
        hcb.regs.write32(Register::TEMP, first_move);
        hcb.modify_dp(cp, -1);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::MsgBad));
    }

    #[test]
    fn residuals() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(1, 0, None)).unwrap();

        // Nothing moved.
        assert_eq!(hcb.compute_residual(cp), 512);

        // Everything moved, plus extra bytes.
        let goalp = hcb.ccbs[cp].goalp;
        hcb.ccbs[cp].phys.lastp = goalp;
        hcb.ccbs[cp].xerr_status = XerrStatus::EXTRA_DATA;
        hcb.ccbs[cp].extra_bytes = 6;
        assert_eq!(hcb.compute_residual(cp), -6);

        // A pointer outside the data block.
        hcb.ccbs[cp].xerr_status = XerrStatus::empty();
        hcb.ccbs[cp].phys.lastp = hcb.layout.address(Label::Dispatch);
        assert_eq!(hcb.compute_residual(cp), 512);
    }
}
