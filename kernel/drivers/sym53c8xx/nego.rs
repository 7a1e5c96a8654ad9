// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Negotiates transfer parameters with targets.
//!
//! Each target has a goal, built from the configuration,
//! the device's capabilities and the chip's limits. When
//! the goal changes, the next command to the target
//! carries an SDTR, WDTR or PPR message. Targets can also
//! start a negotiation themselves, in which case we answer
//! with the closest parameters we support.
//!
//! Agreed parameters are applied by patching the target's
//! register shadows, which SCRIPTS loads on each selection
//! and reselection, and the select block of every busy CCB
//! for the target.

use crate::ccb::{CcbIndex, HostStatus, Nego};
use crate::chip::{Features, DIV_10M};
use crate::hcb::Hcb;
use crate::regs::{BusMode, Register, Registers, Scntl3, Scntl4, Stest2};
use crate::scripts::Label;
use crate::target::{DeviceCapabilities, Transfer};
use log::{debug, info, warn};
use scsi::message::{self, PprOptions};

/// The largest period factor that needs ULTRA
/// timing on chips before the C1010.
///
const ULTRA_FACTOR: u8 = 12;

/// The fastest period factor that can be reached
/// without PPR.
///
const PPR_ONLY_FACTOR: u8 = 0x0a;

/// A clock divisor and extra clock count, as
/// programmed into SCNTL3 and SXFER (or SCNTL4).
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SyncClock {
    pub div: u8,
    pub fak: u8,
}

// period_tenths returns the transfer period for a
// period factor, in tenths of a nanosecond.
fn period_tenths(dt: bool, factor: u8) -> u64 {
    match factor {
        0..=9 if dt => 125,
        0..=10 => 250,
        11 => 303,
        12 => 500,
        _ => 40 * factor as u64,
    }
}

impl<R: Registers> Hcb<R> {
    /// get_sync returns the clock settings for the
    /// period factor given, or `None` if the chip
    /// cannot reach it.
    ///
    pub(crate) fn get_sync(&self, dt: bool, factor: u8) -> Option<SyncClock> {
        let clock_divn = self.limits.clock_divn as usize;
        let mut kpc = period_tenths(dt, factor) * self.limits.clock_khz as u64;
        if dt {
            kpc <<= 1;
        }

        // Without U3EN, the C1010 has no extra clocks,
        // so we need the slowest divisor that is fast
        // enough.
        let features = self.chip.features;
        if features.contains(Features::C10) && !features.contains(Features::U3EN) {
            let mut div = clock_divn;
            while div > 0 {
                div -= 1;
                if kpc > (DIV_10M[div] as u64) << 2 {
                    div += 1;
                    break;
                }
            }

            if div == clock_divn {
                return None;
            }

            return Some(SyncClock { div: div as u8, fak: 0 });
        }

        let mut div = clock_divn - 1;
        while div > 0 && kpc < (DIV_10M[div] as u64) << 2 {
            div -= 1;
        }

        let (clocks, base) = if dt {
            ((kpc - 1) / ((DIV_10M[div] as u64) << 1) + 1, 2)
        } else {
            ((kpc - 1) / DIV_10M[div] as u64 + 1, 4)
        };

        if clocks < base || clocks - base > 2 {
            return None;
        }

        Some(SyncClock {
            div: div as u8,
            fak: (clocks - base) as u8,
        })
    }

    /// check_goals trims the target's goal to what
    /// the device, the chip and the bus all support.
    ///
    pub(crate) fn check_goals(&mut self, target: u8) {
        let dt_bus = self.scsi_mode == BusMode::LowVoltageDifferential && self.chip.features.contains(Features::U3EN);
        let limits = self.limits;
        let tcb = &mut self.targets[target as usize];
        let caps = tcb.caps;
        let goal = &mut tcb.goal;
        let t = &mut goal.transfer;

        if !caps.wide {
            t.width = 0;
        }

        if !caps.sync {
            t.iu = false;
            t.dt = false;
            t.qas = false;
            t.offset = 0;
        } else {
            if caps.dt && caps.ppr {
                if caps.dt_only {
                    t.dt = true;
                }

                if t.offset == 0 {
                    t.dt = false;
                }
            } else {
                t.dt = false;
            }

            // Some targets fail to negotiate DT on
            // single-ended buses.
            if !dt_bus {
                t.dt = false;
            }

            let (maxoffs, minsync, maxsync) = if t.dt {
                t.width = 1;
                (limits.maxoffs_dt, limits.minsync_dt, limits.maxsync_dt)
            } else {
                t.iu = false;
                t.qas = false;
                (limits.maxoffs, limits.minsync, limits.maxsync)
            };

            if t.offset > maxoffs {
                t.offset = maxoffs;
            }

            if t.period < minsync {
                t.period = minsync;
            }

            if t.period > maxsync {
                t.period = maxsync;
            }
        }

        if (!caps.ppr || (t.offset == 0 && t.width == 0)) && goal.renego == Some(Nego::Ppr) {
            goal.renego = None;
        }
    }

    /// prepare_nego writes the negotiation message the
    /// target's goal calls for into `msg`, returning
    /// its length and the kind of negotiation.
    ///
    pub(crate) fn prepare_nego(&mut self, target: u8, msg: &mut [u8]) -> (usize, Option<Nego>) {
        self.check_goals(target);
        let goal = &mut self.targets[target as usize].goal;
        let t = goal.transfer;
        let nego = if goal.renego == Some(Nego::Ppr)
            || (t.offset != 0 && (t.iu || t.dt || t.qas || t.period < PPR_ONLY_FACTOR))
        {
            Some(Nego::Ppr)
        } else if goal.renego == Some(Nego::Wide) || t.width != 0 {
            Some(Nego::Wide)
        } else if goal.renego == Some(Nego::Sync) || t.offset != 0 {
            Some(Nego::Sync)
        } else {
            goal.check_nego = false;
            None
        };

        let len = match nego {
            Some(Nego::Sync) => message::populate_sync(msg, t.period, t.offset),
            Some(Nego::Wide) => message::populate_width(msg, t.width),
            Some(Nego::Ppr) => {
                let mut opts = PprOptions::empty();
                opts.set(PprOptions::IU, t.iu);
                opts.set(PprOptions::DT, t.dt);
                opts.set(PprOptions::QAS, t.qas);
                message::populate_ppr(msg, t.period, t.offset, t.width, opts)
            }
            None => 0,
        };

        if let Some(nego) = nego {
            debug!("{}:{}: negotiating {:?}: {:x?}", self.config.name, target, nego, &msg[..len]);
        }

        (len, nego)
    }

    // set_transfer programs the chip and the target's
    // register shadows with new transfer parameters.
    fn set_transfer(&mut self, target: u8, opts: PprOptions, offset: u8, period: u8, wide: u8, clock: SyncClock) {
        let c10 = self.chip.is_c10();
        let tcb = &mut self.targets[target as usize];
        let (mut sval, mut wval, mut uval) = (tcb.sval, tcb.wval, tcb.uval);

        sval = if c10 {
            (sval & !0x3f) | offset
        } else {
            (sval & !0x1f) | offset
        };

        if offset != 0 {
            wval = (wval & !0x70) | ((clock.div + 1) << 4);
            if c10 {
                let xclk = Scntl4::XCLKH_ST | Scntl4::XCLKH_DT | Scntl4::XCLKS_ST | Scntl4::XCLKS_DT;
                uval &= !xclk.bits();
                if clock.fak >= 1 {
                    uval |= (Scntl4::XCLKH_ST | Scntl4::XCLKH_DT).bits();
                }
                if clock.fak >= 2 {
                    uval |= (Scntl4::XCLKS_ST | Scntl4::XCLKS_DT).bits();
                }
            } else {
                sval = (sval & !0xe0) | (clock.fak << 5);
            }
        }

        wval &= !Scntl3::EWS.bits();
        if wide != 0 {
            wval |= Scntl3::EWS.bits();
        }

        if c10 {
            uval &= !(Scntl4::U3EN | Scntl4::AIPCKEN).bits();
            if !opts.is_empty() {
                uval |= Scntl4::U3EN.bits();
            }
        } else {
            wval &= !Scntl3::ULTRA.bits();
            if period <= ULTRA_FACTOR {
                wval |= Scntl3::ULTRA.bits();
            }
        }

        if tcb.sval == sval && tcb.wval == wval && tcb.uval == uval {
            return;
        }

        tcb.sval = sval;
        tcb.wval = wval;
        tcb.uval = uval;

        // Extended REQ/ACK filtering is too slow for
        // short periods.
        if period < 50 && !c10 {
            self.regs.clear_bits8(Register::STEST2, Stest2::EXT.bits());
        }

        self.regs.write8(Register::SXFER, sval);
        self.regs.write8(Register::SCNTL3, wval);
        if c10 {
            self.regs.write8(Register::SCNTL4, uval);
        }

        // Busy jobs will use the new values from
        // their next selection or reselection.
        for cp in self.ccbs.busy() {
            let ccb = &mut self.ccbs[cp];
            if ccb.target != target {
                continue;
            }

            ccb.phys.select.sel_scntl3 = wval;
            ccb.phys.select.sel_sxfer = sval;
            if c10 {
                ccb.phys.select.sel_scntl4 = uval;
            }
        }
    }

    // announce_transfer logs the target's current
    // transfer parameters.
    fn announce_transfer(&self, target: u8) {
        let cur = self.targets[target as usize].current;
        let bits = 8 << cur.width;
        if cur.offset == 0 {
            info!("{}:{}: asynchronous {}-bit transfers", self.config.name, target, bits);
            return;
        }

        info!(
            "{}:{}: {} {}-bit transfers, period factor {}, offset {}{}{}",
            self.config.name,
            target,
            if cur.dt { "DT" } else { "ST" },
            bits,
            cur.period,
            cur.offset,
            if cur.iu { ", IU" } else { "" },
            if cur.qas { ", QAS" } else { "" },
        );
    }

    /// set_sync applies the result of a synchronous
    /// negotiation.
    ///
    pub(crate) fn set_sync(&mut self, target: u8, offset: u8, period: u8, clock: SyncClock) {
        let wide = if self.targets[target as usize].wval & Scntl3::EWS.bits() != 0 {
            1
        } else {
            0
        };

        self.set_transfer(target, PprOptions::empty(), offset, period, wide, clock);

        let tcb = &mut self.targets[target as usize];
        tcb.goal.renego = if wide != 0 {
            Some(Nego::Wide)
        } else if offset != 0 {
            Some(Nego::Sync)
        } else {
            None
        };

        tcb.current = Transfer {
            period,
            offset,
            width: wide,
            ..Transfer::default()
        };

        let goal = &mut tcb.goal;
        if !goal.transfer.dt && !goal.transfer.iu && !goal.transfer.qas {
            goal.transfer.period = period;
            goal.transfer.offset = offset;
            goal.check_nego = false;
        }

        self.announce_transfer(target);
    }

    /// set_wide applies the result of a wide
    /// negotiation, which always leaves the target
    /// asynchronous.
    ///
    pub(crate) fn set_wide(&mut self, target: u8, wide: u8) {
        self.set_transfer(target, PprOptions::empty(), 0, 0, wide, SyncClock::default());

        let tcb = &mut self.targets[target as usize];
        tcb.goal.renego = if wide != 0 { Some(Nego::Wide) } else { None };
        tcb.goal.check_nego = false;
        tcb.goal.transfer.width = wide;
        tcb.current = Transfer {
            width: wide,
            ..Transfer::default()
        };

        self.announce_transfer(target);
    }

    /// set_pprot applies the result of a PPR
    /// negotiation.
    ///
    pub(crate) fn set_pprot(&mut self, target: u8, opts: PprOptions, offset: u8, period: u8, wide: u8, clock: SyncClock) {
        self.set_transfer(target, opts, offset, period, wide, clock);

        let transfer = Transfer {
            period,
            offset,
            width: wide,
            iu: opts.contains(PprOptions::IU),
            dt: opts.contains(PprOptions::DT),
            qas: opts.contains(PprOptions::QAS),
        };

        let tcb = &mut self.targets[target as usize];
        tcb.goal.renego = if wide != 0 || offset != 0 {
            Some(Nego::Ppr)
        } else {
            None
        };

        tcb.goal.transfer = transfer;
        tcb.goal.check_nego = false;
        tcb.current = transfer;

        self.announce_transfer(target);
    }

    // nego_request returns whether the message in
    // msgin is a request from the target, rather than
    // an answer to our own negotiation. It returns
    // None for an answer to a different negotiation.
    fn nego_request(&mut self, cp: CcbIndex, nego: Nego) -> Option<bool> {
        if self.regs.read8(Register::HS_PRT) != HostStatus::Negotiate as u8 {
            return Some(true);
        }

        self.regs.write8(Register::HS_PRT, HostStatus::Busy as u8);
        match self.ccbs[cp].nego_status {
            Some(status) if status != nego => None,
            _ => Some(false),
        }
    }

    // finish_nego resumes SCRIPTS after a negotiation
    // message has been checked.
    fn finish_nego(&mut self, cp: CcbIndex, nego: Nego, outcome: Option<bool>, resp: Label) {
        match outcome {
            Some(true) => {
                self.ccbs[cp].nego_status = Some(nego);
                self.jump(resp);
            }
            Some(false) => self.jump(Label::Clrack),
            None => self.jump(Label::MsgBad),
        }
    }

    /// sync_nego handles an SDTR message from the
    /// target.
    ///
    pub(crate) fn sync_nego(&mut self, cp: CcbIndex) {
        let target = self.ccbs[cp].target;
        let outcome = self
            .nego_request(cp, Nego::Sync)
            .filter(|&request| self.sync_nego_check(target, request));

        self.finish_nego(cp, Nego::Sync, outcome, Label::SdtrResp);
    }

    // sync_nego_check applies the SDTR in msgin,
    // preparing the answer to a request. It returns
    // false if the message must be rejected.
    fn sync_nego_check(&mut self, target: u8, request: bool) -> bool {
        debug!("{}:{}: sync msgin: {:x?}", self.config.name, target, &self.msgin[..5]);
        let mut period = self.msgin[3];
        let mut offset = self.msgin[4];
        let mut changed = false;

        if offset > self.limits.maxoffs {
            changed = true;
            offset = self.limits.maxoffs;
        }

        if offset != 0 && period < self.limits.minsync {
            changed = true;
            period = self.limits.minsync;
        }

        let clock = if offset != 0 {
            self.get_sync(false, period)
        } else {
            Some(SyncClock::default())
        };

        let clock = match clock {
            Some(clock) if request || !changed => clock,
            _ => {
                self.set_sync(target, 0, 0, SyncClock::default());
                return false;
            }
        };

        self.set_sync(target, offset, period, clock);
        if request {
            message::populate_sync(&mut self.msgout, period, offset);
            self.msgin[0] = message::NOOP;
        }

        true
    }

    /// wide_nego handles a WDTR message from the
    /// target.
    ///
    pub(crate) fn wide_nego(&mut self, cp: CcbIndex) {
        let target = self.ccbs[cp].target;
        let outcome = self
            .nego_request(cp, Nego::Wide)
            .filter(|&request| self.wide_nego_check(target, request));

        // Once the width is agreed, go on to
        // negotiate the synchronous offset.
        let goal = self.targets[target as usize].goal.transfer;
        if outcome == Some(false) && goal.offset != 0 {
            message::populate_sync(&mut self.msgout, goal.period, goal.offset);
            self.ccbs[cp].nego_status = Some(Nego::Sync);
            self.regs.write8(Register::HS_PRT, HostStatus::Negotiate as u8);
            self.jump(Label::SdtrResp);
            return;
        }

        self.finish_nego(cp, Nego::Wide, outcome, Label::WdtrResp);
    }

    fn wide_nego_check(&mut self, target: u8, request: bool) -> bool {
        debug!("{}:{}: wide msgin: {:x?}", self.config.name, target, &self.msgin[..4]);
        let mut wide = self.msgin[3];
        let mut changed = false;
        if wide > self.limits.maxwide {
            changed = true;
            wide = self.limits.maxwide;
        }

        if !request && changed {
            return false;
        }

        self.set_wide(target, wide);
        if request {
            message::populate_width(&mut self.msgout, wide);
            self.msgin[0] = message::NOOP;
        }

        true
    }

    /// ppr_nego handles a PPR message from the
    /// target.
    ///
    pub(crate) fn ppr_nego(&mut self, cp: CcbIndex) {
        let target = self.ccbs[cp].target;
        let outcome = self
            .nego_request(cp, Nego::Ppr)
            .filter(|&request| self.ppr_nego_check(target, request));

        self.finish_nego(cp, Nego::Ppr, outcome, Label::PprResp);
    }

    fn ppr_nego_check(&mut self, target: u8, request: bool) -> bool {
        debug!("{}:{}: ppr msgin: {:x?}", self.config.name, target, &self.msgin[..8]);
        let limits = self.limits;
        let mut period = self.msgin[3];
        let mut offset = self.msgin[5];
        let mut wide = self.msgin[6];
        let asked = PprOptions::from_bits_truncate(self.msgin[7]);
        let mut opts = asked;
        let mut changed = false;

        if wide > limits.maxwide {
            changed = true;
            wide = limits.maxwide;
        }

        if wide == 0 || !self.chip.features.contains(Features::U3EN) {
            opts = PprOptions::empty();
        }

        if opts != asked {
            changed = true;
        }

        let dt = opts.contains(PprOptions::DT);
        let (maxoffs, minsync) = if dt {
            (limits.maxoffs_dt, limits.minsync_dt)
        } else {
            (limits.maxoffs, limits.minsync)
        };

        if offset > maxoffs {
            changed = true;
            offset = maxoffs;
        }

        if offset != 0 && period < minsync {
            changed = true;
            period = minsync;
        }

        let clock = if offset != 0 {
            self.get_sync(dt, period)
        } else {
            Some(SyncClock::default())
        };

        match clock {
            Some(clock) if request || !changed => {
                self.set_pprot(target, opts, offset, period, wide, clock);
                if request {
                    message::populate_ppr(&mut self.msgout, period, offset, wide, opts);
                    self.msgin[0] = message::NOOP;
                }

                true
            }
            _ => {
                self.set_pprot(target, PprOptions::empty(), 0, 0, 0, SyncClock::default());

                // An answer that only asks for ST
                // transfers can be tried again with the
                // older messages.
                if !request && opts.is_empty() {
                    let goal = &mut self.targets[target as usize].goal;
                    goal.transfer = Transfer {
                        period,
                        offset,
                        width: wide,
                        ..Transfer::default()
                    };
                    goal.check_nego = true;
                }

                false
            }
        }
    }

    /// nego_default falls back to safe parameters
    /// when the target ignores our negotiation.
    ///
    pub(crate) fn nego_default(&mut self, cp: CcbIndex) {
        let target = self.ccbs[cp].target;
        match self.ccbs[cp].nego_status {
            Some(Nego::Ppr) => {
                let limits = self.limits;
                let goal = &mut self.targets[target as usize].goal;
                if goal.transfer.period < limits.minsync {
                    goal.transfer.period = limits.minsync;
                }
                if goal.transfer.offset > limits.maxoffs {
                    goal.transfer.offset = limits.maxoffs;
                }

                goal.transfer.iu = false;
                goal.transfer.dt = false;
                goal.transfer.qas = false;
                goal.check_nego = true;
            }
            Some(Nego::Sync) => self.set_sync(target, 0, 0, SyncClock::default()),
            Some(Nego::Wide) => self.set_wide(target, 0),
            None => {}
        }

        self.msgin[0] = message::NOOP;
        self.msgout[0] = message::NOOP;
        self.ccbs[cp].nego_status = None;
    }

    /// nego_rejected handles a MESSAGE REJECT sent in
    /// reply to our negotiation.
    ///
    pub(crate) fn nego_rejected(&mut self, cp: CcbIndex) {
        let target = self.ccbs[cp].target;
        warn!("{}:{}: negotiation rejected", self.config.name, target);
        self.nego_default(cp);
        self.regs.write8(Register::HS_PRT, HostStatus::Busy as u8);
    }

    /// set_capabilities records what a device supports,
    /// renegotiating with its next command.
    ///
    pub(crate) fn set_capabilities(&mut self, target: u8, caps: DeviceCapabilities) {
        let tcb = &mut self.targets[target as usize];
        tcb.caps = caps;
        tcb.goal.check_nego = true;
    }

    /// update_goal changes a target's goal through
    /// `f` and renegotiates with the next command.
    ///
    pub(crate) fn update_goal<F>(&mut self, target: u8, f: F)
    where
        F: FnOnce(&mut Transfer, &Transfer, u8),
    {
        let minsync = self.limits.minsync;
        let tcb = &mut self.targets[target as usize];
        let current = tcb.current;
        f(&mut tcb.goal.transfer, &current, minsync);
        tcb.goal.check_nego = true;
    }

    pub(crate) fn set_goal_period(&mut self, target: u8, period: u8) {
        self.update_goal(target, |goal, current, minsync| {
            // The fastest periods need DT, which also
            // needs wide transfers.
            if period <= minsync && current.width != 0 {
                goal.dt = true;
            }

            goal.period = period;
        });
    }

    pub(crate) fn set_goal_offset(&mut self, target: u8, offset: u8) {
        self.update_goal(target, |goal, _, _| goal.offset = offset);
    }

    pub(crate) fn set_goal_width(&mut self, target: u8, width: u8) {
        self.update_goal(target, |goal, _, _| {
            if width == 0 {
                goal.iu = false;
                goal.dt = false;
                goal.qas = false;
            }

            goal.width = width;
        });
    }

    pub(crate) fn set_goal_dt(&mut self, target: u8, dt: bool) {
        self.update_goal(target, |goal, _, _| {
            if dt {
                goal.dt = true;
            } else {
                goal.iu = false;
                goal.dt = false;
                goal.qas = false;
            }
        });
    }

    pub(crate) fn set_goal_iu(&mut self, target: u8, iu: bool) {
        self.update_goal(target, |goal, _, _| {
            goal.iu = iu;
            if iu {
                goal.dt = true;
            }
        });
    }

    pub(crate) fn set_goal_qas(&mut self, target: u8, qas: bool) {
        self.update_goal(target, |goal, _, _| {
            goal.qas = qas;
            if qas {
                goal.dt = true;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_command, test_hcb};
    use scsi::message::TaskAttribute;

    #[test]
    fn sync_clocks() {
        let hcb = test_hcb();
        assert_eq!(hcb.get_sync(false, 10), Some(SyncClock { div: 0, fak: 0 }));
        assert_eq!(hcb.get_sync(true, 9), Some(SyncClock { div: 0, fak: 0 }));
        assert_eq!(hcb.get_sync(false, 12), Some(SyncClock { div: 2, fak: 0 }));

        // Too slow for any divisor.
        assert_eq!(hcb.get_sync(false, 255), None);
    }

    #[test]
    fn no_ppr_without_offset_or_wide() {
        let mut hcb = test_hcb();
        hcb.scsi_mode = BusMode::LowVoltageDifferential;
        let tcb = &mut hcb.targets[1];
        tcb.caps = DeviceCapabilities {
            sync: true,
            wide: false,
            dt: true,
            dt_only: true,
            ppr: true,
        };
        tcb.goal.transfer = Transfer {
            period: 9,
            offset: 0,
            width: 1,
            iu: true,
            dt: true,
            qas: true,
        };
        tcb.goal.renego = Some(Nego::Ppr);

        let mut msg = [0u8; 8];
        assert_eq!(hcb.prepare_nego(1, &mut msg), (0, None));
        let goal = hcb.targets[1].goal;
        assert!(!goal.transfer.dt);
        assert!(!goal.transfer.iu);
        assert_eq!(goal.transfer.width, 0);
        assert!(!goal.check_nego);
    }

    #[test]
    fn prepare_messages() {
        let mut hcb = test_hcb();
        let mut msg = [0u8; 8];

        // Wide first, as the device is wide and the
        // period does not need PPR.
        assert_eq!(hcb.prepare_nego(1, &mut msg), (4, Some(Nego::Wide)));
        assert_eq!(msg[..4], [message::EXTENDED, 2, message::extended::WDTR, 1]);

        // DT on an LVD bus needs PPR.
        hcb.scsi_mode = BusMode::LowVoltageDifferential;
        hcb.targets[1].caps.dt = true;
        hcb.targets[1].caps.ppr = true;
        hcb.targets[1].goal.transfer.dt = true;
        hcb.targets[1].goal.transfer.period = 9;
        assert_eq!(hcb.prepare_nego(1, &mut msg), (8, Some(Nego::Ppr)));
        assert_eq!(msg[3], 9);
        assert_eq!(msg[5], hcb.limits.maxoffs_dt.min(31));
        assert_eq!(msg[7], PprOptions::DT.bits());

        // Narrow devices get an SDTR.
        hcb.targets[2].caps.wide = false;
        hcb.targets[2].goal.transfer.dt = false;
        assert_eq!(hcb.prepare_nego(2, &mut msg), (5, Some(Nego::Sync)));
        assert_eq!(msg[..5], [message::EXTENDED, 3, message::extended::SDTR, 10, 31]);
    }

    #[test]
    fn sync_answer() {
        let mut hcb = test_hcb();
        hcb.targets[4].caps.wide = false;
        let cp = hcb.queue_scsiio(test_command(4, 0, Some(TaskAttribute::Simple))).unwrap();
        assert_eq!(hcb.ccbs[cp].nego_status, Some(Nego::Sync));
        assert_eq!(hcb.targets[4].nego_cp, Some(cp));

        hcb.regs.write8(Register::HS_PRT, HostStatus::Negotiate as u8);
        hcb.msgin = [message::EXTENDED, 3, message::extended::SDTR, 12, 16, 0, 0, 0];
        hcb.sync_nego(cp);

        assert_eq!(hcb.regs.read8(Register::HS_PRT), HostStatus::Busy as u8);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::Clrack));
        let tcb = &hcb.targets[4];
        assert_eq!(tcb.current.offset, 16);
        assert_eq!(tcb.current.period, 12);
        assert_eq!(tcb.sval & 0x3f, 16);
        assert_eq!(tcb.goal.renego, Some(Nego::Sync));
        assert!(!tcb.goal.check_nego);

        // The busy CCB was patched too.
        assert_eq!(hcb.ccbs[cp].phys.select.sel_sxfer, tcb.sval);
        assert_eq!(hcb.ccbs[cp].phys.select.sel_scntl3, tcb.wval);
        assert_eq!(hcb.regs.read8(Register::SXFER), tcb.sval);
    }

    #[test]
    fn changed_answer_is_rejected() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(4, 0, None)).unwrap();
        hcb.ccbs[cp].nego_status = Some(Nego::Sync);
        hcb.regs.write8(Register::HS_PRT, HostStatus::Negotiate as u8);

        // An offset beyond what we can do.
        hcb.msgin = [message::EXTENDED, 3, message::extended::SDTR, 12, 200, 0, 0, 0];
        hcb.sync_nego(cp);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::MsgBad));
        assert_eq!(hcb.targets[4].current.offset, 0);

        // An answer to a different negotiation.
        hcb.regs.write8(Register::HS_PRT, HostStatus::Negotiate as u8);
        hcb.msgin = [message::EXTENDED, 2, message::extended::WDTR, 1, 0, 0, 0, 0];
        hcb.wide_nego(cp);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::MsgBad));
    }

    #[test]
    fn sync_request() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(5, 0, None)).unwrap();
        hcb.regs.write8(Register::HS_PRT, HostStatus::Busy as u8);

        // The target asks for more than we can do,
        // so we answer with our limits.
        hcb.msgin = [message::EXTENDED, 3, message::extended::SDTR, 8, 200, 0, 0, 0];
        hcb.sync_nego(cp);
        let (minsync, maxoffs) = (hcb.limits.minsync, hcb.limits.maxoffs);
        assert_eq!(hcb.msgout[..5], [message::EXTENDED, 3, message::extended::SDTR, minsync, maxoffs]);
        assert_eq!(hcb.msgin[0], message::NOOP);
        assert_eq!(hcb.ccbs[cp].nego_status, Some(Nego::Sync));
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::SdtrResp));
    }

    #[test]
    fn wide_answer_chains_sync() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(6, 0, None)).unwrap();
        assert_eq!(hcb.ccbs[cp].nego_status, Some(Nego::Wide));

        hcb.regs.write8(Register::HS_PRT, HostStatus::Negotiate as u8);
        hcb.msgin = [message::EXTENDED, 2, message::extended::WDTR, 1, 0, 0, 0, 0];
        hcb.wide_nego(cp);

        let goal = hcb.targets[6].goal.transfer;
        assert_eq!(hcb.targets[6].current.width, 1);
        assert_eq!(hcb.targets[6].wval & Scntl3::EWS.bits(), Scntl3::EWS.bits());
        assert_eq!(hcb.msgout[..5], [message::EXTENDED, 3, message::extended::SDTR, goal.period, goal.offset]);
        assert_eq!(hcb.ccbs[cp].nego_status, Some(Nego::Sync));
        assert_eq!(hcb.regs.read8(Register::HS_PRT), HostStatus::Negotiate as u8);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::SdtrResp));
    }

    #[test]
    fn ppr_rejected_falls_back() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(6, 0, None)).unwrap();
        hcb.ccbs[cp].nego_status = Some(Nego::Ppr);
        hcb.regs.write8(Register::HS_PRT, HostStatus::Negotiate as u8);

        // A narrower answer than we asked for.
        hcb.msgin = [message::EXTENDED, 6, message::extended::PPR, 10, 0, 40, 1, 0];
        hcb.ppr_nego(cp);
        assert_eq!(hcb.regs.read32(Register::DSP), hcb.layout.address(Label::MsgBad));
        let goal = hcb.targets[6].goal;
        assert!(goal.check_nego);
        assert_eq!(goal.transfer.offset, hcb.limits.maxoffs);
        assert!(!goal.transfer.dt);
        assert_eq!(hcb.targets[6].current, Transfer::default());
    }

    #[test]
    fn rejected_negotiation() {
        let mut hcb = test_hcb();
        let cp = hcb.queue_scsiio(test_command(6, 0, None)).unwrap();
        hcb.ccbs[cp].nego_status = Some(Nego::Ppr);
        hcb.targets[6].goal.transfer.dt = true;
        hcb.targets[6].goal.transfer.period = 9;

        hcb.nego_rejected(cp);
        let goal = hcb.targets[6].goal;
        assert_eq!(goal.transfer.period, hcb.limits.minsync);
        assert!(!goal.transfer.dt);
        assert!(goal.check_nego);
        assert_eq!(hcb.ccbs[cp].nego_status, None);
        assert_eq!(hcb.msgout[0], message::NOOP);
        assert_eq!(hcb.regs.read8(Register::HS_PRT), HostStatus::Busy as u8);
    }

    #[test]
    fn transport_setters() {
        let mut hcb = test_hcb();
        hcb.targets[1].goal.check_nego = false;
        hcb.targets[1].current.width = 1;
        hcb.set_goal_period(1, 9);
        assert!(hcb.targets[1].goal.transfer.dt);
        assert!(hcb.targets[1].goal.check_nego);

        hcb.set_goal_qas(1, true);
        hcb.set_goal_width(1, 0);
        let goal = hcb.targets[1].goal.transfer;
        assert!(!goal.dt && !goal.qas && !goal.iu);

        hcb.set_goal_iu(1, true);
        assert!(hcb.targets[1].goal.transfer.dt);
        hcb.set_goal_dt(1, false);
        assert!(!hcb.targets[1].goal.transfer.iu);
        hcb.set_goal_offset(1, 5);
        assert_eq!(hcb.targets[1].goal.transfer.offset, 5);
    }
}
