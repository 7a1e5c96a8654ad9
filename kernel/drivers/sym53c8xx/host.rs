// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The host adapter as seen by the upper layers.
//!
//! A [`Host`] serialises every operation on the host
//! control block with a spin lock. Completed commands are
//! gathered while the lock is held and handed to the
//! [`Midlayer`] once it has been released, so the
//! midlayer can queue new commands from its callbacks.

use crate::ccb::AbortReason;
use crate::chip::ChipInfo;
use crate::command::{Command, CommandId, Completion, Midlayer};
use crate::config::Config;
use crate::hcb::Hcb;
use crate::recovery::StartReason;
use crate::regs::Registers;
use crate::target::{DeviceCapabilities, Transfer};
use crate::Error;
use alloc::vec::Vec;
use core::mem;
use log::info;
use spin::Mutex;

// The bus settle delay is waited out in steps of
// a millisecond.
const SETTLE_STEP_MICROS: u32 = 1000;
const SETTLE_STEPS: u32 = 1_000_000 / SETTLE_STEP_MICROS;

/// Reports whether an interrupt came from the host
/// adapter.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqResult {
    /// The chip had nothing to report. The interrupt
    /// belongs to another device on a shared line.
    None,

    /// The chip's interrupt was serviced.
    Handled,
}

/// A Symbios/LSI 53C8XX host bus adapter.
///
pub struct Host<R: Registers, M: Midlayer> {
    hcb: Mutex<Hcb<R>>,
    midlayer: Mutex<M>,
}

impl<R: Registers, M: Midlayer> Host<R, M> {
    /// Initialises the chip described by `chip`,
    /// reached through `regs`, and starts SCRIPTS.
    ///
    pub fn new(regs: R, chip: &'static ChipInfo, config: Config, midlayer: M) -> Result<Self, Error> {
        let mut hcb = Hcb::new(regs, chip, config)?;
        info!(
            "{}: {} rev {:#x}, SCSI id {}, {} targets",
            hcb.config.name,
            chip.name,
            chip.revision_max,
            hcb.config.host_id,
            hcb.targets.len()
        );

        hcb.start_up(StartReason::Init);

        Ok(Host {
            hcb: Mutex::new(hcb),
            midlayer: Mutex::new(midlayer),
        })
    }

    // with_hcb runs `f` with the lock held, then reports
    // any bus reset and completed commands to the
    // midlayer.
    fn with_hcb<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut Hcb<R>) -> T,
    {
        let (result, finished, bus_was_reset) = {
            let mut hcb = self.hcb.lock();
            let result = f(&mut *hcb);
            let finished: Vec<Completion> = mem::take(&mut hcb.finished);
            let bus_was_reset = mem::replace(&mut hcb.bus_was_reset, false);
            (result, finished, bus_was_reset)
        };

        if bus_was_reset || !finished.is_empty() {
            let mut midlayer = self.midlayer.lock();
            if bus_was_reset {
                midlayer.bus_reset();
            }

            for completion in finished {
                midlayer.done(completion);
            }
        }

        result
    }

    /// Submits a command. The command's completion is
    /// reported through [`Midlayer::done`].
    ///
    pub fn queue(&self, cmd: Command) -> Result<(), Error> {
        self.with_hcb(|hcb| hcb.queue_scsiio(cmd).map(|_| ()))
    }

    /// Services the chip's interrupts.
    ///
    pub fn interrupt(&self) -> IrqResult {
        if self.with_hcb(|hcb| hcb.interrupt()) {
            IrqResult::Handled
        } else {
            IrqResult::None
        }
    }

    /// Aborts an outstanding command at the upper
    /// layers' request. It completes with
    /// [`HostByte::Abort`](scsi::HostByte::Abort).
    ///
    pub fn abort(&self, id: CommandId) -> Result<(), Error> {
        self.with_hcb(|hcb| hcb.abort_command(id, AbortReason::User))
    }

    /// Aborts a command that has run for too long.
    /// It completes with
    /// [`HostByte::TimeOut`](scsi::HostByte::TimeOut).
    ///
    pub fn timeout(&self, id: CommandId) -> Result<(), Error> {
        self.with_hcb(|hcb| hcb.abort_command(id, AbortReason::Timeout))
    }

    /// Sends a BUS DEVICE RESET message to a target.
    ///
    pub fn reset_target(&self, target: u8) -> Result<(), Error> {
        self.with_hcb(|hcb| hcb.reset_target(target))
    }

    /// Aborts every command on a logical unit.
    ///
    pub fn clear_lun(&self, target: u8, lun: u8) -> Result<(), Error> {
        self.with_hcb(|hcb| hcb.clear_lun(target, lun))
    }

    /// Resets the SCSI bus. Every outstanding command
    /// is failed once the chip reports the reset.
    ///
    pub fn reset_bus(&self) -> Result<(), Error> {
        let settle = self.with_hcb(|hcb| {
            hcb.reset_bus()?;
            Ok(hcb.config.settle_delay as u32)
        })?;

        // Give the devices time to recover. The lock is
        // only taken one step at a time, so the reset
        // interrupt can be serviced meanwhile.
        for _ in 0..settle * SETTLE_STEPS {
            self.hcb.lock().regs.delay(SETTLE_STEP_MICROS);
        }

        Ok(())
    }

    // with_target is with_hcb for operations on a single
    // target, which must be on the bus and not the
    // adapter itself.
    fn with_target<T, F>(&self, target: u8, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Hcb<R>) -> T,
    {
        self.with_hcb(|hcb| {
            if target as usize >= hcb.targets.len() || target == hcb.config.host_id {
                return Err(Error::InvalidTarget(target));
            }

            Ok(f(hcb))
        })
    }

    /// Records what a device supports, as learned
    /// from its INQUIRY data.
    ///
    pub fn set_capabilities(&self, target: u8, caps: DeviceCapabilities) -> Result<(), Error> {
        self.with_target(target, |hcb| hcb.set_capabilities(target, caps))
    }

    /// Returns the transfer parameters currently
    /// agreed with a target.
    ///
    pub fn transfer(&self, target: u8) -> Result<Transfer, Error> {
        self.with_target(target, |hcb| hcb.targets[target as usize].current)
    }

    /// Returns the transfer parameters the adapter
    /// will next try to negotiate with a target.
    ///
    pub fn goal(&self, target: u8) -> Result<Transfer, Error> {
        self.with_target(target, |hcb| hcb.targets[target as usize].goal.transfer)
    }

    pub fn set_period(&self, target: u8, period: u8) -> Result<(), Error> {
        self.with_target(target, |hcb| hcb.set_goal_period(target, period))
    }

    pub fn set_offset(&self, target: u8, offset: u8) -> Result<(), Error> {
        self.with_target(target, |hcb| hcb.set_goal_offset(target, offset))
    }

    pub fn set_width(&self, target: u8, width: u8) -> Result<(), Error> {
        self.with_target(target, |hcb| hcb.set_goal_width(target, width))
    }

    pub fn set_dt(&self, target: u8, dt: bool) -> Result<(), Error> {
        self.with_target(target, |hcb| hcb.set_goal_dt(target, dt))
    }

    pub fn set_iu(&self, target: u8, iu: bool) -> Result<(), Error> {
        self.with_target(target, |hcb| hcb.set_goal_iu(target, iu))
    }

    pub fn set_qas(&self, target: u8, qas: bool) -> Result<(), Error> {
        self.with_target(target, |hcb| hcb.set_goal_qas(target, qas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccb::HostStatus;
    use crate::chip::by_name;
    use crate::regs::{Dstat, Istat, Register, Sist};
    use crate::testing::{test_command, MockChip, Recorder};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use scsi::message::TaskAttribute;
    use scsi::HostByte;

    fn test_host() -> Host<MockChip, Recorder> {
        let chip = by_name("1010-66").unwrap();
        Host::new(MockChip::new(), chip, Config::default(), Recorder::default()).unwrap()
    }

    // finish marks a started command as completed
    // successfully and posts it to the done queue.
    fn finish(host: &Host<MockChip, Recorder>, id: CommandId) {
        let mut hcb = host.hcb.lock();
        let cp = hcb
            .ccbs
            .busy()
            .into_iter()
            .find(|&cp| hcb.ccbs[cp].cmd.as_ref().map(|cmd| cmd.id) == Some(id))
            .unwrap();

        let ccb = &mut hcb.ccbs[cp];
        ccb.host_status = HostStatus::Complete;
        ccb.ssss_status = 0;
        ccb.phys.lastp = ccb.goalp;
        let ba = ccb.ba;
        hcb.dqueue.post(0, ba);
        hcb.regs.poke8(Register::ISTAT, Istat::INTF.bits());
    }

    #[test]
    fn completions_reach_midlayer() {
        let host = test_host();
        assert_eq!(host.interrupt(), IrqResult::None);

        let cmd = test_command(1, 0, None);
        let id = cmd.id;
        host.queue(cmd).unwrap();
        assert!(host.midlayer.lock().completions.is_empty());

        finish(&host, id);
        assert_eq!(host.interrupt(), IrqResult::Handled);

        let midlayer = host.midlayer.lock();
        assert_eq!(midlayer.completions.len(), 1);
        assert_eq!(midlayer.completions[0].id, id);
        assert_eq!(midlayer.completions[0].result.host, HostByte::Ok);
        assert_eq!(midlayer.resets, 0);
    }

    #[test]
    fn refused_requests() {
        let host = test_host();
        assert_eq!(host.queue(test_command(7, 0, None)), Err(Error::InvalidTarget(7)));
        assert_eq!(host.abort(CommandId(u64::MAX)), Err(Error::NotFound));
        assert_eq!(host.reset_target(7), Err(Error::InvalidTarget(7)));
        assert_eq!(host.clear_lun(1, 0), Err(Error::InvalidLun(0)));
        assert_eq!(host.set_width(16, 1), Err(Error::InvalidTarget(16)));
        assert_eq!(host.transfer(7), Err(Error::InvalidTarget(7)));
        assert!(host.midlayer.lock().completions.is_empty());
    }

    #[test]
    fn transport_settings() {
        let host = test_host();
        host.set_width(2, 0).unwrap();
        host.set_offset(2, 0).unwrap();
        let goal = host.goal(2).unwrap();
        assert_eq!(goal.width, 0);
        assert_eq!(goal.offset, 0);
        assert!(!goal.dt);
        assert_eq!(host.transfer(2).unwrap(), Transfer::default());
    }

    #[test]
    fn bus_reset_fails_commands() {
        let host = test_host();
        let cmd = test_command(3, 0, Some(TaskAttribute::Simple));
        let id = cmd.id;
        host.queue(cmd).unwrap();

        host.reset_bus().unwrap();
        assert!(host.hcb.lock().regs.was_reset());

        // The settle delay is not spent in one go with
        // the lock held.
        let hcb = host.hcb.lock();
        assert!(hcb.regs.delayed() >= 3_000_000);
        assert!(hcb.regs.longest_delay() <= 2000);
        drop(hcb);

        // The chip reports the reset it saw.
        host.hcb.lock().regs.raise(Sist::RST, Dstat::empty());
        assert_eq!(host.interrupt(), IrqResult::Handled);

        let midlayer = host.midlayer.lock();
        assert_eq!(midlayer.resets, 1);
        assert_eq!(midlayer.completions.len(), 1);
        assert_eq!(midlayer.completions[0].id, id);
        assert_ne!(midlayer.completions[0].result.host, HostByte::Ok);
    }

    #[test]
    fn abort_and_timeout() {
        let host = test_host();
        let first = test_command(4, 0, None);
        let second = test_command(5, 0, None);
        let (first_id, second_id) = (first.id, second.id);
        host.queue(first).unwrap();
        host.queue(second).unwrap();

        // Both are in the start queue, so SCRIPTS is
        // asked to stop and hand control back.
        host.abort(first_id).unwrap();
        host.timeout(second_id).unwrap();
        let hcb = host.hcb.lock();
        assert_eq!(hcb.istat_sem, Istat::SEM);
        let reasons: Vec<_> = hcb.ccbs.busy().into_iter().map(|cp| hcb.ccbs[cp].to_abort).collect();
        assert!(reasons.contains(&Some(AbortReason::User)));
        assert!(reasons.contains(&Some(AbortReason::Timeout)));
    }

    // Tagged and untagged commands never run on a
    // logical unit at the same time, whatever the mix
    // submitted and the order they complete in.
    #[test]
    fn tagged_and_untagged_exclusive() {
        let host = test_host();
        let mut rng = StdRng::seed_from_u64(0x53c8_7500);
        let mut outstanding = Vec::new();
        for _ in 0..500 {
            if outstanding.is_empty() || rng.gen_bool(0.6) {
                let tag_order = if rng.gen_bool(0.3) { None } else { Some(TaskAttribute::Simple) };
                let cmd = test_command(1, 0, tag_order);
                let id = cmd.id;
                if host.queue(cmd).is_ok() {
                    outstanding.push(id);
                }
            } else {
                // Complete one of the started commands.
                let started: Vec<CommandId> = {
                    let hcb = host.hcb.lock();
                    hcb.ccbs
                        .busy()
                        .into_iter()
                        .filter(|&cp| hcb.ccbs[cp].started)
                        .filter_map(|cp| hcb.ccbs[cp].cmd.as_ref().map(|cmd| cmd.id))
                        .collect()
                };

                if started.is_empty() {
                    continue;
                }

                let id = started[rng.gen_range(0..started.len())];
                finish(&host, id);
                assert_eq!(host.interrupt(), IrqResult::Handled);
                outstanding.retain(|&other| other != id);
            }

            let hcb = host.hcb.lock();
            let lcb = hcb.targets[1].lun(0).unwrap();
            assert!(!(lcb.started_tags > 0 && lcb.started_no_tag > 0));
            assert!(lcb.started_no_tag <= 1);
        }

        let completed = host.midlayer.lock().completions.len();
        assert!(completed > 0);
        assert!(completed + outstanding.len() <= 500);
    }
}
