// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The host control block, which owns all of a host
//! adapter's state.
//!
//! The behaviour is spread over several modules, each
//! adding an `impl` block to [`Hcb`]:
//!
//! - `queue`: the start and done queues and CCB scheduling.
//! - `intr`: interrupt decoding.
//! - `sir`: SCRIPTS interrupt handling.
//! - `phase`: phase mismatches and data pointers.
//! - `nego`: transfer negotiation.
//! - `recovery`: aborts, resets and restarts.
//! - `complete`: command completion.

use crate::ccb::{CcbIndex, CcbPool, Select, SgEntry};
use crate::chip::{ChipInfo, TransferLimits, DIV_10M};
use crate::command::Completion;
use crate::config::Config;
use crate::queue::{DoneQueue, StartQueue};
use crate::regs::{BusMode, Ctest3, Dcntl, Istat, Register, Registers, Stest3};
use crate::scripts::{Label, ScriptsImage, ScriptsLayout};
use crate::target::{Tcb, Transfer};
use crate::Error;
use alloc::vec::Vec;
use log::warn;

/// Offsets of the host's own areas read by SCRIPTS,
/// relative to the host control block's bus address.
///
pub(crate) mod area {
    pub const IDLE_TASK: u32 = 0x00;
    pub const MSGIN: u32 = 0x40;
    pub const MSGOUT: u32 = 0x48;
    pub const ABRT_SEL: u32 = 0x50;
    pub const ABRT_TBL: u32 = 0x58;
    pub const ABRT_MSG: u32 = 0x60;
}

// The slowest asynchronous transfer rate, in MHz,
// that the clock divisor must allow.
const MIN_ASYNC_MHZ: u32 = 40;

/// The host control block.
///
pub struct Hcb<R: Registers> {
    pub(crate) regs: R,
    pub(crate) config: Config,
    pub(crate) chip: &'static ChipInfo,
    pub(crate) limits: TransferLimits,

    pub(crate) layout: ScriptsLayout,
    pub(crate) image: ScriptsImage,

    pub(crate) ccbs: CcbPool,
    pub(crate) squeue: StartQueue,
    pub(crate) dqueue: DoneQueue,
    pub(crate) targets: Vec<Tcb>,

    // ba is the bus address of the host control
    // block, loaded into DSA when SCRIPTS works
    // for the host rather than for a job.
    pub(crate) ba: u32,

    // istat_sem holds SEM while the host wants
    // SCRIPTS to stop for task recovery.
    pub(crate) istat_sem: Istat,

    // Message buffers shared with SCRIPTS.
    pub(crate) msgin: [u8; 8],
    pub(crate) msgout: [u8; 8],
    pub(crate) lastmsg: u8,

    // The selection and message used to abort
    // tasks.
    pub(crate) abrt_sel: Select,
    pub(crate) abrt_tbl: SgEntry,
    pub(crate) abrt_msg: [u8; 8],

    // Immediate arbitration state.
    pub(crate) last_cp: Option<CcbIndex>,
    pub(crate) iarb_count: u8,

    pub(crate) scsi_mode: BusMode,

    // Register values chosen at initialisation.
    pub(crate) rv_scntl3: u8,
    pub(crate) rv_ctest3: u8,
    pub(crate) rv_dcntl: u8,

    // Completions and bus resets waiting to be
    // reported once the lock is dropped.
    pub(crate) finished: Vec<Completion>,
    pub(crate) bus_was_reset: bool,
}

// async_divisor returns the SCNTL3 clock conversion
// factor that keeps asynchronous transfers within
// the slowest rate supported.
fn async_divisor(limits: &TransferLimits) -> u8 {
    let mut i = limits.clock_divn as usize - 1;
    while i > 0 {
        if 10 * MIN_ASYNC_MHZ * limits.clock_khz > DIV_10M[i] {
            i += 1;
            break;
        }

        i -= 1;
    }

    (i + 1) as u8
}

impl<R: Registers> Hcb<R> {
    /// new prepares the host control block for `chip`,
    /// without touching the chip.
    ///
    pub fn new(regs: R, chip: &'static ChipInfo, mut config: Config) -> Result<Self, Error> {
        let max_target = if chip.features.contains(crate::chip::Features::WIDE) {
            16
        } else {
            8
        };

        if config.max_target == 0 || config.max_target > max_target {
            return Err(Error::BadConfig("target count not supported by chip"));
        }

        if config.host_id >= config.max_target {
            return Err(Error::BadConfig("host id out of range"));
        }

        if config.max_lun == 0 || config.max_lun > 64 {
            return Err(Error::BadConfig("logical unit count out of range"));
        }

        if config.max_queue < 3 || config.ccb_count == 0 || config.max_sg == 0 {
            return Err(Error::BadConfig("queue sizes too small"));
        }

        // One start queue slot always holds the idle
        // task, and SCRIPTS may still be fetching from
        // another, so no more than max_queue - 2 jobs
        // can be in flight.
        let max_start = config.max_queue - 2;
        if config.ccb_count > max_start {
            warn!(
                "{}: {} command blocks do not fit a start queue of {}, using {}",
                config.name, config.ccb_count, config.max_queue, max_start
            );
            config.ccb_count = max_start;
        }

        let limits = TransferLimits::new(chip, chip.scsi_clock_khz());
        let rv_scntl3 = async_divisor(&limits);
        let rv_dcntl = if config.irq_totem_pole { Dcntl::IRQM.bits() } else { 0 };

        let layout = ScriptsLayout::new(config.scripta_ba, config.scriptb_ba, config.max_sg);
        let image = ScriptsImage::assemble(&layout, config.hcb_ba + area::MSGOUT);
        let ccbs = CcbPool::new(config.ccb_ba, config.ccb_count, config.max_sg);
        let squeue = StartQueue::new(config.squeue_ba, config.max_queue, config.hcb_ba + area::IDLE_TASK);
        let dqueue = DoneQueue::new(config.dqueue_ba, config.max_queue);

        let goal = if config.min_sync == 0 {
            Transfer {
                width: if config.wide { limits.maxwide } else { 0 },
                ..Transfer::default()
            }
        } else {
            Transfer {
                period: config.min_sync.max(limits.minsync),
                offset: limits.maxoffs,
                width: if config.wide { limits.maxwide } else { 0 },
                dt: config.dt && limits.supports_dt(),
                iu: false,
                qas: false,
            }
        };

        let targets = (0..config.max_target)
            .map(|_| Tcb::new(config.max_lun, rv_scntl3, goal))
            .collect();

        Ok(Hcb {
            regs,
            chip,
            limits,
            layout,
            image,
            ccbs,
            squeue,
            dqueue,
            targets,
            ba: config.hcb_ba,
            istat_sem: Istat::empty(),
            msgin: [0; 8],
            msgout: [0; 8],
            lastmsg: 0,
            abrt_sel: Select::default(),
            abrt_tbl: SgEntry::default(),
            abrt_msg: [0; 8],
            last_cp: None,
            iarb_count: 0,
            scsi_mode: BusMode::Unknown,
            rv_scntl3,
            rv_ctest3: 0,
            rv_dcntl,
            finished: Vec::new(),
            bus_was_reset: false,
            config,
        })
    }

    pub(crate) fn bad_itl_ba(&self) -> u32 {
        self.layout.address(Label::BadItl)
    }

    pub(crate) fn bad_itlq_ba(&self) -> u32 {
        self.layout.address(Label::BadItlq)
    }

    pub(crate) fn bad_lun_ba(&self) -> u32 {
        self.layout.address(Label::ReselBadLun)
    }

    /// jump restarts SCRIPTS at `label`.
    ///
    pub(crate) fn jump(&mut self, label: Label) {
        let addr = self.layout.address(label);
        self.regs.write32(Register::DSP, addr);
    }

    /// resume lets SCRIPTS continue after an interrupt.
    ///
    pub(crate) fn resume(&mut self) {
        self.regs.write8(Register::DCNTL, self.rv_dcntl | Dcntl::STD.bits());
    }

    /// clear_fifos discards the DMA and SCSI FIFOs.
    ///
    pub(crate) fn clear_fifos(&mut self) {
        self.regs.write8(Register::CTEST3, self.rv_ctest3 | Ctest3::CLF.bits());
        self.regs.write8(Register::STEST3, (Stest3::TE | Stest3::CSF).bits());
    }

    /// signal_stop asks SCRIPTS to stop and call back
    /// for task recovery.
    ///
    pub(crate) fn signal_stop(&mut self) {
        self.istat_sem = Istat::SEM;
        self.regs.write8(Register::ISTAT, (Istat::SIGP | Istat::SEM).bits());
    }

    /// sdid returns the SCSI id SCRIPTS last selected
    /// or was reselected by, as the chip reports it.
    ///
    pub(crate) fn sdid(&mut self) -> u8 {
        self.regs.read8(Register::SDID) & 0x0f
    }

    /// current_target returns the target SCRIPTS is
    /// talking to, if it is one we know about.
    ///
    pub(crate) fn current_target(&mut self) -> Option<u8> {
        let target = self.sdid();
        if (target as usize) < self.targets.len() {
            Some(target)
        } else {
            None
        }
    }

    /// squeue_position returns the start queue slot
    /// SCRIPTS will start next, as it saved it in
    /// SCRATCHA before interrupting.
    ///
    pub(crate) fn squeue_position(&mut self) -> usize {
        let addr = self.regs.read32(Register::SCRATCHA);
        self.squeue.position(addr).unwrap_or_else(|| self.squeue.put())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::by_name;
    use crate::testing::MockChip;

    #[test]
    fn clock_divisors() {
        let c875 = by_name("875").unwrap();
        let limits = TransferLimits::new(c875, c875.scsi_clock_khz());
        assert_eq!(async_divisor(&limits), 5);

        let c810 = by_name("810").unwrap();
        let limits = TransferLimits::new(c810, c810.scsi_clock_khz());
        assert_eq!(async_divisor(&limits), 3);
    }

    #[test]
    fn bad_configs() {
        let c810 = by_name("810").unwrap();
        let config = Config::default();
        assert_eq!(
            Hcb::new(MockChip::new(), c810, config.clone()).err(),
            Some(Error::BadConfig("target count not supported by chip"))
        );

        let c875 = by_name("875").unwrap();
        let config = Config {
            host_id: 16,
            ..Config::default()
        };
        assert!(Hcb::new(MockChip::new(), c875, config).is_err());

        let hcb = Hcb::new(MockChip::new(), c875, Config::default()).unwrap();
        assert_eq!(hcb.targets.len(), 16);
        assert_eq!(hcb.targets[0].wval, hcb.rv_scntl3);
        assert_eq!(hcb.targets[0].goal.transfer.offset, hcb.limits.maxoffs);
        assert_eq!(hcb.squeue.len(), 2 * Config::default().max_queue);

        let config = Config {
            max_queue: 2,
            ..Config::default()
        };
        assert_eq!(
            Hcb::new(MockChip::new(), c875, config).err(),
            Some(Error::BadConfig("queue sizes too small"))
        );
    }

    #[test]
    fn ccbs_fit_start_queue() {
        let c875 = by_name("875").unwrap();
        let config = Config {
            max_queue: 16,
            ccb_count: 64,
            ..Config::default()
        };
        let hcb = Hcb::new(MockChip::new(), c875, config).unwrap();
        assert_eq!(hcb.config.ccb_count, 14);
        assert_eq!(hcb.ccbs.free.len(), 14);
    }
}
