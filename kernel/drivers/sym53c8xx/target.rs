// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Per-target and per-logical unit control blocks.

use crate::ccb::{CcbIndex, Nego};
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// What a device is known to support, as reported
/// by its INQUIRY data.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub sync: bool,
    pub wide: bool,
    pub dt: bool,
    pub dt_only: bool,
    pub ppr: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        DeviceCapabilities {
            sync: true,
            wide: true,
            dt: false,
            dt_only: false,
            ppr: false,
        }
    }
}

/// A set of transfer parameters: either the goal
/// to negotiate or the values in use.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transfer {
    // period is the SCSI period factor.
    pub period: u8,

    // offset is the synchronous offset, with 0
    // meaning asynchronous.
    pub offset: u8,

    // width is the width exponent.
    pub width: u8,

    pub iu: bool,
    pub dt: bool,
    pub qas: bool,
}

/// The negotiation goal for a target.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferGoal {
    pub transfer: Transfer,

    // check_nego requests a negotiation with the
    // next command.
    pub check_nego: bool,

    // renego is the message used by the last
    // successful negotiation, to be used again.
    pub renego: Option<Nego>,
}

/// A logical unit control block.
///
#[derive(Debug)]
pub struct Lcb {
    // to_clear asks the abort machine to send
    // ABORT to the logical unit.
    pub(crate) to_clear: bool,

    // Tagged and untagged commands in use.
    pub(crate) busy_itl: u16,
    pub(crate) busy_itlq: u16,

    // Commands in the start queue or on the bus.
    pub(crate) started_tags: u16,
    pub(crate) started_no_tag: u16,
    pub(crate) started_max: u16,
    pub(crate) started_limit: u16,

    // num_sgood counts good completions since
    // the queue depth was last reduced.
    pub(crate) num_sgood: u16,

    pub(crate) waiting: VecDeque<CcbIndex>,
    pub(crate) started: VecDeque<CcbIndex>,

    // The circular tag allocator.
    cb_tags: Vec<u8>,
    ia_tag: usize,
    if_tag: usize,

    // Reselection paths read by SCRIPTS.
    pub(crate) itlq_tbl: Vec<u32>,
    pub(crate) itl_task_sa: u32,
    pub(crate) resel_sa: u32,

    // Ordered tag insertion state.
    pub(crate) tags_since: u32,
    pub(crate) tags_sum: [u32; 2],
    pub(crate) tags_si: usize,
}

impl Lcb {
    /// Returns a logical unit with no commands and
    /// every reselection path pointing at the bad
    /// path handlers given.
    ///
    pub fn new(max_tags: u16, bad_itl: u32, bad_itlq: u32, bad_lun: u32) -> Self {
        Lcb {
            to_clear: false,
            busy_itl: 0,
            busy_itlq: 0,
            started_tags: 0,
            started_no_tag: 0,
            started_max: max_tags.max(1),
            started_limit: max_tags.max(1),
            num_sgood: 0,
            waiting: VecDeque::new(),
            started: VecDeque::new(),
            cb_tags: (0..crate::MAX_TASK as u8).collect(),
            ia_tag: 0,
            if_tag: 0,
            itlq_tbl: alloc::vec![bad_itlq; crate::MAX_TASK],
            itl_task_sa: bad_itl,
            resel_sa: bad_lun,
            tags_since: 0,
            tags_sum: [0; 2],
            tags_si: 0,
        }
    }

    /// Takes the next free tag, if fewer than
    /// `MAX_TASK` are in use.
    ///
    pub fn alloc_tag(&mut self) -> Option<u8> {
        if self.busy_itlq as usize >= crate::MAX_TASK {
            return None;
        }

        let tag = self.cb_tags[self.ia_tag];
        self.ia_tag = (self.ia_tag + 1) % crate::MAX_TASK;
        self.busy_itlq += 1;
        Some(tag)
    }

    /// Returns a tag to the allocator.
    ///
    pub fn free_tag(&mut self, tag: u8) {
        self.cb_tags[self.if_tag] = tag;
        self.if_tag = (self.if_tag + 1) % crate::MAX_TASK;
        self.busy_itlq = self.busy_itlq.saturating_sub(1);
    }

    /// Returns whether the logical unit has no
    /// command in use.
    ///
    pub fn is_idle(&self) -> bool {
        self.busy_itl == 0 && self.busy_itlq == 0
    }
}

/// A target control block.
///
#[derive(Debug)]
pub struct Tcb {
    // Register shadows loaded before talking to
    // the target: SXFER, SCNTL3 and SCNTL4.
    pub(crate) sval: u8,
    pub(crate) wval: u8,
    pub(crate) uval: u8,

    pub(crate) goal: TransferGoal,

    // current holds the parameters in use.
    pub(crate) current: Transfer,

    // nego_cp is the CCB carrying the current
    // negotiation, if any.
    pub(crate) nego_cp: Option<CcbIndex>,

    // to_reset asks the abort machine to send a
    // BUS DEVICE RESET.
    pub(crate) to_reset: bool,

    pub(crate) caps: DeviceCapabilities,

    pub(crate) luns: Vec<Option<Lcb>>,
}

impl Tcb {
    pub fn new(max_lun: u8, wval: u8, goal: Transfer) -> Self {
        let mut luns = Vec::with_capacity(max_lun as usize);
        luns.resize_with(max_lun as usize, || None);
        Tcb {
            sval: 0,
            wval,
            uval: 0,
            goal: TransferGoal {
                transfer: goal,
                check_nego: true,
                renego: None,
            },
            current: Transfer::default(),
            nego_cp: None,
            to_reset: false,
            caps: DeviceCapabilities::default(),
            luns,
        }
    }

    /// Returns the logical unit's control block,
    /// if it has been allocated.
    ///
    pub fn lun(&self, lun: u8) -> Option<&Lcb> {
        self.luns.get(lun as usize).and_then(|lcb| lcb.as_ref())
    }

    pub fn lun_mut(&mut self, lun: u8) -> Option<&mut Lcb> {
        self.luns.get_mut(lun as usize).and_then(|lcb| lcb.as_mut())
    }

    /// Returns the first logical unit waiting to be
    /// cleared.
    ///
    pub fn lun_to_clear(&self) -> Option<u8> {
        self.luns
            .iter()
            .position(|lcb| lcb.as_ref().map(|lcb| lcb.to_clear).unwrap_or(false))
            .map(|lun| lun as u8)
    }

    /// Returns whether the target needs attention
    /// from the abort machine.
    ///
    pub fn needs_recovery(&self) -> bool {
        self.to_reset || self.lun_to_clear().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_allocator() {
        let mut lcb = Lcb::new(16, 1, 2, 3);
        let mut tags = Vec::new();
        for _ in 0..crate::MAX_TASK {
            tags.push(lcb.alloc_tag().unwrap());
        }

        assert_eq!(lcb.alloc_tag(), None);
        assert_eq!(tags[0], 0);
        assert_eq!(tags[crate::MAX_TASK - 1], (crate::MAX_TASK - 1) as u8);

        // Freed tags are reused in the order freed.
        lcb.free_tag(7);
        lcb.free_tag(3);
        assert_eq!(lcb.alloc_tag(), Some(7));
        assert_eq!(lcb.alloc_tag(), Some(3));
        assert!(!lcb.is_idle());
    }

    #[test]
    fn recovery_flags() {
        let mut tcb = Tcb::new(8, 0, Transfer::default());
        assert!(!tcb.needs_recovery());
        tcb.luns[5] = Some(Lcb::new(4, 0, 0, 0));
        tcb.lun_mut(5).unwrap().to_clear = true;
        assert_eq!(tcb.lun_to_clear(), Some(5));
        assert!(tcb.needs_recovery());
        assert!(tcb.lun(2).is_none());
    }
}
