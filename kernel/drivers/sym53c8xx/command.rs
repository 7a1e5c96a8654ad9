// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The interface between the host adapter and the upper
//! layers: the commands they submit, the results the
//! adapter returns, and the [`Midlayer`] callbacks.

use alloc::vec::Vec;
use scsi::message::TaskAttribute;
use scsi::HostByte;

/// Identifies a command submitted by the upper layers.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

/// The direction of a command's data transfer.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataDirection {
    None,
    In,
    Out,
}

/// A physically contiguous piece of a command's
/// data buffer.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u32,
    pub len: u32,
}

/// A SCSI command to run on a target.
///
#[derive(Clone, Debug)]
pub struct Command {
    pub id: CommandId,
    pub target: u8,
    pub lun: u8,

    // cdb is the command descriptor block.
    pub cdb: Vec<u8>,

    pub direction: DataDirection,
    pub segments: Vec<DmaSegment>,

    // tag_order is None for untagged commands.
    pub tag_order: Option<TaskAttribute>,

    // scsi_level is the SCSI version the device
    // claims, with SCSI-2 as 2.
    pub scsi_level: u8,
}

impl Command {
    /// Returns the total length of the data buffer.
    ///
    pub fn data_len(&self) -> u32 {
        self.segments.iter().map(|seg| seg.len).sum()
    }
}

/// The outcome of a command.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub host: HostByte,

    // status is the SCSI status byte.
    pub status: u8,

    // resid is the number of bytes not transferred.
    // It can be negative when the target sent more
    // than was asked for.
    pub resid: i32,

    // sense holds the sense data fetched after a
    // CHECK CONDITION.
    pub sense: Option<Vec<u8>>,
}

/// A finished command.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub id: CommandId,
    pub result: CommandResult,
}

/// Receives completions and bus events from the host
/// adapter.
///
/// Callbacks are made without the adapter's lock held,
/// so they may submit new commands.
///
pub trait Midlayer {
    /// Called once for each finished command.
    ///
    fn done(&mut self, completion: Completion);

    /// Called after the SCSI bus has been reset.
    ///
    fn bus_reset(&mut self) {}
}
