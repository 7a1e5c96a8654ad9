// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Status values returned with a completed command.

/// A SCSI status code, as returned by the target
/// in the STATUS phase.
///
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StatusCode {
    Good = 0x00,
    CheckCondition = 0x02,
    ConditionMet = 0x04,
    Busy = 0x08,
    Intermediate = 0x10,
    IntermediateConditionMet = 0x14,
    ReservationConflict = 0x18,
    CommandTerminated = 0x22,
    TaskSetFull = 0x28,
    AcaActive = 0x30,
    TaskAborted = 0x40,
}

impl StatusCode {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0x00 => Some(StatusCode::Good),
            0x02 => Some(StatusCode::CheckCondition),
            0x04 => Some(StatusCode::ConditionMet),
            0x08 => Some(StatusCode::Busy),
            0x10 => Some(StatusCode::Intermediate),
            0x14 => Some(StatusCode::IntermediateConditionMet),
            0x18 => Some(StatusCode::ReservationConflict),
            0x22 => Some(StatusCode::CommandTerminated),
            0x28 => Some(StatusCode::TaskSetFull),
            0x30 => Some(StatusCode::AcaActive),
            0x40 => Some(StatusCode::TaskAborted),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The host adapter's view of how a command ended,
/// independent of the target's SCSI status.
///
/// The values match the host byte used by the Linux
/// SCSI midlayer, so upper layers can apply their
/// usual retry policy.
///
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HostByte {
    /// The command reached the target; see the
    /// SCSI status.
    Ok = 0x00,

    /// The target did not answer selection.
    NoConnect = 0x01,

    BusBusy = 0x02,

    /// The command was cancelled after a software
    /// timeout.
    TimeOut = 0x03,

    BadTarget = 0x04,

    /// The command was cancelled on request.
    Abort = 0x05,

    /// A parity error was detected.
    Parity = 0x06,

    /// Some other transport error occurred.
    Error = 0x07,

    /// The command was lost to a bus or device
    /// reset.
    Reset = 0x08,

    BadInterrupt = 0x09,

    /// The command did not complete, but may be
    /// retried safely.
    SoftError = 0x0b,

    Requeue = 0x0d,
}

impl HostByte {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
