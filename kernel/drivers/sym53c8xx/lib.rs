// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the host side of the Symbios/LSI 53C8XX family
//! of parallel SCSI host bus adapters.
//!
//! The chips in this family run a small program, called
//! SCRIPTS, on an on-chip processor. SCRIPTS selects targets,
//! moves data and handles most message exchanges without the
//! host's help. The host and SCRIPTS share two rings of bus
//! addresses in memory: the start queue, where the host
//! places the command control blocks (CCBs) of new jobs, and
//! the done queue, where SCRIPTS returns completed ones.
//!
//! Everything SCRIPTS cannot handle alone ends up as an
//! interrupt. This crate decodes those interrupts, recovers
//! from phase mismatches and bus errors, negotiates transfer
//! parameters with each target, and runs the abort protocol
//! that cancels commands on request or after a timeout.
//!
//! # Structure
//!
//! A [`Host`] wraps the host control block behind a single
//! spin lock. All state shared with SCRIPTS (the two rings,
//! the CCB pool and the per-target control blocks) is owned
//! by the host control block, so holding the lock is enough
//! to serialise every operation against other CPUs. SCRIPTS
//! itself is treated as an independent actor: the host only
//! trusts state derived from the SCRIPTS program counter when
//! it is outside the critical regions listed in
//! [`scripts::Region`], and falls back to a full bus reset
//! otherwise.
//!
//! Chip registers are reached through the [`Registers`]
//! trait, and completed commands are passed back up through
//! the [`Midlayer`] trait, after the lock has been released.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(deprecated_in_future)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(missing_abi)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod ccb;
pub mod chip;
mod command;
mod complete;
mod config;
mod hcb;
mod host;
mod intr;
mod nego;
mod phase;
mod queue;
mod recovery;
pub mod regs;
pub mod scripts;
mod sir;
mod target;

#[cfg(test)]
mod testing;

pub use command::{Command, CommandId, CommandResult, Completion, DataDirection, DmaSegment, Midlayer};
pub use config::{BusCheck, Config, ConfigError};
pub use host::{Host, IrqResult};
pub use regs::{Register, Registers};
pub use target::{DeviceCapabilities, Transfer};

use core::fmt;

/// The maximum number of tagged commands outstanding
/// on a single logical unit.
///
pub const MAX_TASK: usize = 64;

/// The size of the buffer used for automatic
/// REQUEST SENSE commands.
///
pub const SENSE_BUFFER_LEN: usize = 32;

/// Describes why a request to the host adapter was
/// refused.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The target id is out of range, or is the
    /// adapter's own id.
    InvalidTarget(u8),

    /// The logical unit number is out of range.
    InvalidLun(u8),

    /// The command descriptor block is empty or
    /// longer than the adapter can send.
    InvalidCommand,

    /// No command control block is free.
    NoCcb,

    /// The logical unit has no free tag.
    NoTag,

    /// The command has more scatter/gather segments
    /// than fit in a command control block.
    TooManySegments(usize),

    /// No outstanding command has the given id.
    NotFound,

    /// The configuration is unusable with this chip.
    BadConfig(&'static str),

    /// The SCSI bus lines were not all inactive after
    /// a bus reset.
    BusLines(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidTarget(id) => write!(f, "invalid target {}", id),
            Error::InvalidLun(lun) => write!(f, "invalid logical unit {}", lun),
            Error::InvalidCommand => write!(f, "invalid command descriptor block"),
            Error::NoCcb => write!(f, "no free command control block"),
            Error::NoTag => write!(f, "no free tag"),
            Error::TooManySegments(n) => write!(f, "too many data segments: {}", n),
            Error::NotFound => write!(f, "command not found"),
            Error::BadConfig(why) => write!(f, "bad configuration: {}", why),
            Error::BusLines(term) => write!(f, "bus lines stuck after reset: {:#x}", term),
        }
    }
}
