// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides types and functions for the SCSI driver
//! protocol, as seen from a parallel SCSI initiator.
//!
//! This covers the command descriptor blocks a host
//! adapter builds itself (such as the automatic REQUEST
//! SENSE), the status and host result bytes returned to
//! the upper layers, the messages exchanged during the
//! MESSAGE phases, and sense data parsing.

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

pub mod message;
mod sense;
mod status;

pub use sense::{parse_sense_data, AdditionalSense, SenseKey};
pub use status::{HostByte, StatusCode};

/// A SCSI operation code.
///
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationCode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    Read10 = 0x28,
    Write10 = 0x2a,
}

/// Represents a SCSI command descriptor block structure.
///
pub trait CommandDescriptorBlock {
    /// Copy the command descriptor block into the given
    /// buffer.
    ///
    fn serialise(&self, buffer: &mut [u8]);

    /// Returns the number of bytes written by
    /// [`serialise`](Self::serialise).
    ///
    fn len(&self) -> usize;
}

fn check_len(buffer: &[u8], need: usize) {
    if buffer.len() < need {
        panic!(
            "command descriptor block is {} bytes long, need {}",
            buffer.len(),
            need
        );
    }
}

/// The TEST UNIT READY command.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct TestUnitReady;

impl TestUnitReady {
    const CDB_LEN: usize = 6;
}

impl CommandDescriptorBlock for TestUnitReady {
    fn serialise(&self, buffer: &mut [u8]) {
        check_len(buffer, Self::CDB_LEN);
        buffer[..Self::CDB_LEN].fill(0); // Operation code, reserved and control are all zero.
    }

    fn len(&self) -> usize {
        Self::CDB_LEN
    }
}

/// The REQUEST SENSE command.
///
/// Host adapters issue this on their own when a
/// command ends with CHECK CONDITION, so the sense
/// data can be returned with the failed command.
///
#[derive(Clone, Copy, Debug)]
pub struct RequestSense {
    // lun is encoded in byte 1 for SCSI-2 devices,
    // which predate the IDENTIFY-only addressing.
    lun: Option<u8>,
    allocation_length: u8,
}

impl RequestSense {
    const CDB_LEN: usize = 6;

    /// Returns a REQUEST SENSE for `allocation_length`
    /// bytes. When `legacy_lun` is given, the LUN is
    /// also encoded in the CDB, as SCSI-2 targets
    /// expect.
    ///
    pub fn new(legacy_lun: Option<u8>, allocation_length: u8) -> Self {
        RequestSense {
            lun: legacy_lun,
            allocation_length,
        }
    }
}

impl CommandDescriptorBlock for RequestSense {
    fn serialise(&self, buffer: &mut [u8]) {
        check_len(buffer, Self::CDB_LEN);
        buffer[0] = OperationCode::RequestSense as u8; // Operation code.
        buffer[1] = match self.lun {
            Some(lun) if lun <= 7 => lun << 5, // LUN, desc bit clear.
            _ => 0x00,
        };
        buffer[2] = 0x00; // Reserved.
        buffer[3] = 0x00; // Reserved.
        buffer[4] = self.allocation_length; // Allocation length.
        buffer[5] = 0x00; // Control.
    }

    fn len(&self) -> usize {
        Self::CDB_LEN
    }
}

/// The READ(10) command.
///
#[derive(Clone, Copy, Debug)]
pub struct Read10 {
    logical_block_address: u32,
    transfer_length: u16,
}

impl Read10 {
    const CDB_LEN: usize = 10;

    pub fn new(logical_block_address: u32, transfer_length: u16) -> Self {
        Read10 {
            logical_block_address,
            transfer_length,
        }
    }
}

impl CommandDescriptorBlock for Read10 {
    fn serialise(&self, buffer: &mut [u8]) {
        check_len(buffer, Self::CDB_LEN);
        buffer[0] = OperationCode::Read10 as u8; // Operation code.
        buffer[1] = 0x00; // Rdprotect, DPO, FUA, RARC.
        buffer[2..(2 + 4)].copy_from_slice(&self.logical_block_address.to_be_bytes());
        buffer[6] = 0x00; // Group number.
        buffer[7..(7 + 2)].copy_from_slice(&self.transfer_length.to_be_bytes());
        buffer[9] = 0x00; // Control.
    }

    fn len(&self) -> usize {
        Self::CDB_LEN
    }
}

/// The WRITE(10) command.
///
#[derive(Clone, Copy, Debug)]
pub struct Write10 {
    logical_block_address: u32,
    transfer_length: u16,
}

impl Write10 {
    const CDB_LEN: usize = 10;

    pub fn new(logical_block_address: u32, transfer_length: u16) -> Self {
        Write10 {
            logical_block_address,
            transfer_length,
        }
    }
}

impl CommandDescriptorBlock for Write10 {
    fn serialise(&self, buffer: &mut [u8]) {
        check_len(buffer, Self::CDB_LEN);
        buffer[0] = OperationCode::Write10 as u8; // Operation code.
        buffer[1] = 0x00; // Wrprotect, DPO, FUA.
        buffer[2..(2 + 4)].copy_from_slice(&self.logical_block_address.to_be_bytes());
        buffer[6] = 0x00; // Group number.
        buffer[7..(7 + 2)].copy_from_slice(&self.transfer_length.to_be_bytes());
        buffer[9] = 0x00; // Control.
    }

    fn len(&self) -> usize {
        Self::CDB_LEN
    }
}
