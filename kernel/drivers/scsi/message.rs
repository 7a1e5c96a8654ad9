// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! SCSI messages, exchanged during the MESSAGE IN and
//! MESSAGE OUT phases of a parallel SCSI bus.
//!
//! Single-byte messages are plain constants. The
//! extended messages used to negotiate transfer
//! parameters (SDTR, WDTR and PPR) have builders that
//! write the message into a caller-supplied buffer and
//! return its length.

use bitflags::bitflags;

pub const COMPLETE: u8 = 0x00;
pub const EXTENDED: u8 = 0x01;
pub const SAVE_DP: u8 = 0x02;
pub const RESTORE_DP: u8 = 0x03;
pub const DISCONNECT: u8 = 0x04;
pub const INITIATOR_DETECTED_ERROR: u8 = 0x05;
pub const ABORT: u8 = 0x06;
pub const REJECT: u8 = 0x07;
pub const NOOP: u8 = 0x08;
pub const PARITY_ERROR: u8 = 0x09;
pub const BUS_DEVICE_RESET: u8 = 0x0c;
pub const ABORT_TAG: u8 = 0x0d;
pub const CLEAR_QUEUE: u8 = 0x0e;
pub const SIMPLE_TAG: u8 = 0x20;
pub const HEAD_TAG: u8 = 0x21;
pub const ORDERED_TAG: u8 = 0x22;
pub const IGNORE_WIDE_RESIDUE: u8 = 0x23;

/// The IDENTIFY bit. Any message byte with
/// the top bit set is an IDENTIFY message.
///
pub const IDENTIFY: u8 = 0x80;

/// Extended message codes, found in the third
/// byte of an EXTENDED message.
///
pub mod extended {
    pub const MODIFY_DP: u8 = 0x00;
    pub const SDTR: u8 = 0x01;
    pub const WDTR: u8 = 0x03;
    pub const PPR: u8 = 0x04;
}

/// Returns the IDENTIFY message for `lun`,
/// optionally granting the target the right to
/// disconnect.
///
pub fn identify(can_disconnect: bool, lun: u8) -> u8 {
    IDENTIFY | if can_disconnect { 0x40 } else { 0x00 } | (lun & 0x07)
}

/// Returns whether `msg` is an IDENTIFY message.
///
pub fn is_identify(msg: u8) -> bool {
    msg & IDENTIFY != 0
}

/// A task attribute, sent as the first byte of a
/// two byte queue tag message.
///
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskAttribute {
    Simple = SIMPLE_TAG as isize,
    HeadOfQueue = HEAD_TAG as isize,
    Ordered = ORDERED_TAG as isize,
}

impl TaskAttribute {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// The protocol options byte of a PPR message.
    ///
    pub struct PprOptions: u8 {
        /// Information units.
        const IU = 0x01;

        /// Double transition clocking.
        const DT = 0x02;

        /// Quick arbitration and selection.
        const QAS = 0x04;
    }
}

/// Writes a SYNCHRONOUS DATA TRANSFER REQUEST
/// message into `buf`, returning its length.
///
/// # Panics
///
/// `populate_sync` will panic if `buf` is shorter
/// than 5 bytes.
///
pub fn populate_sync(buf: &mut [u8], period: u8, offset: u8) -> usize {
    buf[0] = EXTENDED;
    buf[1] = 3; // Length.
    buf[2] = extended::SDTR;
    buf[3] = period;
    buf[4] = offset;
    5
}

/// Writes a WIDE DATA TRANSFER REQUEST message
/// into `buf`, returning its length.
///
/// `width` is the transfer width exponent, so
/// 0 means 8 bits and 1 means 16 bits.
///
/// # Panics
///
/// `populate_width` will panic if `buf` is
/// shorter than 4 bytes.
///
pub fn populate_width(buf: &mut [u8], width: u8) -> usize {
    buf[0] = EXTENDED;
    buf[1] = 2; // Length.
    buf[2] = extended::WDTR;
    buf[3] = width;
    4
}

/// Writes a PARALLEL PROTOCOL REQUEST message
/// into `buf`, returning its length.
///
/// # Panics
///
/// `populate_ppr` will panic if `buf` is shorter
/// than 8 bytes.
///
pub fn populate_ppr(buf: &mut [u8], period: u8, offset: u8, width: u8, opts: PprOptions) -> usize {
    buf[0] = EXTENDED;
    buf[1] = 6; // Length.
    buf[2] = extended::PPR;
    buf[3] = period;
    buf[4] = 0; // Reserved.
    buf[5] = offset;
    buf[6] = width;
    buf[7] = opts.bits();
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_messages() {
        assert_eq!(identify(true, 0), 0xc0);
        assert_eq!(identify(false, 3), 0x83);
        assert!(is_identify(identify(false, 0)));
        assert!(!is_identify(ABORT));
    }

    #[test]
    fn negotiation_messages() {
        let mut buf = [0u8; 8];
        assert_eq!(populate_sync(&mut buf[..], 12, 16), 5);
        assert_eq!(&buf[..5], &[0x01, 3, 0x01, 12, 16]);

        assert_eq!(populate_width(&mut buf[..], 1), 4);
        assert_eq!(&buf[..4], &[0x01, 2, 0x03, 1]);

        let opts = PprOptions::DT | PprOptions::QAS;
        assert_eq!(populate_ppr(&mut buf[..], 9, 62, 1, opts), 8);
        assert_eq!(buf, [0x01, 6, 0x04, 9, 0, 62, 1, 0x06]);
    }
}
