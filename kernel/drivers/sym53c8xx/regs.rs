// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Names the chip registers used by the driver and defines
//! the [`Registers`] trait through which they are accessed.
//!
//! The driver never touches a raw address. The bus glue
//! (memory-mapped or port I/O, with whatever byte swapping
//! the platform needs) implements `Registers`, and the
//! driver refers to each register by name.

use bitflags::bitflags;

/// A chip register, identified by its offset into the
/// operating register set.
///
/// Several registers are also used as scratch storage
/// shared with SCRIPTS, so some offsets have more than
/// one name.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Register(pub u16);

impl Register {
    pub const SCNTL0: Register = Register(0x00);
    pub const SCNTL1: Register = Register(0x01);
    pub const SCNTL2: Register = Register(0x02);
    pub const SCNTL3: Register = Register(0x03);
    pub const SCID: Register = Register(0x04);
    pub const SXFER: Register = Register(0x05);
    pub const SDID: Register = Register(0x06);
    pub const SOCL: Register = Register(0x09);
    pub const SBCL: Register = Register(0x0b);
    pub const DSTAT: Register = Register(0x0c);
    pub const SSTAT0: Register = Register(0x0d);
    pub const SSTAT1: Register = Register(0x0e);
    pub const SSTAT2: Register = Register(0x0f);
    pub const DSA: Register = Register(0x10);
    pub const ISTAT: Register = Register(0x14);
    pub const ISTAT1: Register = Register(0x15);
    pub const MBOX1: Register = Register(0x17);
    pub const CTEST3: Register = Register(0x1b);
    pub const TEMP: Register = Register(0x1c);
    pub const DFIFO: Register = Register(0x20);
    pub const CTEST4: Register = Register(0x21);
    pub const CTEST5: Register = Register(0x22);
    pub const DBC: Register = Register(0x24);
    pub const DCMD: Register = Register(0x27);
    pub const DSP: Register = Register(0x2c);
    pub const DSPS: Register = Register(0x30);
    pub const SCRATCHA: Register = Register(0x34);
    pub const DMODE: Register = Register(0x38);
    pub const DIEN: Register = Register(0x39);
    pub const DCNTL: Register = Register(0x3b);
    pub const SIEN: Register = Register(0x40);
    pub const SIST: Register = Register(0x42);
    pub const STIME0: Register = Register(0x48);
    pub const RESPID: Register = Register(0x4a);
    pub const STEST2: Register = Register(0x4e);
    pub const STEST3: Register = Register(0x4f);
    pub const STEST4: Register = Register(0x52);
    pub const SBDL: Register = Register(0x58);
    pub const SCRATCHB: Register = Register(0x5c);
    pub const SCNTL4: Register = Register(0xbc);
    pub const DFBC: Register = Register(0xf0);

    // The bytes of SCRATCHA hold the state SCRIPTS keeps
    // for the current nexus.

    /// Extended host status.
    pub const HX_PRT: Register = Register(0x34);

    /// Host status of the current job.
    pub const HS_PRT: Register = Register(0x35);

    /// SCSI status of the current job.
    pub const SS_PRT: Register = Register(0x36);

    /// Host flags of the current job.
    pub const HF_PRT: Register = Register(0x37);
}

/// Gives the driver access to a chip's registers.
///
pub trait Registers {
    fn read8(&mut self, reg: Register) -> u8;
    fn read16(&mut self, reg: Register) -> u16;
    fn read32(&mut self, reg: Register) -> u32;
    fn write8(&mut self, reg: Register, value: u8);
    fn write16(&mut self, reg: Register, value: u16);
    fn write32(&mut self, reg: Register, value: u32);

    /// Sets the given bits in an 8-bit register.
    ///
    fn set_bits8(&mut self, reg: Register, bits: u8) {
        let value = self.read8(reg);
        self.write8(reg, value | bits);
    }

    /// Clears the given bits in an 8-bit register.
    ///
    fn clear_bits8(&mut self, reg: Register, bits: u8) {
        let value = self.read8(reg);
        self.write8(reg, value & !bits);
    }

    /// Returns whether the bus the chip sits on has
    /// gone away, in which case every register reads
    /// as all ones.
    ///
    fn channel_offline(&self) -> bool {
        false
    }

    /// Waits for at least `micros` microseconds.
    ///
    fn delay(&mut self, _micros: u32) {}
}

bitflags! {
    /// The interrupt status register.
    ///
    pub struct Istat: u8 {
        /// DMA interrupt pending.
        const DIP = 0x01;

        /// SCSI interrupt pending.
        const SIP = 0x02;

        /// Interrupt on the fly: SCRIPTS has put
        /// completed jobs into the done queue.
        const INTF = 0x04;

        /// Connected to the SCSI bus.
        const CON = 0x08;

        /// Semaphore, used to ask SCRIPTS to stop
        /// in its scheduler.
        const SEM = 0x10;

        /// Signal process, which wakes SCRIPTS up.
        const SIGP = 0x20;

        /// Software reset.
        const SRST = 0x40;

        /// Abort the current operation.
        const CABRT = 0x80;
    }
}

bitflags! {
    /// The second interrupt status register,
    /// present on chips with the ISTAT1 feature.
    ///
    pub struct Istat1: u8 {
        /// SCRIPTS is running.
        const SCRUN = 0x08;
    }
}

bitflags! {
    /// The SCSI interrupt status registers, SIST0
    /// and SIST1, read as a single 16-bit value.
    ///
    pub struct Sist: u16 {
        const PAR = 0x0001;
        const RST = 0x0002;
        const UDC = 0x0004;
        const SGE = 0x0008;
        const RSL = 0x0010;
        const SEL = 0x0020;
        const CMP = 0x0040;
        const MA = 0x0080;
        const HTH = 0x0100;
        const GEN = 0x0200;
        const STO = 0x0400;
        const SBMC = 0x1000;
    }
}

bitflags! {
    /// The DMA status register.
    ///
    pub struct Dstat: u8 {
        const IID = 0x01;
        const SIR = 0x04;
        const SSI = 0x08;
        const ABRT = 0x10;
        const BF = 0x20;
        const MDPE = 0x40;
        const DFE = 0x80;
    }
}

bitflags! {
    /// SCSI status 0.
    ///
    pub struct Sstat0: u8 {
        const SDP0 = 0x01;
        const RST = 0x02;
        const OLF = 0x20;
        const ORF = 0x40;
        const ILF = 0x80;
    }
}

bitflags! {
    /// SCSI status 2, which holds the upper byte
    /// of the SCSI latches on wide chips.
    ///
    pub struct Sstat2: u8 {
        const SDP1 = 0x01;
        const LDSC = 0x02;
        const OLF1 = 0x20;
        const ORF1 = 0x40;
        const ILF1 = 0x80;
    }
}

bitflags! {
    /// SCSI control 1.
    ///
    pub struct Scntl1: u8 {
        const ISCON = 0x10;
        const CRST = 0x08;
    }
}

bitflags! {
    /// SCSI control 2.
    ///
    pub struct Scntl2: u8 {
        /// Wide SCSI receive: a byte of a wide
        /// transfer is held in the SWIDE register.
        const WSR = 0x01;

        /// Wide SCSI send.
        const WSS = 0x08;
    }
}

bitflags! {
    /// SCSI control 3.
    ///
    pub struct Scntl3: u8 {
        const EWS = 0x08;
        const ULTRA = 0x80;
    }
}

bitflags! {
    /// SCSI control 4, present on the C1010.
    ///
    pub struct Scntl4: u8 {
        const XCLKS_ST = 0x01;
        const XCLKS_DT = 0x02;
        const XCLKH_ST = 0x04;
        const XCLKH_DT = 0x08;
        const AIPCKEN = 0x40;
        const U3EN = 0x80;
    }
}

bitflags! {
    /// DMA control.
    ///
    pub struct Dcntl: u8 {
        const NOCOM = 0x01;
        const STD = 0x04;
        const IRQM = 0x08;
    }
}

bitflags! {
    /// Chip test 3.
    ///
    pub struct Ctest3: u8 {
        /// Clear the DMA FIFO.
        const CLF = 0x04;
    }
}

bitflags! {
    /// Chip test 5.
    ///
    pub struct Ctest5: u8 {
        /// The DMA FIFO is 536 bytes long.
        const DFS = 0x20;
    }
}

bitflags! {
    /// SCSI test 2.
    ///
    pub struct Stest2: u8 {
        /// Extended REQ/ACK filtering.
        const EXT = 0x02;
    }
}

bitflags! {
    /// SCSI test 3.
    ///
    pub struct Stest3: u8 {
        /// Clear the SCSI FIFO.
        const CSF = 0x02;

        /// TolerANT enable.
        const TE = 0x80;
    }
}

/// The electrical mode of the SCSI bus, reported
/// in STEST4.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusMode {
    HighVoltageDifferential,
    SingleEnded,
    LowVoltageDifferential,
    Unknown,
}

impl BusMode {
    const MASK: u8 = 0xc0;

    /// Decodes the bus mode from an STEST4 value.
    ///
    pub fn from_stest4(stest4: u8) -> Self {
        match stest4 & Self::MASK {
            0x40 => BusMode::HighVoltageDifferential,
            0x80 => BusMode::SingleEnded,
            0xc0 => BusMode::LowVoltageDifferential,
            _ => BusMode::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BusMode::HighVoltageDifferential => "HVD",
            BusMode::SingleEnded => "SE",
            BusMode::LowVoltageDifferential => "LVD",
            BusMode::Unknown => "??",
        }
    }
}
