// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the members of the 53C8XX family.
//!
//! Each chip family is a [`ChipInfo`] entry in [`CHIPS`],
//! carrying its feature flags and transfer capabilities.
//! Behaviour that differs between families is derived from
//! the entry once (see [`FifoCounter`] and [`TransferLimits`])
//! instead of being tested feature bit by feature bit at
//! each use.

use bitflags::bitflags;

bitflags! {
    /// Optional chip features.
    ///
    pub struct Features: u32 {
        /// Wide (16-bit) SCSI.
        const WIDE = 1 << 0;

        /// Ultra SCSI (20 MHz).
        const ULTRA = 1 << 1;

        /// Ultra2 SCSI (40 MHz).
        const ULTRA2 = 1 << 2;

        /// Ultra3 SCSI (80 MHz, double transition).
        const ULTRA3 = 1 << 3;

        /// Clock doubler.
        const DBLR = 1 << 4;

        /// Clock quadrupler.
        const QUAD = 1 << 5;

        /// Enable read line.
        const ERL = 1 << 6;

        /// Cache line size enable.
        const CLSE = 1 << 7;

        /// Burst opcode fetch.
        const BOF = 1 << 8;

        /// Large (536 byte) DMA FIFO.
        const DFS = 1 << 9;

        /// Prefetch enable.
        const PFEN = 1 << 10;

        /// LOAD/STORE instructions.
        const LDSTR = 1 << 11;

        /// On-chip SCRIPTS RAM.
        const RAM = 1 << 12;

        /// 8K of on-chip RAM.
        const RAM8K = 1 << 13;

        /// Differential SCSI.
        const DIFF = 1 << 14;

        /// SCRIPTS handles phase mismatch itself.
        const NOPM = 1 << 15;

        /// The SCSI clock multiplier reports lock.
        const LCKFRQ = 1 << 16;

        /// Immediate arbitration.
        const IARB = 1 << 17;

        /// Dual address cycle.
        const DAC = 1 << 18;

        /// Has the ISTAT1 register.
        const ISTAT1 = 1 << 19;

        /// Has the DMA FIFO byte count register.
        const DFBC = 1 << 20;

        /// The C1010 core.
        const C10 = 1 << 21;

        /// Ultra3 enable in SCNTL4.
        const U3EN = 1 << 22;

        /// 66 MHz PCI.
        const PCI66 = 1 << 23;

        /// CRC checking in DT mode.
        const CRC = 1 << 24;
    }
}

/// A chip family.
///
#[derive(Debug)]
pub struct ChipInfo {
    pub name: &'static str,

    // device_id is the PCI device id.
    pub device_id: u16,

    // revision_max is the last PCI revision
    // described by this entry.
    pub revision_max: u8,

    // burst_max is the log2 of the maximum
    // DMA burst length.
    pub burst_max: u8,

    // offset_max is the largest synchronous
    // offset in ST mode.
    pub offset_max: u8,

    // clock_divn is the number of SCSI clock
    // divisors the chip supports.
    pub clock_divn: u8,

    pub features: Features,
}

/// The chips this driver supports.
///
pub static CHIPS: [ChipInfo; 13] = [
    ChipInfo {
        name: "810",
        device_id: 0x0001,
        revision_max: 0x0f,
        burst_max: 4,
        offset_max: 8,
        clock_divn: 4,
        features: Features::ERL,
    },
    ChipInfo {
        name: "810a",
        device_id: 0x0001,
        revision_max: 0xff,
        burst_max: 4,
        offset_max: 8,
        clock_divn: 4,
        features: Features::from_bits_truncate(
            Features::ERL.bits() | Features::LDSTR.bits() | Features::PFEN.bits() | Features::BOF.bits(),
        ),
    },
    ChipInfo {
        name: "815",
        device_id: 0x0004,
        revision_max: 0xff,
        burst_max: 4,
        offset_max: 8,
        clock_divn: 4,
        features: Features::from_bits_truncate(Features::ERL.bits() | Features::BOF.bits()),
    },
    ChipInfo {
        name: "825",
        device_id: 0x0003,
        revision_max: 0x0f,
        burst_max: 6,
        offset_max: 8,
        clock_divn: 4,
        features: Features::from_bits_truncate(
            Features::WIDE.bits() | Features::ERL.bits() | Features::BOF.bits() | Features::DIFF.bits(),
        ),
    },
    ChipInfo {
        name: "825a",
        device_id: 0x0003,
        revision_max: 0xff,
        burst_max: 6,
        offset_max: 8,
        clock_divn: 4,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::BOF.bits()
                | Features::DFS.bits()
                | Features::LDSTR.bits()
                | Features::PFEN.bits()
                | Features::RAM.bits()
                | Features::DIFF.bits(),
        ),
    },
    ChipInfo {
        name: "860",
        device_id: 0x0006,
        revision_max: 0xff,
        burst_max: 4,
        offset_max: 8,
        clock_divn: 5,
        features: Features::from_bits_truncate(
            Features::ULTRA.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::LDSTR.bits()
                | Features::PFEN.bits(),
        ),
    },
    ChipInfo {
        name: "875",
        device_id: 0x000f,
        revision_max: 0x01,
        burst_max: 6,
        offset_max: 16,
        clock_divn: 5,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::ULTRA.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::DFS.bits()
                | Features::LDSTR.bits()
                | Features::PFEN.bits()
                | Features::RAM.bits()
                | Features::DIFF.bits(),
        ),
    },
    ChipInfo {
        name: "875a",
        device_id: 0x0013,
        revision_max: 0xff,
        burst_max: 6,
        offset_max: 16,
        clock_divn: 5,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::ULTRA.bits()
                | Features::DBLR.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::DFS.bits()
                | Features::LDSTR.bits()
                | Features::PFEN.bits()
                | Features::RAM.bits()
                | Features::IARB.bits()
                | Features::DIFF.bits(),
        ),
    },
    ChipInfo {
        name: "895",
        device_id: 0x000c,
        revision_max: 0xff,
        burst_max: 6,
        offset_max: 31,
        clock_divn: 7,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::ULTRA2.bits()
                | Features::QUAD.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::DFS.bits()
                | Features::RAM.bits()
                | Features::LCKFRQ.bits(),
        ),
    },
    ChipInfo {
        name: "895a",
        device_id: 0x0012,
        revision_max: 0xff,
        burst_max: 6,
        offset_max: 31,
        clock_divn: 7,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::ULTRA2.bits()
                | Features::QUAD.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::DFS.bits()
                | Features::RAM.bits()
                | Features::RAM8K.bits()
                | Features::NOPM.bits()
                | Features::IARB.bits()
                | Features::DAC.bits()
                | Features::LCKFRQ.bits(),
        ),
    },
    ChipInfo {
        name: "896",
        device_id: 0x000b,
        revision_max: 0xff,
        burst_max: 7,
        offset_max: 31,
        clock_divn: 7,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::ULTRA2.bits()
                | Features::QUAD.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::DFS.bits()
                | Features::LDSTR.bits()
                | Features::PFEN.bits()
                | Features::RAM.bits()
                | Features::RAM8K.bits()
                | Features::NOPM.bits()
                | Features::IARB.bits()
                | Features::DAC.bits()
                | Features::LCKFRQ.bits(),
        ),
    },
    ChipInfo {
        name: "1010-33",
        device_id: 0x0020,
        revision_max: 0xff,
        burst_max: 7,
        offset_max: 31,
        clock_divn: 7,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::ULTRA3.bits()
                | Features::QUAD.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::DFBC.bits()
                | Features::LDSTR.bits()
                | Features::PFEN.bits()
                | Features::RAM.bits()
                | Features::RAM8K.bits()
                | Features::NOPM.bits()
                | Features::IARB.bits()
                | Features::DAC.bits()
                | Features::ISTAT1.bits()
                | Features::CRC.bits()
                | Features::C10.bits()
                | Features::U3EN.bits(),
        ),
    },
    ChipInfo {
        name: "1010-66",
        device_id: 0x0021,
        revision_max: 0xff,
        burst_max: 7,
        offset_max: 31,
        clock_divn: 7,
        features: Features::from_bits_truncate(
            Features::WIDE.bits()
                | Features::ULTRA3.bits()
                | Features::QUAD.bits()
                | Features::CLSE.bits()
                | Features::BOF.bits()
                | Features::DFBC.bits()
                | Features::LDSTR.bits()
                | Features::PFEN.bits()
                | Features::RAM.bits()
                | Features::RAM8K.bits()
                | Features::NOPM.bits()
                | Features::IARB.bits()
                | Features::DAC.bits()
                | Features::ISTAT1.bits()
                | Features::CRC.bits()
                | Features::C10.bits()
                | Features::U3EN.bits()
                | Features::PCI66.bits(),
        ),
    },
];

/// Returns the chip family with the given PCI
/// device id and revision.
///
pub fn lookup(device_id: u16, revision: u8) -> Option<&'static ChipInfo> {
    CHIPS
        .iter()
        .find(|chip| chip.device_id == device_id && revision <= chip.revision_max)
}

/// Returns the chip family with the given name.
///
pub fn by_name(name: &str) -> Option<&'static ChipInfo> {
    CHIPS.iter().find(|chip| chip.name == name)
}

/// How a chip reports the number of bytes left in
/// its DMA FIFO after a phase mismatch.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FifoCounter {
    /// The DFBC register holds the byte count.
    ByteCount,

    /// The count is the low 10 bits of DFIFO and
    /// CTEST5, less the transfer residual.
    Dfifo10Bit,

    /// The count is the low 7 bits of DFIFO, less
    /// the transfer residual.
    Dfifo7Bit,
}

impl FifoCounter {
    /// Returns the bytes still in the DMA FIFO, given the
    /// combined DFIFO/CTEST4/CTEST5 long word and the
    /// residual byte count from DBC.
    ///
    /// Only meaningful for the DFIFO methods; the byte
    /// count method reads DFBC directly.
    ///
    pub fn from_dfifo(self, dfifo: u32, rest: u32) -> u32 {
        match self {
            FifoCounter::ByteCount => 0,
            FifoCounter::Dfifo10Bit => {
                let count = ((dfifo >> 8) & 0x300) | (dfifo & 0xff);
                count.wrapping_sub(rest) & 0x3ff
            }
            FifoCounter::Dfifo7Bit => (dfifo & 0xff).wrapping_sub(rest) & 0x7f,
        }
    }
}

impl ChipInfo {
    /// Returns the DMA FIFO counting method.
    ///
    pub fn fifo_counter(&self) -> FifoCounter {
        if self.features.contains(Features::DFBC) {
            FifoCounter::ByteCount
        } else if self.features.contains(Features::DFS) {
            FifoCounter::Dfifo10Bit
        } else {
            FifoCounter::Dfifo7Bit
        }
    }

    /// Returns the SCSI clock frequency in kHz,
    /// after any multiplier.
    ///
    pub fn scsi_clock_khz(&self) -> u32 {
        if self.features.contains(Features::QUAD) {
            160_000
        } else if self.features.intersects(Features::DBLR | Features::ULTRA) {
            80_000
        } else {
            40_000
        }
    }

    /// Returns whether the chip is a C1010 core.
    ///
    pub fn is_c10(&self) -> bool {
        self.features.contains(Features::C10)
    }
}

/// The SCSI clock divisors, in units of 10 MHz
/// periods scaled for integer arithmetic.
///
pub(crate) const DIV_10M: [u32; 7] = [
    2 * 5_000_000,
    3 * 5_000_000,
    4 * 5_000_000,
    6 * 5_000_000,
    8 * 5_000_000,
    12 * 5_000_000,
    16 * 5_000_000,
];

/// The transfer parameters a chip can support,
/// expressed as SCSI period factors and offsets.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferLimits {
    pub clock_khz: u32,
    pub clock_divn: u8,

    // Fastest and slowest ST period factors.
    pub minsync: u8,
    pub maxsync: u8,
    pub maxoffs: u8,

    // DT limits, all zero when DT is unsupported.
    pub minsync_dt: u8,
    pub maxsync_dt: u8,
    pub maxoffs_dt: u8,

    // maxwide is the width exponent: 0 for
    // narrow chips and 1 for wide ones.
    pub maxwide: u8,
}

impl TransferLimits {
    /// Derives the transfer limits for `chip`,
    /// running with the given SCSI clock.
    ///
    pub fn new(chip: &ChipInfo, clock_khz: u32) -> Self {
        let clock_khz = clock_khz.max(1);
        let clock_divn = chip.clock_divn.clamp(1, DIV_10M.len() as u8);

        // The fastest period, in tenths of nanoseconds.
        let period = (4 * DIV_10M[0] + clock_khz - 1) / clock_khz;
        let mut minsync = match period {
            0..=250 => 10,
            251..=303 => 11,
            304..=500 => 12,
            _ => ((period + 40 - 1) / 40).min(255) as u8,
        };

        let features = chip.features;
        if minsync < 25 && !features.intersects(Features::ULTRA | Features::ULTRA2 | Features::ULTRA3) {
            minsync = 25;
        } else if minsync < 12 && !features.intersects(Features::ULTRA2 | Features::ULTRA3) {
            minsync = 12;
        }

        let period = (11 * DIV_10M[clock_divn as usize - 1]) / (4 * clock_khz);
        let maxsync = if period > 2540 { 254 } else { (period / 10) as u8 };

        let (minsync_dt, maxsync_dt, maxoffs_dt) =
            if features.contains(Features::ULTRA3) && clock_khz == 160_000 {
                (9, 50, 62)
            } else {
                (0, 0, 0)
            };

        TransferLimits {
            clock_khz,
            clock_divn,
            minsync,
            maxsync,
            maxoffs: chip.offset_max,
            minsync_dt,
            maxsync_dt,
            maxoffs_dt,
            maxwide: if features.contains(Features::WIDE) { 1 } else { 0 },
        }
    }

    /// Returns whether the chip can use DT clocking.
    ///
    pub fn supports_dt(&self) -> bool {
        self.maxoffs_dt != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_lookup() {
        assert_eq!(lookup(0x0001, 0x02).map(|c| c.name), Some("810"));
        assert_eq!(lookup(0x0001, 0x12).map(|c| c.name), Some("810a"));
        assert_eq!(lookup(0x0020, 0x01).map(|c| c.name), Some("1010-33"));
        assert!(lookup(0x1234, 0).is_none());
        assert_eq!(by_name("895a").map(|c| c.device_id), Some(0x0012));
    }

    #[test]
    fn transfer_limits() {
        let c1010 = by_name("1010-66").unwrap();
        let limits = TransferLimits::new(c1010, c1010.scsi_clock_khz());
        assert_eq!(limits.minsync, 10);
        assert_eq!(limits.maxsync, 137);
        assert_eq!(limits.maxoffs, 31);
        assert_eq!((limits.minsync_dt, limits.maxsync_dt, limits.maxoffs_dt), (9, 50, 62));
        assert_eq!(limits.maxwide, 1);
        assert!(limits.supports_dt());

        let c875 = by_name("875").unwrap();
        let limits = TransferLimits::new(c875, c875.scsi_clock_khz());
        assert_eq!(limits.minsync, 12);
        assert!(!limits.supports_dt());

        let c810 = by_name("810").unwrap();
        let limits = TransferLimits::new(c810, c810.scsi_clock_khz());
        assert_eq!(limits.minsync, 25);
        assert_eq!(limits.maxwide, 0);
    }

    #[test]
    fn fifo_counters() {
        assert_eq!(by_name("1010-33").unwrap().fifo_counter(), FifoCounter::ByteCount);
        assert_eq!(by_name("875").unwrap().fifo_counter(), FifoCounter::Dfifo10Bit);
        assert_eq!(by_name("810").unwrap().fifo_counter(), FifoCounter::Dfifo7Bit);

        // 7-bit counter wraps below the residual.
        assert_eq!(FifoCounter::Dfifo7Bit.from_dfifo(0x05, 0x103), 0x02);
        // 10-bit counter takes the top bits from CTEST5.
        assert_eq!(FifoCounter::Dfifo10Bit.from_dfifo(0x0001_0010, 0x0008), 0x108);
    }
}
