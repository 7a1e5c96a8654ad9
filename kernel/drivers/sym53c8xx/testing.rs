// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Shared helpers for the unit tests: a register file that
//! plays the part of the chip, a midlayer that records what
//! it is told, and builders for host control blocks and
//! commands.

use crate::chip;
use crate::command::{Command, CommandId, Completion, DataDirection, DmaSegment, Midlayer};
use crate::config::Config;
use crate::hcb::Hcb;
use crate::regs::{Dstat, Istat, Register, Registers, Scntl1, Sist, Sstat0};
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use scsi::message::TaskAttribute;
use scsi::{CommandDescriptorBlock, Read10};

/// A fake chip, backed by a plain register file.
///
/// Interrupt conditions are queued with [`raise`](Self::raise)
/// and reported through ISTAT, SIST and DSTAT the way the
/// chip stacks them: reading SIST or DSTAT clears that half
/// of the oldest condition, and the next condition shows up
/// once both halves have been read.
///
pub struct MockChip {
    file: [u8; 256],
    conditions: VecDeque<(Sist, Dstat)>,
    writes: Vec<(Register, u32)>,
    offline: bool,
    delayed: u64,
    longest_delay: u32,
}

impl MockChip {
    pub fn new() -> Self {
        MockChip {
            file: [0; 256],
            conditions: VecDeque::new(),
            writes: Vec::new(),
            offline: false,
            delayed: 0,
            longest_delay: 0,
        }
    }

    /// raise queues an interrupt condition.
    ///
    pub fn raise(&mut self, sist: Sist, dstat: Dstat) {
        self.conditions.push_back((sist, dstat));
    }

    /// pending returns the raised conditions that have
    /// not been fully read yet.
    ///
    pub fn pending(&self) -> &VecDeque<(Sist, Dstat)> {
        &self.conditions
    }

    /// set_offline makes the chip vanish: every read
    /// returns all ones from now on.
    ///
    pub fn set_offline(&mut self) {
        self.offline = true;
    }

    /// poke8 changes a register without going through
    /// the chip's write side effects.
    ///
    pub fn poke8(&mut self, reg: Register, value: u8) {
        self.file[reg.0 as usize] = value;
    }

    /// last_write returns the value most recently written
    /// to `reg`.
    ///
    pub fn last_write(&self, reg: Register) -> Option<u32> {
        self.writes.iter().rev().find(|(r, _)| *r == reg).map(|(_, value)| *value)
    }

    /// was_reset returns whether the SCSI RST line was
    /// ever asserted.
    ///
    pub fn was_reset(&self) -> bool {
        self.writes
            .iter()
            .any(|(reg, value)| *reg == Register::SCNTL1 && *value as u8 & Scntl1::CRST.bits() != 0)
    }

    /// delayed returns the total time waited, in
    /// microseconds.
    ///
    pub fn delayed(&self) -> u64 {
        self.delayed
    }

    /// longest_delay returns the longest single wait,
    /// in microseconds.
    ///
    pub fn longest_delay(&self) -> u32 {
        self.longest_delay
    }

    fn load(&self, reg: Register, len: usize) -> u32 {
        let start = reg.0 as usize;
        self.file[start..start + len]
            .iter()
            .rev()
            .fold(0, |acc, byte| (acc << 8) | *byte as u32)
    }

    fn store(&mut self, reg: Register, len: usize, value: u32) {
        let start = reg.0 as usize;
        for (i, byte) in self.file[start..start + len].iter_mut().enumerate() {
            *byte = (value >> (8 * i)) as u8;
        }

        self.writes.push((reg, value));
    }

    // pop_front drops the oldest condition once both
    // halves have been read.
    fn pop_front(&mut self) {
        if let Some((sist, dstat)) = self.conditions.front() {
            if sist.is_empty() && dstat.is_empty() {
                self.conditions.pop_front();
            }
        }
    }
}

impl Registers for MockChip {
    fn read8(&mut self, reg: Register) -> u8 {
        if self.offline {
            return 0xff;
        }

        match reg {
            Register::ISTAT => {
                let mut istat = Istat::from_bits_truncate(self.file[reg.0 as usize]);
                if let Some((sist, dstat)) = self.conditions.front() {
                    istat.set(Istat::SIP, !sist.is_empty());
                    istat.set(Istat::DIP, !dstat.is_empty());
                }

                istat.bits()
            }
            Register::DSTAT => match self.conditions.front_mut() {
                Some((_, dstat)) => {
                    let value = dstat.bits();
                    *dstat = Dstat::empty();
                    self.pop_front();
                    value
                }
                None => self.file[reg.0 as usize],
            },
            _ => self.file[reg.0 as usize],
        }
    }

    fn read16(&mut self, reg: Register) -> u16 {
        if self.offline {
            return 0xffff;
        }

        match (reg, self.conditions.front_mut()) {
            (Register::SIST, Some((sist, _))) => {
                let value = sist.bits();
                *sist = Sist::empty();
                self.pop_front();
                value
            }
            _ => self.load(reg, 2) as u16,
        }
    }

    fn read32(&mut self, reg: Register) -> u32 {
        if self.offline {
            return 0xffff_ffff;
        }

        self.load(reg, 4)
    }

    fn write8(&mut self, reg: Register, value: u8) {
        match reg {
            // Writing INTF acknowledges it.
            Register::ISTAT => {
                self.store(reg, 1, value as u32);
                self.file[reg.0 as usize] &= !Istat::INTF.bits();
            }
            Register::SCNTL1 => {
                self.store(reg, 1, value as u32);
                let sstat0 = &mut self.file[Register::SSTAT0.0 as usize];
                if value & Scntl1::CRST.bits() != 0 {
                    *sstat0 |= Sstat0::RST.bits();
                } else {
                    *sstat0 &= !Sstat0::RST.bits();
                }
            }
            _ => self.store(reg, 1, value as u32),
        }
    }

    fn write16(&mut self, reg: Register, value: u16) {
        self.store(reg, 2, value as u32);
    }

    fn write32(&mut self, reg: Register, value: u32) {
        self.store(reg, 4, value);
    }

    fn channel_offline(&self) -> bool {
        self.offline
    }

    fn delay(&mut self, micros: u32) {
        self.delayed += micros as u64;
        self.longest_delay = self.longest_delay.max(micros);
    }
}

/// A midlayer that remembers everything it is told.
///
#[derive(Debug, Default)]
pub struct Recorder {
    pub completions: Vec<Completion>,
    pub resets: usize,
}

impl Midlayer for Recorder {
    fn done(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    fn bus_reset(&mut self) {
        self.resets += 1;
    }
}

/// test_hcb returns a host control block for a
/// 53C1010-66 on the fake chip, with the default
/// configuration.
///
pub fn test_hcb() -> Hcb<MockChip> {
    let chip = chip::by_name("1010-66").unwrap();
    Hcb::new(MockChip::new(), chip, Config::default()).unwrap()
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// test_command returns a READ(10) of one 512-byte
/// block from a SCSI-2 device, with a fresh id.
///
pub fn test_command(target: u8, lun: u8, tag_order: Option<TaskAttribute>) -> Command {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let read = Read10::new(0, 1);
    let mut cdb = vec![0u8; read.len()];
    read.serialise(&mut cdb);

    Command {
        id: CommandId(id),
        target,
        lun,
        cdb,
        direction: DataDirection::In,
        segments: vec![DmaSegment {
            addr: 0x0100_0000 + ((id as u32 & 0xfff) << 12),
            len: 512,
        }],
        tag_order,
        scsi_level: 2,
    }
}
