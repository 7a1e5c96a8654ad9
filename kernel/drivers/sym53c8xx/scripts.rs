// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Models the SCRIPTS program the chip runs.
//!
//! The driver needs three things from the SCRIPTS program:
//!
//! 1. The bus address of each named entry point, so it can
//!    restart SCRIPTS at a chosen place ([`ScriptsLayout`]).
//! 2. A host copy of the instructions, so it can inspect the
//!    MOVE instruction interrupted by a phase mismatch
//!    ([`ScriptsImage`]).
//! 3. The address ranges in which SCRIPTS is updating the
//!    shared queues, so recovery never restarts it half way
//!    through ([`Region`]).
//!
//! The program is split into two segments, A and B. Segment A
//! holds the hot paths (scheduling, selection, data transfer)
//! and segment B the error and negotiation paths.

use crate::ccb::phys;
use alloc::vec::Vec;
use core::ops::Range;

/// The size of a SCRIPTS instruction in bytes.
///
pub const INSTRUCTION_SIZE: u32 = 8;

/// A SCRIPTS segment.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    A,
    B,
}

/// A named entry point in the SCRIPTS program.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Label {
    // Segment A.
    Start,
    GetjobBegin,
    GetjobEnd,
    Select,
    WfSelDone,
    SendIdent,
    SelectDone,
    Dispatch,
    Init,
    Clrack,
    Command,
    Status,
    MsgIn,
    Complete,
    Done,
    DoneEnd,
    CompleteError,
    Ungetjob,
    Reselect,
    ReselTag,
    ReselDsa,
    ReselNoTag,
    Idle,
    DataIn,
    DataIn2,
    DataOut,
    DataOut2,
    Pm0Data,
    Pm1Data,

    // Segment B.
    NoData,
    SelForAbort,
    SelForAbort1,
    MsgBad,
    MsgWeird,
    WdtrResp,
    SendWdtr,
    SdtrResp,
    SendSdtr,
    PprResp,
    SendPpr,
    NegoBadPhase,
    IdentBreak,
    IdentBreakAtn,
    SdataIn,
    ReselBadLun,
    BadItl,
    BadItlq,
    PmHandle,
    WsrMaHelper,
}

impl Label {
    /// Every label, in program order.
    ///
    pub const ALL: [Label; 49] = [
        Label::Start,
        Label::GetjobBegin,
        Label::GetjobEnd,
        Label::Select,
        Label::WfSelDone,
        Label::SendIdent,
        Label::SelectDone,
        Label::Dispatch,
        Label::Init,
        Label::Clrack,
        Label::Command,
        Label::Status,
        Label::MsgIn,
        Label::Complete,
        Label::Done,
        Label::DoneEnd,
        Label::CompleteError,
        Label::Ungetjob,
        Label::Reselect,
        Label::ReselTag,
        Label::ReselDsa,
        Label::ReselNoTag,
        Label::Idle,
        Label::DataIn,
        Label::DataIn2,
        Label::DataOut,
        Label::DataOut2,
        Label::Pm0Data,
        Label::Pm1Data,
        Label::NoData,
        Label::SelForAbort,
        Label::SelForAbort1,
        Label::MsgBad,
        Label::MsgWeird,
        Label::WdtrResp,
        Label::SendWdtr,
        Label::SdtrResp,
        Label::SendSdtr,
        Label::PprResp,
        Label::SendPpr,
        Label::NegoBadPhase,
        Label::IdentBreak,
        Label::IdentBreakAtn,
        Label::SdataIn,
        Label::ReselBadLun,
        Label::BadItl,
        Label::BadItlq,
        Label::PmHandle,
        Label::WsrMaHelper,
    ];

    /// Returns the segment holding the label.
    ///
    pub fn segment(self) -> Segment {
        if (self as usize) < (Label::NoData as usize) {
            Segment::A
        } else {
            Segment::B
        }
    }

    // Returns the number of instructions in the
    // block starting at this label.
    fn instructions(self, max_sg: usize) -> usize {
        match self {
            Label::DataIn | Label::DataOut => max_sg,
            Label::Dispatch => 10,
            Label::Select | Label::Reselect | Label::SelForAbort | Label::PmHandle => 6,
            Label::Complete | Label::Done => 6,
            Label::Start
            | Label::GetjobBegin
            | Label::Init
            | Label::Ungetjob
            | Label::ReselTag
            | Label::ReselDsa
            | Label::ReselNoTag
            | Label::MsgIn
            | Label::Pm0Data
            | Label::Pm1Data
            | Label::MsgWeird
            | Label::ReselBadLun
            | Label::BadItl
            | Label::BadItlq
            | Label::WsrMaHelper => 4,
            _ => 2,
        }
    }
}

const LABEL_COUNT: usize = Label::ALL.len();

/// The SCRIPTS interrupt codes, passed in DSPS when
/// SCRIPTS executes an INT instruction.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sir {
    BadScsiStatus = 1,
    SelAtnNoMsgOut = 2,
    MsgReceived = 3,
    MsgWeird = 4,
    NegoFailed = 5,
    NegoProto = 6,
    ScriptStopped = 7,
    RejectToSend = 8,
    SwideOverrun = 9,
    SodlUnderrun = 10,
    ReselNoMsgIn = 11,
    ReselNoIdentify = 12,
    ReselBadLun = 13,
    TargetSelected = 14,
    ReselBadItl = 15,
    ReselBadItlq = 16,
    AbortSent = 17,
    ReselAborted = 18,
    MsgOutDone = 19,
    CompleteError = 20,
    DataOverrun = 21,
    BadPhase = 22,
}

impl Sir {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            1 => Some(Sir::BadScsiStatus),
            2 => Some(Sir::SelAtnNoMsgOut),
            3 => Some(Sir::MsgReceived),
            4 => Some(Sir::MsgWeird),
            5 => Some(Sir::NegoFailed),
            6 => Some(Sir::NegoProto),
            7 => Some(Sir::ScriptStopped),
            8 => Some(Sir::RejectToSend),
            9 => Some(Sir::SwideOverrun),
            10 => Some(Sir::SodlUnderrun),
            11 => Some(Sir::ReselNoMsgIn),
            12 => Some(Sir::ReselNoIdentify),
            13 => Some(Sir::ReselBadLun),
            14 => Some(Sir::TargetSelected),
            15 => Some(Sir::ReselBadItl),
            16 => Some(Sir::ReselBadItlq),
            17 => Some(Sir::AbortSent),
            18 => Some(Sir::ReselAborted),
            19 => Some(Sir::MsgOutDone),
            20 => Some(Sir::CompleteError),
            21 => Some(Sir::DataOverrun),
            22 => Some(Sir::BadPhase),
            _ => None,
        }
    }
}

/// A SCSI bus phase, as encoded in the low three
/// bits of a MOVE instruction.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    DtDataOut = 4,
    DtDataIn = 5,
    MsgOut = 6,
    MsgIn = 7,
}

impl Phase {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => Phase::DataOut,
            1 => Phase::DataIn,
            2 => Phase::Command,
            3 => Phase::Status,
            4 => Phase::DtDataOut,
            5 => Phase::DtDataIn,
            6 => Phase::MsgOut,
            _ => Phase::MsgIn,
        }
    }

    /// Returns whether the phase transfers data.
    ///
    pub fn is_data(self) -> bool {
        (self as u8) & 2 == 0
    }

    /// Returns whether the initiator receives bytes
    /// in this phase.
    ///
    pub fn is_input(self) -> bool {
        (self as u8) & 1 != 0
    }
}

/// A critical SCRIPTS region: SCRIPTS is updating
/// state shared with the host, so the host cannot
/// tell how far it got.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// Taking the next job from the start queue.
    GetJob,

    /// Putting a job back after losing arbitration,
    /// up to the start of reselection.
    UngetJob,

    /// Selecting a target to send it an abort
    /// message.
    SelectForAbort,

    /// Posting a completed job to the done queue.
    Done,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::GetJob, Region::UngetJob, Region::SelectForAbort, Region::Done];

    fn bounds(self) -> (Label, Label) {
        match self {
            Region::GetJob => (Label::GetjobBegin, Label::GetjobEnd),
            Region::UngetJob => (Label::Ungetjob, Label::Reselect),
            Region::SelectForAbort => (Label::SelForAbort, Label::SelForAbort1),
            Region::Done => (Label::Done, Label::DoneEnd),
        }
    }

    /// Returns the DSP values inside the region.
    ///
    /// DSP points past the instruction being run, so
    /// the range runs from just after the first label
    /// up to and including the last one.
    ///
    pub fn dsp_range(self, layout: &ScriptsLayout) -> Range<u32> {
        let (first, last) = self.bounds();
        (layout.address(first) + 1)..(layout.address(last) + 1)
    }
}

/// Lays out the two segments of the SCRIPTS program
/// and gives the bus address of each label.
///
#[derive(Clone, Debug)]
pub struct ScriptsLayout {
    a_base: u32,
    b_base: u32,
    a_size: u32,
    b_size: u32,
    max_sg: usize,

    // offsets holds each label's offset into
    // its segment, indexed by label.
    offsets: [u32; LABEL_COUNT],
}

impl ScriptsLayout {
    /// Lays out the program for segments loaded at
    /// `a_base` and `b_base`, with `max_sg` data
    /// MOVEs in each data block.
    ///
    pub fn new(a_base: u32, b_base: u32, max_sg: usize) -> Self {
        let mut offsets = [0u32; LABEL_COUNT];
        let mut a_size = 0u32;
        let mut b_size = 0u32;
        for (label, offset) in Label::ALL.iter().copied().zip(offsets.iter_mut()) {
            let size = label.instructions(max_sg) as u32 * INSTRUCTION_SIZE;
            let end = match label.segment() {
                Segment::A => &mut a_size,
                Segment::B => &mut b_size,
            };

            *offset = *end;
            *end += size;
        }

        ScriptsLayout {
            a_base,
            b_base,
            a_size,
            b_size,
            max_sg,
            offsets,
        }
    }

    /// Returns the bus address of `label`.
    ///
    pub fn address(&self, label: Label) -> u32 {
        let base = match label.segment() {
            Segment::A => self.a_base,
            Segment::B => self.b_base,
        };

        base + self.offsets[label as usize]
    }

    /// Returns the number of data MOVEs in each data
    /// block.
    ///
    pub fn max_sg(&self) -> usize {
        self.max_sg
    }

    /// Returns the segment and offset of the instruction
    /// that was running when SCRIPTS stopped with DSP
    /// set to `dsp`.
    ///
    pub fn locate(&self, dsp: u32) -> Option<(Segment, u32)> {
        if dsp > self.a_base && dsp <= self.a_base + self.a_size {
            Some((Segment::A, dsp - self.a_base - INSTRUCTION_SIZE))
        } else if dsp > self.b_base && dsp <= self.b_base + self.b_size {
            Some((Segment::B, dsp - self.b_base - INSTRUCTION_SIZE))
        } else {
            None
        }
    }

    /// Returns the critical region containing `dsp`,
    /// if any.
    ///
    pub fn critical_region(&self, dsp: u32) -> Option<Region> {
        Region::ALL
            .iter()
            .copied()
            .find(|region| region.dsp_range(self).contains(&dsp))
    }

    /// Returns the bus address of the data MOVE block
    /// end label for the given direction.
    ///
    pub(crate) fn data_end(&self, input: bool) -> u32 {
        if input {
            self.address(Label::DataIn2)
        } else {
            self.address(Label::DataOut2)
        }
    }

    fn segment_size(&self, segment: Segment) -> u32 {
        match segment {
            Segment::A => self.a_size,
            Segment::B => self.b_size,
        }
    }
}

/// A SCRIPTS instruction.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub word0: u32,
    pub word1: u32,
}

impl Instruction {
    const MOVE_TABLE: u32 = 0x1000_0000;
    const MOVE_ABS: u32 = 0x0800_0000;
    const SELECT_ATN_TABLE: u32 = 0x4300_0000;
    const JUMP: u32 = 0x8008_0000;
    const CALL: u32 = 0x8808_0000;
    const INT: u32 = 0x9808_0000;
    const NO_OP: u32 = 0x8000_0000;

    /// A chained table-indirect MOVE, whose table
    /// entry sits at `offset` in the CCB.
    ///
    pub fn move_table(phase: Phase, offset: u32) -> Self {
        Instruction {
            word0: Self::MOVE_TABLE | ((phase as u32) << 24),
            word1: offset,
        }
    }

    /// A block MOVE of `count` bytes at `addr`.
    ///
    pub fn move_abs(phase: Phase, count: u32, addr: u32) -> Self {
        Instruction {
            word0: Self::MOVE_ABS | ((phase as u32) << 24) | (count & 0xff_ffff),
            word1: addr,
        }
    }

    pub fn select_atn(offset: u32) -> Self {
        Instruction {
            word0: Self::SELECT_ATN_TABLE,
            word1: offset,
        }
    }

    pub fn jump(addr: u32) -> Self {
        Instruction {
            word0: Self::JUMP,
            word1: addr,
        }
    }

    pub fn call(addr: u32) -> Self {
        Instruction {
            word0: Self::CALL,
            word1: addr,
        }
    }

    pub fn int(sir: Sir) -> Self {
        Instruction {
            word0: Self::INT,
            word1: sir as u32,
        }
    }

    pub fn no_op() -> Self {
        Instruction {
            word0: Self::NO_OP,
            word1: 0,
        }
    }

    /// Returns the opcode byte, which DCMD also holds
    /// while the instruction runs.
    ///
    pub fn opcode(&self) -> u8 {
        (self.word0 >> 24) as u8
    }

    /// Returns whether the instruction is a MOVE.
    ///
    pub fn is_move(&self) -> bool {
        self.word0 & 0xc000_0000 == 0
    }

    /// Returns whether the operands come from a
    /// table in the CCB.
    ///
    pub fn is_table_indirect(&self) -> bool {
        self.word0 & Self::MOVE_TABLE != 0
    }

    /// Returns the byte count of a block MOVE.
    ///
    pub fn count(&self) -> u32 {
        self.word0 & 0xff_ffff
    }
}

/// The host copy of the SCRIPTS program.
///
#[derive(Clone, Debug)]
pub struct ScriptsImage {
    a: Vec<u32>,
    b: Vec<u32>,
}

impl ScriptsImage {
    /// Assembles the program for `layout`. `msgout`
    /// is the bus address of the host's message out
    /// buffer, used by the negotiation blocks.
    ///
    pub fn assemble(layout: &ScriptsLayout, msgout: u32) -> Self {
        let mut a = Vec::with_capacity((layout.segment_size(Segment::A) / 4) as usize);
        let mut b = Vec::with_capacity((layout.segment_size(Segment::B) / 4) as usize);
        for label in Label::ALL {
            let words = match label.segment() {
                Segment::A => &mut a,
                Segment::B => &mut b,
            };

            let block = Self::block(layout, label, msgout);
            for i in 0..label.instructions(layout.max_sg) {
                let insn = block.get(i).copied().unwrap_or_else(Instruction::no_op);
                words.push(insn.word0);
                words.push(insn.word1);
            }
        }

        ScriptsImage { a, b }
    }

    // Returns the leading instructions of the block at
    // label. The rest of the block is padding.
    fn block(layout: &ScriptsLayout, label: Label, msgout: u32) -> Vec<Instruction> {
        let mut block = Vec::new();
        match label {
            Label::Select => {
                block.push(Instruction::select_atn(phys::SELECT));
                block.push(Instruction::jump(layout.address(Label::Reselect)));
            }
            Label::SendIdent => block.push(Instruction::move_table(Phase::MsgOut, phys::SMSG)),
            Label::Command => block.push(Instruction::move_table(Phase::Command, phys::CMD)),
            Label::Status => block.push(Instruction::move_abs(Phase::Status, 1, 0)),
            Label::MsgIn => block.push(Instruction::move_abs(Phase::MsgIn, 1, 0)),
            Label::Clrack => block.push(Instruction::jump(layout.address(Label::Dispatch))),
            Label::DataIn | Label::DataOut => {
                let phase = if label == Label::DataIn {
                    Phase::DataIn
                } else {
                    Phase::DataOut
                };

                for i in 0..layout.max_sg {
                    block.push(Instruction::move_table(phase, phys::data(i)));
                }
            }
            Label::DataIn2 | Label::DataOut2 => block.push(Instruction::int(Sir::DataOverrun)),
            Label::Pm0Data => {
                block.push(Instruction::move_table(Phase::DataIn, phys::PM0_SG));
                block.push(Instruction::jump(0));
            }
            Label::Pm1Data => {
                block.push(Instruction::move_table(Phase::DataIn, phys::PM1_SG));
                block.push(Instruction::jump(0));
            }
            Label::NoData => block.push(Instruction::int(Sir::DataOverrun)),
            Label::SelForAbort => block.push(Instruction::int(Sir::TargetSelected)),
            Label::SelForAbort1 => block.push(Instruction::int(Sir::AbortSent)),
            Label::SendWdtr => block.push(Instruction::move_abs(Phase::MsgOut, 4, msgout)),
            Label::SendSdtr => block.push(Instruction::move_abs(Phase::MsgOut, 5, msgout)),
            Label::SendPpr => block.push(Instruction::move_abs(Phase::MsgOut, 8, msgout)),
            Label::WdtrResp => block.push(Instruction::jump(layout.address(Label::SendWdtr))),
            Label::SdtrResp => block.push(Instruction::jump(layout.address(Label::SendSdtr))),
            Label::PprResp => block.push(Instruction::jump(layout.address(Label::SendPpr))),
            Label::NegoBadPhase => block.push(Instruction::int(Sir::NegoProto)),
            Label::MsgWeird => block.push(Instruction::int(Sir::RejectToSend)),
            Label::SdataIn => {
                block.push(Instruction::move_table(Phase::DataIn, phys::SENSE));
                block.push(Instruction::call(layout.address(Label::Dispatch)));
            }
            Label::ReselBadLun => block.push(Instruction::int(Sir::ReselBadLun)),
            Label::BadItl => block.push(Instruction::int(Sir::ReselBadItl)),
            Label::BadItlq => block.push(Instruction::int(Sir::ReselBadItlq)),
            Label::WsrMaHelper => {
                block.push(Instruction::move_table(Phase::DataIn, phys::WRESID));
                block.push(Instruction::jump(layout.address(Label::Dispatch)));
            }
            Label::CompleteError => block.push(Instruction::int(Sir::CompleteError)),
            _ => {}
        }

        block
    }

    /// Returns the instruction at `offset` into
    /// `segment`.
    ///
    pub fn fetch(&self, segment: Segment, offset: u32) -> Option<Instruction> {
        if offset % 4 != 0 {
            return None;
        }

        let words = match segment {
            Segment::A => &self.a,
            Segment::B => &self.b,
        };

        let index = (offset / 4) as usize;
        match (words.get(index), words.get(index + 1)) {
            (Some(&word0), Some(&word1)) => Some(Instruction { word0, word1 }),
            _ => None,
        }
    }

    /// Returns the instruction SCRIPTS was running
    /// when it stopped with DSP set to `dsp`.
    ///
    pub fn interrupted(&self, layout: &ScriptsLayout, dsp: u32) -> Option<Instruction> {
        let (segment, offset) = layout.locate(dsp)?;
        self.fetch(segment, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: u32 = 0x1000_0000;
    const B: u32 = 0x2000_0000;

    #[test]
    fn label_table() {
        assert_eq!(Label::ALL.len(), Label::WsrMaHelper as usize + 1);
        for (i, label) in Label::ALL.iter().enumerate() {
            assert_eq!(*label as usize, i);
        }
        assert_eq!(Label::Pm1Data.segment(), Segment::A);
        assert_eq!(Label::NoData.segment(), Segment::B);
        assert_eq!(Label::WsrMaHelper.segment(), Segment::B);
    }

    #[test]
    fn layout() {
        let layout = ScriptsLayout::new(A, B, 8);
        assert_eq!(layout.address(Label::Start), A);
        assert_eq!(layout.address(Label::NoData), B);
        assert_eq!(layout.address(Label::DataIn2) - layout.address(Label::DataIn), 8 * 8);
        assert!(layout.address(Label::WsrMaHelper) > layout.address(Label::PmHandle));

        assert_eq!(layout.locate(A), None);
        assert_eq!(layout.locate(A + 8), Some((Segment::A, 0)));
        assert_eq!(layout.locate(B + 16), Some((Segment::B, 8)));
        assert_eq!(layout.locate(0x3000_0000), None);
    }

    #[test]
    fn critical_regions() {
        let layout = ScriptsLayout::new(A, B, 8);
        let begin = layout.address(Label::GetjobBegin);
        let end = layout.address(Label::GetjobEnd);

        // The range is half open on both ends by one.
        assert_eq!(layout.critical_region(begin), None);
        assert_eq!(layout.critical_region(begin + 1), Some(Region::GetJob));
        assert_eq!(layout.critical_region(end), Some(Region::GetJob));
        assert_eq!(layout.critical_region(end + 1), None);

        let done = layout.address(Label::DoneEnd);
        assert_eq!(layout.critical_region(done), Some(Region::Done));
        let abort = layout.address(Label::SelForAbort) + 8;
        assert_eq!(layout.critical_region(abort), Some(Region::SelectForAbort));
        assert_eq!(layout.critical_region(layout.address(Label::Dispatch) + 8), None);
    }

    #[test]
    fn image() {
        let layout = ScriptsLayout::new(A, B, 4);
        let image = ScriptsImage::assemble(&layout, 0x5000);

        // The second data in MOVE refers to the second
        // table entry.
        let dsp = layout.address(Label::DataIn) + 16;
        let insn = image.interrupted(&layout, dsp).unwrap();
        assert_eq!(insn.opcode(), 0x11);
        assert!(insn.is_move());
        assert!(insn.is_table_indirect());
        assert_eq!(insn.word1, phys::data(1));

        let dsp = layout.address(Label::SendSdtr) + 8;
        let insn = image.interrupted(&layout, dsp).unwrap();
        assert_eq!(insn.opcode(), 0x0e);
        assert!(!insn.is_table_indirect());
        assert_eq!(insn.count(), 5);
        assert_eq!(insn.word1, 0x5000);

        assert_eq!(image.fetch(Segment::A, 2), None);
    }

    #[test]
    fn phases() {
        assert!(Phase::DataIn.is_data());
        assert!(Phase::DtDataOut.is_data());
        assert!(!Phase::MsgOut.is_data());
        assert!(Phase::MsgIn.is_input());
        assert_eq!(Phase::from_bits(0x1e), Phase::MsgOut);
        assert_eq!(Sir::from_u8(17), Some(Sir::AbortSent));
        assert_eq!(Sir::from_u8(0), None);
    }
}
