//! Opcode definitions and instruction decoding.
//!
//! An instruction is a single opcode byte. Opcodes numbered at or above
//! [`HAVE_ARGUMENT`] are followed by a little-endian `u16` argument, so every
//! instruction is either 1 or 3 bytes wide.

use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr, IntoStaticStr};

use crate::exception::FrameError;

/// First opcode number that carries a `u16` argument.
pub const HAVE_ARGUMENT: u8 = 90;

/// Bytecode opcodes.
///
/// Jump arguments of `JumpForward`, `JumpIfFalse`, `JumpIfTrue`, `ForIter` and the
/// `Setup*` family are relative to the following instruction; `JumpAbsolute` and
/// `ContinueLoop` carry absolute offsets. `JumpIfFalse`/`JumpIfTrue` leave the
/// tested value on the stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    Nop = 9,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    GetIter = 68,
    BreakLoop = 80,
    ReturnValue = 83,
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    // opcodes from here on take an argument
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    StoreGlobal = 97,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    CompareOp = 107,
    JumpForward = 110,
    JumpIfFalse = 111,
    JumpIfTrue = 112,
    JumpAbsolute = 113,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    MakeClosure = 134,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
}

/// How an opcode's argument addresses its jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// Target is the offset of the next instruction plus the argument.
    Relative,
    /// Target is the argument itself.
    Absolute,
}

impl Opcode {
    #[inline]
    #[must_use]
    pub fn has_argument(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// Encoded size of the instruction in bytes.
    #[inline]
    #[must_use]
    pub fn width(self) -> usize {
        if self.has_argument() { 3 } else { 1 }
    }

    #[must_use]
    pub fn jump_kind(self) -> Option<JumpKind> {
        match self {
            Self::JumpForward
            | Self::JumpIfFalse
            | Self::JumpIfTrue
            | Self::ForIter
            | Self::SetupLoop
            | Self::SetupExcept
            | Self::SetupFinally => Some(JumpKind::Relative),
            Self::JumpAbsolute | Self::ContinueLoop => Some(JumpKind::Absolute),
            _ => None,
        }
    }

    /// True for the three opcodes that push a block marker.
    #[must_use]
    pub fn is_block_setup(self) -> bool {
        matches!(self, Self::SetupLoop | Self::SetupExcept | Self::SetupFinally)
    }
}

/// Comparison selected by the `CompareOp` argument.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
pub enum Comparison {
    #[strum(serialize = "<")]
    Lt = 0,
    #[strum(serialize = "<=")]
    Le = 1,
    #[strum(serialize = "==")]
    Eq = 2,
    #[strum(serialize = "!=")]
    Ne = 3,
    #[strum(serialize = ">")]
    Gt = 4,
    #[strum(serialize = ">=")]
    Ge = 5,
    #[strum(serialize = "in")]
    In = 6,
    #[strum(serialize = "not in")]
    NotIn = 7,
    #[strum(serialize = "is")]
    Is = 8,
    #[strum(serialize = "is not")]
    IsNot = 9,
    #[strum(serialize = "exception match")]
    ExceptionMatch = 10,
}

impl Comparison {
    #[must_use]
    pub fn from_arg(arg: u16) -> Option<Self> {
        u8::try_from(arg).ok().and_then(Self::from_repr)
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: Opcode,
    /// Argument, zero for opcodes below `HAVE_ARGUMENT`.
    pub arg: u16,
}

impl Instruction {
    /// Decodes the instruction starting at `offset`.
    pub fn decode(bytecode: &[u8], offset: usize) -> Result<Self, FrameError> {
        let byte = *bytecode.get(offset).ok_or(FrameError::InvalidOpcode { offset, byte: 0 })?;
        let opcode = Opcode::from_repr(byte).ok_or(FrameError::InvalidOpcode { offset, byte })?;
        let arg = if opcode.has_argument() {
            match bytecode.get(offset + 1..offset + 3) {
                Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
                _ => return Err(FrameError::InvalidOpcode { offset, byte }),
            }
        } else {
            0
        };
        Ok(Self { offset, opcode, arg })
    }

    #[inline]
    #[must_use]
    pub fn next_offset(&self) -> usize {
        self.offset + self.opcode.width()
    }

    /// Absolute jump target, for jump and block setup instructions.
    #[must_use]
    pub fn jump_target(&self) -> Option<usize> {
        self.opcode.jump_kind().map(|kind| match kind {
            JumpKind::Relative => self.next_offset() + usize::from(self.arg),
            JumpKind::Absolute => usize::from(self.arg),
        })
    }
}

/// Iterator over the instructions of a bytecode string, in offset order.
///
/// Yields an error and stops at the first undecodable byte.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    bytecode: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    #[must_use]
    pub fn new(bytecode: &'a [u8]) -> Self {
        Self {
            bytecode,
            offset: 0,
            failed: false,
        }
    }
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instruction, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytecode.len() {
            return None;
        }
        match Instruction::decode(self.bytecode, self.offset) {
            Ok(instr) => {
                self.offset = instr.next_offset();
                Some(Ok(instr))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
