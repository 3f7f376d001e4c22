//! Code objects: immutable compiled units shared by every frame that runs them.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use super::op::{Instruction, Instructions, Opcode};
use crate::{exception::FrameError, value::Value};

/// A constant pool entry.
///
/// Constants live in code objects, which are shared across threads, so they use
/// a thread-safe representation and are turned into runtime values on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Const>),
    Code(Arc<Code>),
}

impl Const {
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Float(f) => Value::Float(*f),
            Self::Str(s) => Value::Str(s.as_str().into()),
            Self::Tuple(items) => Value::Tuple(items.iter().map(Self::to_value).collect()),
            Self::Code(code) => Value::Code(Arc::clone(code)),
        }
    }
}

/// Code object flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlags {
    /// Locals live in fixed slots addressed by `LoadFast`/`StoreFast`.
    pub optimized: bool,
    /// The frame gets its own locals mapping instead of sharing globals.
    pub new_locals: bool,
    /// Calling the code creates a generator instead of running it.
    pub generator: bool,
    /// Resuming a started generator pushes the sent value before continuing.
    pub accepts_resume_value: bool,
}

impl CodeFlags {
    /// Flags for an ordinary function body.
    #[must_use]
    pub const fn function() -> Self {
        Self {
            optimized: true,
            new_locals: true,
            generator: false,
            accepts_resume_value: false,
        }
    }

    /// Flags for a generator function body that receives sent values.
    #[must_use]
    pub const fn generator() -> Self {
        Self {
            optimized: true,
            new_locals: true,
            generator: true,
            accepts_resume_value: true,
        }
    }

    /// Flags for module-level code: locals are the globals.
    #[must_use]
    pub const fn module() -> Self {
        Self {
            optimized: false,
            new_locals: false,
            generator: false,
            accepts_resume_value: false,
        }
    }
}

/// The raw fields of a code object, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeParts {
    pub name: String,
    pub bytecode: Vec<u8>,
    pub consts: Vec<Const>,
    /// Names addressed by the `*Name` and `*Global` opcodes.
    pub names: Vec<String>,
    /// Fast local slot names; arguments come first.
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    pub arg_count: u16,
    pub max_stack_size: u16,
    pub flags: CodeFlags,
    pub first_line: u32,
    /// `(offset delta, line delta)` byte pairs.
    pub line_table: Vec<u8>,
}

/// A compiled, validated unit of bytecode.
///
/// Code objects are immutable once built and shared through `Arc`; everything a
/// frame needs to know about its instructions is read from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CodeParts")]
pub struct Code {
    name: String,
    bytecode: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<String>,
    varnames: Vec<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    arg_count: u16,
    max_stack_size: u16,
    flags: CodeFlags,
    first_line: u32,
    line_table: Vec<u8>,
}

impl TryFrom<CodeParts> for Code {
    type Error = FrameError;

    fn try_from(parts: CodeParts) -> Result<Self, Self::Error> {
        Self::new(parts)
    }
}

impl Code {
    /// Validates `parts` and builds the code object.
    ///
    /// Checks that every instruction decodes and that operands index into the
    /// right tables. Jump targets and line starts must land on instruction
    /// boundaries, and block setups and pops must pair up statically.
    pub fn new(parts: CodeParts) -> Result<Self, FrameError> {
        let code = Self {
            name: parts.name,
            bytecode: parts.bytecode,
            consts: parts.consts,
            names: parts.names,
            varnames: parts.varnames,
            cellvars: parts.cellvars,
            freevars: parts.freevars,
            arg_count: parts.arg_count,
            max_stack_size: parts.max_stack_size,
            flags: parts.flags,
            first_line: parts.first_line,
            line_table: parts.line_table,
        };
        code.validate()?;
        Ok(code)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if usize::from(self.arg_count) > self.varnames.len() {
            return Err(FrameError::invalid_code(format!(
                "{}: arg_count {} exceeds {} local slots",
                self.name,
                self.arg_count,
                self.varnames.len()
            )));
        }
        if self.line_table.len() % 2 != 0 {
            return Err(FrameError::invalid_code("line table has an odd number of bytes"));
        }

        let instructions = self.instructions().collect::<Result<Vec<_>, _>>()?;
        let is_boundary = |target: usize| {
            target == self.bytecode.len() || instructions.binary_search_by_key(&target, |i| i.offset).is_ok()
        };
        for instr in &instructions {
            let arg = usize::from(instr.arg);
            let (table, len) = match instr.opcode {
                Opcode::LoadConst => ("constant", self.consts.len()),
                Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadName
                | Opcode::StoreGlobal
                | Opcode::LoadGlobal => ("name", self.names.len()),
                Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => ("local", self.varnames.len()),
                Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref => ("cell", self.cell_count()),
                Opcode::YieldValue if !self.flags.generator => {
                    return Err(FrameError::invalid_code(format!(
                        "{}: yield at offset {} outside a generator",
                        self.name, instr.offset
                    )));
                }
                _ => {
                    if let Some(target) = instr.jump_target()
                        && !is_boundary(target)
                    {
                        return Err(FrameError::invalid_code(format!(
                            "{}: jump at offset {} targets {target}, not an instruction boundary",
                            self.name, instr.offset
                        )));
                    }
                    continue;
                }
            };
            if arg >= len {
                return Err(FrameError::invalid_code(format!(
                    "{}: {table} index {arg} out of range at offset {}",
                    self.name, instr.offset
                )));
            }
        }

        if let Some((addr, line)) = self.line_starts().find(|&(addr, _)| !is_boundary(addr)) {
            return Err(FrameError::invalid_code(format!(
                "{}: line {line} starts at offset {addr}, not an instruction boundary",
                self.name
            )));
        }

        let mut scan = BlockScan::default();
        for instr in &instructions {
            scan.step(self, instr)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn consts(&self) -> &[Const] {
        &self.consts
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    #[must_use]
    pub fn cellvars(&self) -> &[String] {
        &self.cellvars
    }

    #[must_use]
    pub fn freevars(&self) -> &[String] {
        &self.freevars
    }

    /// Number of closure cells a frame of this code holds: cell variables, then free variables.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    /// Name of the closure cell at `index`.
    #[must_use]
    pub fn cell_name(&self, index: usize) -> &str {
        self.cellvars
            .iter()
            .chain(&self.freevars)
            .nth(index)
            .map_or("<cell>", String::as_str)
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        usize::from(self.arg_count)
    }

    #[must_use]
    pub fn local_count(&self) -> usize {
        self.varnames.len()
    }

    #[must_use]
    pub fn max_stack_size(&self) -> usize {
        usize::from(self.max_stack_size)
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    #[must_use]
    pub fn line_table(&self) -> &[u8] {
        &self.line_table
    }

    #[must_use]
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions::new(&self.bytecode)
    }

    /// Opcode at `offset`, if `offset` holds a valid one.
    #[must_use]
    pub fn opcode_at(&self, offset: usize) -> Option<Opcode> {
        self.bytecode.get(offset).copied().and_then(Opcode::from_repr)
    }

    /// Source line of the instruction at `offset`.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut line = self.first_line;
        let mut addr = 0;
        for pair in self.line_table.chunks_exact(2) {
            addr += usize::from(pair[0]);
            if addr > offset {
                break;
            }
            line += u32::from(pair[1]);
        }
        line
    }

    /// `(offset, line)` of each line table entry that advances the line, in
    /// table order. Entries that only advance the offset are padding.
    pub fn line_starts(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.line_table
            .chunks_exact(2)
            .scan((0usize, self.first_line), |(addr, line), pair| {
                *addr += usize::from(pair[0]);
                *line += u32::from(pair[1]);
                Some((pair[1] != 0).then_some((*addr, *line)))
            })
            .flatten()
    }

    /// Last source line covered by the line table.
    #[must_use]
    pub fn last_line(&self) -> u32 {
        self.line_starts().last().map_or(self.first_line, |(_, line)| line)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "code {} (line {})", self.name, self.first_line)?;
        for instr in self.instructions() {
            let Ok(instr) = instr else {
                return writeln!(f, "  <undecodable>");
            };
            if instr.opcode.has_argument() {
                writeln!(f, "  {:>5} {:<20} {}", instr.offset, instr.opcode, instr.arg)?;
            } else {
                writeln!(f, "  {:>5} {}", instr.offset, instr.opcode)?;
            }
        }
        Ok(())
    }
}

/// One statically open block, found by scanning instructions in offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StaticBlock {
    /// Offset of the setup instruction.
    pub setup: usize,
    /// Set once the protected body of a `SetupFinally` ends and its handler begins.
    pub in_finally: bool,
}

/// Linear scan of the static block structure.
///
/// `PopBlock` closes loop and except blocks but only marks a finally block as
/// entered; the matching `EndFinally` closes it.
#[derive(Debug, Default)]
pub(crate) struct BlockScan {
    pub open: Vec<StaticBlock>,
}

impl BlockScan {
    pub fn step(&mut self, code: &Code, instr: &Instruction) -> Result<(), FrameError> {
        match instr.opcode {
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                self.open.push(StaticBlock {
                    setup: instr.offset,
                    in_finally: false,
                });
            }
            Opcode::PopBlock => {
                let Some(top) = self.open.last_mut() else {
                    return Err(FrameError::invalid_code(format!(
                        "{}: pop block at offset {} with no open block",
                        code.name, instr.offset
                    )));
                };
                if code.opcode_at(top.setup) == Some(Opcode::SetupFinally) {
                    top.in_finally = true;
                } else {
                    self.open.pop();
                }
            }
            Opcode::EndFinally => {
                if let Some(top) = self.open.last()
                    && code.opcode_at(top.setup) == Some(Opcode::SetupFinally)
                {
                    self.open.pop();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Setup offset of the innermost block whose finally handler is being executed.
    pub fn innermost_finally(&self) -> Option<usize> {
        self.open.iter().rev().find(|block| block.in_finally).map(|block| block.setup)
    }
}
