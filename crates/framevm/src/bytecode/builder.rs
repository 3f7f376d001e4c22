//! Builder for emitting bytecode.
//!
//! `CodeBuilder` encodes opcodes and operands into raw bytes, resolves jump
//! labels, records the line table and computes the maximum stack depth.

use ahash::AHashSet;

use super::{
    code::{Code, CodeFlags, CodeParts, Const},
    op::{Instruction, JumpKind, Opcode},
};
use crate::exception::FrameError;

/// Builder for emitting bytecode.
///
/// # Usage
///
/// ```
/// use framevm::bytecode::{CodeBuilder, CodeFlags, Opcode};
///
/// let mut builder = CodeBuilder::new("add", 1);
/// builder.set_flags(CodeFlags::function());
/// let a = builder.add_local("a");
/// let b = builder.add_local("b");
/// builder.set_arg_count(2);
/// builder.set_line(2);
/// builder.emit_arg(Opcode::LoadFast, a);
/// builder.emit_arg(Opcode::LoadFast, b);
/// builder.emit(Opcode::BinaryAdd);
/// builder.emit(Opcode::ReturnValue);
/// let code = builder.build().unwrap();
/// assert_eq!(code.max_stack_size(), 2);
/// ```
#[derive(Debug)]
pub struct CodeBuilder {
    name: String,
    bytecode: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<String>,
    varnames: Vec<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    arg_count: u16,
    flags: CodeFlags,
    first_line: u32,

    /// `(offset delta, line delta)` byte pairs emitted so far.
    line_table: Vec<u8>,
    /// Line of the last line table entry.
    table_line: u32,
    /// Offset of the last line table entry.
    table_offset: usize,
    /// Line requested by `set_line`, recorded when the next instruction is emitted.
    pending_line: Option<u32>,

    /// Bound offset of each label, indexed by label id.
    labels: Vec<Option<usize>>,
    /// Jump instructions still waiting for their label's offset.
    fixups: Vec<(usize, JumpLabel)>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>, first_line: u32) -> Self {
        Self {
            name: name.into(),
            bytecode: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            arg_count: 0,
            flags: CodeFlags::function(),
            first_line,
            line_table: Vec::new(),
            table_line: first_line,
            table_offset: 0,
            pending_line: None,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn set_flags(&mut self, flags: CodeFlags) {
        self.flags = flags;
    }

    pub fn set_arg_count(&mut self, arg_count: u16) {
        self.arg_count = arg_count;
    }

    /// Sets the source line for subsequent instructions.
    ///
    /// Lines must not decrease; a line lower than the last recorded one is ignored.
    pub fn set_line(&mut self, line: u32) {
        self.pending_line = Some(line);
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert!(!op.has_argument(), "{op} takes an argument");
        self.start_instruction();
        self.bytecode.push(op as u8);
    }

    /// Emits an instruction with a u16 operand.
    pub fn emit_arg(&mut self, op: Opcode, arg: u16) {
        debug_assert!(op.has_argument(), "{op} takes no argument");
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&arg.to_le_bytes());
    }

    /// Adds a constant and emits `LoadConst` for it.
    pub fn emit_load_const(&mut self, value: Const) {
        let idx = self.add_const(value);
        self.emit_arg(Opcode::LoadConst, idx);
    }

    /// Creates a label that can be jumped to before or after it is bound.
    #[must_use]
    pub fn new_label(&mut self) -> JumpLabel {
        self.labels.push(None);
        JumpLabel(self.labels.len() - 1)
    }

    /// Binds `label` to the current offset.
    pub fn bind(&mut self, label: JumpLabel) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.bytecode.len());
    }

    /// Emits a jump or block setup instruction targeting `label`.
    ///
    /// The operand is patched in `build()` once every label is bound.
    pub fn emit_jump(&mut self, op: Opcode, label: JumpLabel) {
        debug_assert!(op.jump_kind().is_some(), "{op} is not a jump");
        self.fixups.push((self.bytecode.len(), label));
        self.emit_arg(op, 0);
    }

    /// Returns the current bytecode offset.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// # Panics
    ///
    /// Panics if the constant pool exceeds 65535 entries.
    #[must_use]
    pub fn add_const(&mut self, value: Const) -> u16 {
        let idx = u16::try_from(self.consts.len()).expect("constant pool exceeds u16 range");
        self.consts.push(value);
        idx
    }

    /// Interns a global/scope name, returning its index.
    #[must_use]
    pub fn add_name(&mut self, name: &str) -> u16 {
        intern(&mut self.names, name)
    }

    /// Interns a fast local name, returning its slot.
    #[must_use]
    pub fn add_local(&mut self, name: &str) -> u16 {
        intern(&mut self.varnames, name)
    }

    /// Declares a cell variable, returning its cell index.
    ///
    /// Cell variables must be declared before free variables.
    #[must_use]
    pub fn add_cellvar(&mut self, name: &str) -> u16 {
        debug_assert!(self.freevars.is_empty(), "cell variables precede free variables");
        intern(&mut self.cellvars, name)
    }

    /// Declares a free variable, returning its cell index.
    #[must_use]
    pub fn add_freevar(&mut self, name: &str) -> u16 {
        let idx = intern(&mut self.freevars, name);
        idx + u16::try_from(self.cellvars.len()).expect("too many cell variables")
    }

    /// Builds the final code object.
    ///
    /// Resolves jumps, computes the maximum stack depth and validates the result.
    pub fn build(mut self) -> Result<Code, FrameError> {
        for (offset, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or_else(|| FrameError::invalid_code("jump to an unbound label"))?;
            let instr = Instruction::decode(&self.bytecode, offset)?;
            let arg = match instr.opcode.jump_kind() {
                Some(JumpKind::Relative) => target
                    .checked_sub(instr.next_offset())
                    .ok_or_else(|| FrameError::invalid_code(format!("relative jump at {offset} goes backwards")))?,
                _ => target,
            };
            let arg = u16::try_from(arg).map_err(|_| FrameError::invalid_code("jump offset exceeds u16 range"))?;
            self.bytecode[offset + 1..offset + 3].copy_from_slice(&arg.to_le_bytes());
        }

        let max_stack_size = max_stack_depth(&self.bytecode, self.flags)?;
        Code::new(CodeParts {
            name: self.name,
            bytecode: self.bytecode,
            consts: self.consts,
            names: self.names,
            varnames: self.varnames,
            cellvars: self.cellvars,
            freevars: self.freevars,
            arg_count: self.arg_count,
            max_stack_size,
            flags: self.flags,
            first_line: self.first_line,
            line_table: self.line_table,
        })
    }

    fn start_instruction(&mut self) {
        let Some(line) = self.pending_line.take() else {
            return;
        };
        if line <= self.table_line {
            return;
        }
        let mut addr_delta = self.bytecode.len() - self.table_offset;
        let mut line_delta = line - self.table_line;
        while addr_delta > 255 {
            self.line_table.extend_from_slice(&[255, 0]);
            addr_delta -= 255;
        }
        while line_delta > 255 {
            self.line_table.extend_from_slice(&[addr_delta as u8, 255]);
            line_delta -= 255;
            addr_delta = 0;
        }
        self.line_table.extend_from_slice(&[addr_delta as u8, line_delta as u8]);
        self.table_line = line;
        self.table_offset = self.bytecode.len();
    }
}

/// Label for a jump target.
///
/// Created by `new_label()`, bound with `bind()` and referenced by `emit_jump()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpLabel(usize);

fn intern(table: &mut Vec<String>, name: &str) -> u16 {
    let idx = table.iter().position(|n| n == name).unwrap_or_else(|| {
        table.push(name.to_owned());
        table.len() - 1
    });
    u16::try_from(idx).expect("name table exceeds u16 range")
}

/// Computes the deepest value stack any path through `bytecode` can reach.
///
/// Walks every control flow edge, tracking the statically open blocks so that
/// `PopBlock` and handler entry restore the right depth.
fn max_stack_depth(bytecode: &[u8], flags: CodeFlags) -> Result<u16, FrameError> {
    struct Path {
        offset: usize,
        depth: i64,
        /// Setup opcode and entry depth of each open block.
        blocks: Vec<(Opcode, i64)>,
    }

    let mut visited = AHashSet::new();
    let mut pending = vec![Path {
        offset: 0,
        depth: 0,
        blocks: Vec::new(),
    }];
    let mut max_depth = 0;

    while let Some(mut path) = pending.pop() {
        // handler entries start above the depth of the instruction that queued them
        max_depth = max_depth.max(path.depth);
        while path.offset < bytecode.len() && visited.insert(path.offset) {
            let instr = Instruction::decode(bytecode, path.offset)?;
            let arg = i64::from(instr.arg);
            let mut falls_through = true;
            match instr.opcode {
                Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                    let handler_depth = if instr.opcode == Opcode::SetupLoop {
                        path.depth
                    } else {
                        path.depth + 3
                    };
                    pending.push(Path {
                        offset: instr.jump_target().unwrap_or_default(),
                        depth: handler_depth,
                        blocks: path.blocks.clone(),
                    });
                    path.blocks.push((instr.opcode, path.depth));
                }
                Opcode::PopBlock => {
                    let (setup, depth) = path
                        .blocks
                        .pop()
                        .ok_or_else(|| FrameError::invalid_code(format!("pop block at {} with no block", instr.offset)))?;
                    path.depth = if setup == Opcode::SetupFinally { depth + 3 } else { depth };
                }
                Opcode::EndFinally => path.depth -= 3,
                Opcode::ForIter => {
                    pending.push(Path {
                        offset: instr.jump_target().unwrap_or_default(),
                        depth: path.depth - 1,
                        blocks: path.blocks.clone(),
                    });
                    path.depth += 1;
                }
                Opcode::JumpIfFalse | Opcode::JumpIfTrue => pending.push(Path {
                    offset: instr.jump_target().unwrap_or_default(),
                    depth: path.depth,
                    blocks: path.blocks.clone(),
                }),
                Opcode::JumpForward | Opcode::JumpAbsolute => {
                    path.offset = instr.jump_target().unwrap_or_default();
                    continue;
                }
                Opcode::ReturnValue | Opcode::RaiseVarargs | Opcode::BreakLoop | Opcode::ContinueLoop => {
                    falls_through = false;
                }
                Opcode::YieldValue => {
                    if !flags.accepts_resume_value {
                        path.depth -= 1;
                    }
                }
                op => path.depth += stack_effect(op, arg),
            }
            if path.depth < 0 {
                return Err(FrameError::invalid_code(format!(
                    "stack underflow at offset {}",
                    instr.offset
                )));
            }
            max_depth = max_depth.max(path.depth);
            if !falls_through {
                break;
            }
            path.offset = instr.next_offset();
        }
    }

    u16::try_from(max_depth).map_err(|_| FrameError::invalid_code("stack depth exceeds u16 range"))
}

/// Net stack effect of opcodes without control flow.
fn stack_effect(op: Opcode, arg: i64) -> i64 {
    match op {
        Opcode::PopTop => -1,
        Opcode::DupTop => 1,
        Opcode::RotTwo | Opcode::RotThree | Opcode::Nop => 0,
        Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::GetIter => 0,
        Opcode::BinaryMultiply
        | Opcode::BinaryModulo
        | Opcode::BinaryAdd
        | Opcode::BinarySubtract
        | Opcode::BinarySubscr
        | Opcode::BinaryFloorDivide
        | Opcode::CompareOp => -1,
        Opcode::LoadConst
        | Opcode::LoadName
        | Opcode::LoadGlobal
        | Opcode::LoadFast
        | Opcode::LoadClosure
        | Opcode::LoadDeref => 1,
        Opcode::StoreName | Opcode::StoreGlobal | Opcode::StoreFast | Opcode::StoreDeref => -1,
        Opcode::DeleteName | Opcode::DeleteFast => 0,
        Opcode::UnpackSequence => arg - 1,
        Opcode::BuildTuple => 1 - arg,
        Opcode::CallFunction => -arg,
        Opcode::MakeFunction => -arg,
        Opcode::MakeClosure => -arg - 1,
        // control flow opcodes are handled by the caller
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_encodes_little_endian_operands() {
        let mut builder = CodeBuilder::new("f", 1);
        builder.set_flags(CodeFlags::module());
        let idx = builder.add_const(Const::Int(1));
        for _ in 0..0x1234 {
            let _ = builder.add_const(Const::None);
        }
        builder.emit_arg(Opcode::LoadConst, idx);
        builder.emit_arg(Opcode::LoadConst, 0x1234);
        builder.emit(Opcode::PopTop);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build().unwrap();
        assert_eq!(
            &code.bytecode()[..6],
            &[Opcode::LoadConst as u8, 0, 0, Opcode::LoadConst as u8, 0x34, 0x12]
        );
    }

    #[test]
    fn forward_jump_is_relative_to_next_instruction() {
        let mut builder = CodeBuilder::new("f", 1);
        let end = builder.new_label();
        builder.emit_load_const(Const::None);
        builder.emit_jump(Opcode::JumpForward, end);
        builder.emit(Opcode::Nop);
        builder.emit(Opcode::Nop);
        builder.bind(end);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build().unwrap();
        // jump at 3, next instruction at 6, target at 8
        assert_eq!(&code.bytecode()[3..6], &[Opcode::JumpForward as u8, 2, 0]);
    }

    #[test]
    fn backward_jump_is_absolute() {
        let mut builder = CodeBuilder::new("f", 1);
        let top = builder.new_label();
        builder.emit(Opcode::Nop);
        builder.bind(top);
        builder.emit(Opcode::Nop);
        builder.emit_jump(Opcode::JumpAbsolute, top);

        let code = builder.build().unwrap();
        assert_eq!(&code.bytecode()[2..5], &[Opcode::JumpAbsolute as u8, 1, 0]);
    }

    #[test]
    fn relative_jump_backwards_is_rejected() {
        let mut builder = CodeBuilder::new("f", 1);
        let top = builder.new_label();
        builder.bind(top);
        builder.emit_jump(Opcode::JumpForward, top);

        assert!(matches!(builder.build(), Err(FrameError::InvalidCode(_))));
    }

    #[test]
    fn line_table_records_deltas() {
        let mut builder = CodeBuilder::new("f", 10);
        builder.set_line(11);
        builder.emit_load_const(Const::Int(1)); // offset 0
        builder.emit(Opcode::PopTop); // offset 3
        builder.set_line(13);
        builder.emit_load_const(Const::None); // offset 4
        builder.emit(Opcode::ReturnValue);

        let code = builder.build().unwrap();
        assert_eq!(code.line_table(), &[0, 1, 4, 2]);
        assert_eq!(code.line_for_offset(0), 11);
        assert_eq!(code.line_for_offset(3), 11);
        assert_eq!(code.line_for_offset(4), 13);
        assert_eq!(code.last_line(), 13);
    }

    #[test]
    fn line_table_splits_large_deltas() {
        let mut builder = CodeBuilder::new("f", 1);
        builder.set_line(301);
        builder.emit_load_const(Const::None);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build().unwrap();
        assert_eq!(code.line_table(), &[0, 255, 0, 45]);
        assert_eq!(code.line_for_offset(0), 301);
    }

    #[test]
    fn line_start_inside_an_instruction_is_rejected() {
        let mut parts = CodeParts {
            name: "f".to_owned(),
            // LOAD_CONST 0; RETURN_VALUE
            bytecode: vec![Opcode::LoadConst as u8, 0, 0, Opcode::ReturnValue as u8],
            consts: vec![Const::None],
            max_stack_size: 1,
            first_line: 1,
            line_table: vec![0, 1, 3, 1],
            ..CodeParts::default()
        };
        assert!(Code::new(parts.clone()).is_ok());

        parts.line_table = vec![0, 1, 1, 1];
        assert!(matches!(Code::new(parts), Err(FrameError::InvalidCode(_))));
    }

    #[test]
    fn long_line_padding_may_split_an_instruction() {
        let mut builder = CodeBuilder::new("f", 1);
        builder.emit(Opcode::Nop);
        for _ in 0..75 {
            builder.emit_load_const(Const::None);
            builder.emit(Opcode::PopTop);
        }
        builder.set_line(2);
        builder.emit_load_const(Const::None);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build().unwrap();
        // padding lands at 255, inside the LOAD_CONST at 253
        assert_eq!(code.line_table(), &[255, 0, 46, 1]);
        assert_eq!(code.line_starts().collect::<Vec<_>>(), vec![(301, 2)]);
        assert_eq!(code.line_for_offset(300), 1);
    }

    #[test]
    fn max_stack_accounts_for_handler_entry() {
        let mut builder = CodeBuilder::new("f", 1);
        let handler = builder.new_label();
        let end = builder.new_label();
        builder.emit_jump(Opcode::SetupExcept, handler);
        builder.emit_load_const(Const::None);
        builder.emit(Opcode::PopTop);
        builder.emit(Opcode::PopBlock);
        builder.emit_jump(Opcode::JumpForward, end);
        builder.bind(handler);
        // [unroller, value, type]
        builder.emit(Opcode::PopTop);
        builder.emit(Opcode::PopTop);
        builder.emit(Opcode::PopTop);
        builder.bind(end);
        builder.emit_load_const(Const::None);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build().unwrap();
        assert_eq!(code.max_stack_size(), 3);
    }

    #[test]
    fn stack_underflow_in_code_is_rejected() {
        let mut builder = CodeBuilder::new("f", 1);
        builder.emit(Opcode::PopTop);
        builder.emit(Opcode::ReturnValue);

        assert!(matches!(builder.build(), Err(FrameError::InvalidCode(_))));
    }

    #[test]
    fn names_are_interned() {
        let mut builder = CodeBuilder::new("f", 1);
        assert_eq!(builder.add_name("x"), 0);
        assert_eq!(builder.add_name("y"), 1);
        assert_eq!(builder.add_name("x"), 0);
        let _ = builder.add_cellvar("c");
        assert_eq!(builder.add_freevar("free"), 1);
    }
}
