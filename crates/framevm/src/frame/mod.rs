//! Execution frames.
//!
//! A [`Frame`] is one in-progress invocation of a code object: its value stack,
//! block stack, locals, closure cells and line-trace state. Frames are run by an
//! [`ExecutionContext`](crate::ExecutionContext), which links them into a chain
//! through their `back` references.
//!
//! # Module Structure
//!
//! - `stack` - bounded value stack
//! - `block` - block markers and unwinding
//! - `line` - line numbers, line events and debugger jumps
//! - `snapshot` - frame capture and restore

use std::{fmt, rc::Rc, sync::Arc};

use smallvec::SmallVec;

pub use block::{BlockKind, BlockMarker, Unroller};
pub(crate) use block::Unrolled;
pub use line::LineJumpError;
pub use snapshot::{BlockSnapshot, FrameSnapshot, LocalsSnapshot, SNAPSHOT_VERSION, SnapshotError};
pub use stack::ValueStack;

use crate::{
    bytecode::Code,
    exception::{FrameError, OperationError, RunResult},
    generator::GeneratorRef,
    resource::ResourceTracker,
    tracer::Tracer,
    value::{Cell, Namespace, Value},
    vm::{ExecutionContext, FrameExit},
};

mod block;
mod line;
mod snapshot;
mod stack;

/// Live block markers, innermost last.
pub type BlockStack = SmallVec<[BlockMarker; 8]>;

thread_local! {
    static DEFAULT_BUILTINS: Namespace = Namespace::with_builtins();
}

/// The builtins namespace shared by frames created without an explicit one.
#[must_use]
pub fn default_builtins() -> Namespace {
    DEFAULT_BUILTINS.with(Namespace::clone)
}

/// Position of a frame in its execution context's chain, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) usize);

impl FrameId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Local variable storage, chosen once from the code flags.
#[derive(Debug, Clone)]
pub enum Locals {
    /// Fixed slots addressed by index; `None` is unbound.
    Fast(Vec<Option<Value>>),
    /// A name mapping, possibly the globals themselves.
    Dict(Namespace),
}

/// Callback invoked on line events while a frame is traced.
///
/// The hook receives the frame mutably and may jump with
/// [`Frame::set_current_line`].
#[derive(Clone)]
pub struct TraceHook(Rc<dyn Fn(&mut Frame, u32)>);

impl TraceHook {
    pub fn new(hook: impl Fn(&mut Frame, u32) + 'static) -> Self {
        Self(Rc::new(hook))
    }

    pub(crate) fn call(&self, frame: &mut Frame, line: u32) {
        (self.0)(frame, line);
    }
}

impl fmt::Debug for TraceHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TraceHook")
    }
}

/// Line tracing state.
///
/// `instr_lb..instr_ub` is the offset range of the line last reported and
/// `instr_prev` the previously traced offset; together they decide when a line
/// event fires.
#[derive(Debug, Clone)]
pub(crate) struct LineTrace {
    pub line: u32,
    pub hook: Option<TraceHook>,
    pub instr_lb: i64,
    pub instr_ub: i64,
    pub instr_prev: i64,
}

impl LineTrace {
    fn new(line: u32) -> Self {
        Self {
            line,
            hook: None,
            instr_lb: 0,
            instr_ub: -1,
            instr_prev: -1,
        }
    }
}

/// One in-progress invocation of a code object.
#[derive(Debug)]
pub struct Frame {
    code: Arc<Code>,
    globals: Namespace,
    builtins: Namespace,
    locals: Locals,
    /// Cell variables followed by free variables.
    cells: Vec<Cell>,
    pub(crate) stack: ValueStack,
    pub(crate) blocks: BlockStack,
    /// Offset of the instruction executed last, `-1` before the first one.
    pub(crate) last_instr: i64,
    pub(crate) back: Option<FrameId>,
    pub(crate) pending_exception: Option<OperationError>,
    pub(crate) line_trace: LineTrace,
    pub(crate) finished: bool,
}

impl Frame {
    /// Creates a frame using the default builtins.
    pub fn new(code: Arc<Code>, globals: Namespace, closure: Vec<Cell>) -> Result<Self, FrameError> {
        Self::with_builtins(code, globals, default_builtins(), closure)
    }

    /// Creates a frame ready to run `code` from its first instruction.
    ///
    /// `closure` must supply exactly one cell per free variable of `code`.
    pub fn with_builtins(
        code: Arc<Code>,
        globals: Namespace,
        builtins: Namespace,
        closure: Vec<Cell>,
    ) -> Result<Self, FrameError> {
        if closure.len() != code.freevars().len() {
            return Err(FrameError::invalid_code(format!(
                "{}: expected {} closure cells, got {}",
                code.name(),
                code.freevars().len(),
                closure.len()
            )));
        }
        let flags = code.flags();
        let locals = if flags.optimized {
            Locals::Fast(vec![None; code.local_count()])
        } else if flags.new_locals {
            Locals::Dict(Namespace::new())
        } else {
            Locals::Dict(globals.clone())
        };
        let cells = code
            .cellvars()
            .iter()
            .map(|_| Cell::default())
            .chain(closure)
            .collect();

        Ok(Self {
            stack: ValueStack::new(code.max_stack_size()),
            blocks: BlockStack::new(),
            last_instr: -1,
            back: None,
            pending_exception: None,
            line_trace: LineTrace::new(code.first_line()),
            finished: false,
            code,
            globals,
            builtins,
            locals,
            cells,
        })
    }

    /// Binds `args` to the leading fast local slots, then copies arguments that
    /// are also cell variables into their cells.
    pub fn set_fast_scope(&mut self, args: Vec<Value>) -> Result<(), FrameError> {
        let Locals::Fast(slots) = &mut self.locals else {
            return Err(FrameError::invalid_code(format!(
                "{}: fast scope on a frame with dict locals",
                self.code.name()
            )));
        };
        if args.len() > slots.len() {
            return Err(FrameError::FastScopeTooLong {
                slots: slots.len(),
                given: args.len(),
            });
        }
        for (slot, arg) in slots.iter_mut().zip(args) {
            *slot = Some(arg);
        }

        let arg_names = &self.code.varnames()[..self.code.arg_count()];
        for (cell, name) in self.cells.iter().zip(self.code.cellvars()) {
            if let Some(index) = arg_names.iter().position(|arg| arg == name) {
                cell.set(slots[index].clone());
            }
        }
        Ok(())
    }

    /// Runs the frame to completion.
    ///
    /// Generator code is not executed; the frame is wrapped in a new generator instead.
    pub fn run<T: ResourceTracker, Tr: Tracer>(self, ctx: &mut ExecutionContext<T, Tr>) -> RunResult<Value> {
        if self.code.flags().generator {
            return Ok(Value::Generator(GeneratorRef::new(self)));
        }
        let (_, exit) = ctx.execute_frame(self);
        match exit? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) => Err(FrameError::invalid_code("yield from a frame that is not a generator").into()),
        }
    }

    /// Offset of the next instruction to execute.
    pub fn resume_offset(&self) -> Result<usize, FrameError> {
        let Ok(offset) = usize::try_from(self.last_instr) else {
            return Ok(0);
        };
        match self.code.opcode_at(offset) {
            Some(op) => Ok(offset + op.width()),
            None => Err(FrameError::InvalidOpcode {
                offset,
                byte: self.code.bytecode().get(offset).copied().unwrap_or_default(),
            }),
        }
    }

    #[must_use]
    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    #[must_use]
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    #[must_use]
    pub fn builtins(&self) -> &Namespace {
        &self.builtins
    }

    #[must_use]
    pub fn locals(&self) -> &Locals {
        &self.locals
    }

    pub(crate) fn locals_mut(&mut self) -> &mut Locals {
        &mut self.locals
    }

    /// Value of fast local `index`, if the frame has fast locals and it is bound.
    #[must_use]
    pub fn fast_local(&self, index: usize) -> Option<&Value> {
        match &self.locals {
            Locals::Fast(slots) => slots.get(index)?.as_ref(),
            Locals::Dict(_) => None,
        }
    }

    pub fn set_fast_local(&mut self, index: usize, value: Value) -> Result<(), FrameError> {
        let Locals::Fast(slots) = &mut self.locals else {
            return Err(FrameError::invalid_code("frame has dict locals"));
        };
        let slot = slots
            .get_mut(index)
            .ok_or_else(|| FrameError::invalid_code(format!("local slot {index} out of range")))?;
        *slot = Some(value);
        Ok(())
    }

    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    #[must_use]
    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut ValueStack {
        &mut self.stack
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockMarker] {
        &self.blocks
    }

    pub fn push_block(&mut self, block: BlockMarker) {
        self.blocks.push(block);
    }

    pub fn pop_block(&mut self) -> Result<BlockMarker, FrameError> {
        self.blocks
            .pop()
            .ok_or_else(|| FrameError::malformed_blocks(format!("{}: pop from an empty block stack", self.code.name())))
    }

    #[must_use]
    pub fn last_instr(&self) -> i64 {
        self.last_instr
    }

    /// The calling frame, while this frame is on an execution context's chain.
    #[must_use]
    pub fn back(&self) -> Option<FrameId> {
        self.back
    }

    /// The exception most recently raised in this frame, if any.
    #[must_use]
    pub fn pending_exception(&self) -> Option<&OperationError> {
        self.pending_exception.as_ref()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Marks the frame as done and drops whatever is left on its stacks.
    pub(crate) fn finish(&mut self) {
        self.finished = true;
        self.stack.truncate_to(0);
        self.blocks.clear();
    }
}
