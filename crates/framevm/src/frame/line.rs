//! Line numbers, line events and debugger-driven jumps.

use std::{fmt, sync::Arc};

use super::{Frame, TraceHook};
use crate::bytecode::{BlockScan, Code, Opcode};

/// Why a debugger jump was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineJumpError {
    /// Jumps are only allowed from inside a trace hook.
    NotTracing,
    BeforeCode { line: u32 },
    AfterCode { line: u32 },
    /// The target line starts with an exception dispatch instruction.
    NoException,
    /// The setup offsets of the finally blocks being executed at the current and target offsets.
    IntoOrOutOfFinally { from: Option<usize>, to: Option<usize> },
    IntoMiddleOfBlock,
}

impl fmt::Display for LineJumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTracing => write!(f, "f_lineno can only be set by a trace function"),
            Self::BeforeCode { line } => write!(f, "line {line} comes before the current code"),
            Self::AfterCode { line } => write!(f, "line {line} comes after the current code"),
            Self::NoException => write!(f, "can't jump to 'except' line as there's no exception"),
            Self::IntoOrOutOfFinally { from, to } => {
                let show = |setup: &Option<usize>| setup.map_or_else(|| "none".to_owned(), |s| s.to_string());
                write!(f, "can't jump into or out of a 'finally' block {} -> {}", show(from), show(to))
            }
            Self::IntoMiddleOfBlock => write!(f, "can't jump into the middle of a block"),
        }
    }
}

impl std::error::Error for LineJumpError {}

impl Frame {
    /// Line of the instruction executed last.
    ///
    /// While a trace hook is attached this is the line last reported to it,
    /// which a jump may have moved away from the physical offset.
    #[must_use]
    pub fn current_line(&self) -> u32 {
        if self.line_trace.hook.is_some() {
            self.line_trace.line
        } else {
            self.last_line()
        }
    }

    fn last_line(&self) -> u32 {
        usize::try_from(self.last_instr).map_or(self.code.first_line(), |offset| self.code.line_for_offset(offset))
    }

    /// Attaches or detaches the line trace hook.
    pub fn set_trace(&mut self, hook: Option<TraceHook>) {
        if hook.is_some() {
            self.line_trace.line = self.last_line();
        }
        self.line_trace.hook = hook;
    }

    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.line_trace.hook.is_some()
    }

    /// Moves execution to the first instruction of `new_line` (or of the next
    /// line with code).
    ///
    /// Only valid from a trace hook. Blocks that the target position is outside
    /// of are popped and their value stack entries discarded. Popped blocks are
    /// unwound, never cleaned up, so no finally handler is primed by a jump.
    /// No line event is reported for the target line.
    pub fn set_current_line(&mut self, new_line: u32) -> Result<(), LineJumpError> {
        if self.line_trace.hook.is_none() {
            return Err(LineJumpError::NotTracing);
        }
        let code = Arc::clone(&self.code);
        if new_line < code.first_line() {
            return Err(LineJumpError::BeforeCode { line: new_line });
        }
        let Some((target, target_line)) = code
            .line_starts()
            .find(|&(_, line)| line >= new_line)
            .filter(|&(addr, _)| addr < code.bytecode().len())
        else {
            return Err(LineJumpError::AfterCode { line: new_line });
        };

        if matches!(code.opcode_at(target), Some(Opcode::DupTop | Opcode::PopTop)) {
            return Err(LineJumpError::NoException);
        }

        let current = usize::try_from(self.last_instr).unwrap_or_default();
        let (from, to) = enclosing_finally(&code, current, target);
        if from != to {
            return Err(LineJumpError::IntoOrOutOfFinally { from, to });
        }

        let (min_addr, max_addr) = if target < current {
            (target, current)
        } else {
            (current, target)
        };
        let mut delta: isize = 0;
        let mut min_delta: isize = 0;
        for instr in code
            .instructions()
            .map_while(Result::ok)
            .skip_while(|instr| instr.offset < min_addr)
            .take_while(|instr| instr.offset < max_addr)
        {
            if instr.opcode.is_block_setup() {
                delta += 1;
            } else if instr.opcode == Opcode::PopBlock {
                delta -= 1;
                min_delta = min_delta.min(delta);
            }
        }

        let live = isize::try_from(self.blocks.len()).unwrap_or(isize::MAX);
        let min_blocks = live + min_delta;
        let new_blocks = if target > current { live + delta } else { live - delta };
        if new_blocks > min_blocks {
            return Err(LineJumpError::IntoMiddleOfBlock);
        }

        while isize::try_from(self.blocks.len()).unwrap_or(isize::MAX) > new_blocks {
            let Some(block) = self.blocks.pop() else { break };
            block.unwind(&mut self.stack);
        }
        self.line_trace.line = target_line;
        self.last_instr = i64::try_from(target).unwrap_or(i64::MAX);
        Ok(())
    }

    /// Updates the line bookkeeping for the instruction at `last_instr` and
    /// returns the line to report, if a line event fires there.
    ///
    /// An event fires on the first instruction of a line and on a backward jump
    /// within the current line.
    pub(crate) fn line_event(&mut self) -> Option<u32> {
        let trace = &mut self.line_trace;
        let last = self.last_instr;
        let mut event = None;
        if trace.instr_lb <= last && last < trace.instr_ub {
            if last < trace.instr_prev {
                event = Some(self.code.line_for_offset(usize::try_from(last).unwrap_or_default()));
            }
        } else {
            let bounds = LineBounds::find(&self.code, usize::try_from(last).unwrap_or_default());
            trace.instr_lb = i64::try_from(bounds.start).unwrap_or(i64::MAX);
            trace.instr_ub = bounds.end.and_then(|end| i64::try_from(end).ok()).unwrap_or(i64::MAX);
            if trace.instr_lb == last {
                event = Some(bounds.line);
            }
        }
        trace.instr_prev = last;
        if let Some(line) = event {
            trace.line = line;
        }
        event
    }
}

/// Setup offsets of the finally blocks whose handlers are executing at
/// `current` and at `target`, found by scanning the static block structure.
fn enclosing_finally(code: &Code, current: usize, target: usize) -> (Option<usize>, Option<usize>) {
    let mut scan = BlockScan::default();
    let mut from = None;
    let mut to = None;
    for instr in code.instructions().map_while(Result::ok) {
        if scan.step(code, &instr).is_err() {
            break;
        }
        if instr.offset == target {
            to = scan.innermost_finally();
        }
        if instr.offset == current {
            from = scan.innermost_finally();
        }
    }
    (from, to)
}

/// Offset range `start..end` covered by one source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineBounds {
    line: u32,
    start: usize,
    /// `None` when the line runs to the end of the code.
    end: Option<usize>,
}

impl LineBounds {
    fn find(code: &Code, offset: usize) -> Self {
        let mut pairs = code.line_table().chunks_exact(2).peekable();
        let mut addr = 0;
        let mut line = code.first_line();
        let mut start = 0;
        while let Some(pair) = pairs.peek() {
            let addr_delta = usize::from(pair[0]);
            if addr + addr_delta > offset {
                break;
            }
            addr += addr_delta;
            if pair[1] != 0 {
                start = addr;
            }
            line += u32::from(pair[1]);
            pairs.next();
        }

        let mut end = None;
        for pair in pairs {
            addr += usize::from(pair[0]);
            if pair[1] != 0 {
                end = Some(addr);
                break;
            }
        }
        if end.is_none() && addr > offset {
            end = Some(addr);
        }
        Self { line, start, end }
    }
}
