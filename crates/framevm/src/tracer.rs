//! Execution tracing.
//!
//! An execution context reports what it does to a [`Tracer`]: dispatched
//! instructions, frames entering and leaving the chain, frames starting and
//! stopping, line events and raised exceptions. The tracer is a type parameter
//! of the context, so with [`NoopTracer`] every hook compiles to nothing.
//!
//! - [`NoopTracer`]: the default
//! - [`StderrTracer`]: an indented execution log on stderr
//! - [`ProfilingTracer`]: opcode and per-code counters
//! - [`RecordingTracer`]: keeps every event, for tests and post-mortems
//!
//! ```
//! use framevm::{ExecutionContext, NoLimitTracker, ProfilingTracer};
//!
//! let ctx = ExecutionContext::with_tracer(NoLimitTracker, ProfilingTracer::new());
//! assert_eq!(ctx.tracer().report().instructions, 0);
//! ```

use std::fmt;

use ahash::AHashMap;

use crate::{bytecode::Opcode, exception::OperationError, value::Value};

/// Hooks called by an execution context.
///
/// Every method has a no-op default. Enter and leave are strictly paired: each
/// frame pushed on the chain is reported left exactly once, including when it
/// exits with an error. `on_call` follows `on_enter` and `on_return` precedes
/// `on_leave`.
pub trait Tracer: fmt::Debug {
    /// Called before each instruction is executed. This is the hot path.
    #[inline(always)]
    fn on_instruction(&mut self, _offset: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    #[inline(always)]
    fn on_enter(&mut self, _code_name: &str, _depth: usize) {}

    #[inline(always)]
    fn on_leave(&mut self, _code_name: &str, _depth: usize) {}

    /// Called when a frame starts or resumes executing.
    #[inline(always)]
    fn on_call(&mut self, _code_name: &str, _depth: usize) {}

    /// Called when a frame returns or yields `value`, or fails (`None`).
    #[inline(always)]
    fn on_return(&mut self, _code_name: &str, _value: Option<&Value>, _depth: usize) {}

    #[inline(always)]
    fn on_line(&mut self, _code_name: &str, _line: u32) {}

    /// Called when an application error is raised in a frame, before handlers run.
    #[inline(always)]
    fn on_exception(&mut self, _code_name: &str, _error: &OperationError) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Prints an execution log to stderr, indented by frame depth.
///
/// ```text
/// -> add (depth 1)
///   : line 2
///   0000 LOAD_FAST          stack 0
///   0003 LOAD_FAST          stack 1
///   0006 BINARY_ADD         stack 2
///   0007 RETURN_VALUE       stack 1
/// <- add = 25
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Instruction lines still to print; `None` prints everything.
    remaining: Option<usize>,
    depth: usize,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops logging after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            remaining: Some(limit),
            depth: 0,
        }
    }

    fn quiet(&self) -> bool {
        self.remaining == Some(0)
    }

    fn indent(&self) -> usize {
        self.depth.saturating_sub(1) * 2
    }
}

impl Tracer for StderrTracer {
    fn on_instruction(&mut self, offset: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        if self.quiet() {
            return;
        }
        let pad = self.indent() + 2;
        eprintln!("{:pad$}{offset:04} {opcode:<18} stack {stack_depth}", "");
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
            if *remaining == 0 {
                eprintln!("(trace limit reached)");
            }
        }
    }

    fn on_call(&mut self, code_name: &str, depth: usize) {
        self.depth = depth;
        if !self.quiet() {
            eprintln!("{:pad$}-> {code_name} (depth {depth})", "", pad = self.indent());
        }
    }

    fn on_return(&mut self, code_name: &str, value: Option<&Value>, depth: usize) {
        self.depth = depth;
        if self.quiet() {
            return;
        }
        let pad = self.indent();
        match value {
            Some(value) => eprintln!("{:pad$}<- {code_name} = {value}", ""),
            None => eprintln!("{:pad$}<- {code_name} failed", ""),
        }
    }

    fn on_leave(&mut self, _code_name: &str, depth: usize) {
        self.depth = depth.saturating_sub(1);
    }

    fn on_line(&mut self, _code_name: &str, line: u32) {
        if !self.quiet() {
            eprintln!("{:pad$}: line {line}", "", pad = self.indent() + 2);
        }
    }

    fn on_exception(&mut self, code_name: &str, error: &OperationError) {
        if !self.quiet() {
            eprintln!("{:pad$}!! {} in {code_name}", "", error.exception(), pad = self.indent() + 2);
        }
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

/// Collects execution counters; read them with [`ProfilingTracer::report`].
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcodes: AHashMap<Opcode, u64>,
    /// Starts (and resumes) per code object name.
    codes: AHashMap<String, u64>,
    instructions: u64,
    exceptions: u64,
    deepest_chain: usize,
}

/// Counters gathered by a [`ProfilingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilingReport {
    /// Executions per opcode, most frequent first.
    pub opcodes: Vec<(Opcode, u64)>,
    /// Frame starts per code object name, most frequent first.
    pub codes: Vec<(String, u64)>,
    pub instructions: u64,
    pub calls: u64,
    pub exceptions: u64,
    pub deepest_chain: usize,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcodes: Vec<(Opcode, u64)> = self.opcodes.iter().map(|(&op, &n)| (op, n)).collect();
        opcodes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));
        let mut codes: Vec<(String, u64)> = self.codes.iter().map(|(name, &n)| (name.clone(), n)).collect();
        codes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ProfilingReport {
            calls: codes.iter().map(|(_, n)| n).sum(),
            opcodes,
            codes,
            instructions: self.instructions,
            exceptions: self.exceptions,
            deepest_chain: self.deepest_chain,
        }
    }
}

impl Tracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _offset: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        *self.opcodes.entry(opcode).or_default() += 1;
        self.instructions += 1;
    }

    fn on_enter(&mut self, _code_name: &str, depth: usize) {
        self.deepest_chain = self.deepest_chain.max(depth);
    }

    fn on_call(&mut self, code_name: &str, _depth: usize) {
        match self.codes.get_mut(code_name) {
            Some(count) => *count += 1,
            None => {
                self.codes.insert(code_name.to_owned(), 1);
            }
        }
    }

    fn on_exception(&mut self, _code_name: &str, _error: &OperationError) {
        self.exceptions += 1;
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} instructions, {} frame starts, {} exceptions, chain depth {}",
            self.instructions, self.calls, self.exceptions, self.deepest_chain
        )?;
        for (name, count) in &self.codes {
            writeln!(f, "  {name:<24} {count:>8}")?;
        }
        for (opcode, count) in &self.opcodes {
            let share = *count as f64 * 100.0 / self.instructions.max(1) as f64;
            writeln!(f, "  {opcode:<24} {count:>8} {share:>5.1}%")?;
        }
        Ok(())
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// One event seen by a [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Instruction {
        offset: usize,
        opcode: Opcode,
        stack_depth: usize,
    },
    /// A frame was pushed on the context's chain.
    Enter { code_name: String, depth: usize },
    /// A frame was popped from the context's chain.
    Leave { code_name: String, depth: usize },
    Call { code_name: String, depth: usize },
    /// A frame stopped running; `value` is `None` when it stopped with an error.
    Return {
        code_name: String,
        value: Option<String>,
        depth: usize,
    },
    Line { code_name: String, line: u32 },
    Exception { code_name: String, error: String },
}

/// Keeps every event in order. Allocates per event.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    skip_instructions: bool,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records everything except per-instruction events.
    #[must_use]
    pub fn without_instructions() -> Self {
        Self {
            events: Vec::new(),
            skip_instructions: true,
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}

impl Tracer for RecordingTracer {
    fn on_instruction(&mut self, offset: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        if !self.skip_instructions {
            self.events.push(TraceEvent::Instruction {
                offset,
                opcode,
                stack_depth,
            });
        }
    }

    fn on_enter(&mut self, code_name: &str, depth: usize) {
        self.events.push(TraceEvent::Enter {
            code_name: code_name.to_owned(),
            depth,
        });
    }

    fn on_leave(&mut self, code_name: &str, depth: usize) {
        self.events.push(TraceEvent::Leave {
            code_name: code_name.to_owned(),
            depth,
        });
    }

    fn on_call(&mut self, code_name: &str, depth: usize) {
        self.events.push(TraceEvent::Call {
            code_name: code_name.to_owned(),
            depth,
        });
    }

    fn on_return(&mut self, code_name: &str, value: Option<&Value>, depth: usize) {
        self.events.push(TraceEvent::Return {
            code_name: code_name.to_owned(),
            value: value.map(ToString::to_string),
            depth,
        });
    }

    fn on_line(&mut self, code_name: &str, line: u32) {
        self.events.push(TraceEvent::Line {
            code_name: code_name.to_owned(),
            line,
        });
    }

    fn on_exception(&mut self, code_name: &str, error: &OperationError) {
        self.events.push(TraceEvent::Exception {
            code_name: code_name.to_owned(),
            error: error.exception().to_string(),
        });
    }
}
