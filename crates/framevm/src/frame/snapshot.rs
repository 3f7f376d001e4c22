//! Frame capture and restore.
//!
//! A [`FrameSnapshot`] is a versioned record of every mutable field of a frame,
//! plus the caller chain it was captured with. Restoring builds a fresh frame
//! through [`Frame::with_builtins`] and then overwrites its state from the
//! snapshot, validating each field; malformed input is rejected as a whole.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{BlockKind, BlockMarker, Frame, FrameId, Locals};
use crate::{
    bytecode::Code,
    exception::{FrameError, OperationError},
    shared::with_session,
    value::{Cell, Namespace, Value},
};

/// Format version written into every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub kind: BlockKind,
    pub handler: usize,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalsSnapshot {
    Fast(Vec<Option<Value>>),
    Dict(Namespace),
    /// The locals are the frame's globals.
    Globals,
}

/// Captured state of a frame and, through `back`, of its callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub version: u32,
    pub code: Arc<Code>,
    pub back: Option<Box<FrameSnapshot>>,
    pub builtins: Namespace,
    /// Live value stack slots, bottom first. A missing slot is rejected on restore.
    pub value_stack: Vec<Option<Value>>,
    pub blocks: Vec<BlockSnapshot>,
    pub pending_exception: Option<OperationError>,
    pub globals: Namespace,
    pub last_instr: i64,
    pub finished: bool,
    pub line: u32,
    pub locals: LocalsSnapshot,
    pub instr_lb: i64,
    pub instr_ub: i64,
    pub instr_prev: i64,
    /// Cell variables followed by free variables.
    pub cells: Vec<Cell>,
}

#[derive(Debug)]
pub enum SnapshotError {
    VersionMismatch { expected: u32, found: u32 },
    /// `last_instr` is neither `-1` nor the offset of an instruction.
    OffsetOutOfRange { offset: i64 },
    MissingStackSlot { index: usize },
    StackOverflow { capacity: usize },
    /// Block `index` has a depth above the stack or a handler off an instruction boundary.
    BadBlock { index: usize },
    /// The locals shape does not match the code flags or slot count.
    LocalsMismatch,
    CellsMismatch { expected: usize, found: usize },
    InvalidFrame(FrameError),
    Codec(postcard::Error),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch { expected, found } => {
                write!(f, "snapshot version {found} is not supported (expected {expected})")
            }
            Self::OffsetOutOfRange { offset } => write!(f, "last instruction offset {offset} is out of range"),
            Self::MissingStackSlot { index } => write!(f, "value stack slot {index} is missing"),
            Self::StackOverflow { capacity } => write!(f, "value stack exceeds capacity {capacity}"),
            Self::BadBlock { index } => write!(f, "block {index} is inconsistent with the frame"),
            Self::LocalsMismatch => write!(f, "locals do not match the code object"),
            Self::CellsMismatch { expected, found } => write!(f, "expected {expected} cells, found {found}"),
            Self::InvalidFrame(err) => write!(f, "{err}"),
            Self::Codec(err) => write!(f, "snapshot encoding failed: {err}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<postcard::Error> for SnapshotError {
    fn from(err: postcard::Error) -> Self {
        Self::Codec(err)
    }
}

impl Frame {
    /// Captures this frame alone, with no caller.
    #[must_use]
    pub fn capture(&self) -> FrameSnapshot {
        self.capture_with_back(None)
    }

    pub(crate) fn capture_with_back(&self, back: Option<FrameSnapshot>) -> FrameSnapshot {
        let locals = match &self.locals {
            Locals::Fast(slots) => LocalsSnapshot::Fast(slots.clone()),
            Locals::Dict(ns) if ns.ptr_eq(&self.globals) => LocalsSnapshot::Globals,
            Locals::Dict(ns) => LocalsSnapshot::Dict(ns.clone()),
        };
        FrameSnapshot {
            version: SNAPSHOT_VERSION,
            code: Arc::clone(&self.code),
            back: back.map(Box::new),
            builtins: self.builtins.clone(),
            value_stack: self.stack.save().into_iter().map(Some).collect(),
            blocks: self
                .blocks
                .iter()
                .map(|block| BlockSnapshot {
                    kind: block.kind(),
                    handler: block.handler(),
                    depth: block.depth(),
                })
                .collect(),
            pending_exception: self.pending_exception.clone(),
            globals: self.globals.clone(),
            last_instr: self.last_instr,
            finished: self.finished,
            line: self.current_line(),
            locals,
            instr_lb: self.line_trace.instr_lb,
            instr_ub: self.line_trace.instr_ub,
            instr_prev: self.line_trace.instr_prev,
            cells: self.cells.clone(),
        }
    }
}

impl FrameSnapshot {
    /// Rebuilds the captured frame, ignoring its callers.
    ///
    /// The restored frame is not linked to any context and has no trace hook.
    pub fn restore(&self) -> Result<Frame, SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: self.version,
            });
        }
        let code = Arc::clone(&self.code);
        if self.cells.len() != code.cell_count() {
            return Err(SnapshotError::CellsMismatch {
                expected: code.cell_count(),
                found: self.cells.len(),
            });
        }
        if self.last_instr != -1 && !is_boundary(&code, self.last_instr) {
            return Err(SnapshotError::OffsetOutOfRange {
                offset: self.last_instr,
            });
        }

        let (cellvars, closure) = self.cells.split_at(code.cellvars().len());
        let mut frame = Frame::with_builtins(
            Arc::clone(&code),
            self.globals.clone(),
            self.builtins.clone(),
            closure.to_vec(),
        )
        .map_err(SnapshotError::InvalidFrame)?;
        frame.cells[..cellvars.len()].clone_from_slice(cellvars);

        frame.stack.restore(self.value_stack.clone()).map_err(|err| match err {
            FrameError::MissingStackSlot { index } => SnapshotError::MissingStackSlot { index },
            FrameError::StackOverflow { capacity } => SnapshotError::StackOverflow { capacity },
            other => SnapshotError::InvalidFrame(other),
        })?;

        let mut min_depth = 0;
        for (index, block) in self.blocks.iter().enumerate() {
            let handler_ok = i64::try_from(block.handler).is_ok_and(|handler| is_boundary(&code, handler));
            if !handler_ok || block.depth > self.value_stack.len() || block.depth < min_depth {
                return Err(SnapshotError::BadBlock { index });
            }
            min_depth = block.depth;
            frame.push_block(BlockMarker::new(block.kind, block.handler, block.depth));
        }

        let flags = code.flags();
        frame.locals = match (&self.locals, flags.optimized, flags.new_locals) {
            (LocalsSnapshot::Fast(slots), true, _) if slots.len() == code.local_count() => Locals::Fast(slots.clone()),
            (LocalsSnapshot::Dict(ns), false, true) => Locals::Dict(ns.clone()),
            (LocalsSnapshot::Globals, false, false) => Locals::Dict(self.globals.clone()),
            _ => return Err(SnapshotError::LocalsMismatch),
        };

        frame.pending_exception.clone_from(&self.pending_exception);
        frame.last_instr = self.last_instr;
        frame.finished = self.finished;
        frame.line_trace.line = self.line;
        frame.line_trace.instr_lb = self.instr_lb;
        frame.line_trace.instr_ub = self.instr_ub;
        frame.line_trace.instr_prev = self.instr_prev;
        Ok(frame)
    }

    /// Rebuilds this frame and every captured caller, outermost first.
    ///
    /// Each frame's `back` refers to the position of its caller in the result.
    pub fn restore_chain(&self) -> Result<Vec<Frame>, SnapshotError> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(snapshot) = current {
            chain.push(snapshot.restore()?);
            current = snapshot.back.as_deref();
        }
        chain.reverse();
        for (index, frame) in chain.iter_mut().enumerate() {
            frame.back = index.checked_sub(1).map(FrameId);
        }
        Ok(chain)
    }

    /// Number of frames in the captured chain, this one included.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        std::iter::successors(Some(self), |snapshot| snapshot.back.as_deref()).count()
    }

    /// Encodes the snapshot with postcard.
    ///
    /// Shared values (namespaces, cells, generators) keep their identity within one dump.
    pub fn dump(&self) -> Result<Vec<u8>, SnapshotError> {
        with_session(|| postcard::to_allocvec(self)).map_err(SnapshotError::from)
    }

    /// Decodes a snapshot produced by [`dump`](Self::dump).
    pub fn load(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot = with_session(|| postcard::from_bytes::<Self>(bytes))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }
}

fn is_boundary(code: &Code, offset: i64) -> bool {
    usize::try_from(offset).is_ok_and(|offset| {
        code.instructions()
            .map_while(Result::ok)
            .any(|instr| instr.offset == offset)
    })
}
