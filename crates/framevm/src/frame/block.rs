//! Block markers and unwinding.
//!
//! A block marker is pushed by a `Setup*` instruction and records where its
//! handler starts and how deep the value stack was at that point. Unwinding pops
//! markers innermost-first until one of them handles the reason for the unwind.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use super::{Frame, stack::ValueStack};
use crate::{
    exception::{FrameError, OperationError},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum BlockKind {
    /// `SetupLoop`: handles `break` and `continue`.
    Loop,
    /// `SetupExcept`: handles exceptions.
    Except,
    /// `SetupFinally`: handles every unwind reason.
    Finally,
}

/// An entry of the block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMarker {
    kind: BlockKind,
    handler: usize,
    depth: usize,
}

impl BlockMarker {
    #[must_use]
    pub fn new(kind: BlockKind, handler: usize, depth: usize) -> Self {
        Self { kind, handler, depth }
    }

    #[must_use]
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Offset where the handler (or loop exit) starts.
    #[must_use]
    pub fn handler(&self) -> usize {
        self.handler
    }

    /// Value stack depth when the block was entered.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this block stops an unwind for `unroller`.
    #[must_use]
    pub fn handles(&self, unroller: &Unroller) -> bool {
        match self.kind {
            BlockKind::Loop => matches!(unroller, Unroller::Break | Unroller::Continue(_)),
            BlockKind::Except => matches!(unroller, Unroller::Exception(_)),
            BlockKind::Finally => true,
        }
    }

    /// Restores the value stack to the block's entry depth.
    pub(crate) fn unwind(&self, stack: &mut ValueStack) {
        stack.truncate_to(self.depth);
    }

    /// Action taken when `PopBlock` leaves the block normally.
    ///
    /// Leaving the protected body of a finally block falls into the handler, so
    /// the `EndFinally` triple is primed with `None`s.
    pub(crate) fn cleanup(&self, stack: &mut ValueStack) -> Result<(), FrameError> {
        self.unwind(stack);
        if self.kind == BlockKind::Finally {
            for _ in 0..3 {
                stack.push(Value::None)?;
            }
        }
        Ok(())
    }

    /// Enters the handler for `unroller`, returning the offset to continue at.
    fn handle(self, frame: &mut Frame, unroller: Unroller) -> Result<usize, FrameError> {
        match (self.kind, unroller) {
            (BlockKind::Loop, Unroller::Continue(target)) => {
                // the loop keeps running, so its block stays
                frame.blocks.push(self);
                Ok(target)
            }
            (BlockKind::Loop, _) => {
                self.unwind(&mut frame.stack);
                Ok(self.handler)
            }
            (_, Unroller::Exception(err)) => {
                self.unwind(&mut frame.stack);
                let value = err.value();
                let exc_type = Value::ExcType(err.exc_type());
                frame.pending_exception = Some((*err).clone());
                frame.stack.push(Value::Unroller(Box::new(Unroller::Exception(err))))?;
                frame.stack.push(value)?;
                frame.stack.push(exc_type)?;
                Ok(self.handler)
            }
            (_, unroller) => {
                self.unwind(&mut frame.stack);
                frame.stack.push(Value::Unroller(Box::new(unroller)))?;
                frame.stack.push(Value::None)?;
                frame.stack.push(Value::None)?;
                Ok(self.handler)
            }
        }
    }
}

/// Why the frame is unwinding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Unroller {
    Return(Value),
    Break,
    /// `continue` from inside a handler, carrying the loop start offset.
    Continue(usize),
    Exception(Box<OperationError>),
}

impl Unroller {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Return(_) => "return",
            Self::Break => "break",
            Self::Continue(_) => "continue",
            Self::Exception(_) => "exception",
        }
    }
}

/// Outcome of unwinding the block stack.
#[derive(Debug)]
pub(crate) enum Unrolled {
    /// A block took over; continue at this offset.
    Handled(usize),
    /// The block stack emptied without a handler.
    Unhandled(Unroller),
}

impl Frame {
    /// Pops blocks until one handles `unroller`, unwinding the value stack of
    /// every block passed on the way.
    pub(crate) fn unroll(&mut self, unroller: Unroller) -> Result<Unrolled, FrameError> {
        while let Some(block) = self.blocks.pop() {
            if block.handles(&unroller) {
                return block.handle(self, unroller).map(Unrolled::Handled);
            }
            block.unwind(&mut self.stack);
        }
        Ok(Unrolled::Unhandled(unroller))
    }
}
