use std::sync::Arc;

use crate::{
    bytecode::Code,
    exception::{OperationError, RunError, RunResult},
    frame::{Frame, FrameId, FrameSnapshot},
    resource::{NoLimitTracker, ResourceTracker},
    tracer::{NoopTracer, Tracer},
    value::{Namespace, Value},
};

use super::FrameExit;

/// Per-thread execution state: the chain of active frames, the resource
/// tracker and the tracer.
///
/// Frames being executed live on the chain, innermost last; each one's `back`
/// is the position of its caller. Every frame pushed is reported to the tracer
/// with `on_enter` and, on every exit path, exactly one `on_leave`.
#[derive(Debug)]
pub struct ExecutionContext<T: ResourceTracker = NoLimitTracker, Tr: Tracer = NoopTracer> {
    pub(crate) frames: Vec<Frame>,
    pub(crate) tracker: T,
    pub(crate) tracer: Tr,
}

impl ExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracer(NoLimitTracker, NoopTracer)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ResourceTracker> ExecutionContext<T> {
    #[must_use]
    pub fn with_tracker(tracker: T) -> Self {
        Self::with_tracer(tracker, NoopTracer)
    }
}

impl<T: ResourceTracker, Tr: Tracer> ExecutionContext<T, Tr> {
    #[must_use]
    pub fn with_tracer(tracker: T, tracer: Tr) -> Self {
        Self {
            frames: Vec::new(),
            tracker,
            tracer,
        }
    }

    /// Number of frames on the chain.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.index())
    }

    /// The innermost frame on the chain.
    #[must_use]
    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tr {
        &mut self.tracer
    }

    #[must_use]
    pub fn into_tracer(self) -> Tr {
        self.tracer
    }

    #[must_use]
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Runs module-level code with `globals` as its namespace.
    pub fn run_code(&mut self, code: Arc<Code>, globals: Namespace) -> RunResult<Value> {
        Frame::new(code, globals, Vec::new())?.run(self)
    }

    /// Runs `frame` from its resume offset until it returns, yields or fails.
    ///
    /// The frame is handed back in every case so that its final state can be
    /// inspected or resumed.
    pub fn execute_frame(&mut self, frame: Frame) -> (Frame, RunResult<FrameExit>) {
        self.run_on_chain(frame, None, None)
    }

    /// Resumes a suspended generator frame.
    ///
    /// `input` is pushed before continuing when the code accepts resume values
    /// and the frame has already started; otherwise it is dropped.
    pub fn execute_generator_frame(&mut self, frame: Frame, input: Option<Value>) -> (Frame, RunResult<FrameExit>) {
        let input = if frame.code().flags().accepts_resume_value && frame.last_instr() != -1 {
            Some(input.unwrap_or(Value::None))
        } else {
            None
        };
        self.run_on_chain(frame, input, None)
    }

    /// Resumes `frame` by raising `err` at its suspension point.
    pub(crate) fn throw_into_frame(&mut self, frame: Frame, err: OperationError) -> (Frame, RunResult<FrameExit>) {
        self.run_on_chain(frame, None, Some(err))
    }

    fn run_on_chain(
        &mut self,
        mut frame: Frame,
        input: Option<Value>,
        throw: Option<OperationError>,
    ) -> (Frame, RunResult<FrameExit>) {
        if let Err(err) = self.tracker.check_depth(self.frames.len()) {
            return (frame, Err(err.into()));
        }
        if let Some(value) = input
            && let Err(err) = frame.stack.push(value)
        {
            return (frame, Err(err.into()));
        }

        let code = Arc::clone(frame.code());
        let guard = FrameGuard::enter(self, frame);
        let ctx = &mut *guard.ctx;
        ctx.tracer.on_call(code.name(), ctx.frames.len());
        let result = ctx.run_frame(throw);
        let returned = match &result {
            Ok(FrameExit::Return(value) | FrameExit::Yield(value)) => Some(value),
            Err(_) => None,
        };
        ctx.tracer.on_return(code.name(), returned, ctx.frames.len());
        let mut frame = guard.leave();
        if result.is_ok() && frame.finished {
            frame.pending_exception = None;
        }
        (frame, result)
    }

    /// Runs a chain of frames restored from a snapshot, outermost first.
    ///
    /// The innermost frame resumes first. Whenever a frame returns, its value
    /// is pushed onto its caller, which then resumes after its call
    /// instruction; an unhandled error is raised in the caller instead. A
    /// yield stops the run and discards the remaining callers.
    pub fn resume_chain(&mut self, mut frames: Vec<Frame>) -> RunResult<FrameExit> {
        let mut outcome: Option<RunResult<Value>> = None;
        while let Some(mut frame) = frames.pop() {
            let (_, result) = match outcome.take() {
                None => self.execute_frame(frame),
                Some(Ok(value)) => {
                    frame.stack.push(value)?;
                    self.execute_frame(frame)
                }
                Some(Err(RunError::Exc(err))) => self.throw_into_frame(frame, *err),
                Some(Err(err)) => return Err(err),
            };
            match result {
                Ok(FrameExit::Return(value)) => outcome = Some(Ok(value)),
                Ok(FrameExit::Yield(value)) => return Ok(FrameExit::Yield(value)),
                Err(err) => outcome = Some(Err(err)),
            }
        }
        match outcome {
            Some(Ok(value)) => Ok(FrameExit::Return(value)),
            Some(Err(err)) => Err(err),
            None => Ok(FrameExit::Return(Value::None)),
        }
    }

    /// The exception being handled, looking from the innermost frame outwards.
    #[must_use]
    pub fn exc_info(&self) -> Option<&OperationError> {
        let mut id = self.frames.len().checked_sub(1);
        while let Some(index) = id {
            let frame = &self.frames[index];
            if let Some(err) = frame.pending_exception() {
                return Some(err);
            }
            id = frame.back().map(FrameId::index);
        }
        None
    }

    /// Captures the frame at `id` together with its callers.
    #[must_use]
    pub fn capture(&self, id: FrameId) -> Option<FrameSnapshot> {
        let frame = self.frame(id)?;
        let back = frame.back().and_then(|back| self.capture(back));
        Some(frame.capture_with_back(back))
    }
}

/// Keeps a frame on the chain for the duration of its execution.
///
/// Dropping the guard pops anything left at or above the frame's position and
/// reports the leave, so the pairing holds when execution unwinds early.
struct FrameGuard<'a, T: ResourceTracker, Tr: Tracer> {
    ctx: &'a mut ExecutionContext<T, Tr>,
    code: Arc<Code>,
    base: usize,
}

impl<'a, T: ResourceTracker, Tr: Tracer> FrameGuard<'a, T, Tr> {
    fn enter(ctx: &'a mut ExecutionContext<T, Tr>, mut frame: Frame) -> Self {
        let base = ctx.frames.len();
        frame.back = base.checked_sub(1).map(FrameId);
        let code = Arc::clone(frame.code());
        ctx.frames.push(frame);
        ctx.tracer.on_enter(code.name(), base + 1);
        Self { ctx, code, base }
    }

    fn leave(self) -> Frame {
        self.ctx.frames.truncate(self.base + 1);
        let mut frame = self.ctx.frames.pop().expect("frame entered by this guard is on the chain");
        frame.back = None;
        frame
    }
}

impl<T: ResourceTracker, Tr: Tracer> Drop for FrameGuard<'_, T, Tr> {
    fn drop(&mut self) {
        self.ctx.frames.truncate(self.base);
        self.ctx.tracer.on_leave(self.code.name(), self.base + 1);
    }
}
