//! Generator objects.
//!
//! A generator owns the suspended frame of a generator code object. Each resume
//! takes the frame out, runs it on the caller's execution context until it
//! yields, returns or fails, and puts it back. While the frame is out the
//! generator is `Running`, so a resume from inside its own body is rejected.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use strum::{Display, IntoStaticStr};

use crate::{
    exception::{ExcType, FrameError, OperationError, RunResult},
    frame::{Frame, FrameSnapshot},
    resource::ResourceTracker,
    shared::Shared,
    tracer::Tracer,
    value::Value,
    vm::{ExecutionContext, FrameExit},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum GeneratorState {
    /// Created but never resumed.
    NotStarted,
    /// Suspended at a yield.
    Suspended,
    /// Its frame is executing.
    Running,
    /// The frame returned.
    #[default]
    Completed,
    /// The frame finished with an error.
    Errored,
}

impl GeneratorState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// Result of resuming a generator.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorStep {
    Yielded(Value),
    Returned(Value),
}

#[derive(Debug, Default)]
pub struct Generator {
    state: GeneratorState,
    name: String,
    /// `None` while running.
    frame: Option<Frame>,
}

#[derive(Serialize, Deserialize)]
struct SerializedGenerator {
    state: GeneratorState,
    name: String,
    frame: Option<FrameSnapshot>,
}

impl Serialize for Generator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SerializedGenerator {
            state: self.state,
            name: self.name.clone(),
            frame: self.frame.as_ref().map(Frame::capture),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Generator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let serialized = SerializedGenerator::deserialize(deserializer)?;
        let frame = serialized
            .frame
            .map(|snapshot| snapshot.restore())
            .transpose()
            .map_err(de::Error::custom)?;
        // a generator captured mid-run has its frame on the chain, not here
        let state = match (serialized.state, &frame) {
            (GeneratorState::Running, _) | (_, None) => GeneratorState::Errored,
            (state, Some(_)) => state,
        };
        Ok(Self {
            state,
            name: serialized.name,
            frame,
        })
    }
}

/// Shared handle to a generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratorRef(Shared<Generator>);

impl GeneratorRef {
    /// Wraps a fresh frame of generator code.
    #[must_use]
    pub fn new(frame: Frame) -> Self {
        Self(Shared::new(Generator {
            state: GeneratorState::NotStarted,
            name: frame.code().name().to_owned(),
            frame: Some(frame),
        }))
    }

    #[must_use]
    pub fn state(&self) -> GeneratorState {
        self.0.borrow().state
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }

    /// Runs `f` on the suspended frame. Returns `None` while the generator runs.
    pub fn with_frame<R>(&self, f: impl FnOnce(&Frame) -> R) -> Option<R> {
        self.0.borrow().frame.as_ref().map(f)
    }

    /// Resumes the generator with `None` as the value of the pending yield.
    pub fn resume<T: ResourceTracker, Tr: Tracer>(
        &self,
        ctx: &mut ExecutionContext<T, Tr>,
    ) -> RunResult<GeneratorStep> {
        self.send(ctx, Value::None)
    }

    /// Resumes the generator with `value` as the result of the pending yield.
    ///
    /// A generator that has not started only accepts `None`. Resuming a
    /// completed or failed generator raises `StopIteration`.
    pub fn send<T: ResourceTracker, Tr: Tracer>(
        &self,
        ctx: &mut ExecutionContext<T, Tr>,
        value: Value,
    ) -> RunResult<GeneratorStep> {
        let frame = self.take_frame(!value.is_none())?;
        let (frame, result) = ctx.execute_generator_frame(frame, Some(value));
        self.settle(frame, result)
    }

    /// Raises `err` inside the generator at its suspension point.
    ///
    /// A generator that has not started is marked failed without running; a
    /// finished one re-raises `err` directly.
    pub fn throw<T: ResourceTracker, Tr: Tracer>(
        &self,
        ctx: &mut ExecutionContext<T, Tr>,
        err: OperationError,
    ) -> RunResult<GeneratorStep> {
        {
            let mut generator = self.0.borrow_mut();
            match generator.state {
                GeneratorState::Running => return Err(FrameError::GeneratorAlreadyRunning.into()),
                GeneratorState::NotStarted => {
                    generator.state = GeneratorState::Errored;
                    if let Some(frame) = generator.frame.as_mut() {
                        frame.finish();
                    }
                    return Err(err.into());
                }
                GeneratorState::Completed | GeneratorState::Errored => return Err(err.into()),
                GeneratorState::Suspended => {}
            }
        }
        let frame = self.take_frame(false)?;
        let (frame, result) = ctx.throw_into_frame(frame, err);
        self.settle(frame, result)
    }

    /// Raises `GeneratorExit` inside a suspended generator and expects it to finish.
    pub fn close<T: ResourceTracker, Tr: Tracer>(&self, ctx: &mut ExecutionContext<T, Tr>) -> RunResult<()> {
        match self.state() {
            GeneratorState::NotStarted => {
                let mut generator = self.0.borrow_mut();
                generator.state = GeneratorState::Completed;
                if let Some(frame) = generator.frame.as_mut() {
                    frame.finish();
                }
                return Ok(());
            }
            GeneratorState::Completed | GeneratorState::Errored => return Ok(()),
            GeneratorState::Suspended | GeneratorState::Running => {}
        }
        match self.throw(ctx, OperationError::bare(ExcType::GeneratorExit)) {
            Ok(GeneratorStep::Yielded(_)) => {
                Err(OperationError::new(ExcType::RuntimeError, "generator ignored GeneratorExit").into())
            }
            Ok(GeneratorStep::Returned(_)) => Ok(()),
            Err(err) if err.is_exception_type(ExcType::GeneratorExit) || err.is_exception_type(ExcType::StopIteration) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Next value for iteration; `None` once the generator is exhausted.
    pub(crate) fn next_value<T: ResourceTracker, Tr: Tracer>(
        &self,
        ctx: &mut ExecutionContext<T, Tr>,
    ) -> RunResult<Option<Value>> {
        match self.resume(ctx) {
            Ok(GeneratorStep::Yielded(value)) => Ok(Some(value)),
            Ok(GeneratorStep::Returned(_)) => Ok(None),
            Err(err) if err.is_exception_type(ExcType::StopIteration) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn take_frame(&self, sending_value: bool) -> RunResult<Frame> {
        let mut guard = self.0.borrow_mut();
        let generator = &mut *guard;
        match generator.state {
            GeneratorState::Running => return Err(FrameError::GeneratorAlreadyRunning.into()),
            GeneratorState::Completed | GeneratorState::Errored => {
                return Err(OperationError::bare(ExcType::StopIteration).into());
            }
            GeneratorState::NotStarted if sending_value => {
                return Err(OperationError::type_error("can't send non-None value to a just-started generator").into());
            }
            GeneratorState::NotStarted | GeneratorState::Suspended => {}
        }
        let frame = generator
            .frame
            .take()
            .ok_or_else(|| FrameError::invalid_code(format!("generator {} has no frame", generator.name)))?;
        generator.state = GeneratorState::Running;
        Ok(frame)
    }

    fn settle(&self, frame: Frame, result: RunResult<FrameExit>) -> RunResult<GeneratorStep> {
        let mut generator = self.0.borrow_mut();
        generator.frame = Some(frame);
        match result {
            Ok(FrameExit::Yield(value)) => {
                generator.state = GeneratorState::Suspended;
                Ok(GeneratorStep::Yielded(value))
            }
            Ok(FrameExit::Return(value)) => {
                generator.state = GeneratorState::Completed;
                Ok(GeneratorStep::Returned(value))
            }
            Err(err) => {
                generator.state = GeneratorState::Errored;
                Err(err)
            }
        }
    }
}

impl From<GeneratorRef> for Value {
    fn from(generator: GeneratorRef) -> Self {
        Self::Generator(generator)
    }
}
