#![doc = include_str!("../../../README.md")]

pub mod bytecode;
pub mod exception;
pub mod frame;
pub mod generator;
pub mod resource;
mod shared;
pub mod tracer;
pub mod value;
pub mod vm;

pub use crate::{
    bytecode::{Code, CodeBuilder, CodeFlags, Const, Opcode},
    exception::{ExcType, FrameError, OperationError, RunError, RunResult, TracebackEntry},
    frame::{
        BlockKind, BlockMarker, Frame, FrameId, FrameSnapshot, LineJumpError, Locals, SnapshotError, TraceHook,
        Unroller, ValueStack, default_builtins,
    },
    generator::{GeneratorRef, GeneratorState, GeneratorStep},
    resource::{LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker},
    shared::with_session,
    tracer::{NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer, TraceEvent, Tracer},
    value::{Builtin, Cell, Function, Namespace, Value},
    vm::{ExecutionContext, FrameExit},
};
