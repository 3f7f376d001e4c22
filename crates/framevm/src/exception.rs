use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::value::Value;

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Exception classes known to the built-in object space.
///
/// Uses strum derives for `Display`, `FromStr` and `Into<&'static str>`; the string
/// form is the variant name, which is also the name the class is bound to in the
/// default builtins namespace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr, Serialize, Deserialize,
)]
pub enum ExcType {
    BaseException,
    Exception,
    GeneratorExit,
    StopIteration,
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,
    LookupError,
    IndexError,
    KeyError,
    NameError,
    UnboundLocalError,
    RuntimeError,
    RecursionError,
    TimeoutError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Whether an exception of type `self` is caught by a handler for `handler_type`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            // GeneratorExit derives from BaseException directly
            Self::Exception => !matches!(self, Self::BaseException | Self::GeneratorExit),
            Self::ArithmeticError => matches!(self, Self::OverflowError | Self::ZeroDivisionError),
            Self::LookupError => matches!(self, Self::IndexError | Self::KeyError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            Self::RuntimeError => matches!(self, Self::RecursionError),
            _ => false,
        }
    }
}

/// An exception instance: its class plus an optional message argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionValue {
    exc_type: ExcType,
    message: Option<String>,
}

impl ExceptionValue {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self { exc_type, message }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for ExceptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

/// One traceback line: the frame an application error passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackEntry {
    /// Name of the code object the frame was executing.
    pub code_name: String,
    /// Source line of the failing instruction.
    pub line: u32,
    /// Byte offset of the failing instruction.
    pub offset: usize,
}

/// An application-level error in flight.
///
/// Carries the exception instance and the traceback accumulated while the error
/// unwinds the call chain. Entries are appended innermost frame first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    exc: ExceptionValue,
    traceback: Vec<TracebackEntry>,
}

impl OperationError {
    #[must_use]
    pub fn new(exc_type: ExcType, message: impl Into<String>) -> Self {
        Self::from_exception(ExceptionValue::new(exc_type, Some(message.into())))
    }

    /// Creates an error with no message, like `raise StopIteration`.
    #[must_use]
    pub fn bare(exc_type: ExcType) -> Self {
        Self::from_exception(ExceptionValue::new(exc_type, None))
    }

    #[must_use]
    pub fn from_exception(exc: ExceptionValue) -> Self {
        Self {
            exc,
            traceback: Vec::new(),
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc.exc_type
    }

    #[must_use]
    pub fn exception(&self) -> &ExceptionValue {
        &self.exc
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.exc.message()
    }

    /// The exception instance as a runtime value, as pushed for handlers.
    #[must_use]
    pub fn value(&self) -> Value {
        Value::Exception(Box::new(self.exc.clone()))
    }

    #[must_use]
    pub fn traceback(&self) -> &[TracebackEntry] {
        &self.traceback
    }

    /// Whether a handler for `exc_type` would catch this error.
    #[must_use]
    pub fn matches(&self, exc_type: ExcType) -> bool {
        self.exc.exc_type.is_subclass_of(exc_type)
    }

    pub(crate) fn push_traceback(&mut self, entry: TracebackEntry) {
        self.traceback.push(entry);
    }

    pub(crate) fn type_error(msg: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, msg)
    }

    pub(crate) fn name_error(name: &str) -> Self {
        Self::new(ExcType::NameError, format!("name '{name}' is not defined"))
    }

    pub(crate) fn unbound_local(name: &str) -> Self {
        Self::new(
            ExcType::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    pub(crate) fn free_var_unbound(name: &str) -> Self {
        Self::new(
            ExcType::NameError,
            format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for entry in self.traceback.iter().rev() {
                writeln!(
                    f,
                    "  in {}, line {} (offset {})",
                    entry.code_name, entry.line, entry.offset
                )?;
            }
        }
        write!(f, "{}", self.exc)
    }
}

impl std::error::Error for OperationError {}

/// Contract violations: programming errors in the bytecode or in the embedder.
///
/// These never reach application handlers; they abort the current operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Pop or peek below the bottom of the value stack.
    StackUnderflow,
    /// Push beyond the code object's declared maximum stack size.
    StackOverflow { capacity: usize },
    /// Bulk restore of the value stack met a missing slot.
    MissingStackSlot { index: usize },
    /// The code object is inconsistent with itself or with its caller.
    InvalidCode(Cow<'static, str>),
    /// The byte at `offset` is not a known opcode or its argument is truncated.
    InvalidOpcode { offset: usize, byte: u8 },
    /// The live block stack does not match what an instruction expects.
    MalformedBlockStack(Cow<'static, str>),
    /// A generator was resumed while its frame was already executing.
    GeneratorAlreadyRunning,
    /// More arguments than the frame has fast local slots.
    FastScopeTooLong { slots: usize, given: usize },
}

impl FrameError {
    pub(crate) fn invalid_code(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidCode(msg.into())
    }

    pub(crate) fn malformed_blocks(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::MalformedBlockStack(msg.into())
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow => write!(f, "value stack underflow"),
            Self::StackOverflow { capacity } => write!(f, "value stack overflow (capacity {capacity})"),
            Self::MissingStackSlot { index } => write!(f, "missing value stack slot {index}"),
            Self::InvalidCode(msg) => write!(f, "invalid code object: {msg}"),
            Self::InvalidOpcode { offset, byte } => write!(f, "invalid opcode {byte} at offset {offset}"),
            Self::MalformedBlockStack(msg) => write!(f, "malformed block stack: {msg}"),
            Self::GeneratorAlreadyRunning => write!(f, "generator already executing"),
            Self::FastScopeTooLong { slots, given } => {
                write!(f, "new fastscope is longer than the allocated area ({given} > {slots})")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Runtime error types that can occur during execution.
///
/// Three variants:
/// - `Fatal`: contract violation, never routed through the block stack
/// - `Exc`: application error that handlers may catch
/// - `Uncatchable`: application error from resource limits that bypasses every handler
#[derive(Debug, Clone, PartialEq)]
pub enum RunError {
    Fatal(FrameError),
    Exc(Box<OperationError>),
    Uncatchable(Box<OperationError>),
}

impl RunError {
    /// Returns the application error, if this is one.
    #[must_use]
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            Self::Exc(err) | Self::Uncatchable(err) => Some(err),
            Self::Fatal(_) => None,
        }
    }

    /// Returns true if this is a catchable exception handled by `exc_type`.
    #[must_use]
    pub fn is_exception_type(&self, exc_type: ExcType) -> bool {
        matches!(self, Self::Exc(err) if err.matches(exc_type))
    }
}

impl From<OperationError> for RunError {
    fn from(err: OperationError) -> Self {
        Self::Exc(Box::new(err))
    }
}

impl From<FrameError> for RunError {
    fn from(err: FrameError) -> Self {
        Self::Fatal(err)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal(err) => write!(f, "fatal: {err}"),
            Self::Exc(err) | Self::Uncatchable(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RunError {}
