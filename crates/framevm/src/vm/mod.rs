//! The dispatch loop.
//!
//! [`ExecutionContext::run_frame`] executes the innermost frame on the chain
//! from its resume offset until the frame returns, yields or fails. Application
//! errors raised by an instruction are routed through the frame's block stack;
//! contract violations and uncatchable errors finish the frame immediately.

use std::{rc::Rc, sync::Arc};

pub use context::ExecutionContext;

use crate::{
    bytecode::{Comparison, Instruction, Opcode},
    exception::{ExcType, FrameError, OperationError, RunError, RunResult, TracebackEntry},
    frame::{BlockKind, BlockMarker, Frame, Locals, Unrolled, Unroller, default_builtins},
    resource::ResourceTracker,
    tracer::Tracer,
    value::{Cell, Function, Value},
};

mod context;
mod space;

/// How a frame stopped running.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameExit {
    /// The frame finished and produced a value.
    Return(Value),
    /// The frame suspended at a yield and can be resumed.
    Yield(Value),
}

/// What the dispatch loop does after an instruction.
#[derive(Debug)]
enum Flow {
    Next,
    Jump(usize),
    Return(Value),
    Yield(Value),
    /// An unwind left the frame with an error already recorded in its traceback.
    Raise(Box<OperationError>),
}

fn top(frames: &mut [Frame]) -> Result<&mut Frame, FrameError> {
    frames
        .last_mut()
        .ok_or_else(|| FrameError::invalid_code("no frame on the execution chain"))
}

fn jump_target(instr: &Instruction) -> Result<usize, FrameError> {
    instr
        .jump_target()
        .ok_or_else(|| FrameError::invalid_code(format!("{} is not a jump", instr.opcode)))
}

/// Turns the result of an unwind started by `return`, `break`, `continue` or
/// `END_FINALLY` into the next step.
fn unrolled_flow(frame: &mut Frame, unrolled: Unrolled) -> Result<Flow, FrameError> {
    match unrolled {
        Unrolled::Handled(target) => Ok(Flow::Jump(target)),
        Unrolled::Unhandled(Unroller::Return(value)) => Ok(Flow::Return(value)),
        Unrolled::Unhandled(Unroller::Exception(err)) => {
            frame.pending_exception = Some((*err).clone());
            Ok(Flow::Raise(err))
        }
        Unrolled::Unhandled(other) => Err(FrameError::malformed_blocks(format!(
            "{}: '{}' outside a loop",
            frame.code().name(),
            other.kind_name()
        ))),
    }
}

impl<T: ResourceTracker, Tr: Tracer> ExecutionContext<T, Tr> {
    /// Runs the innermost frame on the chain.
    ///
    /// With `throw`, the error is raised at the frame's last instruction before
    /// anything else executes.
    pub(crate) fn run_frame(&mut self, throw: Option<OperationError>) -> RunResult<FrameExit> {
        let mut offset = top(&mut self.frames)?.resume_offset()?;
        if let Some(err) = throw {
            let at = usize::try_from(top(&mut self.frames)?.last_instr).unwrap_or_default();
            offset = match self.raise(err, at) {
                Ok(handler) => handler,
                Err(err) => return self.fail(err),
            };
        }

        loop {
            if let Err(err) = self.tracker.on_dispatch() {
                return self.fail(err.into());
            }
            let frame_depth = self.frames.len();
            let frame = top(&mut self.frames)?;
            frame.last_instr = i64::try_from(offset).unwrap_or(i64::MAX);

            if let Some(line) = frame.line_event() {
                self.tracer.on_line(frame.code().name(), line);
                if let Some(hook) = frame.line_trace.hook.clone() {
                    hook.call(frame, line);
                    offset = usize::try_from(frame.last_instr).unwrap_or_default();
                }
            }

            let instr = match Instruction::decode(frame.code().bytecode(), offset) {
                Ok(instr) => instr,
                Err(err) => return self.fail(err.into()),
            };
            self.tracer
                .on_instruction(offset, instr.opcode, frame.stack.depth(), frame_depth);

            let flow = match self.execute(instr) {
                Ok(flow) => flow,
                Err(RunError::Exc(err)) => match self.raise(*err, offset) {
                    Ok(handler) => Flow::Jump(handler),
                    Err(err) => return self.fail(err),
                },
                Err(err) => return self.fail(err),
            };
            match flow {
                Flow::Next => offset = instr.next_offset(),
                Flow::Jump(target) => offset = target,
                Flow::Return(value) => {
                    top(&mut self.frames)?.finish();
                    return Ok(FrameExit::Return(value));
                }
                Flow::Yield(value) => return Ok(FrameExit::Yield(value)),
                Flow::Raise(err) => return self.fail(RunError::Exc(err)),
            }
        }
    }

    /// Finishes the innermost frame with `err`.
    fn fail(&mut self, err: RunError) -> RunResult<FrameExit> {
        if let Some(frame) = self.frames.last_mut() {
            frame.finish();
        }
        Err(err)
    }

    /// Raises `err` at `offset` in the innermost frame, returning the handler
    /// offset or the error to propagate to the caller.
    fn raise(&mut self, mut err: OperationError, offset: usize) -> Result<usize, RunError> {
        let frame = top(&mut self.frames)?;
        let code = Arc::clone(frame.code());
        err.push_traceback(TracebackEntry {
            code_name: code.name().to_owned(),
            line: code.line_for_offset(offset),
            offset,
        });
        self.tracer.on_exception(code.name(), &err);
        match frame.unroll(Unroller::Exception(Box::new(err)))? {
            Unrolled::Handled(handler) => Ok(handler),
            Unrolled::Unhandled(Unroller::Exception(err)) => {
                frame.pending_exception = Some((*err).clone());
                Err(RunError::Exc(err))
            }
            Unrolled::Unhandled(other) => Err(FrameError::malformed_blocks(format!(
                "exception unwind ended as '{}'",
                other.kind_name()
            ))
            .into()),
        }
    }

    fn execute(&mut self, instr: Instruction) -> RunResult<Flow> {
        let arg = usize::from(instr.arg);
        let frame = top(&mut self.frames)?;
        let code = Arc::clone(frame.code());
        let name = || {
            code.names()
                .get(arg)
                .map(String::as_str)
                .ok_or_else(|| FrameError::invalid_code(format!("name index {arg} out of range")))
        };

        match instr.opcode {
            Opcode::Nop => {}
            Opcode::PopTop => {
                frame.stack.pop()?;
            }
            Opcode::RotTwo => {
                let top = frame.stack.pop()?;
                let second = frame.stack.pop()?;
                frame.stack.push(top)?;
                frame.stack.push(second)?;
            }
            Opcode::RotThree => {
                let top = frame.stack.pop()?;
                let second = frame.stack.pop()?;
                let third = frame.stack.pop()?;
                frame.stack.push(top)?;
                frame.stack.push(third)?;
                frame.stack.push(second)?;
            }
            Opcode::DupTop => frame.stack.dup_n(1)?,

            Opcode::UnaryPositive => {
                let value = frame.stack.pop()?;
                frame.stack.push(space::unary_positive(&value)?)?;
            }
            Opcode::UnaryNegative => {
                let value = frame.stack.pop()?;
                frame.stack.push(space::unary_negative(&value)?)?;
            }
            Opcode::UnaryNot => {
                let value = frame.stack.pop()?;
                frame.stack.push(Value::Bool(!space::is_true(&value)))?;
            }
            Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryFloorDivide => {
                let op = match instr.opcode {
                    Opcode::BinaryAdd => space::BinaryOp::Add,
                    Opcode::BinarySubtract => space::BinaryOp::Sub,
                    Opcode::BinaryMultiply => space::BinaryOp::Mul,
                    Opcode::BinaryModulo => space::BinaryOp::Mod,
                    _ => space::BinaryOp::FloorDiv,
                };
                let rhs = frame.stack.pop()?;
                let lhs = frame.stack.pop()?;
                frame.stack.push(space::binary(op, &lhs, &rhs)?)?;
            }
            Opcode::BinarySubscr => {
                let index = frame.stack.pop()?;
                let container = frame.stack.pop()?;
                frame.stack.push(space::subscript(&container, &index)?)?;
            }
            Opcode::CompareOp => {
                let op = Comparison::from_arg(instr.arg)
                    .ok_or_else(|| FrameError::invalid_code(format!("unknown comparison {arg}")))?;
                let rhs = frame.stack.pop()?;
                let lhs = frame.stack.pop()?;
                frame.stack.push(space::compare(op, &lhs, &rhs)?)?;
            }

            Opcode::GetIter => {
                let value = frame.stack.pop()?;
                frame.stack.push(space::get_iter(value)?)?;
            }
            Opcode::ForIter => {
                let target = jump_target(&instr)?;
                let next = match frame.stack.peek(0)?.clone() {
                    Value::Iterator(iter) => iter.next_item(),
                    Value::Generator(generator) => generator.next_value(self)?,
                    other => {
                        return Err(OperationError::type_error(format!(
                            "'{}' object is not an iterator",
                            other.type_name()
                        ))
                        .into());
                    }
                };
                let frame = top(&mut self.frames)?;
                match next {
                    Some(value) => frame.stack.push(value)?,
                    None => {
                        frame.stack.pop()?;
                        return Ok(Flow::Jump(target));
                    }
                }
            }
            Opcode::UnpackSequence => {
                let value = frame.stack.pop()?;
                frame.stack.push_rev(space::unpack(&value, arg)?)?;
            }
            Opcode::BuildTuple => {
                let items = frame.stack.pop_n(arg)?;
                frame.stack.push(space::tuple(items))?;
            }

            Opcode::JumpForward | Opcode::JumpAbsolute => return Ok(Flow::Jump(jump_target(&instr)?)),
            Opcode::JumpIfFalse => {
                if !space::is_true(frame.stack.peek(0)?) {
                    return Ok(Flow::Jump(jump_target(&instr)?));
                }
            }
            Opcode::JumpIfTrue => {
                if space::is_true(frame.stack.peek(0)?) {
                    return Ok(Flow::Jump(jump_target(&instr)?));
                }
            }

            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                let kind = match instr.opcode {
                    Opcode::SetupLoop => BlockKind::Loop,
                    Opcode::SetupExcept => BlockKind::Except,
                    _ => BlockKind::Finally,
                };
                let depth = frame.stack.depth();
                frame.push_block(BlockMarker::new(kind, jump_target(&instr)?, depth));
            }
            Opcode::PopBlock => {
                let block = frame.pop_block()?;
                block.cleanup(&mut frame.stack)?;
            }
            Opcode::EndFinally => {
                let [unroller, _value, _exc_type]: [Value; 3] = frame
                    .stack
                    .pop_n(3)?
                    .try_into()
                    .map_err(|_| FrameError::StackUnderflow)?;
                match unroller {
                    Value::None => {}
                    Value::Unroller(unroller) => {
                        let unrolled = frame.unroll(*unroller)?;
                        return unrolled_flow(frame, unrolled).map_err(Into::into);
                    }
                    other => {
                        return Err(FrameError::malformed_blocks(format!(
                            "END_FINALLY expected an unroller, found {other}"
                        ))
                        .into());
                    }
                }
            }
            Opcode::BreakLoop => {
                let unrolled = frame.unroll(Unroller::Break)?;
                return unrolled_flow(frame, unrolled).map_err(Into::into);
            }
            Opcode::ContinueLoop => {
                let unrolled = frame.unroll(Unroller::Continue(jump_target(&instr)?))?;
                return unrolled_flow(frame, unrolled).map_err(Into::into);
            }
            Opcode::ReturnValue => {
                let value = frame.stack.pop()?;
                let unrolled = frame.unroll(Unroller::Return(value))?;
                return unrolled_flow(frame, unrolled).map_err(Into::into);
            }
            Opcode::YieldValue => return Ok(Flow::Yield(frame.stack.pop()?)),

            Opcode::LoadConst => {
                let value = code
                    .consts()
                    .get(arg)
                    .ok_or_else(|| FrameError::invalid_code(format!("constant index {arg} out of range")))?
                    .to_value();
                frame.stack.push(value)?;
            }
            Opcode::LoadName => {
                let name = name()?;
                let local = match frame.locals() {
                    Locals::Dict(ns) => ns.get(name),
                    Locals::Fast(_) => return Err(fast_locals_by_name(code.name()).into()),
                };
                let value = local
                    .or_else(|| frame.globals().get(name))
                    .or_else(|| frame.builtins().get(name))
                    .ok_or_else(|| OperationError::name_error(name))?;
                frame.stack.push(value)?;
            }
            Opcode::StoreName => {
                let value = frame.stack.pop()?;
                match frame.locals() {
                    Locals::Dict(ns) => ns.set(name()?, value),
                    Locals::Fast(_) => return Err(fast_locals_by_name(code.name()).into()),
                }
            }
            Opcode::DeleteName => {
                let name = name()?;
                match frame.locals() {
                    Locals::Dict(ns) => {
                        if !ns.remove(name) {
                            return Err(OperationError::name_error(name).into());
                        }
                    }
                    Locals::Fast(_) => return Err(fast_locals_by_name(code.name()).into()),
                }
            }
            Opcode::LoadGlobal => {
                let name = name()?;
                let value = frame
                    .globals()
                    .get(name)
                    .or_else(|| frame.builtins().get(name))
                    .ok_or_else(|| OperationError::name_error(name))?;
                frame.stack.push(value)?;
            }
            Opcode::StoreGlobal => {
                let value = frame.stack.pop()?;
                frame.globals().set(name()?, value);
            }

            Opcode::LoadFast => {
                let value = fast_slot(frame.locals_mut(), arg)?.clone();
                let value = value.ok_or_else(|| OperationError::unbound_local(local_name(code.varnames(), arg)))?;
                frame.stack.push(value)?;
            }
            Opcode::StoreFast => {
                let value = frame.stack.pop()?;
                *fast_slot(frame.locals_mut(), arg)? = Some(value);
            }
            Opcode::DeleteFast => {
                let slot = fast_slot(frame.locals_mut(), arg)?;
                if slot.take().is_none() {
                    return Err(OperationError::unbound_local(local_name(code.varnames(), arg)).into());
                }
            }
            Opcode::LoadClosure => {
                let cell = cell_at(frame, arg)?.clone();
                frame.stack.push(Value::Cell(cell))?;
            }
            Opcode::LoadDeref => {
                let value = cell_at(frame, arg)?.get().ok_or_else(|| {
                    let name = code.cell_name(arg);
                    if arg < code.cellvars().len() {
                        OperationError::unbound_local(name)
                    } else {
                        OperationError::free_var_unbound(name)
                    }
                })?;
                frame.stack.push(value)?;
            }
            Opcode::StoreDeref => {
                let value = frame.stack.pop()?;
                cell_at(frame, arg)?.set(Some(value));
            }

            Opcode::RaiseVarargs => {
                let err = match arg {
                    0 => {
                        return Err(match self.exc_info() {
                            Some(err) => RunError::Exc(Box::new(err.clone())),
                            None => OperationError::new(ExcType::RuntimeError, "No active exception to reraise").into(),
                        });
                    }
                    1 => {
                        let value = frame.stack.pop()?;
                        space::make_exception(value, None)
                    }
                    2 => {
                        let exc_arg = frame.stack.pop()?;
                        let exc_type = frame.stack.pop()?;
                        space::make_exception(exc_type, Some(exc_arg))
                    }
                    _ => return Err(FrameError::invalid_code(format!("RAISE_VARARGS with {arg} arguments")).into()),
                };
                return Err(err.unwrap_or_else(|type_error| type_error).into());
            }
            Opcode::CallFunction => {
                let args = frame.stack.pop_n(arg)?;
                let callee = frame.stack.pop()?;
                let result = self.call_value(callee, args)?;
                top(&mut self.frames)?.stack.push(result)?;
            }
            Opcode::MakeFunction | Opcode::MakeClosure => {
                let Value::Code(function_code) = frame.stack.pop()? else {
                    return Err(FrameError::invalid_code("function body is not a code object").into());
                };
                let closure = if instr.opcode == Opcode::MakeClosure {
                    let cells = closure_cells(frame.stack.pop()?)?;
                    if cells.len() != function_code.freevars().len() {
                        return Err(FrameError::invalid_code(format!(
                            "{}: closure has {} cells for {} free variables",
                            function_code.name(),
                            cells.len(),
                            function_code.freevars().len()
                        ))
                        .into());
                    }
                    cells
                } else {
                    Vec::new()
                };
                let defaults = frame.stack.pop_n(arg)?;
                let function = Function::new(function_code, frame.globals().clone(), defaults, closure);
                frame.stack.push(Value::Function(Rc::new(function)))?;
            }
        }
        Ok(Flow::Next)
    }

    /// Calls `callee` with positional `args`.
    fn call_value(&mut self, callee: Value, mut args: Vec<Value>) -> RunResult<Value> {
        match callee {
            Value::Function(function) => {
                let code = Arc::clone(function.code());
                let arg_count = code.arg_count();
                let defaults = function.defaults();
                let required = arg_count.saturating_sub(defaults.len());
                if args.len() > arg_count {
                    return Err(OperationError::type_error(format!(
                        "{}() takes {arg_count} positional arguments but {} were given",
                        code.name(),
                        args.len()
                    ))
                    .into());
                }
                if args.len() < required {
                    return Err(OperationError::type_error(format!(
                        "{}() missing {} required positional arguments",
                        code.name(),
                        required - args.len()
                    ))
                    .into());
                }
                let missing = arg_count - args.len();
                args.extend_from_slice(&defaults[defaults.len() - missing..]);

                let builtins = self
                    .frames
                    .last()
                    .map_or_else(default_builtins, |caller| caller.builtins().clone());
                let mut frame =
                    Frame::with_builtins(code, function.globals().clone(), builtins, function.closure().to_vec())?;
                frame.set_fast_scope(args)?;
                frame.run(self)
            }
            Value::Builtin(builtin) => Ok(space::call_builtin(builtin, &args)?),
            Value::ExcType(exc_type) => Ok(space::instantiate(exc_type, &args).value()),
            other => Err(OperationError::type_error(format!("'{}' object is not callable", other.type_name())).into()),
        }
    }
}

fn fast_locals_by_name(code_name: &str) -> FrameError {
    FrameError::invalid_code(format!("{code_name}: name access in a frame with fast locals"))
}

fn fast_slot(locals: &mut Locals, index: usize) -> Result<&mut Option<Value>, FrameError> {
    match locals {
        Locals::Fast(slots) => slots
            .get_mut(index)
            .ok_or_else(|| FrameError::invalid_code(format!("local slot {index} out of range"))),
        Locals::Dict(_) => Err(FrameError::invalid_code("fast local access in a frame with dict locals")),
    }
}

fn local_name(varnames: &[String], index: usize) -> &str {
    varnames.get(index).map_or("<local>", String::as_str)
}

fn cell_at(frame: &Frame, index: usize) -> Result<&Cell, FrameError> {
    frame
        .cells()
        .get(index)
        .ok_or_else(|| FrameError::invalid_code(format!("cell index {index} out of range")))
}

fn closure_cells(value: Value) -> Result<Vec<Cell>, FrameError> {
    let Value::Tuple(items) = value else {
        return Err(FrameError::invalid_code("closure is not a tuple of cells"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Cell(cell) => Ok(cell.clone()),
            _ => Err(FrameError::invalid_code("closure is not a tuple of cells")),
        })
        .collect()
}
