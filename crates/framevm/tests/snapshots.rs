//! Capturing frames, encoding them and resuming the restored copies.

use std::{rc::Rc, sync::Arc};

use framevm::{
    BlockKind, Code, CodeBuilder, CodeFlags, Const, ExcType, ExecutionContext, Frame, FrameExit, FrameId,
    FrameSnapshot, Function, GeneratorRef, GeneratorState, GeneratorStep, Namespace, OperationError, Opcode,
    SnapshotError, Value,
};
use pretty_assertions::assert_eq;

fn reload(snapshot: &FrameSnapshot) -> FrameSnapshot {
    FrameSnapshot::load(&snapshot.dump().unwrap()).unwrap()
}

fn add_code() -> Arc<Code> {
    let mut builder = CodeBuilder::new("add", 1);
    let a = builder.add_local("a");
    let b = builder.add_local("b");
    builder.set_arg_count(2);
    builder.emit_arg(Opcode::LoadFast, a);
    builder.emit_arg(Opcode::LoadFast, b);
    builder.emit(Opcode::BinaryAdd);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

/// `x = yield 1; yield x`
fn echo() -> Arc<Code> {
    let mut builder = CodeBuilder::new("echo", 1);
    builder.set_flags(CodeFlags::generator());
    builder.emit_load_const(Const::Int(1));
    builder.emit(Opcode::YieldValue);
    builder.emit(Opcode::YieldValue);
    builder.emit(Opcode::PopTop);
    builder.emit_load_const(Const::None);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

/// `100 + <call>()`, suspended inside the call.
fn caller_in_call() -> FrameSnapshot {
    let mut builder = CodeBuilder::new("<caller>", 1);
    builder.set_flags(CodeFlags::module());
    builder.emit_load_const(Const::Int(100));
    builder.emit_load_const(Const::None);
    builder.emit_arg(Opcode::CallFunction, 0);
    builder.emit(Opcode::BinaryAdd);
    builder.emit(Opcode::ReturnValue);
    let frame = Frame::new(Arc::new(builder.build().unwrap()), Namespace::new(), Vec::new()).unwrap();

    let mut snapshot = frame.capture();
    snapshot.value_stack = vec![Some(Value::Int(100))];
    snapshot.last_instr = 6;
    snapshot
}

fn callee(args: Vec<Value>, caller: FrameSnapshot) -> FrameSnapshot {
    let mut frame = Frame::new(add_code(), Namespace::new(), Vec::new()).unwrap();
    frame.set_fast_scope(args).unwrap();
    let mut snapshot = frame.capture();
    snapshot.back = Some(Box::new(caller));
    snapshot
}

#[test]
fn suspended_generator_frame_resumes_after_reload() {
    let mut ctx = ExecutionContext::new();
    let generator = GeneratorRef::new(Frame::new(echo(), Namespace::new(), Vec::new()).unwrap());
    assert_eq!(generator.resume(&mut ctx).unwrap(), GeneratorStep::Yielded(Value::Int(1)));

    let snapshot = reload(&generator.with_frame(Frame::capture).unwrap());
    assert_eq!(snapshot.last_instr, 3);
    assert_eq!(snapshot.chain_len(), 1);

    let frame = snapshot.restore().unwrap();
    let (frame, exit) = ctx.execute_generator_frame(frame, Some(Value::Int(42)));
    assert_eq!(exit.unwrap(), FrameExit::Yield(Value::Int(42)));
    assert_eq!(frame.last_instr(), 4);

    // the original is untouched by resuming the copy
    assert_eq!(generator.state(), GeneratorState::Suspended);
    assert_eq!(generator.with_frame(Frame::last_instr), Some(3));
}

/// ```text
/// try:
///     raise ValueError
/// except:
///     kept = 'kept'
///     while ...:
///         yield 1
///         break
/// ```
fn yields_inside_handler() -> Arc<Code> {
    let mut builder = CodeBuilder::new("inside_handler", 1);
    builder.set_flags(CodeFlags::generator());
    let value_error = builder.add_name("ValueError");
    let handler = builder.new_label();
    let after_loop = builder.new_label();
    builder.emit_jump(Opcode::SetupExcept, handler);
    builder.emit_arg(Opcode::LoadGlobal, value_error);
    builder.emit_arg(Opcode::RaiseVarargs, 1);
    builder.bind(handler);
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopTop);
    builder.emit_load_const(Const::Str("kept".to_owned()));
    builder.emit_jump(Opcode::SetupLoop, after_loop);
    builder.emit_load_const(Const::Int(1));
    builder.emit(Opcode::YieldValue);
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopBlock);
    builder.bind(after_loop);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

#[test]
fn live_blocks_and_pending_exception_survive_reload() {
    let mut ctx = ExecutionContext::new();
    let generator = GeneratorRef::new(Frame::new(yields_inside_handler(), Namespace::new(), Vec::new()).unwrap());
    assert_eq!(generator.resume(&mut ctx).unwrap(), GeneratorStep::Yielded(Value::Int(1)));
    let captured = generator.with_frame(Frame::capture).unwrap();
    assert_eq!(captured.blocks.len(), 1);

    let snapshot = reload(&captured);

    assert_eq!(snapshot.blocks, captured.blocks);
    assert_eq!(snapshot.blocks[0].kind, BlockKind::Loop);
    assert_eq!(snapshot.blocks[0].depth, 1);
    assert_eq!(snapshot.value_stack, vec![Some(Value::from("kept"))]);
    assert_eq!(
        snapshot.pending_exception.as_ref().map(OperationError::exc_type),
        Some(ExcType::ValueError)
    );

    let frame = snapshot.restore().unwrap();
    assert_eq!(frame.blocks().len(), 1);
    assert_eq!(frame.blocks()[0].handler(), captured.blocks[0].handler);
    assert_eq!(frame.pending_exception(), captured.pending_exception.as_ref());

    let (frame, exit) = ctx.execute_generator_frame(frame, Some(Value::None));
    assert_eq!(exit.unwrap(), FrameExit::Return(Value::from("kept")));
    assert!(frame.blocks().is_empty());
}

#[test]
fn function_in_its_own_globals_keeps_identity() {
    let globals = Namespace::new();
    let function = Function::new(add_code(), globals.clone(), vec![Value::Int(2)], Vec::new());
    globals.set("add", Value::Function(Rc::new(function)));
    let frame = Frame::new(echo(), globals, Vec::new()).unwrap();

    let snapshot = reload(&frame.capture());

    let Some(Value::Function(function)) = snapshot.globals.get("add") else {
        panic!("function missing from globals");
    };
    assert!(function.globals().ptr_eq(&snapshot.globals));
    assert_eq!(function.defaults(), &[Value::Int(2)]);
    assert_eq!(function.name(), "add");
}

#[test]
fn generator_stored_in_globals_survives_with_its_frame() {
    let globals = Namespace::new();
    let generator = GeneratorRef::new(Frame::new(echo(), globals.clone(), Vec::new()).unwrap());
    globals.set("g", generator.clone().into());
    let mut ctx = ExecutionContext::new();
    generator.resume(&mut ctx).unwrap();

    let module = Frame::new(add_code(), globals, Vec::new()).unwrap();
    let restored = reload(&module.capture()).restore().unwrap();

    let Some(Value::Generator(copy)) = restored.globals().get("g") else {
        panic!("generator missing from globals");
    };
    assert!(!copy.ptr_eq(&generator));
    assert_eq!(copy.state(), GeneratorState::Suspended);
    assert_eq!(copy.with_frame(|frame| frame.globals().ptr_eq(restored.globals())), Some(true));
    assert_eq!(copy.send(&mut ctx, Value::Int(7)).unwrap(), GeneratorStep::Yielded(Value::Int(7)));
    assert_eq!(copy.resume(&mut ctx).unwrap(), GeneratorStep::Returned(Value::None));
}

#[test]
fn cells_shared_between_frames_stay_shared() {
    let mut builder = CodeBuilder::new("inner", 1);
    let n = builder.add_freevar("n");
    builder.emit_arg(Opcode::LoadDeref, n);
    builder.emit(Opcode::ReturnValue);
    let inner = Arc::new(builder.build().unwrap());

    let cell = framevm::Cell::new(Some(Value::Int(5)));
    let first = Frame::new(Arc::clone(&inner), Namespace::new(), vec![cell.clone()]).unwrap();
    let second = Frame::new(inner, Namespace::new(), vec![cell]).unwrap();

    let mut outer = second.capture();
    outer.back = Some(Box::new(first.capture()));
    let chain = reload(&outer).restore_chain().unwrap();

    assert_eq!(chain.len(), 2);
    assert!(chain[0].cells()[0].ptr_eq(&chain[1].cells()[0]));
    chain[0].cells()[0].set(Some(Value::Int(6)));
    assert_eq!(chain[1].cells()[0].get(), Some(Value::Int(6)));
}

#[test]
fn restored_chain_links_callers() {
    let snapshot = reload(&callee(vec![Value::Int(1), Value::Int(2)], caller_in_call()));
    assert_eq!(snapshot.chain_len(), 2);

    let chain = snapshot.restore_chain().unwrap();

    assert_eq!(chain[0].code().name(), "<caller>");
    assert_eq!(chain[0].back(), None);
    assert_eq!(chain[1].code().name(), "add");
    assert_eq!(chain[1].back().map(FrameId::index), Some(0));
}

#[test]
fn resumed_chain_returns_into_caller() {
    let chain = reload(&callee(vec![Value::Int(1), Value::Int(2)], caller_in_call()))
        .restore_chain()
        .unwrap();

    let mut ctx = ExecutionContext::new();
    let exit = ctx.resume_chain(chain).unwrap();

    assert_eq!(exit, FrameExit::Return(Value::Int(103)));
    assert_eq!(ctx.depth(), 0);
}

#[test]
fn error_in_resumed_callee_propagates_through_caller() {
    let chain = reload(&callee(vec![Value::Int(1), Value::from("x")], caller_in_call()))
        .restore_chain()
        .unwrap();

    let err = ExecutionContext::new().resume_chain(chain).unwrap_err();

    assert!(err.is_exception_type(ExcType::TypeError));
    let names: Vec<&str> = err
        .operation_error()
        .unwrap()
        .traceback()
        .iter()
        .map(|entry| entry.code_name.as_str())
        .collect();
    assert_eq!(names, vec!["add", "<caller>"]);
}

#[test]
fn truncated_bytes_are_a_codec_error() {
    let frame = Frame::new(add_code(), Namespace::new(), Vec::new()).unwrap();
    let bytes = frame.capture().dump().unwrap();

    let err = FrameSnapshot::load(&bytes[..bytes.len() / 2]).unwrap_err();

    assert!(matches!(err, SnapshotError::Codec(_)));
}

#[test]
fn missing_stack_slot_is_rejected() {
    let mut snapshot = caller_in_call();
    snapshot.value_stack = vec![None];

    assert!(matches!(
        snapshot.restore(),
        Err(SnapshotError::MissingStackSlot { index: 0 })
    ));
}

#[test]
fn wrong_cell_count_is_rejected() {
    let mut snapshot = Frame::new(add_code(), Namespace::new(), Vec::new()).unwrap().capture();
    snapshot.cells.push(framevm::Cell::new(None));

    assert!(matches!(
        snapshot.restore(),
        Err(SnapshotError::CellsMismatch { expected: 0, found: 1 })
    ));
}
