//! Debugger jumps through `Frame::set_current_line`.

use std::{cell::RefCell, rc::Rc, sync::Arc};

use framevm::{
    Code, CodeBuilder, Const, ExecutionContext, Frame, LineJumpError, Namespace, Opcode, TraceHook, Value,
};
use pretty_assertions::assert_eq;

/// Outcome of a jump attempted from a hook, with the frame state right after.
#[derive(Debug, Default)]
struct Attempt {
    result: Option<Result<(), LineJumpError>>,
    blocks_after: usize,
    line_after: u32,
    lines_seen: Vec<u32>,
}

/// Runs `code`, attempting a jump to `to_line` the first time line `from_line` is reported.
fn attempt_jump(code: Arc<Code>, from_line: u32, to_line: u32) -> (Value, Attempt) {
    let attempt = Rc::new(RefCell::new(Attempt::default()));
    let seen = Rc::clone(&attempt);
    let hook = TraceHook::new(move |frame, line| {
        let mut attempt = seen.borrow_mut();
        attempt.lines_seen.push(line);
        if line == from_line && attempt.result.is_none() {
            attempt.result = Some(frame.set_current_line(to_line));
            attempt.blocks_after = frame.blocks().len();
            attempt.line_after = frame.current_line();
        }
    });

    let mut frame = Frame::new(code, Namespace::new(), Vec::new()).unwrap();
    frame.set_trace(Some(hook));
    let value = frame.run(&mut ExecutionContext::new()).unwrap();
    let attempt = attempt.take();
    (value, attempt)
}

/// ```text
/// 2  x = 1
/// 3  x = 2
/// 4  return x
/// ```
fn assignments() -> Arc<Code> {
    let mut builder = CodeBuilder::new("assign", 1);
    let x = builder.add_local("x");
    builder.set_line(2);
    builder.emit_load_const(Const::Int(1));
    builder.emit_arg(Opcode::StoreFast, x);
    builder.set_line(3);
    builder.emit_load_const(Const::Int(2));
    builder.emit_arg(Opcode::StoreFast, x);
    builder.set_line(4);
    builder.emit_arg(Opcode::LoadFast, x);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

/// ```text
/// 2  try:
/// 3      None
/// 4  except:
///        pass
/// 5  return None
/// ```
fn try_except() -> Arc<Code> {
    let mut builder = CodeBuilder::new("try_except", 1);
    let handler = builder.new_label();
    let end = builder.new_label();
    builder.set_line(2);
    builder.emit_jump(Opcode::SetupExcept, handler);
    builder.set_line(3);
    builder.emit_load_const(Const::None);
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopBlock);
    builder.emit_jump(Opcode::JumpForward, end);
    builder.set_line(4);
    builder.bind(handler);
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopTop);
    builder.set_line(5);
    builder.bind(end);
    builder.emit_load_const(Const::None);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

/// ```text
/// 2  try:
/// 3      1
/// 4  finally:
///        2
/// 5  return None
/// ```
fn try_finally() -> Arc<Code> {
    let mut builder = CodeBuilder::new("try_finally", 1);
    let handler = builder.new_label();
    builder.set_line(2);
    builder.emit_jump(Opcode::SetupFinally, handler);
    builder.set_line(3);
    builder.emit_load_const(Const::Int(1));
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopBlock);
    builder.set_line(4);
    builder.bind(handler);
    builder.emit_load_const(Const::Int(2));
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::EndFinally);
    builder.set_line(5);
    builder.emit_load_const(Const::None);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

/// ```text
/// 2  None
/// 3  while ...:
/// 4      1; break
/// 5  return None
/// ```
fn single_pass_loop() -> Arc<Code> {
    let mut builder = CodeBuilder::new("single_pass", 1);
    let end = builder.new_label();
    builder.set_line(2);
    builder.emit_load_const(Const::None);
    builder.emit(Opcode::PopTop);
    builder.set_line(3);
    builder.emit_jump(Opcode::SetupLoop, end);
    builder.set_line(4);
    builder.emit_load_const(Const::Int(1));
    builder.emit(Opcode::PopTop);
    builder.emit(Opcode::PopBlock);
    builder.set_line(5);
    builder.bind(end);
    builder.emit_load_const(Const::None);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

#[test]
fn jump_requires_a_trace_hook() {
    let mut frame = Frame::new(assignments(), Namespace::new(), Vec::new()).unwrap();

    assert_eq!(frame.set_current_line(3), Err(LineJumpError::NotTracing));
    assert!(!frame.is_tracing());
}

#[test]
fn forward_jump_skips_a_line() {
    let (value, attempt) = attempt_jump(assignments(), 3, 4);

    assert_eq!(attempt.result, Some(Ok(())));
    assert_eq!(attempt.line_after, 4);
    assert_eq!(value, Value::Int(1));
    // the hook already saw the jump, so the target line is not reported again
    assert_eq!(attempt.lines_seen, vec![2, 3]);
}

#[test]
fn jump_to_line_without_code_lands_on_next_line() {
    let mut builder = CodeBuilder::new("gap", 1);
    let x = builder.add_local("x");
    builder.set_line(2);
    builder.emit_load_const(Const::Int(1));
    builder.emit_arg(Opcode::StoreFast, x);
    builder.set_line(3);
    builder.emit_load_const(Const::Int(2));
    builder.emit_arg(Opcode::StoreFast, x);
    builder.set_line(6);
    builder.emit_arg(Opcode::LoadFast, x);
    builder.emit(Opcode::ReturnValue);

    let (value, attempt) = attempt_jump(Arc::new(builder.build().unwrap()), 3, 5);

    assert_eq!(attempt.result, Some(Ok(())));
    assert_eq!(attempt.line_after, 6);
    assert_eq!(value, Value::Int(1));
}

#[test]
fn jump_before_first_line_is_refused() {
    let (value, attempt) = attempt_jump(assignments(), 3, 0);

    assert_eq!(attempt.result, Some(Err(LineJumpError::BeforeCode { line: 0 })));
    assert_eq!(value, Value::Int(2));
}

#[test]
fn jump_after_last_line_is_refused() {
    let (value, attempt) = attempt_jump(assignments(), 2, 99);

    assert_eq!(attempt.result, Some(Err(LineJumpError::AfterCode { line: 99 })));
    assert_eq!(attempt.line_after, 2);
    assert_eq!(value, Value::Int(2));
}

#[test]
fn jump_onto_except_dispatch_is_refused() {
    let (value, attempt) = attempt_jump(try_except(), 3, 4);

    assert_eq!(attempt.result, Some(Err(LineJumpError::NoException)));
    assert_eq!(value, Value::None);
}

#[test]
fn jump_into_finally_is_refused() {
    let (_, attempt) = attempt_jump(try_finally(), 2, 4);

    assert_eq!(
        attempt.result,
        Some(Err(LineJumpError::IntoOrOutOfFinally { from: None, to: Some(0) }))
    );
}

#[test]
fn jump_out_of_finally_is_refused() {
    let (value, attempt) = attempt_jump(try_finally(), 4, 5);

    assert_eq!(
        attempt.result,
        Some(Err(LineJumpError::IntoOrOutOfFinally { from: Some(0), to: None }))
    );
    assert_eq!(value, Value::None);
}

#[test]
fn jump_into_loop_body_is_refused() {
    let (_, attempt) = attempt_jump(single_pass_loop(), 2, 4);

    assert_eq!(attempt.result, Some(Err(LineJumpError::IntoMiddleOfBlock)));
}

#[test]
fn jump_out_of_loop_pops_its_block() {
    let (value, attempt) = attempt_jump(single_pass_loop(), 4, 5);

    assert_eq!(attempt.result, Some(Ok(())));
    assert_eq!(attempt.blocks_after, 0);
    assert_eq!(value, Value::None);
}

#[test]
fn refused_jump_leaves_execution_unchanged() {
    let (value, attempt) = attempt_jump(try_except(), 3, 4);

    assert!(attempt.result.is_some_and(|result| result.is_err()));
    assert_eq!(attempt.blocks_after, 1);
    assert_eq!(attempt.lines_seen, vec![2, 3, 5]);
    assert_eq!(value, Value::None);
}

#[test]
fn jump_error_messages() {
    assert_eq!(
        LineJumpError::NotTracing.to_string(),
        "f_lineno can only be set by a trace function"
    );
    assert_eq!(
        LineJumpError::IntoOrOutOfFinally { from: Some(3), to: None }.to_string(),
        "can't jump into or out of a 'finally' block 3 -> none"
    );
}
