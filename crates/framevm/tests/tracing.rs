//! Tracer event ordering and line events.

use std::sync::Arc;

use framevm::{
    Code, CodeBuilder, CodeFlags, Const, ExecutionContext, NoLimitTracker, Namespace, Opcode, ProfilingTracer,
    RecordingTracer, TraceEvent, Value,
};
use pretty_assertions::assert_eq;

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

/// `add(lhs, rhs)` at module level.
fn call_add(lhs: Const, rhs: Const) -> Arc<Code> {
    let mut builder = CodeBuilder::new("<module>", 1);
    builder.set_flags(CodeFlags::module());
    builder.emit_load_const(Const::Code(add_code()));
    builder.emit_arg(Opcode::MakeFunction, 0);
    builder.emit_load_const(lhs);
    builder.emit_load_const(rhs);
    builder.emit_arg(Opcode::CallFunction, 2);
    builder.emit(Opcode::ReturnValue);
    Arc::new(builder.build().unwrap())
}

fn frame_events(events: &[TraceEvent]) -> Vec<TraceEvent> {
    events
        .iter()
        .filter(|event| !matches!(event, TraceEvent::Instruction { .. } | TraceEvent::Line { .. }))
        .cloned()
        .collect()
}

fn enter(code_name: &str, depth: usize) -> TraceEvent {
    TraceEvent::Enter {
        code_name: code_name.to_owned(),
        depth,
    }
}

fn leave(code_name: &str, depth: usize) -> TraceEvent {
    TraceEvent::Leave {
        code_name: code_name.to_owned(),
        depth,
    }
}

fn call(code_name: &str, depth: usize) -> TraceEvent {
    TraceEvent::Call {
        code_name: code_name.to_owned(),
        depth,
    }
}

fn ret(code_name: &str, value: Option<&str>, depth: usize) -> TraceEvent {
    TraceEvent::Return {
        code_name: code_name.to_owned(),
        value: value.map(str::to_owned),
        depth,
    }
}

#[test]
fn enter_and_leave_nest_around_calls() {
    let mut ctx = ExecutionContext::with_tracer(NoLimitTracker, RecordingTracer::new());
    let result = ctx
        .run_code(call_add(Const::Int(1), Const::Int(2)), Namespace::new())
        .unwrap();
    assert_eq!(result, Value::Int(3));

    assert_eq!(
        frame_events(ctx.tracer().events()),
        vec![
            enter("<module>", 1),
            call("<module>", 1),
            enter("add", 2),
            call("add", 2),
            ret("add", Some("3"), 2),
            leave("add", 2),
            ret("<module>", Some("3"), 1),
            leave("<module>", 1),
        ]
    );
}

#[test]
fn failing_frames_are_still_left() {
    let mut ctx = ExecutionContext::with_tracer(NoLimitTracker, RecordingTracer::without_instructions());
    let err = ctx
        .run_code(call_add(Const::Int(1), Const::Str("x".to_owned())), Namespace::new())
        .unwrap_err();
    assert!(err.is_exception_type(framevm::ExcType::TypeError));

    let events = ctx.into_tracer().into_events();
    assert_eq!(
        frame_events(&events),
        vec![
            enter("<module>", 1),
            call("<module>", 1),
            enter("add", 2),
            call("add", 2),
            TraceEvent::Exception {
                code_name: "add".to_owned(),
                error: "TypeError: unsupported operand type(s) for +: 'int' and 'str'".to_owned(),
            },
            ret("add", None, 2),
            leave("add", 2),
            TraceEvent::Exception {
                code_name: "<module>".to_owned(),
                error: "TypeError: unsupported operand type(s) for +: 'int' and 'str'".to_owned(),
            },
            ret("<module>", None, 1),
            leave("<module>", 1),
        ]
    );
}

#[test]
fn profiling_counts_instructions_and_depth() {
    let mut ctx = ExecutionContext::with_tracer(NoLimitTracker, ProfilingTracer::new());
    ctx.run_code(call_add(Const::Int(1), Const::Int(2)), Namespace::new())
        .unwrap();

    let report = ctx.tracer().report();
    // six module instructions plus four in add
    assert_eq!(report.instructions, 10);
    assert_eq!(report.calls, 2);
    assert_eq!(report.deepest_chain, 2);
    assert_eq!(report.exceptions, 0);
    assert_eq!(report.opcodes[0], (Opcode::LoadConst, 3));
    assert_eq!(
        report.codes,
        vec![("<module>".to_owned(), 1), ("add".to_owned(), 1)]
    );
}

/// `i = 0` / `while i < 3: i += 1` on one line / `return i`
#[test]
fn backward_jump_within_a_line_reports_it_again() {
    let mut builder = CodeBuilder::new("count", 1);
    let i = builder.add_local("i");
    let top = builder.new_label();
    let done = builder.new_label();
    builder.set_line(2);
    builder.emit_load_const(Const::Int(0));
    builder.emit_arg(Opcode::StoreFast, i);
    builder.set_line(3);
    builder.bind(top);
    builder.emit_arg(Opcode::LoadFast, i);
    builder.emit_load_const(Const::Int(3));
    builder.emit_arg(Opcode::CompareOp, 0);
    builder.emit_jump(Opcode::JumpIfFalse, done);
    builder.emit(Opcode::PopTop);
    builder.emit_arg(Opcode::LoadFast, i);
    builder.emit_load_const(Const::Int(1));
    builder.emit(Opcode::BinaryAdd);
    builder.emit_arg(Opcode::StoreFast, i);
    builder.emit_jump(Opcode::JumpAbsolute, top);
    builder.set_line(4);
    builder.bind(done);
    builder.emit(Opcode::PopTop);
    builder.emit_arg(Opcode::LoadFast, i);
    builder.emit(Opcode::ReturnValue);

    let frame = framevm::Frame::new(Arc::new(builder.build().unwrap()), Namespace::new(), Vec::new()).unwrap();
    let mut ctx = ExecutionContext::with_tracer(NoLimitTracker, RecordingTracer::new());
    assert_eq!(frame.run(&mut ctx).unwrap(), Value::Int(3));

    let lines: Vec<u32> = ctx
        .tracer()
        .events()
        .iter()
        .filter_map(|event| match event {
            TraceEvent::Line { line, .. } => Some(*line),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec![2, 3, 3, 3, 3, 4]);
}
