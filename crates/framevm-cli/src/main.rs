use std::{env, fs, process::ExitCode, sync::Arc, time::Instant};

use framevm::{
    CodeBuilder, CodeFlags, Const, ExecutionContext, Frame, FrameExit, FrameSnapshot, Namespace, NoLimitTracker,
    Opcode, StderrTracer, Tracer, with_session,
};

const USAGE: &str = "usage: framevm <inspect|resume|demo> <snapshot> [--trace]";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let (Some(command), Some(path)) = (args.get(1), args.get(2)) else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let trace = args[3..].iter().any(|arg| arg == "--trace");

    match command.as_str() {
        "inspect" => inspect(path),
        "resume" => {
            if trace {
                resume(path, StderrTracer::new())
            } else {
                resume(path, framevm::NoopTracer)
            }
        }
        "demo" => demo(path),
        other => {
            eprintln!("unknown command: {other}\n{USAGE}");
            ExitCode::FAILURE
        }
    }
}

fn read_snapshot(path: &str) -> Result<FrameSnapshot, String> {
    eprintln!("Reading snapshot: {path}");
    let bytes = fs::read(path).map_err(|err| format!("Error reading {path}: {err}"))?;
    FrameSnapshot::load(&bytes).map_err(|err| format!("Error decoding {path}: {err}"))
}

fn inspect(path: &str) -> ExitCode {
    let snapshot = match read_snapshot(path) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    eprintln!("{} frame(s), innermost {}", snapshot.chain_len(), snapshot.code.name());
    match with_session(|| serde_json::to_string_pretty(&snapshot)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn resume<Tr: Tracer>(path: &str, tracer: Tr) -> ExitCode {
    let frames = match read_snapshot(path).and_then(|snapshot| snapshot.restore_chain().map_err(|err| err.to_string()))
    {
        Ok(frames) => frames,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let mut ctx = ExecutionContext::with_tracer(NoLimitTracker, tracer);
    let result = ctx.resume_chain(frames);
    let elapsed = start.elapsed();
    match result {
        Ok(FrameExit::Return(value)) => {
            eprintln!("success after: {elapsed:?}\n{value}");
            ExitCode::SUCCESS
        }
        Ok(FrameExit::Yield(value)) => {
            eprintln!("suspended after: {elapsed:?}, yielded {value}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error after: {elapsed:?}\n{err}");
            ExitCode::FAILURE
        }
    }
}

/// Writes a snapshot of a module frame that sums `range(10)` before it starts.
fn demo(path: &str) -> ExitCode {
    let mut builder = CodeBuilder::new("<demo>", 1);
    builder.set_flags(CodeFlags::module());
    let total = builder.add_name("total");
    let i = builder.add_name("i");
    let range = builder.add_name("range");
    let loop_end = builder.new_label();
    let next = builder.new_label();
    let exhausted = builder.new_label();

    builder.set_line(1);
    builder.emit_load_const(Const::Int(0));
    builder.emit_arg(Opcode::StoreName, total);
    builder.set_line(2);
    builder.emit_jump(Opcode::SetupLoop, loop_end);
    builder.emit_arg(Opcode::LoadName, range);
    builder.emit_load_const(Const::Int(10));
    builder.emit_arg(Opcode::CallFunction, 1);
    builder.emit(Opcode::GetIter);
    builder.bind(next);
    builder.emit_jump(Opcode::ForIter, exhausted);
    builder.emit_arg(Opcode::StoreName, i);
    builder.set_line(3);
    builder.emit_arg(Opcode::LoadName, total);
    builder.emit_arg(Opcode::LoadName, i);
    builder.emit(Opcode::BinaryAdd);
    builder.emit_arg(Opcode::StoreName, total);
    builder.emit_jump(Opcode::JumpAbsolute, next);
    builder.bind(exhausted);
    builder.emit(Opcode::PopBlock);
    builder.bind(loop_end);
    builder.set_line(4);
    builder.emit_arg(Opcode::LoadName, total);
    builder.emit(Opcode::ReturnValue);

    let snapshot = builder
        .build()
        .map_err(|err| err.to_string())
        .and_then(|code| Frame::new(Arc::new(code), Namespace::new(), Vec::new()).map_err(|err| err.to_string()))
        .and_then(|frame| frame.capture().dump().map_err(|err| err.to_string()));
    match snapshot.and_then(|bytes| fs::write(path, bytes).map_err(|err| format!("Error writing {path}: {err}"))) {
        Ok(()) => {
            eprintln!("wrote {path}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
