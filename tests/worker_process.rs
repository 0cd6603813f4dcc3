//! Integration tests for the out-of-process sandbox
//!
//! These re-execute the gradebox binary in its sandbox-worker role.

mod common;

use common::*;
use gradebox::config::types::{GradeError, InputMode, IsolationStrategy};
use gradebox::sandbox::{OutOfProcessSandbox, ResultKind, Sandbox};
use gradebox::unit::{CompiledUnit, Instr, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn sandbox(timeout: Duration) -> OutOfProcessSandbox {
    let mut config = sandbox_config(timeout);
    config.strategy = IsolationStrategy::OutOfProcess;
    OutOfProcessSandbox::new(config)
        .unwrap()
        .with_worker_exe(PathBuf::from(env!("CARGO_BIN_EXE_gradebox")))
}

#[test]
fn test_worker_returns_value_and_output() {
    let unit = CompiledUnit::new("Main").with_routine(routine(
        "answer",
        vec![
            text("thinking"),
            call("std.Console", "println", &["std.String"]),
            Instr::Pop,
            int(42),
            Instr::ReturnValue,
        ],
    ));
    let outcome = sandbox(Duration::from_secs(5))
        .run(&request(vec![unit], "Main", "answer").with_result_type("int"))
        .unwrap();
    assert_eq!(outcome.result.value(), &Value::Int(42));
    assert_eq!(outcome.stdout.as_deref(), Some("thinking\n"));
}

#[test]
fn test_worker_reports_illegal_operation() {
    let unit = CompiledUnit::new("Main").with_routine(routine(
        "snoop",
        vec![
            text("PATH"),
            call("std.System", "getenv", &["std.String"]),
            Instr::ReturnValue,
        ],
    ));
    let outcome = sandbox(Duration::from_secs(5))
        .run(&request(vec![unit], "Main", "snoop"))
        .unwrap();
    assert_eq!(outcome.result.kind(), ResultKind::IllegalOperation);
    assert_eq!(
        outcome.result.violation().message_text(),
        "Illegal call: std.System.getenv(std.String)"
    );
}

#[test]
fn test_uncancellable_worker_is_killed() {
    let unit = CompiledUnit::new("Main").with_routine(routine("spin", vec![Instr::Jump(0)]));
    let mut sandbox = sandbox(Duration::from_millis(500));
    let mut config = sandbox.config().clone();
    config.cancellation_injection = false;
    sandbox = OutOfProcessSandbox::new(config)
        .unwrap()
        .with_worker_exe(PathBuf::from(env!("CARGO_BIN_EXE_gradebox")));

    let started = Instant::now();
    let outcome = sandbox.run(&request(vec![unit], "Main", "spin")).unwrap();
    assert_eq!(outcome.result.kind(), ResultKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_worker_memory_exhaustion() {
    let unit = CompiledUnit::new("Main").with_routine(routine(
        "hog",
        vec![int(1 << 40), Instr::NewArray, Instr::ReturnValue],
    ));
    let mut config = sandbox_config(Duration::from_secs(5));
    config.heap_limit = Some(1 << 20);
    let outcome = OutOfProcessSandbox::new(config)
        .unwrap()
        .with_worker_exe(PathBuf::from(env!("CARGO_BIN_EXE_gradebox")))
        .run(&request(vec![unit], "Main", "hog"))
        .unwrap();
    assert_eq!(outcome.result.kind(), ResultKind::OutOfMemory);
}

#[test]
fn test_worker_loader_defect_is_propagated() {
    let unit = CompiledUnit::new("Main").with_routine(routine("broken", vec![Instr::Jump(7)]));
    let err = sandbox(Duration::from_secs(5))
        .run(&request(vec![unit], "Main", "broken"))
        .unwrap_err();
    assert!(matches!(err, GradeError::LoaderDefect { ref unit, .. } if unit == "Main"));
}

#[test]
fn test_inherited_stdin_reaches_end_of_input() {
    // the worker's stdin carries only the request line
    let unit = CompiledUnit::new("Main").with_routine(routine(
        "echo",
        vec![call("std.Console", "readLine", &[]), Instr::ReturnValue],
    ));
    let mut config = sandbox_config(Duration::from_secs(5));
    config.strategy = IsolationStrategy::OutOfProcess;
    config.stdin = InputMode::Inherit;
    let sandbox = OutOfProcessSandbox::new(config)
        .unwrap()
        .with_worker_exe(PathBuf::from(env!("CARGO_BIN_EXE_gradebox")));

    let outcome = sandbox.run(&request(vec![unit], "Main", "echo")).unwrap();
    assert_eq!(outcome.result.kind(), ResultKind::Normal);
    assert!(outcome.result.value().is_null());
}
