//! Small builder for assembling units in integration tests

#![allow(dead_code)]

use gradebox::config::types::{HarnessConfig, InputMode, OutputMode, SandboxConfig};
use gradebox::harness::RepetitionHarness;
use gradebox::sandbox::{sandbox_for, SandboxRequest};
use gradebox::unit::{CallSite, CompiledUnit, Const, Instr, Routine, TEST_ANNOTATION};
use std::sync::Arc;
use std::time::Duration;

pub fn int(value: i64) -> Instr {
    Instr::Const(Const::Int(value))
}

pub fn double(value: f64) -> Instr {
    Instr::Const(Const::Double(value))
}

pub fn text(value: &str) -> Instr {
    Instr::Const(Const::Str(value.to_string()))
}

pub fn call(owner: &str, name: &str, params: &[&str]) -> Instr {
    Instr::Invoke(CallSite::new(owner, name, params))
}

pub fn routine(name: &str, code: Vec<Instr>) -> Routine {
    Routine::new(name, &[], code)
}

pub fn test(name: &str, code: Vec<Instr>) -> Routine {
    routine(name, code).annotated(TEST_ANNOTATION)
}

/// `assertEquals(expected, <call>)` followed by a plain return
pub fn assert_returns(expected: i64, owner: &str, name: &str) -> Vec<Instr> {
    vec![
        int(expected),
        call(owner, name, &[]),
        call("test.Assert", "assertEquals", &["int", "int"]),
        Instr::Pop,
        Instr::Return,
    ]
}

pub fn sandbox_config(timeout: Duration) -> SandboxConfig {
    SandboxConfig {
        timeout,
        grace_period: Duration::from_millis(500),
        stdin: InputMode::Empty,
        stdout: OutputMode::Capture,
        stderr: OutputMode::Capture,
        ..SandboxConfig::default()
    }
}

pub fn harness_config(repetitions: u32) -> HarnessConfig {
    HarnessConfig {
        repetitions,
        rep_timeout: Duration::from_secs(1),
        test_timeout: Duration::from_secs(30),
        sandbox: sandbox_config(Duration::from_secs(1)),
    }
}

pub fn harness(
    config: &HarnessConfig,
    submission: Vec<CompiledUnit>,
    tests: Vec<CompiledUnit>,
) -> RepetitionHarness {
    let sandbox = sandbox_for(config.sandbox.clone()).expect("sandbox");
    RepetitionHarness::new(
        sandbox,
        Arc::new(submission),
        tests.into_iter().map(Arc::new).collect(),
    )
}

/// Request running `owner.name()` with no support units
pub fn request(units: Vec<CompiledUnit>, owner: &str, name: &str) -> SandboxRequest {
    SandboxRequest::new(Arc::new(units), Vec::new(), CallSite::new(owner, name, &[]), Vec::new())
}
