//! Execution sandbox: run one entry operation of freshly loaded units under
//! a wall-clock budget and classify the outcome.
//!
//! Two strategies implement the same [`Sandbox`] contract:
//! - [`thread::InProcessSandbox`]: dedicated worker thread, abandoned if it
//!   ignores cancellation
//! - [`process::OutOfProcessSandbox`]: one re-executed worker process per
//!   run, hard-killed on timeout, able to report memory exhaustion

pub mod process;
pub mod thread;
pub mod worker;

pub use process::OutOfProcessSandbox;
pub use thread::InProcessSandbox;

use crate::config::types::{IsolationStrategy, Result, SandboxConfig};
use crate::loader::IsolationContext;
use crate::observability::audit::CorrelationIds;
use crate::runtime::hierarchy::{is_subtype, CLASS_CAST, SECURITY_EXCEPTION};
use crate::runtime::{conforms, Exec, Interpreter, RunEnv};
use crate::unit::{CallSite, CompiledUnit, Throwable, Value, WireValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stack size of sandbox worker threads
pub(crate) const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Everything needed for one sandboxed run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Units to rewrite and isolate
    pub sandboxed: Arc<Vec<CompiledUnit>>,
    /// Unrestricted units shared by reference (tests, libraries)
    pub support: Vec<Arc<CompiledUnit>>,
    pub entry: CallSite,
    pub args: Vec<WireValue>,
    /// Declared result type; a non-conforming return value is a fault
    pub result_type: Option<String>,
    /// Overrides the configured timeout
    pub timeout: Option<Duration>,
    pub correlation: Option<CorrelationIds>,
}

impl SandboxRequest {
    pub fn new(
        sandboxed: Arc<Vec<CompiledUnit>>,
        support: Vec<Arc<CompiledUnit>>,
        entry: CallSite,
        args: Vec<WireValue>,
    ) -> Self {
        Self {
            sandboxed,
            support,
            entry,
            args,
            result_type: None,
            timeout: None,
            correlation: None,
        }
    }

    pub fn with_result_type(mut self, result_type: &str) -> Self {
        self.result_type = Some(result_type.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }
}

/// Tag of a [`SandboxResult`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "fault")]
    Fault,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "illegal_operation")]
    IllegalOperation,
    #[serde(rename = "out_of_memory")]
    OutOfMemory,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultKind::Normal => "normal",
            ResultKind::Fault => "fault",
            ResultKind::Timeout => "timeout",
            ResultKind::IllegalOperation => "illegal_operation",
            ResultKind::OutOfMemory => "out_of_memory",
        };
        f.write_str(name)
    }
}

/// Classified outcome of one sandboxed run
#[derive(Clone, Debug)]
pub enum SandboxResult {
    Normal(Value),
    Fault(Arc<Throwable>),
    Timeout,
    IllegalOperation(Arc<Throwable>),
    /// Only produced by the out-of-process strategy
    OutOfMemory,
}

impl SandboxResult {
    pub fn kind(&self) -> ResultKind {
        match self {
            SandboxResult::Normal(_) => ResultKind::Normal,
            SandboxResult::Fault(_) => ResultKind::Fault,
            SandboxResult::Timeout => ResultKind::Timeout,
            SandboxResult::IllegalOperation(_) => ResultKind::IllegalOperation,
            SandboxResult::OutOfMemory => ResultKind::OutOfMemory,
        }
    }

    /// Returned value of a normal run.
    ///
    /// # Panics
    /// If the run did not complete normally.
    pub fn value(&self) -> &Value {
        match self {
            SandboxResult::Normal(value) => value,
            other => panic!("value() called on a {} sandbox result", other.kind()),
        }
    }

    /// Cause of a faulted run.
    ///
    /// # Panics
    /// If the run did not fault.
    pub fn fault(&self) -> &Arc<Throwable> {
        match self {
            SandboxResult::Fault(cause) => cause,
            other => panic!("fault() called on a {} sandbox result", other.kind()),
        }
    }

    /// Capability violation of an illegal run.
    ///
    /// # Panics
    /// If the run raised no capability violation.
    pub fn violation(&self) -> &Arc<Throwable> {
        match self {
            SandboxResult::IllegalOperation(cause) => cause,
            other => panic!("violation() called on a {} sandbox result", other.kind()),
        }
    }

    pub fn to_wire(&self) -> WireResult {
        match self {
            SandboxResult::Normal(value) => WireResult::Normal(value.to_wire()),
            SandboxResult::Fault(cause) => WireResult::Fault(cause.as_ref().clone()),
            SandboxResult::Timeout => WireResult::Timeout,
            SandboxResult::IllegalOperation(cause) => {
                WireResult::IllegalOperation(cause.as_ref().clone())
            }
            SandboxResult::OutOfMemory => WireResult::OutOfMemory,
        }
    }
}

/// Serializable [`SandboxResult`]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail")]
pub enum WireResult {
    #[serde(rename = "normal")]
    Normal(WireValue),
    #[serde(rename = "fault")]
    Fault(Throwable),
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "illegal_operation")]
    IllegalOperation(Throwable),
    #[serde(rename = "out_of_memory")]
    OutOfMemory,
}

impl WireResult {
    pub fn into_result(self) -> SandboxResult {
        match self {
            WireResult::Normal(value) => SandboxResult::Normal(value.into_value()),
            WireResult::Fault(cause) => SandboxResult::Fault(Arc::new(cause)),
            WireResult::Timeout => SandboxResult::Timeout,
            WireResult::IllegalOperation(cause) => SandboxResult::IllegalOperation(Arc::new(cause)),
            WireResult::OutOfMemory => SandboxResult::OutOfMemory,
        }
    }
}

/// Result plus whatever the stream policy asked to capture
#[derive(Clone, Debug)]
pub struct SandboxOutcome {
    pub result: SandboxResult,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub elapsed: Duration,
}

/// Bounded execution of one entry operation in a fresh isolation context
pub trait Sandbox: Send + Sync {
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutcome>;

    fn config(&self) -> &SandboxConfig;
}

/// Sandbox implementing the configured isolation strategy
pub fn sandbox_for(config: SandboxConfig) -> Result<Box<dyn Sandbox>> {
    Ok(match config.strategy {
        IsolationStrategy::InProcess => Box::new(InProcessSandbox::new(config)),
        IsolationStrategy::OutOfProcess => Box::new(OutOfProcessSandbox::new(config)?),
    })
}

/// Invoke the entry operation inside `context` and classify the outcome
pub(crate) fn execute_entry(
    context: &IsolationContext,
    entry: &CallSite,
    args: Vec<Value>,
    result_type: Option<&str>,
    env: RunEnv,
) -> (SandboxResult, RunEnv) {
    let mut interp = Interpreter::new(context, env);
    let returned = interp.call(entry, None, args);
    let env = interp.into_env();
    (classify(returned, &env, result_type), env)
}

/// Map a raw runtime outcome to a sandbox result.
///
/// A recorded capability violation wins over everything else, even when
/// submitted code caught it and returned normally.
pub(crate) fn classify(returned: Exec<Value>, env: &RunEnv, result_type: Option<&str>) -> SandboxResult {
    if let Some(violation) = &env.violation {
        return SandboxResult::IllegalOperation(Arc::clone(violation));
    }
    match returned {
        Ok(value) => match result_type {
            Some(declared) if !conforms(&value, declared) => SandboxResult::Fault(Arc::new(
                Throwable::new(
                    CLASS_CAST,
                    format!("{} cannot be returned as {}", value.type_name(), declared),
                ),
            )),
            _ => SandboxResult::Normal(value),
        },
        Err(thrown) if is_subtype(&thrown.type_name, SECURITY_EXCEPTION) => {
            SandboxResult::IllegalOperation(thrown)
        }
        Err(thrown) => SandboxResult::Fault(thrown),
    }
}
