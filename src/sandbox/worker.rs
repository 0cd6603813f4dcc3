//! Sandbox-worker role of the gradebox binary.
//!
//! The supervisor writes one [`WorkerRequest`] JSON line to the worker's
//! stdin and reads one [`WorkerReply`] JSON line from its stdout. Output of
//! sandboxed code is always captured in the worker; the supervisor applies
//! the stream policy.

use super::{execute_entry, SandboxRequest, SandboxResult, WireResult, WORKER_STACK_SIZE};
use crate::config::policy::CallPolicy;
use crate::config::types::{GradeError, InputMode, OutputMode, Result, SandboxConfig};
use crate::loader::IsolatedLoader;
use crate::runtime::{CancellationToken, RunEnv, RunIo};
use crate::unit::WireValue;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Name passed to `--internal-role`
pub const WORKER_ROLE: &str = "sandbox-worker";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request: SandboxRequest,
    /// Exact whitelist text; absent means unrestricted
    pub whitelist: Option<String>,
    pub cancellation_injection: bool,
    pub stdin: InputMode,
    pub heap_limit: Option<u64>,
    pub max_call_depth: usize,
    pub dump_dir: Option<PathBuf>,
}

impl WorkerRequest {
    pub fn new(request: SandboxRequest, config: &SandboxConfig) -> Self {
        Self {
            request,
            whitelist: config.policy.as_ref().map(|p| p.serialize()),
            cancellation_injection: config.cancellation_injection,
            stdin: config.stdin,
            heap_limit: config.heap_limit,
            max_call_depth: config.max_call_depth,
            dump_dir: config.dump_dir.clone(),
        }
    }

    /// Worker-side configuration; output is always captured
    fn sandbox_config(&self) -> Result<SandboxConfig> {
        let policy = match &self.whitelist {
            Some(text) => Some(Arc::new(CallPolicy::parse_exact(text)?)),
            None => None,
        };
        Ok(SandboxConfig {
            policy,
            cancellation_injection: self.cancellation_injection,
            stdin: self.stdin,
            stdout: OutputMode::Capture,
            stderr: OutputMode::Capture,
            heap_limit: self.heap_limit,
            max_call_depth: self.max_call_depth,
            dump_dir: self.dump_dir.clone(),
            ..SandboxConfig::default()
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status")]
pub enum WorkerReply {
    #[serde(rename = "completed")]
    Completed {
        result: WireResult,
        stdout: String,
        stderr: String,
    },
    #[serde(rename = "loader_defect")]
    LoaderDefect {
        unit: String,
        routine: String,
        reason: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Execute one request and build the reply
pub fn serve(request: WorkerRequest) -> Result<WorkerReply> {
    let config = request.sandbox_config()?;
    let mut loader = IsolatedLoader::from_config(&config);
    if let Some(correlation) = &request.request.correlation {
        loader = loader.with_correlation(correlation.clone());
    }

    let context = match loader.load(&request.request.sandboxed, &request.request.support) {
        Ok(context) => context,
        Err(GradeError::LoaderDefect { unit, routine, reason }) => {
            return Ok(WorkerReply::LoaderDefect { unit, routine, reason })
        }
        Err(e) => return Err(e),
    };

    let io = RunIo::new(config.stdin, config.stdout, config.stderr);
    let env = RunEnv::new(io.clone(), CancellationToken::new(), &config);
    let entry = request.request.entry.clone();
    let args = request
        .request
        .args
        .iter()
        .cloned()
        .map(WireValue::into_value)
        .collect();
    let result_type = request.request.result_type.clone();

    let worker = std::thread::Builder::new()
        .name("gradebox-worker".to_string())
        .stack_size(WORKER_STACK_SIZE)
        .spawn(move || {
            let (result, env) = execute_entry(&context, &entry, args, result_type.as_deref(), env);
            if env.heap_exhausted {
                SandboxResult::OutOfMemory
            } else {
                result
            }
        })?;
    let result = worker
        .join()
        .map_err(|_| GradeError::Worker("sandbox worker thread panicked".to_string()))?;

    Ok(WorkerReply::Completed {
        result: result.to_wire(),
        stdout: io.stdout.captured().unwrap_or_default(),
        stderr: io.stderr.captured().unwrap_or_default(),
    })
}

/// Entry point of `--internal-role sandbox-worker`
pub fn run_worker_role() -> Result<()> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let reply = match serde_json::from_str::<WorkerRequest>(&line) {
        Ok(request) => serve(request).unwrap_or_else(|e| WorkerReply::Error {
            message: e.to_string(),
        }),
        Err(e) => WorkerReply::Error {
            message: format!("malformed worker request: {}", e),
        },
    };

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string(&reply)?)?;
    stdout.flush()?;
    Ok(())
}
