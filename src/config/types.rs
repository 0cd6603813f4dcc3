/// Core configuration types and the crate-wide error taxonomy for gradebox
use crate::config::policy::CallPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How standard input is presented to sandboxed code
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum InputMode {
    /// Read from the grading process's own stdin
    #[serde(rename = "inherit")]
    Inherit,
    /// Behave like an empty stream (reads observe end of input)
    #[serde(rename = "empty")]
    Empty,
    /// Any read raises an I/O error inside the sandbox
    #[serde(rename = "closed")]
    Closed,
}

/// How standard output or error written by sandboxed code is handled
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputMode {
    /// Pass through to the grading process's stream
    #[serde(rename = "inherit")]
    Inherit,
    /// Drop everything
    #[serde(rename = "discard")]
    Discard,
    /// Buffer and return with the outcome
    #[serde(rename = "capture")]
    Capture,
    /// Buffer and pass through
    #[serde(rename = "capture_forward")]
    CaptureForward,
}

impl OutputMode {
    pub fn captures(self) -> bool {
        matches!(self, OutputMode::Capture | OutputMode::CaptureForward)
    }

    pub fn forwards(self) -> bool {
        matches!(self, OutputMode::Inherit | OutputMode::CaptureForward)
    }
}

/// Execution strategy behind the sandbox contract
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum IsolationStrategy {
    /// Dedicated worker thread inside the grading process
    #[serde(rename = "in_process")]
    InProcess,
    /// Re-exec of the gradebox binary in its sandbox-worker role
    #[serde(rename = "out_of_process")]
    OutOfProcess,
}

/// Configuration for a single sandboxed run
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    /// Wall-clock budget for one run
    pub timeout: Duration,
    /// How long to wait for a cancelled worker before abandoning it
    pub grace_period: Duration,
    /// Standard input policy
    pub stdin: InputMode,
    /// Standard output policy
    pub stdout: OutputMode,
    /// Standard error policy
    pub stderr: OutputMode,
    /// Call whitelist; `None` disables call gating entirely
    pub policy: Option<Arc<CallPolicy>>,
    /// Insert cooperative cancellation checks at loop back edges
    pub cancellation_injection: bool,
    /// Worker isolation strategy
    pub strategy: IsolationStrategy,
    /// Allocation budget in heap cells (objects, array slots, string bytes)
    pub heap_limit: Option<u64>,
    /// Maximum interpreter call depth before a stack overflow is raised
    pub max_call_depth: usize,
    /// Write rewritten sandboxed units here for inspection
    pub dump_dir: Option<PathBuf>,
}

/// Deepest interpreter call chain a 64 MiB worker stack holds
pub const MAX_CALL_DEPTH_LIMIT: usize = 8192;

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            grace_period: Duration::from_secs(1),
            stdin: InputMode::Empty,
            stdout: OutputMode::Discard,
            stderr: OutputMode::Discard,
            policy: Some(Arc::new(CallPolicy::default_baseline())),
            cancellation_injection: true,
            strategy: IsolationStrategy::InProcess,
            heap_limit: None,
            max_call_depth: 512,
            dump_dir: None,
        }
    }
}

impl SandboxConfig {
    /// Unrestricted configuration: no call gating, output passed through
    pub fn permissive() -> Self {
        Self {
            policy: None,
            stdin: InputMode::Inherit,
            stdout: OutputMode::Inherit,
            stderr: OutputMode::Inherit,
            ..Self::default()
        }
    }
}

/// Configuration of the repetition harness
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Runs per test operation
    pub repetitions: u32,
    /// Wall-clock budget for a single repetition
    pub rep_timeout: Duration,
    /// Cumulative budget for all repetitions of one test operation
    pub test_timeout: Duration,
    /// Sandbox settings shared by every repetition
    pub sandbox: SandboxConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            repetitions: 1,
            rep_timeout: Duration::from_secs(6),
            test_timeout: Duration::from_secs(10),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Custom error types for gradebox
#[derive(Error, Debug)]
pub enum GradeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Whitelist error at line {line}: {reason}")]
    Whitelist { line: usize, reason: String },

    #[error("Loader defect in {unit}::{routine}: {reason}")]
    LoaderDefect {
        unit: String,
        routine: String,
        reason: String,
    },

    #[error("Harness defect: {0}")]
    HarnessDefect(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GradeError {
    pub fn loader_defect(
        unit: impl Into<String>,
        routine: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        GradeError::LoaderDefect {
            unit: unit.into(),
            routine: routine.into(),
            reason: reason.into(),
        }
    }

    /// True for failures of the grading machinery itself, as opposed to
    /// bad input files or configuration.
    pub fn is_sandbox_defect(&self) -> bool {
        matches!(
            self,
            GradeError::LoaderDefect { .. } | GradeError::HarnessDefect(_) | GradeError::Worker(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GradeError>;
