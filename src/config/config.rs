/// Configuration loading from a JSON grading config file
use crate::config::policy::CallPolicy;
use crate::config::types::{
    GradeError, HarnessConfig, InputMode, IsolationStrategy, OutputMode, Result, SandboxConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Which call whitelist to start from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WhitelistBase {
    /// The documented baseline
    #[serde(rename = "default")]
    Default,
    /// An empty whitelist; only extra entries are permitted
    #[serde(rename = "empty")]
    Empty,
    /// No call gating at all
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WhitelistConfig {
    pub base: WhitelistBase,
    /// Additional signatures in the textual whitelist format
    pub extra: Vec<String>,
    /// Additional whitelist file, resolved against the config file's directory
    pub extra_file: Option<PathBuf>,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            base: WhitelistBase::Default,
            extra: Vec::new(),
            extra_file: None,
        }
    }
}

impl WhitelistConfig {
    /// Build the policy; `None` disables call gating
    pub fn build(&self, base_dir: Option<&Path>) -> Result<Option<CallPolicy>> {
        let mut policy = match self.base {
            WhitelistBase::None => {
                if !self.extra.is_empty() || self.extra_file.is_some() {
                    return Err(GradeError::Config(
                        "whitelist entries given but whitelist base is \"none\"".to_string(),
                    ));
                }
                return Ok(None);
            }
            WhitelistBase::Default => CallPolicy::default_baseline(),
            WhitelistBase::Empty => CallPolicy::empty(),
        };
        policy.extend_from_text(&self.extra.join("\n"))?;
        if let Some(file) = &self.extra_file {
            let path = match base_dir {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            let text = std::fs::read_to_string(&path).map_err(|e| {
                GradeError::Config(format!("cannot read whitelist {}: {}", path.display(), e))
            })?;
            policy.extend_from_text(&text)?;
        }
        Ok(Some(policy))
    }
}

/// On-disk grading configuration; every field is optional
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GradeConfigFile {
    pub repetitions: u32,
    pub rep_timeout_ms: u64,
    pub test_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub stdin: InputMode,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
    pub strategy: IsolationStrategy,
    pub cancellation_injection: bool,
    pub heap_limit: Option<u64>,
    pub max_call_depth: usize,
    pub dump_dir: Option<PathBuf>,
    pub whitelist: WhitelistConfig,
}

impl Default for GradeConfigFile {
    fn default() -> Self {
        let defaults = HarnessConfig::default();
        let sandbox = &defaults.sandbox;
        Self {
            repetitions: defaults.repetitions,
            rep_timeout_ms: defaults.rep_timeout.as_millis() as u64,
            test_timeout_ms: defaults.test_timeout.as_millis() as u64,
            grace_period_ms: sandbox.grace_period.as_millis() as u64,
            stdin: sandbox.stdin,
            stdout: sandbox.stdout,
            stderr: sandbox.stderr,
            strategy: sandbox.strategy,
            cancellation_injection: sandbox.cancellation_injection,
            heap_limit: sandbox.heap_limit,
            max_call_depth: sandbox.max_call_depth,
            dump_dir: None,
            whitelist: WhitelistConfig::default(),
        }
    }
}

impl GradeConfigFile {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GradeError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            GradeError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Resolve into a harness configuration. Relative paths are taken
    /// against `base_dir` when given.
    pub fn to_harness_config(&self, base_dir: Option<&Path>) -> Result<HarnessConfig> {
        let policy = self.whitelist.build(base_dir)?.map(Arc::new);
        let rep_timeout = Duration::from_millis(self.rep_timeout_ms);
        Ok(HarnessConfig {
            repetitions: self.repetitions,
            rep_timeout,
            test_timeout: Duration::from_millis(self.test_timeout_ms),
            sandbox: SandboxConfig {
                timeout: rep_timeout,
                grace_period: Duration::from_millis(self.grace_period_ms),
                stdin: self.stdin,
                stdout: self.stdout,
                stderr: self.stderr,
                policy,
                cancellation_injection: self.cancellation_injection,
                strategy: self.strategy,
                heap_limit: self.heap_limit,
                max_call_depth: self.max_call_depth,
                dump_dir: self.dump_dir.clone(),
            },
        })
    }
}

/// Read `path` and resolve it into a harness configuration
pub fn load_harness_config(path: &Path) -> Result<HarnessConfig> {
    let file = GradeConfigFile::load_from_file(path)?;
    file.to_harness_config(path.parent())
}
