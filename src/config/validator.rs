// Harness configuration validation
// Errors make a configuration unusable; warnings flag settings that run but
// cannot deliver what the harness promises.

use crate::config::types::{
    GradeError, HarnessConfig, IsolationStrategy, OutputMode, Result, MAX_CALL_DEPTH_LIMIT,
};

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a harness configuration; with `strict`, any error is returned
/// as [`GradeError::Config`]
pub fn validate_config(config: &HarnessConfig, strict: bool) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_budgets(config, &mut result);
    validate_isolation(config, &mut result);
    validate_streams(config, &mut result);

    if strict && !result.is_valid() {
        let error_msg = format!(
            "Config validation failed in strict mode:\n{}",
            result.errors.join("\n")
        );
        return Err(GradeError::Config(error_msg));
    }

    Ok(result)
}

fn validate_budgets(config: &HarnessConfig, result: &mut ValidationResult) {
    if config.repetitions == 0 {
        result.add_error("repetitions cannot be zero".to_string());
    } else if config.repetitions == 1 {
        result.add_warning(
            "a single repetition cannot observe nondeterministic behavior".to_string(),
        );
    }

    if config.rep_timeout.is_zero() {
        result.add_error("rep_timeout cannot be zero".to_string());
    }
    if config.test_timeout.is_zero() {
        result.add_error("test_timeout cannot be zero".to_string());
    }
    if !config.rep_timeout.is_zero() && config.test_timeout < config.rep_timeout {
        result.add_warning(format!(
            "test_timeout ({:?}) is below rep_timeout ({:?}); tests will rarely complete all repetitions",
            config.test_timeout, config.rep_timeout
        ));
    }
    if config.sandbox.grace_period.is_zero() {
        result.add_warning(
            "grace_period is zero; cancelled workers get no chance to stop".to_string(),
        );
    }
}

fn validate_isolation(config: &HarnessConfig, result: &mut ValidationResult) {
    let sandbox = &config.sandbox;
    if sandbox.strategy == IsolationStrategy::InProcess && !sandbox.cancellation_injection {
        result.add_warning(
            "in-process isolation without cancellation injection cannot stop pure loops; \
             such workers will be abandoned"
                .to_string(),
        );
    }
    if sandbox.policy.is_none() {
        result.add_warning("no call whitelist: sandboxed code may call anything".to_string());
    }
    if sandbox.max_call_depth == 0 {
        result.add_error("max_call_depth cannot be zero".to_string());
    } else if sandbox.max_call_depth > MAX_CALL_DEPTH_LIMIT {
        result.add_error(format!(
            "max_call_depth {} exceeds the worker stack limit of {}",
            sandbox.max_call_depth, MAX_CALL_DEPTH_LIMIT
        ));
    }
    if sandbox.heap_limit == Some(0) {
        result.add_error("heap_limit cannot be zero".to_string());
    }

    if let Some(ref dump_dir) = sandbox.dump_dir {
        if !dump_dir.exists() {
            result.add_warning(format!("dump_dir does not exist: {:?}", dump_dir));
        }
    }
}

fn validate_streams(config: &HarnessConfig, result: &mut ValidationResult) {
    let sandbox = &config.sandbox;
    for (name, mode) in [("stdout", sandbox.stdout), ("stderr", sandbox.stderr)] {
        if mode.forwards() && config.repetitions > 1 {
            result.add_warning(format!(
                "{} is forwarded; output of all {} repetitions will interleave",
                name, config.repetitions
            ));
        }
    }
    if sandbox.stdout == OutputMode::Inherit && sandbox.strategy == IsolationStrategy::OutOfProcess
    {
        result.add_warning(
            "out-of-process workers only forward stdout after the run completes".to_string(),
        );
    }
}
