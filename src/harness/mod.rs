//! Repetition harness: run one test operation N times, each in a fresh
//! isolation context, and fold the outcomes into a [`MethodVerdict`].

pub mod suite;

pub use suite::{TestOperation, TestReport, TestSuite, UnitTestSuite};

use crate::config::types::{GradeError, HarnessConfig, Result};
use crate::observability::audit::CorrelationIds;
use crate::observability::metrics::get_metrics;
use crate::sandbox::{Sandbox, SandboxRequest, SandboxResult};
use crate::unit::CompiledUnit;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Aggregate outcome of all repetitions of one test operation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodVerdict {
    pub name: String,
    pub passed: bool,
    /// Distinct failure messages in first-seen order
    pub failed_messages: Vec<String>,
    pub non_deterministic: bool,
    pub repetitions_completed: u32,
    pub incomplete: bool,
    pub timed_out: bool,
    pub out_of_memory: bool,
    pub illegal_operations: Vec<String>,
    pub scores: Vec<f64>,
}

impl MethodVerdict {
    pub fn failed(&self) -> bool {
        !self.failed_messages.is_empty()
    }
}

/// Outcome of one repetition
#[derive(Clone, Debug, PartialEq)]
pub enum Repetition {
    Passed { score: Option<f64> },
    Failed { message: String, score: Option<f64> },
    TimedOut,
    OutOfMemory,
    Illegal { message: String },
}

/// Per-operation accumulator
#[derive(Debug, Default)]
struct Tally {
    passed: bool,
    failed: Vec<String>,
    timed_out: bool,
    out_of_memory: bool,
    illegal: Vec<String>,
    scores: Vec<f64>,
}

impl Tally {
    fn add(&mut self, repetition: Repetition) {
        match repetition {
            Repetition::Passed { score } => {
                self.passed = true;
                self.scores.extend(score);
            }
            Repetition::Failed { message, score } => {
                if !self.failed.contains(&message) {
                    self.failed.push(message);
                }
                self.scores.extend(score);
            }
            Repetition::TimedOut => self.timed_out = true,
            Repetition::OutOfMemory => self.out_of_memory = true,
            Repetition::Illegal { message } => self.illegal.push(message),
        }
    }

    fn into_verdict(self, name: String, completed: u32, requested: u32) -> MethodVerdict {
        let non_deterministic = self.passed && !self.failed.is_empty();
        MethodVerdict {
            name,
            passed: self.passed && !non_deterministic,
            failed_messages: self.failed,
            non_deterministic,
            repetitions_completed: completed,
            incomplete: completed < requested,
            timed_out: self.timed_out,
            out_of_memory: self.out_of_memory,
            illegal_operations: self.illegal,
            scores: self.scores,
        }
    }
}

/// Sequential executor of test operations against one submission
pub struct RepetitionHarness {
    sandbox: Box<dyn Sandbox>,
    suite: Box<dyn TestSuite>,
    sandboxed: Arc<Vec<CompiledUnit>>,
    support: Vec<Arc<CompiledUnit>>,
    correlation: CorrelationIds,
}

impl RepetitionHarness {
    pub fn new(
        sandbox: Box<dyn Sandbox>,
        sandboxed: Arc<Vec<CompiledUnit>>,
        support: Vec<Arc<CompiledUnit>>,
    ) -> Self {
        Self {
            sandbox,
            suite: Box::new(UnitTestSuite::new()),
            sandboxed,
            support,
            correlation: CorrelationIds::new(),
        }
    }

    pub fn with_suite(mut self, suite: Box<dyn TestSuite>) -> Self {
        self.suite = suite;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn correlation(&self) -> &CorrelationIds {
        &self.correlation
    }

    /// Test operations of the support units, in execution order
    pub fn discover(&self) -> Vec<TestOperation> {
        self.suite.discover(&self.support)
    }

    /// Run `repetitions` repetitions of `operation`.
    ///
    /// Stops early once `test_budget` is exhausted, but never before the
    /// first repetition. A faulting test runner aborts with
    /// [`GradeError::HarnessDefect`].
    pub fn execute(
        &self,
        operation: &TestOperation,
        repetitions: u32,
        rep_timeout: Duration,
        test_budget: Duration,
    ) -> Result<MethodVerdict> {
        let name = operation.display_name();
        let (entry, args, result_type) = self.suite.entry(operation);
        let test_correlation = self
            .correlation
            .clone()
            .with_test(format!("{}.{}", operation.unit, operation.routine));

        let started = Instant::now();
        let mut tally = Tally::default();
        let mut completed = repetitions;

        for rep in 1..=repetitions {
            let mut request = SandboxRequest::new(
                Arc::clone(&self.sandboxed),
                self.support.clone(),
                entry.clone(),
                args.clone(),
            )
            .with_timeout(rep_timeout)
            .with_correlation(test_correlation.next_run().with_repetition(rep));
            if let Some(declared) = &result_type {
                request = request.with_result_type(declared);
            }

            let outcome = self.sandbox.run(&request)?;
            let repetition = self.classify(operation, outcome.result)?;
            debug!("{} repetition {}/{}: {:?}", name, rep, repetitions, repetition);
            tally.add(repetition);

            let elapsed = started.elapsed();
            if rep < repetitions && elapsed > test_budget {
                warn!(
                    "{} exhausted its {:?} budget after {} of {} repetitions",
                    name, test_budget, rep, repetitions
                );
                completed = rep;
                break;
            }
        }

        let verdict = tally.into_verdict(name, completed, repetitions);
        get_metrics().record_verdict(
            verdict.repetitions_completed,
            verdict.incomplete,
            verdict.non_deterministic,
            started.elapsed(),
        );
        info!(
            "{}: passed={} failed={} nondeterministic={} timeout={} illegal={} reps={}/{}",
            verdict.name,
            verdict.passed,
            verdict.failed(),
            verdict.non_deterministic,
            verdict.timed_out,
            verdict.illegal_operations.len(),
            verdict.repetitions_completed,
            repetitions
        );
        Ok(verdict)
    }

    /// Every discovered test operation under `config`
    pub fn execute_all(&self, config: &HarnessConfig) -> Result<Vec<MethodVerdict>> {
        self.discover()
            .iter()
            .map(|op| self.execute(op, config.repetitions, config.rep_timeout, config.test_timeout))
            .collect()
    }

    fn classify(&self, operation: &TestOperation, result: SandboxResult) -> Result<Repetition> {
        Ok(match result {
            SandboxResult::Timeout => Repetition::TimedOut,
            SandboxResult::OutOfMemory => Repetition::OutOfMemory,
            SandboxResult::IllegalOperation(cause) => Repetition::Illegal {
                message: cause.message_text().to_string(),
            },
            SandboxResult::Fault(cause) => {
                return Err(GradeError::HarnessDefect(format!(
                    "test runner faulted on {}.{}: {}",
                    operation.unit, operation.routine, cause
                )))
            }
            SandboxResult::Normal(value) => {
                let report = self.suite.interpret(operation, &value)?;
                match report.failure_message() {
                    None => Repetition::Passed { score: report.score },
                    Some(message) => Repetition::Failed {
                        message,
                        score: report.score,
                    },
                }
            }
        })
    }
}
