use super::REPORT_SCHEMA_VERSION;
use crate::config::types::{GradeError, HarnessConfig, Result};
use crate::harness::{MethodVerdict, RepetitionHarness};
use crate::loader::IsolatedLoader;
use crate::observability::audit::CorrelationIds;
use crate::sandbox::sandbox_for;
use crate::unit::CompiledUnit;
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counts over the verdicts of one unit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub non_deterministic: usize,
    pub timed_out: usize,
    pub illegal: usize,
    pub incomplete: usize,
}

impl ReportSummary {
    pub fn tally(verdicts: &[MethodVerdict]) -> Self {
        let count = |pred: fn(&MethodVerdict) -> bool| verdicts.iter().filter(|v| pred(v)).count();
        Self {
            tests: verdicts.len(),
            passed: count(|v| v.passed),
            failed: count(|v| v.failed()),
            non_deterministic: count(|v| v.non_deterministic),
            timed_out: count(|v| v.timed_out),
            illegal: count(|v| !v.illegal_operations.is_empty()),
            incomplete: count(|v| v.incomplete),
        }
    }
}

/// Verdicts of every test operation run against one submission
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub schema_version: String,
    pub submission: String,
    /// SHA-256 of the submitted units
    pub fingerprint: String,
    pub graded_at: DateTime<Utc>,
    pub request_id: String,
    /// Verdicts in execution order
    pub verdicts: Vec<MethodVerdict>,
    /// Set when the submission could not be loaded or rewritten
    pub load_failure: Option<String>,
    pub summary: ReportSummary,
}

impl UnitReport {
    pub fn new(submission: &str, units: &[CompiledUnit], request_id: &str) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            submission: submission.to_string(),
            fingerprint: fingerprint(units),
            graded_at: Utc::now(),
            request_id: request_id.to_string(),
            verdicts: Vec::new(),
            load_failure: None,
            summary: ReportSummary::default(),
        }
    }

    /// Append a verdict, keeping the summary current
    pub fn push(&mut self, verdict: MethodVerdict) {
        self.verdicts.push(verdict);
        self.summary = ReportSummary::tally(&self.verdicts);
    }

    pub fn fail_load(&mut self, reason: String) {
        self.load_failure = Some(reason);
    }

    /// Every test passed deterministically and nothing failed to load
    pub fn all_passed(&self) -> bool {
        self.load_failure.is_none() && self.summary.passed == self.summary.tests
    }
}

/// SHA-256 over the canonical JSON form of `units`
pub fn fingerprint(units: &[CompiledUnit]) -> String {
    use sha2::{Digest, Sha256};
    let canonical = serde_json::to_string(units).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Run every discovered test of `tests` against `submission` units.
///
/// A loader defect is recorded as the report's load failure instead of
/// aborting; any other sandbox defect is returned.
pub fn grade_submission(
    submission: &str,
    units: Vec<CompiledUnit>,
    tests: Vec<CompiledUnit>,
    config: &HarnessConfig,
) -> Result<UnitReport> {
    let correlation = CorrelationIds::new();
    let mut report = UnitReport::new(submission, &units, &correlation.request_id);
    let sandboxed = Arc::new(units);
    let support: Vec<Arc<CompiledUnit>> = tests.into_iter().map(Arc::new).collect();

    // one load up front so a broken submission fails even without tests
    let preflight = IsolatedLoader::new(config.sandbox.policy.clone(), config.sandbox.cancellation_injection)
        .with_correlation(correlation.clone())
        .load(&sandboxed, &support);
    if let Err(e) = preflight {
        return match e {
            GradeError::LoaderDefect { .. } => {
                error!("{}: cannot load submission: {}", submission, e);
                report.fail_load(e.to_string());
                Ok(report)
            }
            other => Err(other),
        };
    }

    let harness = RepetitionHarness::new(sandbox_for(config.sandbox.clone())?, sandboxed, support)
        .with_correlation(correlation);
    let operations = harness.discover();
    info!("{}: grading {} test operations", submission, operations.len());

    for operation in &operations {
        match harness.execute(
            operation,
            config.repetitions,
            config.rep_timeout,
            config.test_timeout,
        ) {
            Ok(verdict) => report.push(verdict),
            Err(e @ GradeError::LoaderDefect { .. }) => {
                error!("{}: loader defect during {}: {}", submission, operation.display_name(), e);
                report.fail_load(e.to_string());
                break;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        "{}: {}/{} passed, {} nondeterministic, {} timed out, {} illegal",
        submission,
        report.summary.passed,
        report.summary.tests,
        report.summary.non_deterministic,
        report.summary.timed_out,
        report.summary.illegal
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Const, Instr, Routine, TEST_ANNOTATION};
    use std::time::Duration;

    fn config() -> HarnessConfig {
        let mut config = HarnessConfig {
            repetitions: 2,
            rep_timeout: Duration::from_millis(500),
            test_timeout: Duration::from_secs(5),
            ..HarnessConfig::default()
        };
        config.sandbox.grace_period = Duration::from_millis(200);
        config
    }

    fn submission() -> Vec<CompiledUnit> {
        vec![CompiledUnit::new("Calc").with_routine(Routine::new(
            "two",
            &[],
            vec![Instr::Const(Const::Int(2)), Instr::ReturnValue],
        ))]
    }

    #[test]
    fn test_summary_tally() {
        let verdicts = vec![
            MethodVerdict {
                passed: true,
                ..MethodVerdict::default()
            },
            MethodVerdict {
                failed_messages: vec!["x (std.AssertionError)".into()],
                timed_out: true,
                ..MethodVerdict::default()
            },
        ];
        let summary = ReportSummary::tally(&verdicts);
        assert_eq!(summary.tests, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.illegal, 0);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = fingerprint(&submission());
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint(&submission()));
        assert_ne!(a, fingerprint(&[CompiledUnit::new("Other")]));
    }

    #[test]
    fn test_grading_runs_discovered_tests() {
        let tests = vec![CompiledUnit::new("CalcTest").with_routine(
            Routine::new(
                "twoIsTwo",
                &[],
                vec![
                    Instr::Const(Const::Int(2)),
                    Instr::Invoke(crate::unit::CallSite::new("Calc", "two", &[])),
                    Instr::Invoke(crate::unit::CallSite::new("test.Assert", "assertEquals", &["int", "int"])),
                    Instr::Pop,
                    Instr::Return,
                ],
            )
            .annotated(TEST_ANNOTATION),
        )];
        let report = grade_submission("alice", submission(), tests, &config()).unwrap();
        assert_eq!(report.summary.tests, 1);
        assert!(report.all_passed());
        assert_eq!(report.verdicts[0].name, "twoIsTwo");
        assert_eq!(report.verdicts[0].repetitions_completed, 2);
    }

    #[test]
    fn test_broken_submission_is_a_load_failure() {
        let broken = vec![CompiledUnit::new("Calc").with_routine(Routine::new("two", &[], vec![Instr::Jump(9)]))];
        let report = grade_submission("bob", broken, Vec::new(), &config()).unwrap();
        assert!(report.load_failure.is_some());
        assert!(report.verdicts.is_empty());
        assert!(!report.all_passed());
    }
}
