//! Test discovery and the test-execution collaborator.

use crate::config::types::{GradeError, Result};
use crate::runtime::natives::{RUNNER_OWNER, RUNNER_ROUTINE};
use crate::unit::{CallSite, CompiledUnit, Throwable, Value, WireValue, TEST_ANNOTATION};
use std::sync::Arc;

/// Separator between enclosing and nested grouping names in a unit name
pub const NESTING_SEPARATOR: char = '$';

/// One test routine of a test unit
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestOperation {
    pub unit: String,
    pub routine: String,
}

impl TestOperation {
    pub fn new(unit: &str, routine: &str) -> Self {
        Self {
            unit: unit.to_string(),
            routine: routine.to_string(),
        }
    }

    /// Reported name: the nested grouping path without the outermost
    /// grouping, dot-joined, followed by the routine name
    pub fn display_name(&self) -> String {
        if !self.unit.contains(NESTING_SEPARATOR) {
            return self.routine.clone();
        }
        let groups: Vec<&str> = self.unit.split(NESTING_SEPARATOR).skip(1).collect();
        format!("{}.{}", groups.join("."), self.routine)
    }
}

/// What a test run reported back from inside the sandbox
#[derive(Clone, Debug, PartialEq)]
pub struct TestReport {
    pub throwable: Option<Arc<Throwable>>,
    pub score: Option<f64>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.throwable.is_none()
    }

    /// Whitespace-collapsed message followed by the throwable type
    pub fn failure_message(&self) -> Option<String> {
        self.throwable.as_ref().map(|t| failure_message(t))
    }
}

pub fn failure_message(thrown: &Throwable) -> String {
    let collapsed: Vec<&str> = thrown.message_text().split_whitespace().collect();
    format!("{} ({})", collapsed.join(" "), thrown.type_name)
}

/// Finds test operations and knows how to run one inside a sandbox
pub trait TestSuite: Send + Sync {
    /// Test operations in execution order
    fn discover(&self, units: &[Arc<CompiledUnit>]) -> Vec<TestOperation>;

    /// Sandbox entry point, arguments and declared result type
    fn entry(&self, operation: &TestOperation) -> (CallSite, Vec<WireValue>, Option<String>);

    /// Decode the entry's return value
    fn interpret(&self, operation: &TestOperation, returned: &Value) -> Result<TestReport>;
}

/// Routines annotated `test`, executed through `test.Runner.run`
#[derive(Clone, Debug, Default)]
pub struct UnitTestSuite {
    /// Restrict discovery to this unit and its nested units
    only: Option<String>,
}

impl UnitTestSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only(unit: &str) -> Self {
        Self {
            only: Some(unit.to_string()),
        }
    }

    fn selected(&self, unit: &str) -> bool {
        match &self.only {
            None => true,
            Some(root) => {
                unit == root
                    || unit
                        .strip_prefix(root.as_str())
                        .map_or(false, |rest| rest.starts_with(NESTING_SEPARATOR))
            }
        }
    }
}

impl TestSuite for UnitTestSuite {
    fn discover(&self, units: &[Arc<CompiledUnit>]) -> Vec<TestOperation> {
        let mut operations: Vec<TestOperation> = units
            .iter()
            .filter(|unit| self.selected(&unit.name))
            .flat_map(|unit| {
                unit.routines
                    .iter()
                    .filter(|r| r.has_annotation(TEST_ANNOTATION) && r.params.is_empty())
                    .map(move |r| TestOperation::new(&unit.name, &r.name))
            })
            .collect();
        operations.sort();
        operations.dedup();
        operations
    }

    fn entry(&self, operation: &TestOperation) -> (CallSite, Vec<WireValue>, Option<String>) {
        let site = CallSite::new(RUNNER_OWNER, RUNNER_ROUTINE, &["std.String", "std.String"]);
        let args = vec![
            WireValue::Str(operation.unit.clone()),
            WireValue::Str(operation.routine.clone()),
        ];
        (site, args, Some("std.Map".to_string()))
    }

    fn interpret(&self, operation: &TestOperation, returned: &Value) -> Result<TestReport> {
        let defect = |what: &str| {
            GradeError::HarnessDefect(format!(
                "test runner returned {} for {}.{}",
                what, operation.unit, operation.routine
            ))
        };
        let report = returned.as_map().ok_or_else(|| defect("no report"))?;
        let throwable = match report.get("throwable") {
            None | Some(Value::Null) => None,
            Some(Value::Throwable(t)) => Some(Arc::clone(t)),
            Some(_) => return Err(defect("a malformed throwable")),
        };
        let score = match report.get("score") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_double().ok_or_else(|| defect("a malformed score"))?),
        };
        Ok(TestReport { throwable, score })
    }
}
