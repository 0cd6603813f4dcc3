//! Report-ready structures built from method verdicts.

pub mod aggregate;

pub use aggregate::{fingerprint, grade_submission, ReportSummary, UnitReport};

/// Version of the serialized [`UnitReport`] layout
pub const REPORT_SCHEMA_VERSION: &str = "1.0";
