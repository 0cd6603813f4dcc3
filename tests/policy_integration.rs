//! Integration tests for the call whitelist

use gradebox::config::policy::{default_whitelist_text, CallPolicy, Signature};
use gradebox::config::types::GradeError;
use std::io::Write;

#[test]
fn test_parse_serialize_round_trip() {
    let text = "\nstd.Math.abs(int)\n\nstd.Files.readString(std.String)\nstd.Socket.<init>(std.String, int)\n";
    let policy = CallPolicy::parse_exact(text).unwrap();
    assert_eq!(policy.len(), 3);

    let reparsed = CallPolicy::parse_exact(&policy.serialize()).unwrap();
    assert_eq!(reparsed, policy);
    assert!(reparsed.is_construction_permitted("std.Socket", &["std.String".to_string(), "int".to_string()]));
}

#[test]
fn test_default_baseline_round_trip() {
    let baseline = CallPolicy::default_baseline();
    assert_eq!(CallPolicy::parse_exact(&default_whitelist_text()).unwrap(), baseline);
    assert!(!baseline.is_call_permitted("std.System", "getenv", &["std.String".to_string()]));
}

#[test]
fn test_entries_are_additive_to_the_baseline() {
    let policy = CallPolicy::parse("std.System.getenv(std.String)").unwrap();
    assert_eq!(policy.len(), CallPolicy::default_baseline().len() + 1);
    assert!(policy.is_call_permitted("std.System", "getenv", &["std.String".to_string()]));
}

#[test]
fn test_no_prefix_matching() {
    let policy = CallPolicy::parse_exact("std.Math.abs(int)").unwrap();
    assert!(!policy.is_call_permitted("std.Math", "abs", &["double".to_string()]));
    assert!(!policy.is_call_permitted("std.Mat", "abs", &["int".to_string()]));
    assert!(!policy.is_call_permitted("std.Math", "ab", &["int".to_string()]));
}

#[test]
fn test_parse_error_names_the_line() {
    let err = CallPolicy::parse_exact("std.Math.abs(int)\n\nnot a signature\n").unwrap_err();
    match err {
        GradeError::Whitelist { line, .. } => assert_eq!(line, 3),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "std.Files.readString(std.String)").unwrap();
    let policy = CallPolicy::from_file(file.path()).unwrap();
    assert!(policy
        .signatures()
        .any(|s| s == &Signature::new("std.Files", "readString", &["std.String"])));
}
