//! Integration tests for the repetition harness and report aggregation

mod common;

use common::*;
use gradebox::config::types::GradeError;
use gradebox::harness::TestOperation;
use gradebox::report::grade_submission;
use gradebox::unit::{CallSite, CompiledUnit, Const, Instr, Routine};
use std::time::Duration;

/// `Counter.next()` increments and returns a static counter
fn counter_unit() -> CompiledUnit {
    CompiledUnit::new("Counter")
        .with_static("count", Const::Int(0))
        .with_routine(routine(
            "next",
            vec![
                Instr::GetStatic {
                    owner: "Counter".into(),
                    field: "count".into(),
                },
                int(1),
                Instr::Add,
                Instr::Dup,
                Instr::PutStatic {
                    owner: "Counter".into(),
                    field: "count".into(),
                },
                Instr::ReturnValue,
            ],
        ))
}

#[test]
fn test_static_counter_is_deterministic() {
    let tests = CompiledUnit::new("CounterTest")
        .with_routine(test("startsAtOne", assert_returns(1, "Counter", "next")))
        .with_routine(test("startsAtTwo", assert_returns(2, "Counter", "next")));
    let config = harness_config(5);
    let harness = harness(&config, vec![counter_unit()], vec![tests]);

    let fresh = harness
        .execute(
            &TestOperation::new("CounterTest", "startsAtOne"),
            5,
            config.rep_timeout,
            config.test_timeout,
        )
        .unwrap();
    assert!(fresh.passed);
    assert!(!fresh.non_deterministic);
    assert_eq!(fresh.repetitions_completed, 5);

    let stale = harness
        .execute(
            &TestOperation::new("CounterTest", "startsAtTwo"),
            5,
            config.rep_timeout,
            config.test_timeout,
        )
        .unwrap();
    assert!(!stale.passed);
    assert!(!stale.non_deterministic);
    assert_eq!(
        stale.failed_messages,
        vec!["expected: <2> but was: <1> (std.AssertionError)".to_string()]
    );
}

#[test]
fn test_scores_follow_reports() {
    let tests = CompiledUnit::new("ScoreTest")
        .with_routine(test(
            "scored",
            vec![
                double(0.5),
                call("test.Score", "report", &["double"]),
                Instr::Pop,
                Instr::Return,
            ],
        ))
        .with_routine(test("unscored", vec![Instr::Return]));
    let config = harness_config(4);
    let harness = harness(&config, Vec::new(), vec![tests]);

    let verdicts = harness.execute_all(&config).unwrap();
    assert_eq!(verdicts.len(), 2);
    assert_eq!(verdicts[0].name, "scored");
    assert_eq!(verdicts[0].scores, vec![0.5; 4]);
    assert_eq!(verdicts[1].name, "unscored");
    assert!(verdicts[1].scores.is_empty());
}

#[test]
fn test_budget_cuts_repetitions() {
    let tests = CompiledUnit::new("SlowTest").with_routine(test(
        "slow",
        vec![
            int(100),
            call("std.Thread", "sleep", &["int"]),
            Instr::Pop,
            Instr::Return,
        ],
    ));
    let config = harness_config(5);
    let harness = harness(&config, Vec::new(), vec![tests]);

    let verdict = harness
        .execute(
            &TestOperation::new("SlowTest", "slow"),
            5,
            Duration::from_secs(1),
            Duration::from_millis(250),
        )
        .unwrap();
    assert!(verdict.repetitions_completed < 5);
    assert!(verdict.incomplete);
    assert!(verdict.passed);
}

#[test]
fn test_coin_flip_is_non_deterministic() {
    let coin = CompiledUnit::new("Coin").with_routine(routine(
        "flip",
        vec![int(2), call("std.Random", "nextInt", &["int"]), Instr::ReturnValue],
    ));
    let tests =
        CompiledUnit::new("CoinTest").with_routine(test("heads", assert_returns(0, "Coin", "flip")));
    let config = harness_config(40);
    let harness = harness(&config, vec![coin], vec![tests]);

    let verdict = harness
        .execute(
            &TestOperation::new("CoinTest", "heads"),
            40,
            config.rep_timeout,
            config.test_timeout,
        )
        .unwrap();
    assert!(verdict.non_deterministic);
    assert!(!verdict.passed);
    assert_eq!(verdict.failed_messages.len(), 1);
}

#[test]
fn test_nested_names_and_illegal_operations() {
    let snoop = CompiledUnit::new("Snoop").with_routine(routine(
        "home",
        vec![
            text("HOME"),
            call("std.System", "getenv", &["std.String"]),
            Instr::ReturnValue,
        ],
    ));
    let tests = CompiledUnit::new("SnoopTest$Environment$Home").with_routine(test(
        "readsHome",
        vec![call("Snoop", "home", &[]), Instr::Pop, Instr::Return],
    ));
    let config = harness_config(2);
    let harness = harness(&config, vec![snoop], vec![tests]);

    let verdicts = harness.execute_all(&config).unwrap();
    assert_eq!(verdicts.len(), 1);
    let verdict = &verdicts[0];
    assert_eq!(verdict.name, "Environment.Home.readsHome");
    assert!(!verdict.passed);
    assert!(verdict.failed_messages.is_empty());
    assert_eq!(
        verdict.illegal_operations,
        vec!["Illegal call: std.System.getenv(std.String)".to_string(); 2]
    );
}

#[test]
fn test_timeouts_are_recorded() {
    let spinner = CompiledUnit::new("Spinner").with_routine(routine("spin", vec![Instr::Jump(0)]));
    let tests = CompiledUnit::new("SpinTest").with_routine(test(
        "spins",
        vec![call("Spinner", "spin", &[]), Instr::Pop, Instr::Return],
    ));
    let mut config = harness_config(2);
    config.rep_timeout = Duration::from_millis(200);
    let harness = harness(&config, vec![spinner], vec![tests]);

    let verdict = harness
        .execute(
            &TestOperation::new("SpinTest", "spins"),
            2,
            config.rep_timeout,
            config.test_timeout,
        )
        .unwrap();
    assert!(verdict.timed_out);
    assert!(!verdict.passed);
    assert!(!verdict.non_deterministic);
}

#[test]
fn test_unknown_test_operation_is_a_harness_defect() {
    let config = harness_config(1);
    let harness = harness(&config, Vec::new(), Vec::new());
    let err = harness
        .execute(
            &TestOperation::new("Missing", "gone"),
            1,
            config.rep_timeout,
            config.test_timeout,
        )
        .unwrap_err();
    assert!(matches!(err, GradeError::HarnessDefect(_)));
}

#[test]
fn test_report_over_a_whole_suite() {
    let tests = CompiledUnit::new("CounterTest")
        .with_routine(test("one", assert_returns(1, "Counter", "next")))
        .with_routine(test("two", assert_returns(2, "Counter", "next")));
    let report = grade_submission("carol", vec![counter_unit()], vec![tests], &harness_config(2)).unwrap();

    assert_eq!(report.submission, "carol");
    assert_eq!(report.summary.tests, 2);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.failed, 1);
    assert!(report.load_failure.is_none());
    assert_eq!(report.fingerprint.len(), 64);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["verdicts"][0]["name"], "one");
}

#[test]
fn test_submission_cannot_replace_the_assertion_library() {
    let calc = CompiledUnit::new("Calc").with_routine(routine("answer", vec![int(41), Instr::ReturnValue]));
    let fake_assert = CompiledUnit::new("test.Assert").with_routine(Routine::new(
        "assertEquals",
        &["int", "int"],
        vec![Instr::Return],
    ));
    let tests =
        CompiledUnit::new("CalcTest").with_routine(test("answers", assert_returns(42, "Calc", "answer")));

    let report =
        grade_submission("mallory", vec![calc, fake_assert], vec![tests], &harness_config(2)).unwrap();
    let reason = report.load_failure.as_deref().unwrap();
    assert!(reason.contains("test.Assert"), "{}", reason);
    assert!(report.verdicts.is_empty());
    assert!(!report.all_passed());
}

#[test]
fn test_thrown_cancellation_signal_is_a_test_failure() {
    let calc = CompiledUnit::new("Calc").with_routine(routine(
        "answer",
        vec![
            Instr::New(CallSite::constructor("std.CancellationSignal", &[])),
            Instr::Throw,
        ],
    ));
    let tests =
        CompiledUnit::new("CalcTest").with_routine(test("answers", assert_returns(42, "Calc", "answer")));
    let mut config = harness_config(2);
    config.sandbox.policy = None;
    let harness = harness(&config, vec![calc], vec![tests]);

    let verdict = harness
        .execute(
            &TestOperation::new("CalcTest", "answers"),
            2,
            config.rep_timeout,
            config.test_timeout,
        )
        .unwrap();
    assert!(!verdict.passed);
    assert!(!verdict.timed_out);
    assert_eq!(verdict.repetitions_completed, 2);
    assert_eq!(verdict.failed_messages.len(), 1);
    assert!(verdict.failed_messages[0].ends_with("(std.CancellationSignal)"));
}
