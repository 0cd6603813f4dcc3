//! Managed runtime executing compiled units inside an isolation context.
//!
//! - [`interp`]: stack-machine interpreter with exception tables
//! - [`natives`]: external callables reachable from units (std and test library)
//! - [`hierarchy`]: built-in throwable types
//! - [`cancel`]: cooperative cancellation token
//! - [`stdio`]: per-run standard streams

pub mod cancel;
pub mod hierarchy;
pub mod interp;
pub mod natives;
pub mod stdio;

pub use cancel::CancellationToken;
pub use interp::Interpreter;
pub use stdio::RunIo;

use crate::config::types::{SandboxConfig, MAX_CALL_DEPTH_LIMIT};
use crate::unit::{Throwable, Value};
use std::sync::Arc;

/// Outcome of executing runtime code: a value or a raised throwable
pub type Exec<T> = std::result::Result<T, Arc<Throwable>>;

pub fn raise<T>(type_name: &str, message: impl Into<String>) -> Exec<T> {
    Err(Arc::new(Throwable::new(type_name, message)))
}

/// Mutable per-run state shared by the interpreter and native callables
#[derive(Debug)]
pub struct RunEnv {
    pub io: RunIo,
    pub cancel: CancellationToken,
    /// First capability violation raised during the run
    pub violation: Option<Arc<Throwable>>,
    pub heap_limit: Option<u64>,
    pub heap_used: u64,
    /// Set once the allocation budget was exceeded
    pub heap_exhausted: bool,
    pub max_call_depth: usize,
    /// Last score reported by the running test
    pub reported_score: Option<f64>,
}

impl RunEnv {
    pub fn new(io: RunIo, cancel: CancellationToken, config: &SandboxConfig) -> Self {
        Self {
            io,
            cancel,
            violation: None,
            heap_limit: config.heap_limit,
            heap_used: 0,
            heap_exhausted: false,
            max_call_depth: config.max_call_depth.min(MAX_CALL_DEPTH_LIMIT),
            reported_score: None,
        }
    }
}

/// Whether `value` may be returned where `type_name` is declared
pub fn conforms(value: &Value, type_name: &str) -> bool {
    match (type_name, value) {
        ("void", v) => v.is_null(),
        ("std.Object", _) => true,
        ("int", Value::Int(_)) => true,
        ("double", Value::Double(_) | Value::Int(_)) => true,
        ("bool", Value::Bool(_)) => true,
        (_, Value::Null) => !matches!(type_name, "int" | "double" | "bool"),
        ("std.String", Value::Str(_)) => true,
        ("std.Map", Value::Map(_)) => true,
        ("std.Array", Value::Array(_)) => true,
        (t, Value::Throwable(thrown)) => hierarchy::is_subtype(&thrown.type_name, t),
        (t, Value::Object(_)) => value.type_name() == t,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_conformance() {
        assert!(conforms(&Value::Int(1), "int"));
        assert!(conforms(&Value::Int(1), "double"));
        assert!(!conforms(&Value::Double(1.5), "int"));
        assert!(conforms(&Value::Null, "std.Map"));
        assert!(!conforms(&Value::Null, "int"));
        assert!(conforms(&Value::Map(Arc::new(BTreeMap::new())), "std.Map"));
        assert!(!conforms(&Value::str("x"), "std.Map"));
        assert!(conforms(&Value::Null, "void"));
        let t = Value::Throwable(Arc::new(Throwable::bare(hierarchy::ASSERTION_ERROR)));
        assert!(conforms(&t, hierarchy::THROWABLE));
    }

    #[test]
    fn test_call_depth_is_clamped() {
        let config = SandboxConfig {
            max_call_depth: usize::MAX,
            ..SandboxConfig::default()
        };
        let io = RunIo::new(
            crate::config::types::InputMode::Empty,
            crate::config::types::OutputMode::Discard,
            crate::config::types::OutputMode::Discard,
        );
        let env = RunEnv::new(io, CancellationToken::new(), &config);
        assert_eq!(env.max_call_depth, MAX_CALL_DEPTH_LIMIT);
    }
}
