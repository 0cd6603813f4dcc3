//! Built-in throwable types and their subtype relation.

pub const THROWABLE: &str = "std.Throwable";
pub const EXCEPTION: &str = "std.Exception";
pub const RUNTIME_EXCEPTION: &str = "std.RuntimeException";
pub const ERROR: &str = "std.Error";
pub const SECURITY_EXCEPTION: &str = "std.SecurityException";
pub const CANCELLATION_SIGNAL: &str = crate::loader::cancellation::CANCELLATION_SIGNAL;
pub const ARITHMETIC_EXCEPTION: &str = "std.ArithmeticException";
pub const NULL_POINTER_EXCEPTION: &str = "std.NullPointerException";
pub const INDEX_OUT_OF_BOUNDS: &str = "std.IndexOutOfBoundsException";
pub const ILLEGAL_ARGUMENT: &str = "std.IllegalArgumentException";
pub const NUMBER_FORMAT: &str = "std.NumberFormatException";
pub const CLASS_CAST: &str = "std.ClassCastException";
pub const IO_EXCEPTION: &str = "std.IOException";
pub const ASSERTION_ERROR: &str = "std.AssertionError";
pub const STACK_OVERFLOW: &str = "std.StackOverflowError";
pub const OUT_OF_MEMORY: &str = "std.OutOfMemoryError";
pub const NO_SUCH_METHOD: &str = "std.NoSuchMethodError";
pub const NO_SUCH_FIELD: &str = "std.NoSuchFieldError";
pub const VERIFY_ERROR: &str = "std.VerifyError";
pub const ASSUMPTION_VIOLATED: &str = "test.AssumptionViolated";

/// (type, parent)
const PARENTS: &[(&str, &str)] = &[
    (EXCEPTION, THROWABLE),
    (ERROR, THROWABLE),
    (RUNTIME_EXCEPTION, EXCEPTION),
    (CANCELLATION_SIGNAL, EXCEPTION),
    (IO_EXCEPTION, EXCEPTION),
    (ARITHMETIC_EXCEPTION, RUNTIME_EXCEPTION),
    (NULL_POINTER_EXCEPTION, RUNTIME_EXCEPTION),
    (INDEX_OUT_OF_BOUNDS, RUNTIME_EXCEPTION),
    (ILLEGAL_ARGUMENT, RUNTIME_EXCEPTION),
    ("std.IllegalStateException", RUNTIME_EXCEPTION),
    (NUMBER_FORMAT, ILLEGAL_ARGUMENT),
    (SECURITY_EXCEPTION, RUNTIME_EXCEPTION),
    (CLASS_CAST, RUNTIME_EXCEPTION),
    (ASSERTION_ERROR, ERROR),
    (STACK_OVERFLOW, ERROR),
    (OUT_OF_MEMORY, ERROR),
    (NO_SUCH_METHOD, ERROR),
    (NO_SUCH_FIELD, ERROR),
    (VERIFY_ERROR, ERROR),
    (ASSUMPTION_VIOLATED, ERROR),
];

pub fn parent_of(type_name: &str) -> Option<&'static str> {
    PARENTS
        .iter()
        .find(|(t, _)| *t == type_name)
        .map(|(_, parent)| *parent)
}

pub fn is_throwable_type(type_name: &str) -> bool {
    type_name == THROWABLE || parent_of(type_name).is_some()
}

/// Reflexive, transitive subtype check over the built-in hierarchy
pub fn is_subtype(type_name: &str, ancestor: &str) -> bool {
    let mut current = Some(type_name);
    while let Some(t) = current {
        if t == ancestor {
            return true;
        }
        current = parent_of(t);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtype_chain() {
        assert!(is_subtype(NUMBER_FORMAT, THROWABLE));
        assert!(is_subtype(NUMBER_FORMAT, ILLEGAL_ARGUMENT));
        assert!(is_subtype(SECURITY_EXCEPTION, RUNTIME_EXCEPTION));
        assert!(is_subtype(CANCELLATION_SIGNAL, EXCEPTION));
        assert!(!is_subtype(CANCELLATION_SIGNAL, RUNTIME_EXCEPTION));
        assert!(!is_subtype(ASSERTION_ERROR, EXCEPTION));
        assert!(is_subtype("Custom", "Custom"));
    }

    #[test]
    fn test_throwable_types() {
        assert!(is_throwable_type(THROWABLE));
        assert!(is_throwable_type(OUT_OF_MEMORY));
        assert!(!is_throwable_type("std.String"));
    }
}
