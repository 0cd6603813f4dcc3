//! External callables reachable from compiled units.
//!
//! Natives are keyed by their rendered call signature, e.g.
//! `std.Math.max(int,int)`. Whether sandboxed code may reach one is decided
//! by the loader's call gating, not here: this table is the full library
//! available to trusted support units such as test suites.

use super::hierarchy::{
    is_subtype, is_throwable_type, ASSERTION_ERROR, ASSUMPTION_VIOLATED, CANCELLATION_SIGNAL,
    ILLEGAL_ARGUMENT, INDEX_OUT_OF_BOUNDS, IO_EXCEPTION, NO_SUCH_METHOD, NULL_POINTER_EXCEPTION,
    NUMBER_FORMAT, SECURITY_EXCEPTION, VERIFY_ERROR,
};
use super::interp::Interpreter;
use super::{raise, Exec};
use crate::loader::cancellation::{CANCELLATION_PROBE, WORKER_OWNER};
use crate::unit::value::Object;
use crate::unit::{CallSite, Throwable, Value, CONSTRUCTOR, DISABLED_ANNOTATION};
use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type NativeFn = fn(&mut Interpreter<'_>, Vec<Value>) -> Exec<Value>;

/// Owner of the test runner entry point
pub const RUNNER_OWNER: &str = "test.Runner";
pub const RUNNER_ROUTINE: &str = "run";

pub static NATIVES: Lazy<NativeRegistry> = Lazy::new(NativeRegistry::standard);

#[derive(Default)]
pub struct NativeRegistry {
    table: HashMap<String, NativeFn>,
    owners: HashSet<String>,
}

impl NativeRegistry {
    fn register(&mut self, owner: &str, name: &str, params: &[&str], f: NativeFn) {
        let key = CallSite::new(owner, name, params).to_string();
        self.table.insert(key, f);
        self.owners.insert(owner.to_string());
    }

    /// Whether any native callable is declared on `owner`
    pub fn owns(&self, owner: &str) -> bool {
        self.owners.contains(owner)
    }

    pub fn get(&self, signature: &str) -> Option<NativeFn> {
        self.table.get(signature).copied()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.table.contains_key(signature)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn standard() -> Self {
        let mut r = Self::default();

        r.register("std.Math", "abs", &["int"], |_, a| Ok(Value::Int(int(&a, 0)?.wrapping_abs())));
        r.register("std.Math", "abs", &["double"], |_, a| Ok(Value::Double(double(&a, 0)?.abs())));
        r.register("std.Math", "max", &["int", "int"], |_, a| {
            Ok(Value::Int(int(&a, 0)?.max(int(&a, 1)?)))
        });
        r.register("std.Math", "min", &["int", "int"], |_, a| {
            Ok(Value::Int(int(&a, 0)?.min(int(&a, 1)?)))
        });
        r.register("std.Math", "sqrt", &["double"], |_, a| Ok(Value::Double(double(&a, 0)?.sqrt())));
        r.register("std.Math", "pow", &["double", "double"], |_, a| {
            Ok(Value::Double(double(&a, 0)?.powf(double(&a, 1)?)))
        });
        r.register("std.Math", "floor", &["double"], |_, a| Ok(Value::Double(double(&a, 0)?.floor())));

        r.register("std.String", "length", &["std.String"], |_, a| {
            Ok(Value::Int(string(&a, 0)?.chars().count() as i64))
        });
        r.register("std.String", "charAt", &["std.String", "int"], string_char_at);
        r.register("std.String", "substring", &["std.String", "int", "int"], string_substring);
        r.register("std.String", "equals", &["std.String", "std.String"], |_, a| {
            Ok(Value::Bool(a.first() == a.get(1)))
        });
        r.register("std.String", "valueOf", &["int"], |_, a| Ok(Value::str(a[0].render())));
        r.register("std.String", "valueOf", &["double"], |_, a| Ok(Value::str(a[0].render())));
        r.register("std.String", "parseInt", &["std.String"], |_, a| {
            let text = string(&a, 0)?;
            match text.trim().parse::<i64>() {
                Ok(n) => Ok(Value::Int(n)),
                Err(_) => raise(NUMBER_FORMAT, format!("For input string: \"{}\"", text)),
            }
        });

        r.register("std.Console", "print", &["std.String"], |vm, a| {
            vm.env.io.stdout.write(&a[0].render());
            Ok(Value::Null)
        });
        r.register("std.Console", "println", &["std.String"], |vm, a| {
            vm.env.io.stdout.write(&format!("{}\n", a[0].render()));
            Ok(Value::Null)
        });
        r.register("std.Console", "printErr", &["std.String"], |vm, a| {
            vm.env.io.stderr.write(&format!("{}\n", a[0].render()));
            Ok(Value::Null)
        });
        r.register("std.Console", "readLine", &[], |vm, _| match vm.env.io.read_line() {
            Ok(Some(line)) => Ok(Value::Str(line)),
            Ok(None) => Ok(Value::Null),
            Err(e) => raise(IO_EXCEPTION, e.to_string()),
        });

        r.register("std.Thread", "sleep", &["int"], thread_sleep);
        r.register("std.System", "currentTimeMillis", &[], |_, _| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            Ok(Value::Int(millis))
        });
        r.register("std.System", "getenv", &["std.String"], |_, a| {
            Ok(std::env::var(string(&a, 0)?).map(Value::Str).unwrap_or(Value::Null))
        });
        r.register("std.Random", "nextInt", &["int"], |_, a| {
            let bound = int(&a, 0)?;
            if bound <= 0 {
                return raise(ILLEGAL_ARGUMENT, "bound must be positive");
            }
            Ok(Value::Int(rand::thread_rng().gen_range(0..bound)))
        });
        r.register("std.Files", "readString", &["std.String"], |_, a| {
            let path = string(&a, 0)?;
            std::fs::read_to_string(&path)
                .map(Value::Str)
                .or_else(|e| raise(IO_EXCEPTION, format!("{}: {}", path, e)))
        });
        r.register(WORKER_OWNER, CANCELLATION_PROBE, &[], |vm, _| {
            Ok(Value::Bool(vm.env.cancel.is_cancelled()))
        });

        r.register("test.Assert", "assertTrue", &["bool"], |_, a| {
            check(boolean(&a, 0)?, || mismatch(&Value::Bool(true), &Value::Bool(false)))
        });
        r.register("test.Assert", "assertTrue", &["std.String", "bool"], |_, a| {
            let message = a[0].render();
            check(boolean(&a, 1)?, || message)
        });
        r.register("test.Assert", "assertFalse", &["bool"], |_, a| {
            check(!boolean(&a, 0)?, || mismatch(&Value::Bool(false), &Value::Bool(true)))
        });
        r.register("test.Assert", "assertEquals", &["int", "int"], assert_equals);
        r.register("test.Assert", "assertEquals", &["std.Object", "std.Object"], assert_equals);
        r.register("test.Assert", "assertEquals", &["double", "double", "double"], |_, a| {
            let (expected, actual, delta) = (double(&a, 0)?, double(&a, 1)?, double(&a, 2)?);
            check((expected - actual).abs() <= delta, || mismatch(&a[0], &a[1]))
        });
        r.register("test.Assert", "assertNull", &["std.Object"], |_, a| {
            check(a[0].is_null(), || mismatch(&Value::Null, &a[0]))
        });
        r.register("test.Assert", "assertNotNull", &["std.Object"], |_, a| {
            check(!a[0].is_null(), || "expected: not <null>".to_string())
        });
        r.register("test.Assert", "fail", &["std.String"], |_, a| {
            raise(ASSERTION_ERROR, a[0].render())
        });
        r.register("test.Assume", "assumeTrue", &["bool"], |_, a| {
            if boolean(&a, 0)? {
                Ok(Value::Null)
            } else {
                raise(ASSUMPTION_VIOLATED, "assumption is not true")
            }
        });
        r.register("test.Score", "report", &["double"], |vm, a| {
            vm.env.reported_score = Some(double(&a, 0)?);
            Ok(Value::Null)
        });
        r.register(RUNNER_OWNER, RUNNER_ROUTINE, &["std.String", "std.String"], run_test);

        r
    }
}

/// Construct a built-in throwable or plain object; `None` if the type is unknown
pub fn construct_builtin(site: &CallSite, args: &[Value]) -> Option<Exec<Value>> {
    if site.owner == "std.Object" && site.params.is_empty() {
        return Some(Ok(Value::Object(Arc::new(Mutex::new(Object {
            class: site.owner.clone(),
            fields: BTreeMap::new(),
        })))));
    }
    if !is_throwable_type(&site.owner) || site.name != CONSTRUCTOR {
        return None;
    }
    let thrown = match (site.params.as_slice(), args) {
        ([], []) => Throwable::bare(&site.owner),
        ([p], [message]) if p == "std.String" => match message {
            Value::Null => Throwable::bare(&site.owner),
            m => Throwable::new(&site.owner, m.render()),
        },
        _ => return None,
    };
    Some(Ok(Value::Throwable(Arc::new(thrown))))
}

/// Run one test routine and report `{throwable, score}`.
///
/// Capability violations, and the cancellation signal once the worker has
/// actually been cancelled, propagate instead of being reported as test
/// failures. Disabled tests are skipped and report no
/// throwable.
fn run_test(vm: &mut Interpreter<'_>, args: Vec<Value>) -> Exec<Value> {
    let unit_name = string(&args, 0)?;
    let routine_name = string(&args, 1)?;
    let ctx = vm.context();
    let unit = match ctx.unit(&unit_name) {
        Some(unit) => Arc::clone(unit),
        None => return raise(NO_SUCH_METHOD, format!("{}.{}()", unit_name, routine_name)),
    };
    let routine = match unit.routine(&routine_name, &[]) {
        Some(routine) => routine,
        None => return raise(NO_SUCH_METHOD, format!("{}.{}()", unit_name, routine_name)),
    };

    vm.env.reported_score = None;
    let outcome = if routine.has_annotation(DISABLED_ANNOTATION) {
        log::debug!("skipping disabled test {}.{}", unit_name, routine_name);
        Ok(Value::Null)
    } else if routine.is_static {
        vm.call(&CallSite::new(&unit_name, &routine_name, &[]), None, Vec::new())
    } else {
        vm.construct(&CallSite::constructor(&unit_name, &[]), Vec::new())
            .and_then(|instance| {
                vm.call(
                    &CallSite::instance(&unit_name, &routine_name, &[]),
                    Some(instance),
                    Vec::new(),
                )
            })
    };

    let throwable = match outcome {
        Ok(_) => Value::Null,
        Err(thrown) if is_subtype(&thrown.type_name, SECURITY_EXCEPTION) => return Err(thrown),
        // a signal thrown by the submission itself is an ordinary failure
        Err(thrown)
            if is_subtype(&thrown.type_name, CANCELLATION_SIGNAL) && vm.env.cancel.is_cancelled() =>
        {
            return Err(thrown)
        }
        Err(thrown) => Value::Throwable(thrown),
    };
    let score = vm.env.reported_score.map(Value::Double).unwrap_or(Value::Null);

    let mut report = BTreeMap::new();
    report.insert("throwable".to_string(), throwable);
    report.insert("score".to_string(), score);
    Ok(Value::Map(Arc::new(report)))
}

fn thread_sleep(vm: &mut Interpreter<'_>, args: Vec<Value>) -> Exec<Value> {
    let millis = int(&args, 0)?;
    if millis < 0 {
        return raise(ILLEGAL_ARGUMENT, "timeout value is negative");
    }
    if !vm.env.cancel.sleep(Duration::from_millis(millis as u64)) {
        return raise(CANCELLATION_SIGNAL, "sleep interrupted");
    }
    Ok(Value::Null)
}

fn string_char_at(_: &mut Interpreter<'_>, args: Vec<Value>) -> Exec<Value> {
    let text = string(&args, 0)?;
    let index = int(&args, 1)?;
    let chars: Vec<char> = text.chars().collect();
    match usize::try_from(index).ok().and_then(|i| chars.get(i)) {
        Some(c) => Ok(Value::Str(c.to_string())),
        None => raise(
            INDEX_OUT_OF_BOUNDS,
            format!("Index {} out of bounds for length {}", index, chars.len()),
        ),
    }
}

fn string_substring(_: &mut Interpreter<'_>, args: Vec<Value>) -> Exec<Value> {
    let text = string(&args, 0)?;
    let (begin, end) = (int(&args, 1)?, int(&args, 2)?);
    let chars: Vec<char> = text.chars().collect();
    if begin < 0 || end < begin || end as usize > chars.len() {
        return raise(
            INDEX_OUT_OF_BOUNDS,
            format!("begin {}, end {}, length {}", begin, end, chars.len()),
        );
    }
    Ok(Value::Str(chars[begin as usize..end as usize].iter().collect()))
}

fn assert_equals(_: &mut Interpreter<'_>, args: Vec<Value>) -> Exec<Value> {
    check(args.first() == args.get(1), || mismatch(&args[0], &args[1]))
}

fn mismatch(expected: &Value, actual: &Value) -> String {
    format!("expected: <{}> but was: <{}>", expected.render(), actual.render())
}

fn check(holds: bool, message: impl FnOnce() -> String) -> Exec<Value> {
    if holds {
        Ok(Value::Null)
    } else {
        raise(ASSERTION_ERROR, message())
    }
}

fn arg(args: &[Value], index: usize) -> Exec<&Value> {
    match args.get(index) {
        Some(Value::Null) => raise(NULL_POINTER_EXCEPTION, format!("argument {} is null", index)),
        Some(value) => Ok(value),
        None => raise(VERIFY_ERROR, format!("missing argument {}", index)),
    }
}

fn int(args: &[Value], index: usize) -> Exec<i64> {
    let value = arg(args, index)?;
    value
        .as_int()
        .map(Ok)
        .unwrap_or_else(|| raise(VERIFY_ERROR, format!("expected int, found {}", value.type_name())))
}

fn double(args: &[Value], index: usize) -> Exec<f64> {
    let value = arg(args, index)?;
    value
        .as_double()
        .map(Ok)
        .unwrap_or_else(|| raise(VERIFY_ERROR, format!("expected double, found {}", value.type_name())))
}

fn boolean(args: &[Value], index: usize) -> Exec<bool> {
    let value = arg(args, index)?;
    value
        .as_bool()
        .map(Ok)
        .unwrap_or_else(|| raise(VERIFY_ERROR, format!("expected bool, found {}", value.type_name())))
}

fn string(args: &[Value], index: usize) -> Exec<String> {
    let value = arg(args, index)?;
    value
        .as_str()
        .map(|s| Ok(s.to_string()))
        .unwrap_or_else(|| raise(VERIFY_ERROR, format!("expected std.String, found {}", value.type_name())))
}
