//! Stack-machine interpreter.
//!
//! Every routine invocation gets a fresh operand stack and local frame.
//! Throwables unwind through the routine's exception table; the first
//! covering handler whose catch clause matches receives the throwable on an
//! otherwise empty operand stack. Every call pushes its result; routines
//! that return nothing push null.

use super::hierarchy::{
    is_subtype, ARITHMETIC_EXCEPTION, ILLEGAL_ARGUMENT, INDEX_OUT_OF_BOUNDS, NO_SUCH_FIELD,
    NO_SUCH_METHOD, NULL_POINTER_EXCEPTION, OUT_OF_MEMORY, SECURITY_EXCEPTION, STACK_OVERFLOW,
    VERIFY_ERROR,
};
use super::natives::{self, NATIVES};
use super::{raise, Exec, RunEnv};
use crate::loader::{const_value, IsolationContext};
use crate::unit::instr::branch_target;
use crate::unit::value::{lock, Object};
use crate::unit::{
    CallKind, CallSite, Catch, CompiledUnit, Instr, Routine, Throwable, Value, CONSTRUCTOR,
    STATIC_INIT,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

enum Flow {
    Next,
    Goto(usize),
    Return(Value),
}

pub struct Interpreter<'ctx> {
    ctx: &'ctx IsolationContext,
    pub env: RunEnv,
    depth: usize,
}

impl<'ctx> Interpreter<'ctx> {
    pub fn new(ctx: &'ctx IsolationContext, env: RunEnv) -> Self {
        Self { ctx, env, depth: 0 }
    }

    pub fn context(&self) -> &'ctx IsolationContext {
        self.ctx
    }

    pub fn into_env(self) -> RunEnv {
        self.env
    }

    /// Invoke a routine or native callable
    pub fn call(&mut self, site: &CallSite, receiver: Option<Value>, args: Vec<Value>) -> Exec<Value> {
        let ctx = self.ctx;
        if let Some(unit) = ctx.unit(&site.owner) {
            self.ensure_initialized(&site.owner)?;
            let routine = match unit.routine(&site.name, &site.params) {
                Some(routine) => routine,
                None => return raise(NO_SUCH_METHOD, site.to_string()),
            };
            let receiver = match (routine.is_static, receiver) {
                (true, _) => None,
                (false, Some(Value::Null)) | (false, None) => {
                    return raise(NULL_POINTER_EXCEPTION, format!("receiver of {}", site))
                }
                (false, Some(r)) => Some(r),
            };
            return self.execute(unit, routine, receiver, args);
        }

        let mut args = args;
        if let Some(receiver) = receiver {
            args.insert(0, receiver);
        }
        match NATIVES.get(&site.to_string()) {
            Some(native) => native(self, args),
            None => raise(NO_SUCH_METHOD, site.to_string()),
        }
    }

    /// Construct an instance of a unit or a built-in type
    pub fn construct(&mut self, site: &CallSite, args: Vec<Value>) -> Exec<Value> {
        let ctx = self.ctx;
        let unit = match ctx.unit(&site.owner) {
            Some(unit) => unit,
            None => {
                return match natives::construct_builtin(site, &args) {
                    Some(result) => {
                        self.allocate(1)?;
                        result
                    }
                    None => raise(NO_SUCH_METHOD, site.to_string()),
                }
            }
        };

        self.ensure_initialized(&site.owner)?;
        self.allocate(1 + unit.fields.len() as u64)?;
        let fields: BTreeMap<String, Value> = unit
            .fields
            .iter()
            .map(|f| (f.name.clone(), const_value(&f.initial)))
            .collect();
        let object = Value::Object(Arc::new(Mutex::new(Object {
            class: unit.name.clone(),
            fields,
        })));

        match unit.routine(CONSTRUCTOR, &site.params) {
            Some(init) => {
                self.execute(unit, init, Some(object.clone()), args)?;
            }
            None if site.params.is_empty() => {}
            None => return raise(NO_SUCH_METHOD, site.to_string()),
        }
        Ok(object)
    }

    fn ensure_initialized(&mut self, owner: &str) -> Exec<()> {
        let ctx = self.ctx;
        if !ctx.begin_init(owner) {
            return Ok(());
        }
        if let Some(unit) = ctx.unit(owner) {
            if let Some(clinit) = unit.routine(STATIC_INIT, &[]) {
                log::trace!("running static initializer of {}", owner);
                self.execute(unit, clinit, None, Vec::new())?;
            }
        }
        Ok(())
    }

    /// Charge `cells` against the allocation budget
    pub fn allocate(&mut self, cells: u64) -> Exec<()> {
        self.env.heap_used = self.env.heap_used.saturating_add(cells);
        match self.env.heap_limit {
            Some(limit) if self.env.heap_used > limit => {
                self.env.heap_exhausted = true;
                raise(OUT_OF_MEMORY, format!("allocation budget of {} cells exhausted", limit))
            }
            _ => Ok(()),
        }
    }

    fn execute(
        &mut self,
        unit: &CompiledUnit,
        routine: &Routine,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Exec<Value> {
        if self.depth >= self.env.max_call_depth {
            return raise(
                STACK_OVERFLOW,
                format!("call depth {} exceeded in {}.{}", self.env.max_call_depth, unit.name, routine.name),
            );
        }
        if args.len() != routine.params.len() {
            return raise(
                VERIFY_ERROR,
                format!("{}.{} expects {} arguments, got {}", unit.name, routine.name, routine.params.len(), args.len()),
            );
        }

        self.depth += 1;
        let result = self.run_frame(routine, receiver, args);
        self.depth -= 1;
        result
    }

    fn run_frame(&mut self, routine: &Routine, receiver: Option<Value>, args: Vec<Value>) -> Exec<Value> {
        let mut locals = vec![Value::Null; routine.frame_size()];
        let offset = match receiver {
            Some(this) => {
                locals[0] = this;
                1
            }
            None => 0,
        };
        for (slot, arg) in locals[offset..].iter_mut().zip(args) {
            *slot = arg;
        }

        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;
        loop {
            let instr = match routine.code.get(pc) {
                Some(instr) => instr,
                None => return raise(VERIFY_ERROR, format!("pc {} outside {}", pc, routine.name)),
            };
            match self.step(instr, pc, &mut stack, &mut locals) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Goto(target)) => pc = target,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(thrown) => match find_handler(routine, pc, &thrown) {
                    Some(target) => {
                        stack.clear();
                        stack.push(Value::Throwable(thrown));
                        pc = target;
                    }
                    None => return Err(thrown),
                },
            }
        }
    }

    fn step(
        &mut self,
        instr: &Instr,
        pc: usize,
        stack: &mut Vec<Value>,
        locals: &mut [Value],
    ) -> Exec<Flow> {
        match instr {
            Instr::Const(c) => stack.push(const_value(c)),
            Instr::Load(slot) => stack.push(local(locals, *slot)?.clone()),
            Instr::Store(slot) => {
                let value = pop(stack)?;
                *local_mut(locals, *slot)? = value;
            }
            Instr::GetStatic { owner, field } => {
                self.ensure_initialized(owner)?;
                match self.ctx.get_static(owner, field) {
                    Some(value) => stack.push(value),
                    None => return raise(NO_SUCH_FIELD, format!("{}.{}", owner, field)),
                }
            }
            Instr::PutStatic { owner, field } => {
                let value = pop(stack)?;
                self.ensure_initialized(owner)?;
                if !self.ctx.put_static(owner, field, value) {
                    return raise(NO_SUCH_FIELD, format!("{}.{}", owner, field));
                }
            }
            Instr::GetField(field) => {
                let target = pop(stack)?;
                let value = with_object(&target, field, |obj| obj.fields.get(field).cloned())?;
                match value {
                    Some(value) => stack.push(value),
                    None => return raise(NO_SUCH_FIELD, field.clone()),
                }
            }
            Instr::PutField(field) => {
                let value = pop(stack)?;
                let target = pop(stack)?;
                let stored = with_object(&target, field, |obj| match obj.fields.get_mut(field) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                })?;
                if !stored {
                    return raise(NO_SUCH_FIELD, field.clone());
                }
            }
            Instr::Add | Instr::Sub | Instr::Mul | Instr::Div | Instr::Rem => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                let result = arithmetic(instr, lhs, rhs)?;
                if let Value::Str(s) = &result {
                    self.allocate(s.len() as u64)?;
                }
                stack.push(result);
            }
            Instr::Neg => match pop(stack)? {
                Value::Int(i) => stack.push(Value::Int(i.wrapping_neg())),
                Value::Double(d) => stack.push(Value::Double(-d)),
                other => return raise(VERIFY_ERROR, format!("cannot negate {}", other.type_name())),
            },
            Instr::Eq | Instr::Ne => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                let equal = lhs == rhs;
                stack.push(Value::Bool(if matches!(instr, Instr::Eq) { equal } else { !equal }));
            }
            Instr::Lt | Instr::Le | Instr::Gt | Instr::Ge => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                let ordering = compare(&lhs, &rhs)?;
                let holds = match instr {
                    Instr::Lt => ordering == Ordering::Less,
                    Instr::Le => ordering != Ordering::Greater,
                    Instr::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                stack.push(Value::Bool(holds));
            }
            Instr::Not => {
                let value = pop_bool(stack)?;
                stack.push(Value::Bool(!value));
            }
            Instr::Concat => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                let joined = lhs.render() + &rhs.render();
                self.allocate(joined.len() as u64)?;
                stack.push(Value::Str(joined));
            }
            Instr::Pop => {
                pop(stack)?;
            }
            Instr::Dup => {
                let top = stack
                    .last()
                    .cloned()
                    .ok_or_else(|| verify_error("dup on empty stack"))?;
                stack.push(top);
            }
            Instr::Jump(offset) => return Ok(Flow::Goto(target(pc, *offset)?)),
            Instr::JumpIf(offset) => {
                if pop_bool(stack)? {
                    return Ok(Flow::Goto(target(pc, *offset)?));
                }
            }
            Instr::JumpIfNot(offset) => {
                if !pop_bool(stack)? {
                    return Ok(Flow::Goto(target(pc, *offset)?));
                }
            }
            Instr::Invoke(site) => {
                let args = pop_args(stack, site.params.len())?;
                let receiver = match site.kind {
                    CallKind::Instance => Some(pop(stack)?),
                    CallKind::Static => None,
                };
                let result = self.call(site, receiver, args)?;
                stack.push(result);
            }
            Instr::New(site) => {
                let args = pop_args(stack, site.params.len())?;
                let object = self.construct(site, args)?;
                stack.push(object);
            }
            Instr::Return => return Ok(Flow::Return(Value::Null)),
            Instr::ReturnValue => return Ok(Flow::Return(pop(stack)?)),
            Instr::Throw => {
                return match pop(stack)? {
                    Value::Throwable(thrown) => Err(thrown),
                    Value::Null => raise(NULL_POINTER_EXCEPTION, "throw of null"),
                    other => raise(VERIFY_ERROR, format!("throw of {}", other.type_name())),
                }
            }
            Instr::InstanceOf(type_name) => {
                let value = pop(stack)?;
                stack.push(Value::Bool(instance_of(&value, type_name)));
            }
            Instr::NewArray => {
                let length = pop_int(stack)?;
                if length < 0 {
                    return raise(ILLEGAL_ARGUMENT, format!("negative array size: {}", length));
                }
                self.allocate(length as u64 + 1)?;
                stack.push(Value::Array(Arc::new(Mutex::new(vec![Value::Null; length as usize]))));
            }
            Instr::ArrayGet => {
                let index = pop_int(stack)?;
                let array = pop(stack)?;
                let value = with_array(&array, |items| {
                    checked_index(index, items.len()).map(|i| items[i].clone())
                })??;
                stack.push(value);
            }
            Instr::ArraySet => {
                let value = pop(stack)?;
                let index = pop_int(stack)?;
                let array = pop(stack)?;
                with_array(&array, |items| {
                    checked_index(index, items.len()).map(|i| items[i] = value)
                })??;
            }
            Instr::ArrayLen => {
                let array = pop(stack)?;
                let len = with_array(&array, |items| items.len())?;
                stack.push(Value::Int(len as i64));
            }
            Instr::RaiseViolation(message) => {
                let violation = Arc::new(Throwable::new(SECURITY_EXCEPTION, message.clone()));
                if self.env.violation.is_none() {
                    self.env.violation = Some(Arc::clone(&violation));
                }
                return Err(violation);
            }
        }
        Ok(Flow::Next)
    }
}

fn find_handler(routine: &Routine, pc: usize, thrown: &Throwable) -> Option<usize> {
    routine
        .handlers
        .iter()
        .find(|h| {
            h.covers(pc)
                && match &h.catch {
                    Catch::Any | Catch::Cleanup => true,
                    Catch::Type(t) => is_subtype(&thrown.type_name, t),
                }
        })
        .map(|h| h.target)
}

pub fn instance_of(value: &Value, type_name: &str) -> bool {
    match value {
        Value::Null => false,
        Value::Throwable(t) => is_subtype(&t.type_name, type_name),
        _ if type_name == "std.Object" => true,
        other => other.type_name() == type_name,
    }
}

fn verify_error(message: &str) -> Arc<Throwable> {
    Arc::new(Throwable::new(VERIFY_ERROR, message))
}

fn pop(stack: &mut Vec<Value>) -> Exec<Value> {
    stack.pop().ok_or_else(|| verify_error("operand stack underflow"))
}

fn pop_bool(stack: &mut Vec<Value>) -> Exec<bool> {
    match pop(stack)? {
        Value::Bool(b) => Ok(b),
        other => raise(VERIFY_ERROR, format!("expected bool, found {}", other.type_name())),
    }
}

fn pop_int(stack: &mut Vec<Value>) -> Exec<i64> {
    match pop(stack)? {
        Value::Int(i) => Ok(i),
        Value::Null => raise(NULL_POINTER_EXCEPTION, "null where int expected"),
        other => raise(VERIFY_ERROR, format!("expected int, found {}", other.type_name())),
    }
}

fn pop_args(stack: &mut Vec<Value>, count: usize) -> Exec<Vec<Value>> {
    if stack.len() < count {
        return Err(verify_error("operand stack underflow"));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn local(locals: &[Value], slot: usize) -> Exec<&Value> {
    locals
        .get(slot)
        .ok_or_else(|| verify_error("local slot out of range"))
}

fn local_mut(locals: &mut [Value], slot: usize) -> Exec<&mut Value> {
    locals
        .get_mut(slot)
        .ok_or_else(|| verify_error("local slot out of range"))
}

fn target(pc: usize, offset: i32) -> Exec<usize> {
    branch_target(pc, offset).ok_or_else(|| verify_error("branch before routine start"))
}

fn checked_index(index: i64, len: usize) -> Exec<usize> {
    if index < 0 || index as usize >= len {
        return raise(
            INDEX_OUT_OF_BOUNDS,
            format!("Index {} out of bounds for length {}", index, len),
        );
    }
    Ok(index as usize)
}

fn with_object<R>(target: &Value, field: &str, f: impl FnOnce(&mut Object) -> R) -> Exec<R> {
    match target {
        Value::Object(obj) => Ok(f(&mut lock(obj))),
        Value::Null => raise(NULL_POINTER_EXCEPTION, format!("field {} of null", field)),
        other => raise(VERIFY_ERROR, format!("field {} of {}", field, other.type_name())),
    }
}

fn with_array<R>(target: &Value, f: impl FnOnce(&mut Vec<Value>) -> R) -> Exec<R> {
    match target {
        Value::Array(items) => Ok(f(&mut lock(items))),
        Value::Null => raise(NULL_POINTER_EXCEPTION, "array access on null"),
        other => raise(VERIFY_ERROR, format!("array access on {}", other.type_name())),
    }
}

fn arithmetic(op: &Instr, lhs: Value, rhs: Value) -> Exec<Value> {
    match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            if matches!(op, Instr::Div | Instr::Rem) && b == 0 {
                return raise(ARITHMETIC_EXCEPTION, "/ by zero");
            }
            Ok(Value::Int(match op {
                Instr::Add => a.wrapping_add(b),
                Instr::Sub => a.wrapping_sub(b),
                Instr::Mul => a.wrapping_mul(b),
                Instr::Div => a.wrapping_div(b),
                _ => a.wrapping_rem(b),
            }))
        }
        (Value::Str(_), _) | (_, Value::Str(_)) if matches!(op, Instr::Add) => {
            Ok(Value::Str(lhs.render() + &rhs.render()))
        }
        _ => match (lhs.as_double(), rhs.as_double()) {
            (Some(a), Some(b)) => Ok(Value::Double(match op {
                Instr::Add => a + b,
                Instr::Sub => a - b,
                Instr::Mul => a * b,
                Instr::Div => a / b,
                _ => a % b,
            })),
            _ if lhs.is_null() || rhs.is_null() => {
                raise(NULL_POINTER_EXCEPTION, "arithmetic on null")
            }
            _ => raise(
                VERIFY_ERROR,
                format!("bad operands {} and {}", lhs.type_name(), rhs.type_name()),
            ),
        },
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Exec<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (lhs.as_double(), rhs.as_double()) {
            (Some(a), Some(b)) => Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal)),
            _ => raise(
                VERIFY_ERROR,
                format!("cannot compare {} and {}", lhs.type_name(), rhs.type_name()),
            ),
        },
    }
}
