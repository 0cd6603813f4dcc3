//! Instruction set of the managed runtime.
//!
//! Routines are flat instruction vectors executed by a stack machine. Branch
//! operands are offsets relative to the branch instruction itself, so
//! `Jump(0)` is an empty self loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal operand of [`Instr::Const`]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Const {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

/// Dispatch kind of a call site
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// No receiver; arguments only
    #[default]
    #[serde(rename = "static")]
    Static,
    /// Receiver is pushed before the arguments
    #[serde(rename = "instance")]
    Instance,
}

/// Statically declared target of a call or construction
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub kind: CallKind,
}

impl CallSite {
    pub fn new(owner: &str, name: &str, params: &[&str]) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            kind: CallKind::Static,
        }
    }

    pub fn instance(owner: &str, name: &str, params: &[&str]) -> Self {
        Self {
            kind: CallKind::Instance,
            ..Self::new(owner, name, params)
        }
    }

    /// Construction site; the name is always `<init>`
    pub fn constructor(owner: &str, params: &[&str]) -> Self {
        Self::new(owner, CONSTRUCTOR, params)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR
    }

    /// `(a,b)` rendering of the parameter list
    pub fn param_list(&self) -> String {
        format!("({})", self.params.join(","))
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.param_list())
    }
}

/// Name of constructor routines
pub const CONSTRUCTOR: &str = "<init>";
/// Name of the per-type static initializer
pub const STATIC_INIT: &str = "<clinit>";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Instr {
    Const(Const),
    Load(usize),
    Store(usize),
    GetStatic { owner: String, field: String },
    PutStatic { owner: String, field: String },
    GetField(String),
    PutField(String),
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    Concat,
    Pop,
    Dup,
    Jump(i32),
    JumpIf(i32),
    JumpIfNot(i32),
    Invoke(CallSite),
    New(CallSite),
    Return,
    ReturnValue,
    Throw,
    InstanceOf(String),
    NewArray,
    ArrayGet,
    ArraySet,
    ArrayLen,
    /// Unconditionally raise a capability violation with this message
    RaiseViolation(String),
}

impl Instr {
    /// Relative offset of a branch instruction
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            Instr::Jump(off) | Instr::JumpIf(off) | Instr::JumpIfNot(off) => Some(*off),
            _ => None,
        }
    }

    pub fn set_branch_offset(&mut self, offset: i32) {
        match self {
            Instr::Jump(off) | Instr::JumpIf(off) | Instr::JumpIfNot(off) => *off = offset,
            _ => {}
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Instr::JumpIf(_) | Instr::JumpIfNot(_))
    }

    /// Control never continues to the next instruction
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            Instr::Jump(_)
                | Instr::Return
                | Instr::ReturnValue
                | Instr::Throw
                | Instr::RaiseViolation(_)
        )
    }

    /// Instructions that end a basic block
    pub fn is_terminator(&self) -> bool {
        self.ends_flow() || self.is_conditional()
    }

    pub fn call_site(&self) -> Option<&CallSite> {
        match self {
            Instr::Invoke(site) | Instr::New(site) => Some(site),
            _ => None,
        }
    }
}

/// Absolute target of a branch at `pc` with relative `offset`
pub fn branch_target(pc: usize, offset: i32) -> Option<usize> {
    let target = pc as i64 + offset as i64;
    usize::try_from(target).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_site_display() {
        let site = CallSite::new("std.Math", "max", &["int", "int"]);
        assert_eq!(site.to_string(), "std.Math.max(int,int)");
        let ctor = CallSite::constructor("std.Exception", &[]);
        assert!(ctor.is_constructor());
        assert_eq!(ctor.to_string(), "std.Exception.<init>()");
    }

    #[test]
    fn test_branch_target() {
        assert_eq!(branch_target(5, -5), Some(0));
        assert_eq!(branch_target(5, 0), Some(5));
        assert_eq!(branch_target(2, -3), None);
    }

    #[test]
    fn test_terminators() {
        assert!(Instr::Jump(0).ends_flow());
        assert!(!Instr::JumpIf(2).ends_flow());
        assert!(Instr::JumpIf(2).is_terminator());
        assert!(Instr::RaiseViolation("x".into()).ends_flow());
        assert!(!Instr::Add.is_terminator());
    }

    #[test]
    fn test_instruction_json_shape() {
        let json = serde_json::to_string(&Instr::Jump(-3)).unwrap();
        assert_eq!(json, "{\"Jump\":-3}");
        let instr: Instr = serde_json::from_str("\"Add\"").unwrap();
        assert_eq!(instr, Instr::Add);
    }
}
