//! Compiled program units.
//!
//! A [`CompiledUnit`] is the immutable, already-compiled definition of one
//! type: its static fields, instance fields and routines. Units are produced
//! by a [`compiler::UnitCompiler`] and are read-only input to the loader.

pub mod compiler;
pub mod instr;
pub mod value;

pub use instr::{CallKind, CallSite, Const, Instr, CONSTRUCTOR, STATIC_INIT};
pub use value::{Throwable, Value, WireValue};

use serde::{Deserialize, Serialize};

/// Marks a routine as a test operation
pub const TEST_ANNOTATION: &str = "test";
/// Marks a test operation as skipped
pub const DISABLED_ANNOTATION: &str = "disabled";

/// Declared field with its initial value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    #[serde(default = "null_const")]
    pub initial: Const,
}

fn null_const() -> Const {
    Const::Null
}

/// Which throwables an exception handler accepts
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Catch {
    /// Every throwable
    Any,
    /// Throwables of this type or a subtype
    Type(String),
    /// Cleanup code that runs for every throwable and re-raises it
    Cleanup,
}

/// Exception table entry; `start..end` is the protected range
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handler {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub catch: Catch,
}

impl Handler {
    pub fn covers(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Routine {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "default_true")]
    pub is_static: bool,
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub max_locals: usize,
    pub code: Vec<Instr>,
    #[serde(default)]
    pub handlers: Vec<Handler>,
}

fn default_true() -> bool {
    true
}

impl Routine {
    pub fn new(name: &str, params: &[&str], code: Vec<Instr>) -> Self {
        Self {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            is_static: true,
            annotations: Vec::new(),
            max_locals: params.len(),
            code,
            handlers: Vec::new(),
        }
    }

    pub fn instance(mut self) -> Self {
        self.is_static = false;
        self.max_locals = self.max_locals.max(self.params.len() + 1);
        self
    }

    pub fn with_locals(mut self, max_locals: usize) -> Self {
        self.max_locals = max_locals;
        self
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn annotated(mut self, annotation: &str) -> Self {
        self.annotations.push(annotation.to_string());
        self
    }

    pub fn has_annotation(&self, annotation: &str) -> bool {
        self.annotations.iter().any(|a| a == annotation)
    }

    /// Number of local slots needed, receiver and parameters included
    pub fn frame_size(&self) -> usize {
        let receiver = usize::from(!self.is_static);
        self.max_locals.max(self.params.len() + receiver)
    }

    pub fn matches(&self, name: &str, params: &[String]) -> bool {
        self.name == name && self.params == params
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompiledUnit {
    pub name: String,
    #[serde(default)]
    pub static_fields: Vec<FieldDecl>,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    #[serde(default)]
    pub routines: Vec<Routine>,
}

impl CompiledUnit {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            static_fields: Vec::new(),
            fields: Vec::new(),
            routines: Vec::new(),
        }
    }

    pub fn with_static(mut self, name: &str, initial: Const) -> Self {
        self.static_fields.push(FieldDecl {
            name: name.to_string(),
            initial,
        });
        self
    }

    pub fn with_field(mut self, name: &str, initial: Const) -> Self {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            initial,
        });
        self
    }

    pub fn with_routine(mut self, routine: Routine) -> Self {
        self.routines.push(routine);
        self
    }

    pub fn routine(&self, name: &str, params: &[String]) -> Option<&Routine> {
        self.routines.iter().find(|r| r.matches(name, params))
    }
}
