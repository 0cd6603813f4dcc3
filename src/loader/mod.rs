//! Isolated loading of compiled units.
//!
//! [`IsolatedLoader::load`] produces a fresh [`IsolationContext`] holding
//! rewritten copies of the sandboxed units plus shared references to the
//! support units. Static state lives in the context, so two contexts never
//! observe each other's statics. Rewriting runs two passes over every
//! sandboxed routine:
//!
//! 1. [`gating`]: call sites denied by the policy become capability violations
//! 2. [`cancellation`]: loop back edges poll the worker's cancellation flag
//!
//! Any inconsistency found while rewriting is a [`GradeError::LoaderDefect`].

pub mod cancellation;
pub mod cfg;
pub mod gating;
pub mod verify;

use crate::config::policy::CallPolicy;
use crate::config::types::{GradeError, Result, SandboxConfig};
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics::get_metrics;
use crate::runtime::natives::NATIVES;
use crate::unit::{CompiledUnit, Const, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Namespaces owned by the runtime library; loaded units may not define types in them
pub const RESERVED_NAMESPACES: &[&str] = &["std.", "test."];

/// Whether a unit named `name` would shadow a library type
pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMESPACES.iter().any(|ns| name.starts_with(ns)) || NATIVES.owns(name)
}

/// What rewriting changed in one isolation context
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RewriteStats {
    /// Violation messages of the call sites replaced
    pub gated_sites: Vec<String>,
    pub loops_instrumented: usize,
    pub handlers_amended: usize,
}

impl RewriteStats {
    fn absorb(&mut self, other: RewriteStats) {
        self.gated_sites.extend(other.gated_sites);
        self.loops_instrumented += other.loops_instrumented;
        self.handlers_amended += other.handlers_amended;
    }
}

#[derive(Clone, Debug)]
pub struct IsolatedLoader {
    policy: Option<Arc<CallPolicy>>,
    inject_cancellation: bool,
    dump_dir: Option<PathBuf>,
    correlation: Option<CorrelationIds>,
}

impl IsolatedLoader {
    pub fn new(policy: Option<Arc<CallPolicy>>, inject_cancellation: bool) -> Self {
        Self {
            policy,
            inject_cancellation,
            dump_dir: None,
            correlation: None,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            dump_dir: config.dump_dir.clone(),
            ..Self::new(config.policy.clone(), config.cancellation_injection)
        }
    }

    pub fn with_dump_dir(mut self, dir: PathBuf) -> Self {
        self.dump_dir = Some(dir);
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Rewrite one sandboxed unit
    pub fn rewrite_unit(
        &self,
        unit: &CompiledUnit,
        sandboxed: &HashSet<String>,
    ) -> Result<(CompiledUnit, RewriteStats)> {
        let mut rewritten = unit.clone();
        let mut stats = RewriteStats::default();

        for routine in rewritten.routines.iter_mut() {
            let routine_name = routine.name.clone();
            let defect = |reason: String| GradeError::loader_defect(&unit.name, &routine_name, reason);
            verify::verify_routine(routine).map_err(defect)?;

            if let Some(policy) = &self.policy {
                stats
                    .gated_sites
                    .extend(gating::gate_calls(routine, policy, sandboxed));
            }

            if self.inject_cancellation {
                stats.loops_instrumented +=
                    cancellation::inject_cancellation(routine).map_err(defect)?;
                stats.handlers_amended += cancellation::amend_handlers(routine);
            }

            verify::verify_routine(routine)
                .map_err(|reason| defect(format!("rewritten routine invalid: {}", reason)))?;
        }

        Ok((rewritten, stats))
    }

    /// Build a fresh isolation context
    pub fn load(
        &self,
        sandboxed: &[CompiledUnit],
        support: &[Arc<CompiledUnit>],
    ) -> Result<IsolationContext> {
        let names: HashSet<String> = sandboxed.iter().map(|u| u.name.clone()).collect();
        let mut types: HashMap<String, Arc<CompiledUnit>> = HashMap::new();
        let mut stats = RewriteStats::default();

        let reserved = sandboxed
            .iter()
            .map(|u| u.name.as_str())
            .chain(support.iter().map(|u| u.name.as_str()))
            .find(|name| is_reserved_name(name));
        if let Some(name) = reserved {
            audit::events::loader_defect(name, "unit name is in a reserved namespace");
            return Err(GradeError::loader_defect(
                name,
                "",
                "unit name is in a reserved namespace",
            ));
        }

        for unit in sandboxed {
            let (rewritten, unit_stats) = self.rewrite_unit(unit, &names).map_err(|e| {
                audit::events::loader_defect(&unit.name, &e.to_string());
                e
            })?;
            for message in &unit_stats.gated_sites {
                self.report_gated_site(&unit.name, message);
            }
            stats.absorb(unit_stats);
            if let Some(dir) = &self.dump_dir {
                dump_unit(dir, &rewritten);
            }
            if types.insert(unit.name.clone(), Arc::new(rewritten)).is_some() {
                return Err(GradeError::loader_defect(&unit.name, "", "duplicate unit name"));
            }
        }
        for unit in support {
            if types.insert(unit.name.clone(), Arc::clone(unit)).is_some() {
                return Err(GradeError::loader_defect(
                    &unit.name,
                    "",
                    "support unit shadows another unit",
                ));
            }
        }

        let metrics = get_metrics();
        metrics.contexts_created.inc();
        metrics.loops_instrumented.add(stats.loops_instrumented as u64);

        let context = IsolationContext {
            id: Uuid::new_v4(),
            types,
            sandboxed: names,
            statics: RefCell::new(HashMap::new()),
            stats,
        };
        log::debug!(
            "isolation context {} ready: {} types, {} gated sites, {} loops instrumented",
            context.id,
            context.types.len(),
            context.stats.gated_sites.len(),
            context.stats.loops_instrumented
        );
        Ok(context)
    }

    fn report_gated_site(&self, unit: &str, message: &str) {
        get_metrics().call_sites_gated.inc();
        let mut event = audit::SecurityEvent::new(
            audit::SecurityEventType::CallSiteGated,
            format!("{} in {}", message, unit),
        )
        .with_unit(unit.to_string());
        if let Some(correlation) = &self.correlation {
            event = event.with_correlation(correlation.clone());
        }
        audit::log_security_event(event);
    }
}

fn dump_unit(dir: &Path, unit: &CompiledUnit) {
    let file_name = format!("{}-instrumented.json", unit.name.replace(&['/', '\\'][..], "_"));
    let path = dir.join(file_name);
    let result = std::fs::create_dir_all(dir)
        .and_then(|_| {
            serde_json::to_string_pretty(unit)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        })
        .and_then(|json| std::fs::write(&path, json));
    match result {
        Ok(()) => log::debug!("dumped rewritten unit to {}", path.display()),
        Err(e) => log::warn!("failed to dump rewritten unit {}: {}", unit.name, e),
    }
}

/// Static fields of one type inside one context
#[derive(Debug, Default)]
struct TypeStatics {
    fields: BTreeMap<String, Value>,
}

/// Single-use namespace of live type definitions.
///
/// Holds its own static storage; dropping the context discards every static
/// value written during the run.
pub struct IsolationContext {
    id: Uuid,
    types: HashMap<String, Arc<CompiledUnit>>,
    sandboxed: HashSet<String>,
    statics: RefCell<HashMap<String, TypeStatics>>,
    stats: RewriteStats,
}

impl IsolationContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stats(&self) -> &RewriteStats {
        &self.stats
    }

    pub fn unit(&self, name: &str) -> Option<&Arc<CompiledUnit>> {
        self.types.get(name)
    }

    pub fn is_sandboxed(&self, name: &str) -> bool {
        self.sandboxed.contains(name)
    }

    /// Mark `name` initialized, seeding its declared statics. Returns false
    /// when the type was already initialized (or is being initialized).
    pub fn begin_init(&self, name: &str) -> bool {
        let mut statics = self.statics.borrow_mut();
        if statics.contains_key(name) {
            return false;
        }
        let fields = self
            .types
            .get(name)
            .map(|unit| {
                unit.static_fields
                    .iter()
                    .map(|f| (f.name.clone(), const_value(&f.initial)))
                    .collect()
            })
            .unwrap_or_default();
        statics.insert(name.to_string(), TypeStatics { fields });
        true
    }

    pub fn get_static(&self, owner: &str, field: &str) -> Option<Value> {
        self.statics
            .borrow()
            .get(owner)
            .and_then(|s| s.fields.get(field).cloned())
    }

    /// Write a declared static; returns false when no such field exists
    pub fn put_static(&self, owner: &str, field: &str, value: Value) -> bool {
        let mut statics = self.statics.borrow_mut();
        match statics.get_mut(owner).and_then(|s| s.fields.get_mut(field)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationContext")
            .field("id", &self.id)
            .field("types", &self.types.len())
            .field("sandboxed", &self.sandboxed)
            .finish()
    }
}

pub fn const_value(c: &Const) -> Value {
    match c {
        Const::Null => Value::Null,
        Const::Bool(b) => Value::Bool(*b),
        Const::Int(i) => Value::Int(*i),
        Const::Double(d) => Value::Double(*d),
        Const::Str(s) => Value::Str(s.clone()),
    }
}
