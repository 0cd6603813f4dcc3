//! Call gating: replace non-whitelisted call and construction sites with an
//! unconditional capability violation.
//!
//! Replacement is one instruction for one instruction, so no branch or
//! handler position moves. Every instruction of the routine is visited,
//! handler and cleanup code included.

use crate::config::policy::CallPolicy;
use crate::unit::{CallSite, Instr, Routine};
use std::collections::HashSet;

/// Violation message for a denied site
pub fn violation_message(site: &CallSite) -> String {
    if site.is_constructor() {
        format!("Illegal constructor call: new {}{}", site.owner, site.param_list())
    } else {
        format!("Illegal call: {}.{}{}", site.owner, site.name, site.param_list())
    }
}

fn permitted(site: &CallSite, policy: &CallPolicy, sandboxed: &HashSet<String>) -> bool {
    if sandboxed.contains(&site.owner) {
        return true;
    }
    if site.is_constructor() {
        policy.is_construction_permitted(&site.owner, &site.params)
    } else {
        policy.is_call_permitted(&site.owner, &site.name, &site.params)
    }
}

/// Rewrite denied sites in place; returns the messages of the sites replaced
pub fn gate_calls(
    routine: &mut Routine,
    policy: &CallPolicy,
    sandboxed: &HashSet<String>,
) -> Vec<String> {
    let mut replaced = Vec::new();
    for instr in routine.code.iter_mut() {
        let denied = match instr.call_site() {
            Some(site) if !permitted(site, policy, sandboxed) => violation_message(site),
            _ => continue,
        };
        *instr = Instr::RaiseViolation(denied.clone());
        replaced.push(denied);
    }
    replaced
}
