//! Cancellation injection.
//!
//! A pure loop never reaches a blocking primitive, so cooperative
//! cancellation only works if the loop itself polls the worker's flag. This
//! pass finds every block that is the source of a back edge and inserts,
//! before its last instruction:
//!
//! ```text
//! Invoke std.Worker.cancellationRequested()
//! JumpIfNot +3
//! New std.CancellationSignal.<init>()
//! Throw
//! ```
//!
//! One loop block is handled per iteration and the graph is rebuilt after
//! every insertion. Afterwards every non-cleanup handler starts with a check
//! that re-raises a caught cancellation signal.

use super::cfg::ControlFlowGraph;
use crate::unit::{CallSite, Catch, Instr, Routine};

pub const CANCELLATION_SIGNAL: &str = "std.CancellationSignal";
pub const WORKER_OWNER: &str = "std.Worker";
pub const CANCELLATION_PROBE: &str = "cancellationRequested";

fn check_sequence() -> Vec<Instr> {
    vec![
        Instr::Invoke(CallSite::new(WORKER_OWNER, CANCELLATION_PROBE, &[])),
        Instr::JumpIfNot(3),
        Instr::New(CallSite::constructor(CANCELLATION_SIGNAL, &[])),
        Instr::Throw,
    ]
}

fn rethrow_sequence() -> Vec<Instr> {
    vec![
        Instr::Dup,
        Instr::InstanceOf(CANCELLATION_SIGNAL.to_string()),
        Instr::JumpIfNot(2),
        Instr::Throw,
    ]
}

/// New offset for a branch at `q` after `k` instructions are inserted at `p`.
///
/// Branches into position `p` land on the inserted code. The instruction
/// previously at `p` keeps its own offset when it targets itself, so a bare
/// self loop must be patched by the caller.
fn relocate(q: usize, offset: i32, p: usize, k: i32) -> i32 {
    let target = q as i64 + offset as i64;
    let (q, p) = (q as i64, p as i64);
    if q < p && target > p {
        offset + k
    } else if q > p && target <= p {
        offset - k
    } else if q == p && target < p {
        offset - k
    } else {
        offset
    }
}

/// Insert `seq` before position `p`, relocating branches and handlers
pub(crate) fn insert_before(routine: &mut Routine, p: usize, seq: Vec<Instr>) {
    let k = seq.len();
    for (q, instr) in routine.code.iter_mut().enumerate() {
        if let Some(offset) = instr.branch_offset() {
            instr.set_branch_offset(relocate(q, offset, p, k as i32));
        }
    }
    routine.code.splice(p..p, seq);
    for handler in routine.handlers.iter_mut() {
        if handler.start > p {
            handler.start += k;
        }
        if handler.end > p {
            handler.end += k;
        }
        if handler.target > p {
            handler.target += k;
        }
    }
}

/// Insert loop checks; returns the number of loop blocks instrumented
pub fn inject_cancellation(routine: &mut Routine) -> Result<usize, String> {
    let k = check_sequence().len();
    let limit = routine.code.len();
    let mut processed = 0;
    loop {
        let at = {
            let cfg = ControlFlowGraph::build(routine)?;
            let sources = cfg.back_edge_blocks();
            if processed >= sources.len() {
                break;
            }
            sources[processed].last()
        };

        insert_before(routine, at, check_sequence());
        // empty loop: the relocated self branch still points at itself
        if routine.code[at + k] == Instr::Jump(0) {
            routine.code[at + k] = Instr::Jump(-(k as i32));
        }

        processed += 1;
        if processed > limit {
            return Err(format!(
                "cancellation injection did not converge after {} insertions",
                processed
            ));
        }
    }
    Ok(processed)
}

/// Make every non-cleanup handler re-raise a caught cancellation signal;
/// returns the number of handler entry points amended
pub fn amend_handlers(routine: &mut Routine) -> usize {
    let mut targets: Vec<usize> = routine
        .handlers
        .iter()
        .filter(|h| h.catch != Catch::Cleanup)
        .map(|h| h.target)
        .collect();
    targets.sort_unstable_by(|a, b| b.cmp(a));
    targets.dedup();
    for &target in &targets {
        insert_before(routine, target, rethrow_sequence());
    }
    targets.len()
}

/// Check that every branch still lands inside the routine
#[cfg(test)]
pub(crate) fn branches_in_range(routine: &Routine) -> bool {
    let len = routine.code.len();
    routine.code.iter().enumerate().all(|(pc, instr)| {
        instr
            .branch_offset()
            .map_or(true, |off| crate::unit::instr::branch_target(pc, off).map_or(false, |t| t < len))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Const, Handler};

    fn routine(code: Vec<Instr>) -> Routine {
        Routine::new("r", &[], code).with_locals(2)
    }

    fn probe() -> Instr {
        Instr::Invoke(CallSite::new(WORKER_OWNER, CANCELLATION_PROBE, &[]))
    }

    #[test]
    fn test_empty_loop_is_patched_to_check() {
        let mut r = routine(vec![Instr::Jump(0)]);
        assert_eq!(inject_cancellation(&mut r).unwrap(), 1);
        assert_eq!(r.code.len(), 5);
        assert_eq!(r.code[0], probe());
        assert_eq!(r.code[4], Instr::Jump(-4));
        assert!(branches_in_range(&r));
    }

    #[test]
    fn test_while_loop_offsets_relocated() {
        // 0: load; 1: if !x goto 4; 2: load; 3: goto 0; 4: return
        let mut r = routine(vec![
            Instr::Load(0),
            Instr::JumpIfNot(3),
            Instr::Load(1),
            Instr::Jump(-3),
            Instr::Return,
        ]);
        assert_eq!(inject_cancellation(&mut r).unwrap(), 1);
        assert_eq!(r.code.len(), 9);
        // exit branch still reaches the return
        assert_eq!(r.code[1], Instr::JumpIfNot(7));
        assert_eq!(r.code[8], Instr::Return);
        // check sits right before the back branch
        assert_eq!(r.code[3], probe());
        assert_eq!(r.code[4], Instr::JumpIfNot(3));
        assert_eq!(r.code[7], Instr::Jump(-7));
    }

    #[test]
    fn test_two_loops_each_get_one_check() {
        let mut r = routine(vec![
            Instr::Load(0),      // 0
            Instr::JumpIfNot(5), // 1 -> 6
            Instr::Load(1),      // 2
            Instr::JumpIf(-1),   // 3 -> 2
            Instr::Load(0),      // 4
            Instr::Jump(-5),     // 5 -> 0
            Instr::Return,       // 6
        ]);
        assert_eq!(inject_cancellation(&mut r).unwrap(), 2);
        assert_eq!(r.code.len(), 15);
        let probes = r.code.iter().filter(|i| **i == probe()).count();
        assert_eq!(probes, 2);
        assert!(branches_in_range(&r));
        assert_eq!(r.code[14], Instr::Return);
        // no new back edges appear after instrumentation
        let cfg = ControlFlowGraph::build(&r).unwrap();
        assert_eq!(cfg.back_edge_blocks().len(), 2);
    }

    #[test]
    fn test_loop_free_routine_unchanged() {
        let mut r = routine(vec![Instr::Const(Const::Int(1)), Instr::ReturnValue]);
        let before = r.clone();
        assert_eq!(inject_cancellation(&mut r).unwrap(), 0);
        assert_eq!(r, before);
    }

    #[test]
    fn test_handlers_shift_with_insertion() {
        let mut r = routine(vec![
            Instr::Load(0),  // 0 protected
            Instr::Jump(-1), // 1 loop back to 0
            Instr::Pop,      // 2 handler
            Instr::Return,   // 3
        ])
        .with_handler(Handler {
            start: 0,
            end: 2,
            target: 2,
            catch: Catch::Type("std.Exception".into()),
        });
        inject_cancellation(&mut r).unwrap();
        assert_eq!(r.handlers[0].start, 0);
        assert_eq!(r.handlers[0].end, 6);
        assert_eq!(r.handlers[0].target, 6);
        assert_eq!(r.code[6], Instr::Pop);
    }

    #[test]
    fn test_amend_handlers_skips_cleanup() {
        let mut r = routine(vec![
            Instr::Return, // 0 protected
            Instr::Pop,    // 1 catch
            Instr::Return, // 2
            Instr::Throw,  // 3 cleanup: rethrow
        ])
        .with_handler(Handler {
            start: 0,
            end: 1,
            target: 1,
            catch: Catch::Any,
        })
        .with_handler(Handler {
            start: 0,
            end: 1,
            target: 3,
            catch: Catch::Cleanup,
        });
        assert_eq!(amend_handlers(&mut r), 1);
        assert_eq!(r.code.len(), 8);
        assert_eq!(r.handlers[0].target, 1);
        assert_eq!(r.code[1], Instr::Dup);
        assert_eq!(r.code[2], Instr::InstanceOf(CANCELLATION_SIGNAL.into()));
        assert_eq!(r.code[5], Instr::Pop);
        assert_eq!(r.handlers[1].target, 7);
        assert_eq!(r.code[7], Instr::Throw);
    }

    #[test]
    fn test_relocation_rules() {
        // branch into the insertion point lands on the inserted code
        assert_eq!(relocate(1, 2, 3, 4), 2);
        // forward branch across the insertion point
        assert_eq!(relocate(1, 4, 3, 4), 8);
        // backward branch from after the insertion point
        assert_eq!(relocate(5, -5, 3, 4), -9);
        // moved instruction branching backwards
        assert_eq!(relocate(3, -3, 3, 4), -7);
        // moved instruction branching to itself is left alone
        assert_eq!(relocate(3, 0, 3, 4), 0);
    }
}
