//! Structural verification of routines, run before and after rewriting.

use crate::unit::instr::branch_target;
use crate::unit::{Instr, Routine};

/// Check a routine's instruction stream and exception table
pub fn verify_routine(routine: &Routine) -> Result<(), String> {
    let len = routine.code.len();
    let last = routine
        .code
        .last()
        .ok_or_else(|| "empty instruction stream".to_string())?;
    if !last.ends_flow() {
        return Err(format!("control falls off the end after {:?}", last));
    }

    let frame = routine.frame_size();
    for (pc, instr) in routine.code.iter().enumerate() {
        if let Some(offset) = instr.branch_offset() {
            match branch_target(pc, offset) {
                Some(t) if t < len => {}
                _ => return Err(format!("branch at {} targets outside the routine", pc)),
            }
        }
        match instr {
            Instr::Load(slot) | Instr::Store(slot) if *slot >= frame => {
                return Err(format!(
                    "local slot {} at {} exceeds frame size {}",
                    slot, pc, frame
                ));
            }
            Instr::Invoke(site) | Instr::New(site) if site.owner.is_empty() => {
                return Err(format!("call site at {} has no owner", pc));
            }
            _ => {}
        }
    }

    for handler in &routine.handlers {
        if handler.start >= handler.end || handler.end > len || handler.target >= len {
            return Err(format!(
                "handler {}..{} -> {} invalid for length {}",
                handler.start, handler.end, handler.target, len
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Catch, Const, Handler};

    #[test]
    fn test_accepts_well_formed() {
        let r = Routine::new("f", &["int"], vec![Instr::Load(0), Instr::ReturnValue]);
        assert!(verify_routine(&r).is_ok());
    }

    #[test]
    fn test_rejects_fall_through_end() {
        let r = Routine::new("f", &[], vec![Instr::Const(Const::Int(1))]);
        assert!(verify_routine(&r).unwrap_err().contains("falls off"));
    }

    #[test]
    fn test_rejects_bad_local_and_handler() {
        let r = Routine::new("f", &[], vec![Instr::Load(3), Instr::Return]);
        assert!(verify_routine(&r).is_err());

        let r = Routine::new("f", &[], vec![Instr::Return]).with_handler(Handler {
            start: 0,
            end: 2,
            target: 0,
            catch: Catch::Any,
        });
        assert!(verify_routine(&r).is_err());
    }
}
