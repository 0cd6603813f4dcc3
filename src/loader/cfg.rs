//! Control-flow graph of a routine.
//!
//! Blocks carry the positions of their call sites, and back-edge sources
//! are a first-class query. Exceptional edges are not modelled as block
//! successors; handler entry blocks are treated as additional roots instead.

use crate::unit::instr::branch_target;
use crate::unit::Routine;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    /// First instruction
    pub start: usize,
    /// One past the last instruction
    pub end: usize,
    /// Successor block indices, fall-through first
    pub successors: Vec<usize>,
    /// Positions of `Invoke` and `New` instructions in this block
    pub call_sites: Vec<usize>,
}

impl BasicBlock {
    pub fn last(&self) -> usize {
        self.end - 1
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Clone, Debug)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    /// Entry block followed by every handler entry block
    pub roots: Vec<usize>,
    block_of: Vec<usize>,
}

impl ControlFlowGraph {
    /// Build the graph; fails on branch or handler positions outside the
    /// instruction stream.
    pub fn build(routine: &Routine) -> Result<Self, String> {
        let code = &routine.code;
        let len = code.len();
        if len == 0 {
            return Err("empty instruction stream".to_string());
        }

        let mut leader = vec![false; len];
        leader[0] = true;
        for (pc, instr) in code.iter().enumerate() {
            if let Some(offset) = instr.branch_offset() {
                let target = resolve(pc, offset, len)?;
                leader[target] = true;
            }
            if instr.is_terminator() && pc + 1 < len {
                leader[pc + 1] = true;
            }
        }
        for handler in &routine.handlers {
            if handler.start >= handler.end || handler.end > len || handler.target >= len {
                return Err(format!(
                    "handler {}..{} -> {} outside instruction stream of length {}",
                    handler.start, handler.end, handler.target, len
                ));
            }
            leader[handler.start] = true;
            leader[handler.target] = true;
            if handler.end < len {
                leader[handler.end] = true;
            }
        }

        let mut blocks = Vec::new();
        let mut block_of = vec![0; len];
        let mut start = 0;
        for pc in 1..=len {
            if pc == len || leader[pc] {
                blocks.push(BasicBlock {
                    start,
                    end: pc,
                    successors: Vec::new(),
                    call_sites: (start..pc)
                        .filter(|&i| code[i].call_site().is_some())
                        .collect(),
                });
                for slot in &mut block_of[start..pc] {
                    *slot = blocks.len() - 1;
                }
                start = pc;
            }
        }

        for index in 0..blocks.len() {
            let last = blocks[index].last();
            let instr = &code[last];
            let mut successors = Vec::new();
            if !instr.ends_flow() && last + 1 < len {
                successors.push(block_of[last + 1]);
            }
            if let Some(offset) = instr.branch_offset() {
                let target = block_of[resolve(last, offset, len)?];
                if !successors.contains(&target) {
                    successors.push(target);
                }
            }
            blocks[index].successors = successors;
        }

        let mut roots = vec![0];
        for handler in &routine.handlers {
            let root = block_of[handler.target];
            if !roots.contains(&root) {
                roots.push(root);
            }
        }

        Ok(Self {
            blocks,
            roots,
            block_of,
        })
    }

    pub fn block_containing(&self, pc: usize) -> Option<&BasicBlock> {
        self.block_of.get(pc).map(|&index| &self.blocks[index])
    }

    /// Blocks that are the source of at least one back edge, ordered by
    /// position. A back edge leads to a block still on the depth-first
    /// stack, so a single-block self loop qualifies.
    pub fn back_edge_blocks(&self) -> Vec<&BasicBlock> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.blocks.len()];
        let mut sources = vec![false; self.blocks.len()];

        for &root in &self.roots {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // (block, next successor to examine)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;
            while let Some(top) = stack.last_mut() {
                let (block, next) = *top;
                if let Some(&succ) = self.blocks[block].successors.get(next) {
                    top.1 += 1;
                    match marks[succ] {
                        Mark::Unvisited => {
                            marks[succ] = Mark::OnStack;
                            stack.push((succ, 0));
                        }
                        Mark::OnStack => sources[block] = true,
                        Mark::Done => {}
                    }
                } else {
                    marks[block] = Mark::Done;
                    stack.pop();
                }
            }
        }

        // blocks are already sorted by start position
        self.blocks
            .iter()
            .zip(sources)
            .filter_map(|(block, is_source)| is_source.then_some(block))
            .collect()
    }
}

fn resolve(pc: usize, offset: i32, len: usize) -> Result<usize, String> {
    match branch_target(pc, offset) {
        Some(target) if target < len => Ok(target),
        _ => Err(format!("branch at {} with offset {} leaves the routine", pc, offset)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Catch, Handler, Instr};

    fn routine(code: Vec<Instr>) -> Routine {
        Routine::new("r", &[], code).with_locals(2)
    }

    #[test]
    fn test_straight_line_is_single_block() {
        let cfg = ControlFlowGraph::build(&routine(vec![
            Instr::Const(crate::unit::Const::Int(1)),
            Instr::Pop,
            Instr::Return,
        ]))
        .unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert!(cfg.back_edge_blocks().is_empty());
    }

    #[test]
    fn test_self_loop_is_back_edge_source() {
        let cfg = ControlFlowGraph::build(&routine(vec![Instr::Jump(0)])).unwrap();
        let sources = cfg.back_edge_blocks();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].start, 0);
        assert_eq!(sources[0].successors, vec![0]);
    }

    #[test]
    fn test_while_loop_blocks() {
        // 0: load; 1: if !x goto 4; 2: call; 3: goto 0; 4: return
        let code = vec![
            Instr::Load(0),
            Instr::JumpIfNot(3),
            Instr::Invoke(crate::unit::CallSite::new("std.Math", "abs", &["int"])),
            Instr::Jump(-3),
            Instr::Return,
        ];
        let cfg = ControlFlowGraph::build(&routine(code)).unwrap();
        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(cfg.blocks[1].call_sites, vec![2]);
        let sources = cfg.back_edge_blocks();
        assert_eq!(sources.len(), 1);
        assert_eq!((sources[0].start, sources[0].end), (2, 4));
    }

    #[test]
    fn test_nested_loops_sorted_by_position() {
        // outer: 0..6, inner self loop at 2
        let code = vec![
            Instr::Load(0),      // 0
            Instr::JumpIfNot(5), // 1 -> 6
            Instr::Load(1),      // 2
            Instr::JumpIf(-1),   // 3 -> 2
            Instr::Load(0),      // 4
            Instr::Jump(-5),     // 5 -> 0
            Instr::Return,       // 6
        ];
        let cfg = ControlFlowGraph::build(&routine(code)).unwrap();
        let starts: Vec<usize> = cfg.back_edge_blocks().iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![2, 4]);
    }

    #[test]
    fn test_loop_inside_handler_is_found() {
        let code = vec![
            Instr::Return,   // 0: protected
            Instr::Pop,      // 1: handler entry
            Instr::Jump(0),  // 2: loop in handler
        ];
        let r = routine(code).with_handler(Handler {
            start: 0,
            end: 1,
            target: 1,
            catch: Catch::Any,
        });
        let cfg = ControlFlowGraph::build(&r).unwrap();
        assert_eq!(cfg.roots.len(), 2);
        let starts: Vec<usize> = cfg.back_edge_blocks().iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![2]);
    }

    #[test]
    fn test_branch_out_of_range_is_rejected() {
        assert!(ControlFlowGraph::build(&routine(vec![Instr::Jump(5)])).is_err());
        assert!(ControlFlowGraph::build(&routine(vec![])).is_err());
    }
}
