//! Natural-loop detection on the IR CFG
//!
//! A back edge is an edge `a → h` where `h` dominates `a`. The loop body
//! is everything that reaches `a` without passing through `h`. LICM and
//! unrolling consume these; block loop depth weights the register
//! allocator's spill scores.

use rustc_hash::FxHashSet;

use crate::jit::ir::{BlockId, IrFunction};

use super::dominators::Dominators;

/// One natural loop
#[derive(Debug)]
pub struct NaturalLoop {
    pub header: BlockId,
    /// Source block of the back edge
    pub latch: BlockId,
    /// All blocks in the loop, header included
    pub body: FxHashSet<BlockId>,
}

impl NaturalLoop {
    pub fn contains(&self, b: BlockId) -> bool {
        self.body.contains(&b)
    }
}

/// Find all natural loops and annotate block loop depth
pub fn find_loops(func: &mut IrFunction, dom: &Dominators) -> Vec<NaturalLoop> {
    let mut loops = Vec::new();

    for &b in &dom.rpo {
        for succ in func.block(b).terminator.successors() {
            if dom.dominates(succ, b) {
                // b → succ is a back edge; succ is the header
                let mut body = FxHashSet::default();
                body.insert(succ);
                let mut stack = vec![b];
                while let Some(n) = stack.pop() {
                    if body.insert(n) {
                        for &p in &func.block(n).preds {
                            stack.push(p);
                        }
                    }
                }
                loops.push(NaturalLoop {
                    header: succ,
                    latch: b,
                    body,
                });
            }
        }
    }

    // Depth = number of loops containing the block
    for block in &mut func.blocks {
        block.loop_depth = loops.iter().filter(|l| l.contains(block.id)).count() as u32;
    }

    loops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Instr, IrFunction, Terminator};
    use aero_core::FunctionId;

    /// b0 → b1(header) → {b2 → b1, b3}
    fn single_loop() -> IrFunction {
        let mut f = IrFunction::new(FunctionId(0), "l".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let b3 = f.add_block(3);
        let c = f.alloc_reg();
        f.block_mut(b0).terminator = Terminator::Jump(b1);
        f.block_mut(b1)
            .instrs
            .push(Instr::ConstBool { dest: c, value: true });
        f.block_mut(b1).terminator = Terminator::Branch {
            cond: c,
            then_block: b2,
            else_block: b3,
        };
        f.block_mut(b2).terminator = Terminator::Jump(b1);
        let r = f.alloc_reg();
        f.block_mut(b3).instrs.push(Instr::ConstUndef { dest: r });
        f.block_mut(b3).terminator = Terminator::Return(r);
        f.recompute_preds();
        f
    }

    #[test]
    fn test_single_loop_found() {
        let mut f = single_loop();
        let dom = Dominators::compute(&f);
        let loops = find_loops(&mut f, &dom);
        assert_eq!(loops.len(), 1);
        let l = &loops[0];
        assert_eq!(l.header, BlockId(1));
        assert_eq!(l.latch, BlockId(2));
        assert!(l.contains(BlockId(1)));
        assert!(l.contains(BlockId(2)));
        assert!(!l.contains(BlockId(0)));
        assert!(!l.contains(BlockId(3)));
    }

    #[test]
    fn test_loop_depth_annotation() {
        let mut f = single_loop();
        let dom = Dominators::compute(&f);
        find_loops(&mut f, &dom);
        assert_eq!(f.block(BlockId(0)).loop_depth, 0);
        assert_eq!(f.block(BlockId(1)).loop_depth, 1);
        assert_eq!(f.block(BlockId(2)).loop_depth, 1);
        assert_eq!(f.block(BlockId(3)).loop_depth, 0);
    }

    #[test]
    fn test_no_loops_in_straight_line() {
        let mut f = IrFunction::new(FunctionId(0), "s".into(), 0, 0);
        let b0 = f.add_block(0);
        let r = f.alloc_reg();
        f.block_mut(b0).instrs.push(Instr::ConstUndef { dest: r });
        f.block_mut(b0).terminator = Terminator::Return(r);
        f.recompute_preds();
        let dom = Dominators::compute(&f);
        assert!(find_loops(&mut f, &dom).is_empty());
    }
}
