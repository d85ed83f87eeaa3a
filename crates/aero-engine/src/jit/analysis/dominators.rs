//! Dominator tree over the IR CFG
//!
//! Iterative algorithm over reverse post-order (Cooper–Harvey–Kennedy).
//! GVN walks the dominator tree; LICM and loop detection use the
//! `dominates` query.

use rustc_hash::FxHashMap;

use crate::jit::ir::{BlockId, IrFunction};

/// Immediate-dominator table
#[derive(Debug)]
pub struct Dominators {
    /// idom[b] for every reachable block; the entry maps to itself
    idom: FxHashMap<BlockId, BlockId>,
    /// Blocks in reverse post-order
    pub rpo: Vec<BlockId>,
}

impl Dominators {
    pub fn compute(func: &IrFunction) -> Dominators {
        let rpo = func.rpo();
        let mut order: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (i, &b) in rpo.iter().enumerate() {
            order.insert(b, i);
        }

        let mut idom: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        idom.insert(func.entry, func.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                // First processed predecessor
                let mut new_idom: Option<BlockId> = None;
                for &p in &func.block(b).preds {
                    if !order.contains_key(&p) {
                        continue; // unreachable predecessor
                    }
                    if idom.contains_key(&p) {
                        new_idom = Some(match new_idom {
                            None => p,
                            Some(cur) => intersect(&idom, &order, p, cur),
                        });
                    }
                }
                if let Some(n) = new_idom {
                    if idom.get(&b) != Some(&n) {
                        idom.insert(b, n);
                        changed = true;
                    }
                }
            }
        }

        Dominators { idom, rpo }
    }

    /// Does `a` dominate `b`? (Every block dominates itself.)
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom.get(&current) {
                Some(&parent) if parent != current => current = parent,
                _ => return false,
            }
        }
    }

    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        let parent = *self.idom.get(&b)?;
        (parent != b).then_some(parent)
    }

    /// Children of `b` in the dominator tree
    pub fn children(&self, b: BlockId) -> Vec<BlockId> {
        self.idom
            .iter()
            .filter(|(&child, &parent)| parent == b && child != b)
            .map(|(&child, _)| child)
            .collect()
    }
}

fn intersect(
    idom: &FxHashMap<BlockId, BlockId>,
    order: &FxHashMap<BlockId, usize>,
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while order[&a] > order[&b] {
            a = idom[&a];
        }
        while order[&b] > order[&a] {
            b = idom[&b];
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Instr, IrFunction, Terminator};
    use aero_core::FunctionId;

    /// entry → (b1 | b2) → b3
    fn diamond() -> IrFunction {
        let mut f = IrFunction::new(FunctionId(0), "d".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let b3 = f.add_block(3);
        let c = f.alloc_reg();
        f.block_mut(b0).instrs.push(Instr::ConstBool { dest: c, value: true });
        f.block_mut(b0).terminator = Terminator::Branch {
            cond: c,
            then_block: b1,
            else_block: b2,
        };
        f.block_mut(b1).terminator = Terminator::Jump(b3);
        f.block_mut(b2).terminator = Terminator::Jump(b3);
        let r = f.alloc_reg();
        f.block_mut(b3).instrs.push(Instr::ConstUndef { dest: r });
        f.block_mut(b3).terminator = Terminator::Return(r);
        f.recompute_preds();
        f
    }

    #[test]
    fn test_diamond_dominators() {
        let f = diamond();
        let dom = Dominators::compute(&f);
        let (b0, b1, b2, b3) = (BlockId(0), BlockId(1), BlockId(2), BlockId(3));

        assert!(dom.dominates(b0, b1));
        assert!(dom.dominates(b0, b2));
        assert!(dom.dominates(b0, b3));
        // Neither arm dominates the join
        assert!(!dom.dominates(b1, b3));
        assert!(!dom.dominates(b2, b3));
        assert_eq!(dom.idom(b3), Some(b0));
        assert_eq!(dom.idom(b0), None);
    }

    #[test]
    fn test_self_domination() {
        let f = diamond();
        let dom = Dominators::compute(&f);
        for b in [BlockId(0), BlockId(1), BlockId(2), BlockId(3)] {
            assert!(dom.dominates(b, b));
        }
    }

    #[test]
    fn test_loop_header_dominates_body() {
        // b0 → b1 (header) → b2 (body) → b1 ; b1 → b3 (exit)
        let mut f = IrFunction::new(FunctionId(0), "l".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let b3 = f.add_block(3);
        let c = f.alloc_reg();
        f.block_mut(b0).terminator = Terminator::Jump(b1);
        f.block_mut(b1).instrs.push(Instr::ConstBool { dest: c, value: true });
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

        let dom = Dominators::compute(&f);
        assert!(dom.dominates(b1, b2));
        assert!(dom.dominates(b1, b3));
        assert!(!dom.dominates(b2, b1));
    }
}
