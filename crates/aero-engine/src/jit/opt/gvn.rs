//! Common-subexpression elimination / global value numbering
//!
//! Hashes pure, deterministic instructions by (opcode, operand ids,
//! immediates). Within a block this is classic CSE; across blocks the
//! table is scoped to the dominator tree, so a value computed in a
//! dominator replaces recomputation in every dominated block. Replaced
//! definitions are deleted and their uses rewritten to the canonical
//! value, which is legal because the canonical definition dominates both.

use rustc_hash::FxHashMap;

use crate::jit::analysis::Dominators;
use crate::jit::ir::{BlockId, CmpOp, Instr, IrFunction, Reg};

use super::{substitute_uses, OptFlags, OptPass, PassContext};

pub struct GlobalValueNumbering;

/// Hashable identity of a value-producing instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ValueKey {
    ConstInt(i32),
    ConstNumBits(u64),
    ConstBool(bool),
    ConstUndef,
    ConstNull,
    IntShl(Reg, u8),
    IntCmp(CmpOp, Reg, Reg),
    NumAdd(Reg, Reg),
    NumSub(Reg, Reg),
    NumMul(Reg, Reg),
    NumDiv(Reg, Reg),
    NumCmp(CmpOp, Reg, Reg),
    UnboxInt(Reg),
    UnboxNum(Reg),
    BoxInt(Reg),
    BoxNum(Reg),
    BoxBool(Reg),
    Not(Reg),
    IsTruthy(Reg),
}

fn key_of(instr: &Instr) -> Option<ValueKey> {
    if !instr.is_value_numberable() {
        return None;
    }
    Some(match instr {
        Instr::ConstInt { value, .. } => ValueKey::ConstInt(*value),
        Instr::ConstNum { value, .. } => ValueKey::ConstNumBits(value.to_bits()),
        Instr::ConstBool { value, .. } => ValueKey::ConstBool(*value),
        Instr::ConstUndef { .. } => ValueKey::ConstUndef,
        Instr::ConstNull { .. } => ValueKey::ConstNull,
        Instr::IntShl { left, amount, .. } => ValueKey::IntShl(*left, *amount),
        Instr::IntCmp {
            op, left, right, ..
        } => ValueKey::IntCmp(*op, *left, *right),
        Instr::NumAdd { left, right, .. } => ValueKey::NumAdd(*left, *right),
        Instr::NumSub { left, right, .. } => ValueKey::NumSub(*left, *right),
        Instr::NumMul { left, right, .. } => ValueKey::NumMul(*left, *right),
        Instr::NumDiv { left, right, .. } => ValueKey::NumDiv(*left, *right),
        Instr::NumCmp {
            op, left, right, ..
        } => ValueKey::NumCmp(*op, *left, *right),
        Instr::UnboxInt { src, .. } => ValueKey::UnboxInt(*src),
        Instr::UnboxNum { src, .. } => ValueKey::UnboxNum(*src),
        Instr::BoxInt { src, .. } => ValueKey::BoxInt(*src),
        Instr::BoxNum { src, .. } => ValueKey::BoxNum(*src),
        Instr::BoxBool { src, .. } => ValueKey::BoxBool(*src),
        Instr::Not { operand, .. } => ValueKey::Not(*operand),
        Instr::IsTruthy { src, .. } => ValueKey::IsTruthy(*src),
        _ => return None,
    })
}

impl OptPass for GlobalValueNumbering {
    fn name(&self) -> &'static str {
        "gvn"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.gvn
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassContext) -> bool {
        func.recompute_preds();
        let dom = Dominators::compute(func);

        let mut subs: FxHashMap<Reg, Reg> = FxHashMap::default();
        let mut remove: Vec<(BlockId, usize)> = Vec::new();

        // Preorder walk of the dominator tree with a scoped table
        let mut table: FxHashMap<ValueKey, Reg> = FxHashMap::default();
        walk(
            func,
            &dom,
            func.entry,
            &mut table,
            &mut subs,
            &mut remove,
        );

        if remove.is_empty() {
            return false;
        }
        // Delete redundant definitions (descending index within block)
        let mut by_block: FxHashMap<BlockId, Vec<usize>> = FxHashMap::default();
        for (b, i) in remove {
            by_block.entry(b).or_default().push(i);
        }
        for (b, mut idxs) in by_block {
            idxs.sort_unstable_by(|a, b2| b2.cmp(a));
            for i in idxs {
                func.block_mut(b).instrs.remove(i);
            }
        }
        substitute_uses(func, &subs);
        true
    }
}

fn walk(
    func: &IrFunction,
    dom: &Dominators,
    block: BlockId,
    table: &mut FxHashMap<ValueKey, Reg>,
    subs: &mut FxHashMap<Reg, Reg>,
    remove: &mut Vec<(BlockId, usize)>,
) {
    let mut added: Vec<ValueKey> = Vec::new();

    for (i, instr) in func.block(block).instrs.iter().enumerate() {
        // Keys are computed after substitution so chains collapse in one
        // pass: a duplicate of a duplicate maps to the original.
        let mut canonical = instr.clone();
        canonical.replace_operands(subs);
        let Some(key) = key_of(&canonical) else {
            continue;
        };
        let Some(dest) = instr.dest() else { continue };
        match table.get(&key) {
            Some(&existing) => {
                subs.insert(dest, existing);
                remove.push((block, i));
            }
            None => {
                table.insert(key.clone(), dest);
                added.push(key);
            }
        }
    }

    let mut children = dom.children(block);
    children.sort_by_key(|b| b.0);
    for child in children {
        walk(func, dom, child, table, subs, remove);
    }

    // Leave scope: entries added by this block are not visible to siblings
    for key in added {
        table.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::builder::SiteTable;
    use crate::jit::ir::Terminator;
    use crate::jit::opt::OptFlags;
    use crate::profiler::ProfileSnapshot;
    use aero_core::FunctionId;

    fn ctx<'a>(p: &'a ProfileSnapshot, s: &'a SiteTable) -> PassContext<'a> {
        PassContext {
            profile: p,
            sites: s,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        }
    }

    #[test]
    fn test_cse_within_block() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let a = f.alloc_reg();
        let x1 = f.alloc_reg();
        let x2 = f.alloc_reg();
        let y = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstNum { dest: a, value: 2.0 },
            Instr::NumAdd {
                dest: x1,
                left: a,
                right: a,
            },
            // Same computation again
            Instr::NumAdd {
                dest: x2,
                left: a,
                right: a,
            },
            Instr::NumMul {
                dest: y,
                left: x1,
                right: x2,
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(y);
        f.recompute_preds();

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(GlobalValueNumbering.run(&mut f, &ctx(&p, &s)));
        // One NumAdd left, and the multiply uses x1 twice
        let adds = f
            .block(b)
            .instrs
            .iter()
            .filter(|i| matches!(i, Instr::NumAdd { .. }))
            .count();
        assert_eq!(adds, 1);
        match f.block(b).instrs.last().unwrap() {
            Instr::NumMul { left, right, .. } => assert_eq!(left, right),
            other => panic!("unexpected {other:?}"),
        }
        assert!(f.verify_ssa().is_ok());
    }

    #[test]
    fn test_gvn_across_dominator() {
        // entry computes a+a; both branch arms recompute it
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let a = f.alloc_reg();
        let c = f.alloc_reg();
        let x0 = f.alloc_reg();
        let x1 = f.alloc_reg();
        let x2 = f.alloc_reg();
        f.block_mut(b0).instrs = vec![
            Instr::ConstNum { dest: a, value: 1.5 },
            Instr::ConstBool { dest: c, value: true },
            Instr::NumAdd {
                dest: x0,
                left: a,
                right: a,
            },
        ];
        f.block_mut(b0).terminator = Terminator::Branch {
            cond: c,
            then_block: b1,
            else_block: b2,
        };
        f.block_mut(b1).instrs = vec![Instr::NumAdd {
            dest: x1,
            left: a,
            right: a,
        }];
        f.block_mut(b1).terminator = Terminator::Return(x1);
        f.block_mut(b2).instrs = vec![Instr::NumAdd {
            dest: x2,
            left: a,
            right: a,
        }];
        f.block_mut(b2).terminator = Terminator::Return(x2);
        f.recompute_preds();

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(GlobalValueNumbering.run(&mut f, &ctx(&p, &s)));
        assert!(f.block(b1).instrs.is_empty());
        assert!(f.block(b2).instrs.is_empty());
        assert!(matches!(f.block(b1).terminator, Terminator::Return(r) if r == x0));
        assert!(matches!(f.block(b2).terminator, Terminator::Return(r) if r == x0));
    }

    #[test]
    fn test_sibling_blocks_do_not_share() {
        // Two branch arms each compute a+a; neither dominates the other,
        // so both computations must remain
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let a = f.alloc_reg();
        let c = f.alloc_reg();
        let x1 = f.alloc_reg();
        let x2 = f.alloc_reg();
        f.block_mut(b0).instrs = vec![
            Instr::ConstNum { dest: a, value: 1.0 },
            Instr::ConstBool { dest: c, value: true },
        ];
        f.block_mut(b0).terminator = Terminator::Branch {
            cond: c,
            then_block: b1,
            else_block: b2,
        };
        f.block_mut(b1).instrs = vec![Instr::NumAdd {
            dest: x1,
            left: a,
            right: a,
        }];
        f.block_mut(b1).terminator = Terminator::Return(x1);
        f.block_mut(b2).instrs = vec![Instr::NumAdd {
            dest: x2,
            left: a,
            right: a,
        }];
        f.block_mut(b2).terminator = Terminator::Return(x2);
        f.recompute_preds();

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        GlobalValueNumbering.run(&mut f, &ctx(&p, &s));
        assert_eq!(f.block(b1).instrs.len(), 1);
        assert_eq!(f.block(b2).instrs.len(), 1);
    }

    #[test]
    fn test_side_effecting_ops_not_numbered() {
        use crate::jit::ir::{BinOp, DeoptId};
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let a = f.alloc_reg();
        let x1 = f.alloc_reg();
        let x2 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: a, value: 1 },
            Instr::Binary {
                op: BinOp::Add,
                dest: x1,
                left: a,
                right: a,
                site: 0,
                deopt: DeoptId(0),
            },
            Instr::Binary {
                op: BinOp::Add,
                dest: x2,
                left: a,
                right: a,
                site: 4,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(x2);
        f.recompute_preds();

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        GlobalValueNumbering.run(&mut f, &ctx(&p, &s));
        let binaries = f
            .block(b)
            .instrs
            .iter()
            .filter(|i| matches!(i, Instr::Binary { .. }))
            .count();
        assert_eq!(binaries, 2);
    }
}
