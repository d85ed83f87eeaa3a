//! Loop-invariant code motion
//!
//! Hoists pure instructions whose operands are all defined outside the
//! loop into the preheader. Only loops with a unique out-of-loop
//! predecessor of the header get a usable preheader; others are skipped.

use rustc_hash::FxHashSet;

use crate::jit::analysis::{find_loops, Dominators};
use crate::jit::ir::{BlockId, Instr, IrFunction, Reg};

use super::{OptFlags, OptPass, PassContext};

pub struct LoopInvariantCodeMotion;

impl OptPass for LoopInvariantCodeMotion {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.licm
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassContext) -> bool {
        func.recompute_preds();
        let dom = Dominators::compute(func);
        let loops = find_loops(func, &dom);
        let mut changed = false;

        for l in &loops {
            // Preheader: the single predecessor of the header from outside
            let outside_preds: Vec<BlockId> = func
                .block(l.header)
                .preds
                .iter()
                .copied()
                .filter(|p| !l.contains(*p))
                .collect();
            let [preheader] = outside_preds.as_slice() else {
                continue;
            };
            let preheader = *preheader;

            // Registers defined inside the loop
            let mut defined_in_loop: FxHashSet<Reg> = FxHashSet::default();
            for &b in &l.body {
                for instr in &func.block(b).instrs {
                    if let Some(d) = instr.dest() {
                        defined_in_loop.insert(d);
                    }
                }
            }

            // Iterate: hoisting one instruction can make another hoistable
            loop {
                let mut hoisted: Option<(BlockId, usize)> = None;
                'search: for &b in &l.body {
                    for (i, instr) in func.block(b).instrs.iter().enumerate() {
                        // DCE-safe is not hoist-safe: local loads read the
                        // mutable frame buffer, and allocations have
                        // per-iteration identity
                        if instr.has_side_effects()
                            || matches!(
                                instr,
                                Instr::Phi { .. }
                                    | Instr::LoadLocal { .. }
                                    | Instr::LoadThis { .. }
                                    | Instr::NewObject { .. }
                                    | Instr::NewArray { .. }
                                    | Instr::MakeFunction { .. }
                            )
                        {
                            continue;
                        }
                        let Some(d) = instr.dest() else { continue };
                        if instr
                            .operands()
                            .iter()
                            .all(|r| !defined_in_loop.contains(r))
                        {
                            defined_in_loop.remove(&d);
                            hoisted = Some((b, i));
                            break 'search;
                        }
                    }
                }
                let Some((b, i)) = hoisted else { break };
                let instr = func.block_mut(b).instrs.remove(i);
                func.block_mut(preheader).instrs.push(instr);
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::builder::SiteTable;
    use crate::jit::ir::{Instr, Terminator};
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

    /// b0(preheader) → b1(header: branch) → b2(body) → b1; b1 → b3(exit)
    /// The body computes `inv = c * c` where c is defined in b0.
    fn loop_with_invariant() -> (IrFunction, BlockId, BlockId) {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let b3 = f.add_block(3);
        let c = f.alloc_reg();
        let cond = f.alloc_reg();
        let inv = f.alloc_reg();
        f.block_mut(b0).instrs = vec![Instr::ConstNum { dest: c, value: 3.0 }];
        f.block_mut(b0).terminator = Terminator::Jump(b1);
        f.block_mut(b1).instrs = vec![Instr::ConstBool {
            dest: cond,
            value: true,
        }];
        f.block_mut(b1).terminator = Terminator::Branch {
            cond,
            then_block: b2,
            else_block: b3,
        };
        f.block_mut(b2).instrs = vec![
            Instr::NumMul {
                dest: inv,
                left: c,
                right: c,
            },
            Instr::StoreLocal { index: 0, value: inv },
        ];
        f.block_mut(b2).terminator = Terminator::Jump(b1);
        let r = f.alloc_reg();
        f.block_mut(b3).instrs = vec![Instr::ConstUndef { dest: r }];
        f.block_mut(b3).terminator = Terminator::Return(r);
        f.recompute_preds();
        (f, b0, b2)
    }

    #[test]
    fn test_hoists_invariant_multiply() {
        let (mut f, preheader, body) = loop_with_invariant();
        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(LoopInvariantCodeMotion.run(&mut f, &ctx(&p, &s)));
        assert!(f
            .block(preheader)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::NumMul { .. })));
        assert!(!f
            .block(body)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::NumMul { .. })));
        assert!(f.verify_ssa().is_ok());
    }

    #[test]
    fn test_does_not_hoist_loop_varying() {
        // body: x = LoadLocal; y = x * x — local loads read the mutable
        // frame buffer and stay put, so the multiply stays too
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 1);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let b3 = f.add_block(3);
        let cond = f.alloc_reg();
        let x = f.alloc_reg();
        let y = f.alloc_reg();
        f.block_mut(b0).terminator = Terminator::Jump(b1);
        f.block_mut(b1).instrs = vec![Instr::ConstBool {
            dest: cond,
            value: true,
        }];
        f.block_mut(b1).terminator = Terminator::Branch {
            cond,
            then_block: b2,
            else_block: b3,
        };
        f.block_mut(b2).instrs = vec![
            Instr::LoadLocal { dest: x, index: 0 },
            Instr::NumMul {
                dest: y,
                left: x,
                right: x,
            },
            Instr::StoreLocal { index: 0, value: y },
        ];
        f.block_mut(b2).terminator = Terminator::Jump(b1);
        let r = f.alloc_reg();
        f.block_mut(b3).instrs = vec![Instr::ConstUndef { dest: r }];
        f.block_mut(b3).terminator = Terminator::Return(r);
        f.recompute_preds();

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        LoopInvariantCodeMotion.run(&mut f, &ctx(&p, &s));
        // NumMul depends on the in-loop load; it must stay
        assert!(f
            .block(b2)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::NumMul { .. })));
    }
}
