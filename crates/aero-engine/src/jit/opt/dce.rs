//! Dead code elimination
//!
//! Removes instructions whose results are unused and which have no side
//! effects. Runs to a fixpoint: removing one dead instruction can orphan
//! the instructions that fed it.

use rustc_hash::FxHashSet;

use crate::jit::ir::{IrFunction, Reg, Terminator};

use super::{OptFlags, OptPass, PassContext};

pub struct DeadCodeElimination;

impl OptPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.dce
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassContext) -> bool {
        eliminate_dead(func)
    }
}

/// The elimination loop itself; the peephole pass reuses it to clean up
/// the dead boxing chains its rewrites orphan, so one pipeline run lands
/// on the fixed point.
pub(crate) fn eliminate_dead(func: &mut IrFunction) -> bool {
    let mut changed_any = false;
    loop {
        let mut used: FxHashSet<Reg> = FxHashSet::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                for r in instr.operands() {
                    used.insert(r);
                }
            }
            match &block.terminator {
                Terminator::Branch { cond, .. } => {
                    used.insert(*cond);
                }
                Terminator::Return(r) => {
                    used.insert(*r);
                }
                _ => {}
            }
        }
        // Deopt states pin their live values
        for state in &func.deopt_states {
            for frame in &state.frames {
                used.extend(frame.stack.iter().copied());
                used.extend(frame.this.iter().copied());
                if let crate::jit::ir::DeoptLocals::Regs(regs) = &frame.locals {
                    used.extend(regs.iter().copied());
                }
            }
        }

        let mut changed = false;
        for block in &mut func.blocks {
            let before = block.instrs.len();
            block.instrs.retain(|instr| {
                if instr.has_side_effects() {
                    return true;
                }
                match instr.dest() {
                    Some(d) => used.contains(&d),
                    None => true,
                }
            });
            if block.instrs.len() != before {
                changed = true;
            }
        }
        if !changed {
            break;
        }
        changed_any = true;
    }
    changed_any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::builder::SiteTable;
    use crate::jit::ir::{BinOp, DeoptId, Instr};
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
    fn test_removes_unused_pure_chain() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let r0 = f.alloc_reg();
        let r1 = f.alloc_reg(); // dead
        let r2 = f.alloc_reg(); // dead, feeds from r1
        let r3 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: r0, value: 1 },
            Instr::ConstInt { dest: r1, value: 2 },
            Instr::Move { dest: r2, src: r1 },
            Instr::ConstInt { dest: r3, value: 3 },
        ];
        f.block_mut(b).terminator = Terminator::Return(r3);

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(DeadCodeElimination.run(&mut f, &ctx(&p, &s)));
        // Only the returned constant survives (r0, r1, r2 are all dead:
        // the chain collapses across iterations)
        assert_eq!(f.block(b).instrs.len(), 1);
        assert!(matches!(
            f.block(b).instrs[0],
            Instr::ConstInt { value: 3, .. }
        ));
    }

    #[test]
    fn test_keeps_side_effects() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let r0 = f.alloc_reg();
        let r1 = f.alloc_reg();
        let r2 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: r0, value: 1 },
            Instr::ConstInt { dest: r1, value: 2 },
            // Unused result but generic ops may coerce — must stay
            Instr::Binary {
                op: BinOp::Add,
                dest: r2,
                left: r0,
                right: r1,
                site: 0,
                deopt: DeoptId(0),
            },
        ];
        let r3 = f.alloc_reg();
        f.block_mut(b)
            .instrs
            .push(Instr::ConstUndef { dest: r3 });
        f.block_mut(b).terminator = Terminator::Return(r3);

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        DeadCodeElimination.run(&mut f, &ctx(&p, &s));
        assert!(f
            .block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Binary { .. })));
    }

    #[test]
    fn test_deopt_state_pins_values() {
        use crate::jit::ir::{DeoptFrame, DeoptLocals, DeoptReason, DeoptState};
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let r0 = f.alloc_reg(); // unused except by the deopt state
        let r1 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: r0, value: 42 },
            Instr::ConstUndef { dest: r1 },
        ];
        f.block_mut(b).terminator = Terminator::Return(r1);
        f.add_deopt_state(DeoptState {
            reason: DeoptReason::TypeFeedback,
            frames: vec![DeoptFrame {
                function: FunctionId(0),
                bytecode_offset: 0,
                locals: DeoptLocals::Buffer,
                stack: vec![r0],
                this: None,
            }],
        });

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        DeadCodeElimination.run(&mut f, &ctx(&p, &s));
        assert!(f
            .block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::ConstInt { value: 42, .. })));
    }
}
