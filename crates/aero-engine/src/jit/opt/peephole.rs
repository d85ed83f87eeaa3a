//! Peephole rewrites
//!
//! Local strength reductions and cleanup of patterns the earlier passes
//! leave behind: additive/multiplicative identities, multiply-by-power-of-
//! two into shifts (when the value range proves no overflow), redundant
//! box/unbox pairs, and copy propagation with a dead-move sweep.

use rustc_hash::FxHashMap;

use crate::jit::ir::{Instr, IrFunction, Reg};

use super::dce::eliminate_dead;
use super::{substitute_uses, OptFlags, OptPass, PassContext};

pub struct Peephole;

impl OptPass for Peephole {
    fn name(&self) -> &'static str {
        "peephole"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.peephole
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassContext) -> bool {
        let mut changed = false;

        // Known raw-integer constants (defs feeding unboxed arithmetic)
        let mut int_consts: FxHashMap<Reg, i32> = FxHashMap::default();
        let mut num_consts: FxHashMap<Reg, f64> = FxHashMap::default();
        // Box/unbox provenance for pair elimination
        let mut boxed_int_of: FxHashMap<Reg, Reg> = FxHashMap::default();
        let mut unboxed_int_of: FxHashMap<Reg, Reg> = FxHashMap::default();
        let mut boxed_num_of: FxHashMap<Reg, Reg> = FxHashMap::default();
        let mut unboxed_num_of: FxHashMap<Reg, Reg> = FxHashMap::default();
        let mut boxed_bool_of: FxHashMap<Reg, Reg> = FxHashMap::default();

        for block in &func.blocks {
            for instr in &block.instrs {
                match instr {
                    Instr::ConstInt { dest, value } => {
                        int_consts.insert(*dest, *value);
                    }
                    Instr::ConstNum { dest, value } => {
                        num_consts.insert(*dest, *value);
                    }
                    Instr::BoxInt { dest, src } => {
                        boxed_int_of.insert(*dest, *src);
                    }
                    Instr::UnboxInt { dest, src } => {
                        unboxed_int_of.insert(*dest, *src);
                    }
                    Instr::BoxNum { dest, src } => {
                        boxed_num_of.insert(*dest, *src);
                    }
                    Instr::UnboxNum { dest, src } => {
                        unboxed_num_of.insert(*dest, *src);
                    }
                    Instr::BoxBool { dest, src } => {
                        boxed_bool_of.insert(*dest, *src);
                    }
                    _ => {}
                }
            }
        }
        // Unboxing a constant SMI yields a known raw int
        let unbox_pairs: Vec<(Reg, i32)> = unboxed_int_of
            .iter()
            .filter_map(|(&dest, &src)| int_consts.get(&src).map(|&v| (dest, v)))
            .collect();
        int_consts.extend(unbox_pairs);

        // Known ranges, snapshotted before the rewrite loop borrows
        // blocks mutably
        let ranges: FxHashMap<Reg, crate::jit::ir::NumRange> = func
            .types
            .iter()
            .filter_map(|(&r, t)| t.range.map(|range| (r, range)))
            .collect();

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                let replacement = match &*instr {
                    // x + 0 and 0 + x (overflow-free, so the checked add
                    // drops to a move)
                    Instr::IntAdd {
                        dest, left, right, ..
                    } => match (int_consts.get(left), int_consts.get(right)) {
                        (_, Some(0)) => Some(Instr::Move {
                            dest: *dest,
                            src: *left,
                        }),
                        (Some(0), _) => Some(Instr::Move {
                            dest: *dest,
                            src: *right,
                        }),
                        _ => None,
                    },
                    // x - 0
                    Instr::IntSub {
                        dest, left, right, ..
                    } => match int_consts.get(right) {
                        Some(0) => Some(Instr::Move {
                            dest: *dest,
                            src: *left,
                        }),
                        _ => None,
                    },
                    // x * 1, and x * 2ⁿ → shift when the range proves it
                    Instr::IntMul {
                        dest, left, right, ..
                    } => match (int_consts.get(left), int_consts.get(right)) {
                        (_, Some(1)) => Some(Instr::Move {
                            dest: *dest,
                            src: *left,
                        }),
                        (Some(1), _) => Some(Instr::Move {
                            dest: *dest,
                            src: *right,
                        }),
                        (_, Some(&c)) if c > 1 && (c as u32).is_power_of_two() => {
                            let amount = (c as u32).trailing_zeros() as u8;
                            shift_if_safe(ranges.get(left).copied(), *dest, *left, amount)
                        }
                        _ => None,
                    },
                    // x * 1.0 is the identity for every double, -0 and NaN
                    // included
                    Instr::NumMul {
                        dest, left, right, ..
                    } => match (num_consts.get(left), num_consts.get(right)) {
                        (_, Some(&c)) if c == 1.0 => Some(Instr::Move {
                            dest: *dest,
                            src: *left,
                        }),
                        (Some(&c), _) if c == 1.0 => Some(Instr::Move {
                            dest: *dest,
                            src: *right,
                        }),
                        _ => None,
                    },
                    // Redundant box/unbox pairs
                    Instr::UnboxInt { dest, src } => boxed_int_of.get(src).map(|&orig| {
                        Instr::Move {
                            dest: *dest,
                            src: orig,
                        }
                    }),
                    Instr::BoxInt { dest, src } => unboxed_int_of.get(src).map(|&orig| {
                        Instr::Move {
                            dest: *dest,
                            src: orig,
                        }
                    }),
                    Instr::UnboxNum { dest, src } => boxed_num_of.get(src).map(|&orig| {
                        Instr::Move {
                            dest: *dest,
                            src: orig,
                        }
                    }),
                    Instr::BoxNum { dest, src } => unboxed_num_of.get(src).map(|&orig| {
                        Instr::Move {
                            dest: *dest,
                            src: orig,
                        }
                    }),
                    // Branch condition built from a boxed bool
                    Instr::IsTruthy { dest, src } => boxed_bool_of.get(src).map(|&raw| {
                        Instr::Move {
                            dest: *dest,
                            src: raw,
                        }
                    }),
                    _ => None,
                };
                if let Some(new_instr) = replacement {
                    *instr = new_instr;
                    changed = true;
                }
            }
        }

        // Copy propagation: route uses of moves to their sources, then
        // clean up the moves and boxing chains the rewrites orphaned
        let mut copies: FxHashMap<Reg, Reg> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                if let Instr::Move { dest, src } = instr {
                    copies.insert(*dest, *src);
                }
            }
        }
        if !copies.is_empty() {
            substitute_uses(func, &copies);
        }
        changed |= eliminate_dead(func);
        changed
    }
}

fn shift_if_safe(
    range: Option<crate::jit::ir::NumRange>,
    dest: Reg,
    left: Reg,
    amount: u8,
) -> Option<Instr> {
    let range = range?;
    let factor = 1i64 << amount;
    let lo = range.lo.checked_mul(factor)?;
    let hi = range.hi.checked_mul(factor)?;
    if lo >= i32::MIN as i64 && hi <= i32::MAX as i64 {
        Some(Instr::IntShl { dest, left, amount })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::builder::SiteTable;
    use crate::jit::ir::{DeoptId, NumRange, Terminator, TypeInfo};
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
    fn test_add_zero_becomes_identity() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let x = f.alloc_reg();
        let zero = f.alloc_reg();
        let sum = f.alloc_reg();
        let boxed = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::LoadLocal { dest: x, index: 0 },
            Instr::ConstInt { dest: zero, value: 0 },
            Instr::IntAdd {
                dest: sum,
                left: x,
                right: zero,
                deopt: DeoptId(0),
            },
            Instr::BoxInt { dest: boxed, src: sum },
        ];
        f.block_mut(b).terminator = Terminator::Return(boxed);
        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(Peephole.run(&mut f, &ctx(&p, &s)));
        // The add is gone; the box reads x directly
        assert!(!f
            .block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::IntAdd { .. })));
        assert!(f
            .block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::BoxInt { src, .. } if *src == x)));
    }

    #[test]
    fn test_mul_power_of_two_with_range() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let x = f.alloc_reg();
        let eight = f.alloc_reg();
        let prod = f.alloc_reg();
        f.set_type(x, TypeInfo::int_range(NumRange { lo: 0, hi: 1000 }));
        f.block_mut(b).instrs = vec![
            Instr::LoadLocal { dest: x, index: 0 },
            Instr::ConstInt {
                dest: eight,
                value: 8,
            },
            Instr::IntMul {
                dest: prod,
                left: x,
                right: eight,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(prod);
        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(Peephole.run(&mut f, &ctx(&p, &s)));
        assert!(f
            .block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::IntShl { amount: 3, .. })));
    }

    #[test]
    fn test_mul_power_of_two_without_range_stays() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let x = f.alloc_reg();
        let eight = f.alloc_reg();
        let prod = f.alloc_reg();
        // No range: 8x could overflow, the checked multiply must stay
        f.block_mut(b).instrs = vec![
            Instr::LoadLocal { dest: x, index: 0 },
            Instr::ConstInt {
                dest: eight,
                value: 8,
            },
            Instr::IntMul {
                dest: prod,
                left: x,
                right: eight,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(prod);
        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        Peephole.run(&mut f, &ctx(&p, &s));
        assert!(f
            .block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::IntMul { .. })));
    }

    #[test]
    fn test_box_unbox_pair_elimination() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        let raw = f.alloc_reg();
        let boxed = f.alloc_reg();
        let unboxed = f.alloc_reg();
        let result = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: raw, value: 7 },
            Instr::BoxInt {
                dest: boxed,
                src: raw,
            },
            Instr::UnboxInt {
                dest: unboxed,
                src: boxed,
            },
            Instr::IntShl {
                dest: result,
                left: unboxed,
                amount: 1,
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(result);
        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(Peephole.run(&mut f, &ctx(&p, &s)));
        // The shift now reads the raw constant; unbox is swept
        match f
            .block(b)
            .instrs
            .iter()
            .find(|i| matches!(i, Instr::IntShl { .. }))
            .unwrap()
        {
            Instr::IntShl { left, .. } => assert_eq!(*left, raw),
            _ => unreachable!(),
        }
        assert!(!f
            .block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::UnboxInt { .. })));
    }

    #[test]
    fn test_is_truthy_of_boxed_bool() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let raw = f.alloc_reg();
        let boxed = f.alloc_reg();
        let cond = f.alloc_reg();
        f.block_mut(b0).instrs = vec![
            Instr::ConstBool {
                dest: raw,
                value: true,
            },
            Instr::BoxBool {
                dest: boxed,
                src: raw,
            },
            Instr::IsTruthy {
                dest: cond,
                src: boxed,
            },
        ];
        f.block_mut(b0).terminator = Terminator::Branch {
            cond,
            then_block: b1,
            else_block: b2,
        };
        let r1 = f.alloc_reg();
        f.block_mut(b1).instrs = vec![Instr::ConstUndef { dest: r1 }];
        f.block_mut(b1).terminator = Terminator::Return(r1);
        let r2 = f.alloc_reg();
        f.block_mut(b2).instrs = vec![Instr::ConstUndef { dest: r2 }];
        f.block_mut(b2).terminator = Terminator::Return(r2);
        f.recompute_preds();

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(Peephole.run(&mut f, &ctx(&p, &s)));
        // The branch condition is now the raw bool
        assert!(matches!(
            f.block(b0).terminator,
            Terminator::Branch { cond: c, .. } if c == raw
        ));
    }
}
