//! Profile-driven type specialization
//!
//! Rewrites generic arithmetic and comparison whose operands are
//! type-stable (one observed type at ≥95%) into guarded, unboxed forms:
//! a `GuardInt`/`GuardNumber` before the first use, then `IntAdd`/`NumAdd`
//! etc. on raw values, then a re-box. Every guard carries the deopt state
//! recorded for its site, so a failed check reconstructs the interpreter
//! mid-expression. Guards are deduplicated per block: once a value is
//! int-guarded, later uses in the block rely on the same guard.

use rustc_hash::FxHashSet;

use crate::jit::ir::{
    BinOp, BlockId, Instr, IrFunction, JsType, NumRange, Reg, TypeInfo,
};
use crate::profiler::ObservedType;

use super::{OptFlags, OptPass, PassContext};

pub struct TypeSpecialization;

impl OptPass for TypeSpecialization {
    fn name(&self) -> &'static str {
        "type-specialization"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.specialize
    }

    fn run(&self, func: &mut IrFunction, ctx: &PassContext) -> bool {
        let mut changed = false;
        let block_ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();
        for block in block_ids {
            changed |= specialize_block(func, ctx, block);
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spec {
    Int,
    Number,
}

fn site_spec(ctx: &PassContext, site: u32, op: Option<BinOp>) -> Option<Spec> {
    let snap = ctx.profile.site(site)?;
    let (a, b) = (snap.stable_type(0)?, snap.stable_type(1)?);
    let is_num =
        |t: ObservedType| matches!(t, ObservedType::Int | ObservedType::Double);
    if !is_num(a) || !is_num(b) {
        return None;
    }
    // Division leaves the integers; modulo stays generic
    match op {
        Some(BinOp::Mod) => return None,
        Some(BinOp::Div) => return Some(Spec::Number),
        _ => {}
    }
    if a == ObservedType::Int && b == ObservedType::Int {
        Some(Spec::Int)
    } else {
        Some(Spec::Number)
    }
}

fn specialize_block(func: &mut IrFunction, ctx: &PassContext, block: BlockId) -> bool {
    let mut guarded_int: FxHashSet<Reg> = FxHashSet::default();
    let mut guarded_num: FxHashSet<Reg> = FxHashSet::default();
    let mut out: Vec<Instr> = Vec::with_capacity(func.block(block).instrs.len());
    let mut changed = false;
    let instrs = std::mem::take(&mut func.block_mut(block).instrs);

    // Fresh regs and type updates are collected while rewriting
    let mut new_types: Vec<(Reg, TypeInfo)> = Vec::new();

    for instr in instrs {
        match instr {
            Instr::Binary {
                op,
                dest,
                left,
                right,
                site,
                deopt,
            } if matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div) => {
                match site_spec(ctx, site, Some(op)) {
                    Some(Spec::Int) => {
                        emit_guard_int(func, &mut out, &mut guarded_int, left, deopt);
                        emit_guard_int(func, &mut out, &mut guarded_int, right, deopt);
                        let ul = func.alloc_reg();
                        let ur = func.alloc_reg();
                        let raw = func.alloc_reg();
                        out.push(Instr::UnboxInt { dest: ul, src: left });
                        out.push(Instr::UnboxInt { dest: ur, src: right });
                        out.push(match op {
                            BinOp::Add => Instr::IntAdd { dest: raw, left: ul, right: ur, deopt },
                            BinOp::Sub => Instr::IntSub { dest: raw, left: ul, right: ur, deopt },
                            _ => Instr::IntMul { dest: raw, left: ul, right: ur, deopt },
                        });
                        out.push(Instr::BoxInt { dest, src: raw });
                        new_types.push((raw, TypeInfo::int_range(NumRange::i32_full())));
                        new_types.push((dest, TypeInfo::int_range(NumRange::i32_full())));
                        changed = true;
                    }
                    Some(Spec::Number) => {
                        emit_guard_num(func, &mut out, &guarded_int, &mut guarded_num, left, deopt);
                        emit_guard_num(func, &mut out, &guarded_int, &mut guarded_num, right, deopt);
                        let ul = func.alloc_reg();
                        let ur = func.alloc_reg();
                        let raw = func.alloc_reg();
                        out.push(Instr::UnboxNum { dest: ul, src: left });
                        out.push(Instr::UnboxNum { dest: ur, src: right });
                        out.push(match op {
                            BinOp::Add => Instr::NumAdd { dest: raw, left: ul, right: ur },
                            BinOp::Sub => Instr::NumSub { dest: raw, left: ul, right: ur },
                            BinOp::Mul => Instr::NumMul { dest: raw, left: ul, right: ur },
                            _ => Instr::NumDiv { dest: raw, left: ul, right: ur },
                        });
                        out.push(Instr::BoxNum { dest, src: raw });
                        new_types.push((raw, TypeInfo::of(JsType::Double)));
                        new_types.push((dest, TypeInfo::of(JsType::Number)));
                        changed = true;
                    }
                    None => out.push(Instr::Binary {
                        op,
                        dest,
                        left,
                        right,
                        site,
                        deopt,
                    }),
                }
            }
            Instr::Compare {
                op,
                dest,
                left,
                right,
                site,
                deopt,
            } => match site_spec(ctx, site, None) {
                Some(Spec::Int) => {
                    emit_guard_int(func, &mut out, &mut guarded_int, left, deopt);
                    emit_guard_int(func, &mut out, &mut guarded_int, right, deopt);
                    let ul = func.alloc_reg();
                    let ur = func.alloc_reg();
                    let raw = func.alloc_reg();
                    out.push(Instr::UnboxInt { dest: ul, src: left });
                    out.push(Instr::UnboxInt { dest: ur, src: right });
                    out.push(Instr::IntCmp {
                        op,
                        dest: raw,
                        left: ul,
                        right: ur,
                    });
                    out.push(Instr::BoxBool { dest, src: raw });
                    new_types.push((dest, TypeInfo::of(JsType::Boolean)));
                    changed = true;
                }
                Some(Spec::Number) => {
                    emit_guard_num(func, &mut out, &guarded_int, &mut guarded_num, left, deopt);
                    emit_guard_num(func, &mut out, &guarded_int, &mut guarded_num, right, deopt);
                    let ul = func.alloc_reg();
                    let ur = func.alloc_reg();
                    let raw = func.alloc_reg();
                    out.push(Instr::UnboxNum { dest: ul, src: left });
                    out.push(Instr::UnboxNum { dest: ur, src: right });
                    out.push(Instr::NumCmp {
                        op,
                        dest: raw,
                        left: ul,
                        right: ur,
                    });
                    out.push(Instr::BoxBool { dest, src: raw });
                    new_types.push((dest, TypeInfo::of(JsType::Boolean)));
                    changed = true;
                }
                None => out.push(Instr::Compare {
                    op,
                    dest,
                    left,
                    right,
                    site,
                    deopt,
                }),
            },
            other => out.push(other),
        }
    }

    func.block_mut(block).instrs = out;
    for (r, ty) in new_types {
        func.set_type(r, ty);
    }
    changed
}

fn emit_guard_int(
    func: &IrFunction,
    out: &mut Vec<Instr>,
    guarded: &mut FxHashSet<Reg>,
    value: Reg,
    deopt: crate::jit::ir::DeoptId,
) {
    if guarded.contains(&value) || func.type_of(value).ty.is_subtype(JsType::Int) {
        guarded.insert(value);
        return;
    }
    out.push(Instr::GuardInt { value, deopt });
    guarded.insert(value);
}

fn emit_guard_num(
    func: &IrFunction,
    out: &mut Vec<Instr>,
    guarded_int: &FxHashSet<Reg>,
    guarded_num: &mut FxHashSet<Reg>,
    value: Reg,
    deopt: crate::jit::ir::DeoptId,
) {
    if guarded_num.contains(&value)
        || guarded_int.contains(&value)
        || func.type_of(value).ty.is_subtype(JsType::Number)
    {
        guarded_num.insert(value);
        return;
    }
    out.push(Instr::GuardNumber { value, deopt });
    guarded_num.insert(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Opcode};
    use crate::jit::ir::builder::{build_ir, SiteTable};
    use crate::jit::opt::{OptFlags, PassContext};
    use crate::profiler::{Profiler, ProfileSnapshot};
    use aero_core::{FunctionId, Value};

    /// return a + b, with int feedback at the add site
    fn add_with_feedback(
        feed: impl Fn(&Profiler, u32),
    ) -> (IrFunction, SiteTable, ProfileSnapshot) {
        let mut b = BytecodeBuilder::new("add", 2, 0);
        b.load_var(0);
        b.load_var(1);
        let add_site = b.offset();
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        let f = b.finish();

        let profiler = Profiler::new(true);
        feed(&profiler, add_site);
        let profile = profiler.snapshot(FunctionId(0));
        let (ir, sites) = build_ir(
            FunctionId(0),
            "add",
            &f.code,
            &f.consts,
            2,
            0,
            false,
            &profile,
            None,
        )
        .unwrap();
        (ir, sites, profile)
    }

    #[test]
    fn test_int_specialization() {
        let (mut ir, sites, profile) = add_with_feedback(|p, site| {
            for _ in 0..100 {
                p.record_type(FunctionId(0), site, 0, Value::integer(1));
                p.record_type(FunctionId(0), site, 1, Value::integer(2));
            }
        });
        let ctx = PassContext {
            profile: &profile,
            sites: &sites,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        };
        assert!(TypeSpecialization.run(&mut ir, &ctx));

        let instrs: Vec<_> = ir
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .collect();
        assert!(instrs.iter().any(|i| matches!(i, Instr::GuardInt { .. })));
        assert!(instrs.iter().any(|i| matches!(i, Instr::IntAdd { .. })));
        assert!(instrs.iter().any(|i| matches!(i, Instr::BoxInt { .. })));
        assert!(!instrs.iter().any(|i| matches!(i, Instr::Binary { .. })));
        assert!(ir.verify_ssa().is_ok());
    }

    #[test]
    fn test_double_specialization() {
        let (mut ir, sites, profile) = add_with_feedback(|p, site| {
            for _ in 0..100 {
                p.record_type(FunctionId(0), site, 0, Value::number(0.5));
                p.record_type(FunctionId(0), site, 1, Value::integer(2));
            }
        });
        let ctx = PassContext {
            profile: &profile,
            sites: &sites,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        };
        assert!(TypeSpecialization.run(&mut ir, &ctx));
        let instrs: Vec<_> = ir
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .collect();
        assert!(instrs.iter().any(|i| matches!(i, Instr::NumAdd { .. })));
        assert!(instrs.iter().any(|i| matches!(i, Instr::GuardNumber { .. })));
    }

    #[test]
    fn test_unstable_site_stays_generic() {
        let (mut ir, sites, profile) = add_with_feedback(|p, site| {
            for _ in 0..50 {
                p.record_type(FunctionId(0), site, 0, Value::integer(1));
                p.record_type(FunctionId(0), site, 0, Value::number(0.5));
                p.record_type(FunctionId(0), site, 1, Value::integer(2));
            }
        });
        let ctx = PassContext {
            profile: &profile,
            sites: &sites,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        };
        assert!(!TypeSpecialization.run(&mut ir, &ctx));
        assert!(ir
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .any(|i| matches!(i, Instr::Binary { .. })));
    }

    #[test]
    fn test_string_feedback_stays_generic() {
        let (mut ir, sites, profile) = add_with_feedback(|p, site| {
            let mut heap = aero_core::Heap::new(0);
            let s = heap.alloc_string("x");
            for _ in 0..100 {
                p.record_type(FunctionId(0), site, 0, s);
                p.record_type(FunctionId(0), site, 1, Value::integer(2));
            }
        });
        let ctx = PassContext {
            profile: &profile,
            sites: &sites,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        };
        assert!(!TypeSpecialization.run(&mut ir, &ctx));
    }

    #[test]
    fn test_guard_deduplication() {
        // (a + a): the same operand needs only one guard
        let mut b = BytecodeBuilder::new("dbl", 1, 0);
        b.load_var(0);
        b.emit(Opcode::Dup);
        let add_site = b.offset();
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        let f = b.finish();

        let profiler = Profiler::new(true);
        for _ in 0..100 {
            profiler.record_type(FunctionId(0), add_site, 0, Value::integer(1));
            profiler.record_type(FunctionId(0), add_site, 1, Value::integer(1));
        }
        let profile = profiler.snapshot(FunctionId(0));
        let (mut ir, sites) = build_ir(
            FunctionId(0),
            "dbl",
            &f.code,
            &f.consts,
            1,
            0,
            false,
            &profile,
            None,
        )
        .unwrap();
        let ctx = PassContext {
            profile: &profile,
            sites: &sites,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        };
        TypeSpecialization.run(&mut ir, &ctx);
        let guards = ir
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter(|i| matches!(i, Instr::GuardInt { .. }))
            .count();
        assert_eq!(guards, 1);
    }
}
