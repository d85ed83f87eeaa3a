//! Constant folding
//!
//! Folds arithmetic and comparisons whose operands are literal constants,
//! rewriting the defining instruction in place so the SSA value keeps its
//! identity. Integer folds that leave i32 promote to a double constant,
//! matching runtime overflow behavior. String concatenation of two pool
//! constants folds into a synthesized pool entry.

use rustc_hash::FxHashMap;

use crate::jit::ir::{BinOp, CmpOp, Instr, IrFunction, JsType, NumRange, Reg, TypeInfo};

use super::{OptFlags, OptPass, PassContext};

/// High bit marking a pool index synthesized by the optimizer (the
/// runtime resolves those from the code entry's string table)
pub const SYNTH_POOL_BIT: u16 = 0x8000;

#[derive(Debug, Clone, Copy)]
enum Known {
    Int(i32),
    Num(f64),
    Bool(bool),
    /// Pool string by index
    Str(u16),
}

impl Known {
    fn as_f64(self) -> Option<f64> {
        match self {
            Known::Int(i) => Some(i as f64),
            Known::Num(n) => Some(n),
            Known::Bool(b) => Some(b as u8 as f64),
            Known::Str(_) => None,
        }
    }
}

pub struct ConstantFolding;

impl OptPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.fold
    }

    fn run(&self, func: &mut IrFunction, _ctx: &PassContext) -> bool {
        let mut known: FxHashMap<Reg, Known> = FxHashMap::default();
        let mut changed = false;
        // (block, instr index, dest, concatenated string)
        let mut string_synths: Vec<(crate::jit::ir::BlockId, usize, Reg, String)> = Vec::new();

        // Seed with constants in program order, folding as we go; RPO
        // guarantees defs precede uses within and across blocks.
        for block_id in func.rpo() {
            let mut replacements: Vec<(usize, Instr, TypeInfo)> = Vec::new();
            for (i, instr) in func.block(block_id).instrs.iter().enumerate() {
                match instr {
                    Instr::ConstInt { dest, value } => {
                        known.insert(*dest, Known::Int(*value));
                    }
                    Instr::ConstNum { dest, value } => {
                        known.insert(*dest, Known::Num(*value));
                    }
                    Instr::ConstBool { dest, value } => {
                        known.insert(*dest, Known::Bool(*value));
                    }
                    Instr::ConstPool { dest, index } => {
                        if pool_string(func, *index).is_some() {
                            known.insert(*dest, Known::Str(*index));
                        }
                    }
                    Instr::Binary {
                        op,
                        dest,
                        left,
                        right,
                        ..
                    } => {
                        if let (Some(&l), Some(&r)) = (known.get(left), known.get(right)) {
                            if let (BinOp::Add, Known::Str(a), Known::Str(b)) = (*op, l, r) {
                                // Constant string concatenation synthesizes
                                // a new pool entry
                                let concat = format!(
                                    "{}{}",
                                    pool_string(func, a).unwrap(),
                                    pool_string(func, b).unwrap()
                                );
                                string_synths.push((block_id, i, *dest, concat));
                                continue;
                            }
                            if let Some((folded, ty)) = fold_binary(*dest, *op, l, r) {
                                if let Some(k) = known_of(&folded) {
                                    known.insert(*dest, k);
                                }
                                replacements.push((i, folded, ty));
                            }
                        }
                    }
                    Instr::Compare {
                        op,
                        dest,
                        left,
                        right,
                        ..
                    } => {
                        if let (Some(&l), Some(&r)) = (known.get(left), known.get(right)) {
                            if let Some(value) = fold_compare(*op, l, r) {
                                known.insert(*dest, Known::Bool(value));
                                replacements.push((
                                    i,
                                    Instr::ConstBool { dest: *dest, value },
                                    TypeInfo::of(JsType::Boolean),
                                ));
                            }
                        }
                    }
                    Instr::Neg { dest, operand } => {
                        if let Some(&v) = known.get(operand) {
                            let folded = match v {
                                Known::Int(n) if n != 0 && n != i32::MIN => Some(Instr::ConstInt {
                                    dest: *dest,
                                    value: -n,
                                }),
                                other => other.as_f64().map(|n| Instr::ConstNum {
                                    dest: *dest,
                                    value: -n,
                                }),
                            };
                            if let Some(folded) = folded {
                                if let Some(k) = known_of(&folded) {
                                    known.insert(*dest, k);
                                }
                                let ty = type_of_instr(&folded);
                                replacements.push((i, folded, ty));
                            }
                        }
                    }
                    Instr::Not { dest, operand } => {
                        if let Some(&v) = known.get(operand) {
                            let value = match v {
                                Known::Bool(b) => Some(!b),
                                Known::Int(n) => Some(n == 0),
                                Known::Num(n) => Some(n == 0.0 || n.is_nan()),
                                Known::Str(idx) => pool_string(func, idx).map(|s| s.is_empty()),
                            };
                            if let Some(value) = value {
                                known.insert(*dest, Known::Bool(value));
                                replacements.push((
                                    i,
                                    Instr::ConstBool { dest: *dest, value },
                                    TypeInfo::of(JsType::Boolean),
                                ));
                            }
                        }
                    }
                    Instr::IsTruthy { dest, src } => {
                        if let Some(&v) = known.get(src) {
                            let value = match v {
                                Known::Bool(b) => Some(b),
                                Known::Int(n) => Some(n != 0),
                                Known::Num(n) => Some(n != 0.0 && !n.is_nan()),
                                Known::Str(idx) => pool_string(func, idx).map(|s| !s.is_empty()),
                            };
                            if let Some(value) = value {
                                known.insert(*dest, Known::Bool(value));
                                replacements.push((
                                    i,
                                    Instr::ConstBool { dest: *dest, value },
                                    TypeInfo::of(JsType::Boolean),
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
            if !replacements.is_empty() {
                changed = true;
                let block = func.block_mut(block_id);
                let mut typed: Vec<(Reg, TypeInfo)> = Vec::new();
                for (i, instr, ty) in replacements {
                    if let Some(d) = instr.dest() {
                        typed.push((d, ty));
                    }
                    block.instrs[i] = instr;
                }
                for (r, ty) in typed {
                    func.set_type(r, ty);
                }
            }
        }

        for (block_id, i, dest, concat) in string_synths {
            let index = SYNTH_POOL_BIT | func.synth_strings.len() as u16;
            func.synth_strings.push(concat.into());
            func.block_mut(block_id).instrs[i] = Instr::ConstPool { dest, index };
            func.set_type(dest, TypeInfo::of(JsType::String));
            changed = true;
        }
        changed
    }
}

/// Content of a pool index when it is a known string (original pool or a
/// synthesized concatenation)
fn pool_string(func: &IrFunction, index: u16) -> Option<&str> {
    if index & SYNTH_POOL_BIT != 0 {
        func.synth_strings
            .get((index & !SYNTH_POOL_BIT) as usize)
            .map(|s| s.as_ref())
    } else {
        func.pool_strings.get(&index).map(|s| s.as_ref())
    }
}

fn known_of(i: &Instr) -> Option<Known> {
    match i {
        Instr::ConstInt { value, .. } => Some(Known::Int(*value)),
        Instr::ConstNum { value, .. } => Some(Known::Num(*value)),
        Instr::ConstBool { value, .. } => Some(Known::Bool(*value)),
        _ => None,
    }
}

fn type_of_instr(i: &Instr) -> TypeInfo {
    match i {
        Instr::ConstInt { value, .. } => TypeInfo::int_range(NumRange::exact(*value as i64)),
        Instr::ConstNum { .. } => TypeInfo::of(JsType::Double),
        Instr::ConstBool { .. } => TypeInfo::of(JsType::Boolean),
        _ => TypeInfo::unknown(),
    }
}

fn fold_binary(dest: Reg, op: BinOp, l: Known, r: Known) -> Option<(Instr, TypeInfo)> {
    // Boolean operands coerce to numbers under arithmetic
    if let (Known::Int(a), Known::Int(b)) = (l, r) {
        match op {
            BinOp::Add => {
                return Some(match a.checked_add(b) {
                    Some(v) => (
                        Instr::ConstInt { dest, value: v },
                        TypeInfo::int_range(NumRange::exact(v as i64)),
                    ),
                    None => (
                        Instr::ConstNum {
                            dest,
                            value: a as f64 + b as f64,
                        },
                        TypeInfo::of(JsType::Double),
                    ),
                })
            }
            BinOp::Sub => {
                return Some(match a.checked_sub(b) {
                    Some(v) => (
                        Instr::ConstInt { dest, value: v },
                        TypeInfo::int_range(NumRange::exact(v as i64)),
                    ),
                    None => (
                        Instr::ConstNum {
                            dest,
                            value: a as f64 - b as f64,
                        },
                        TypeInfo::of(JsType::Double),
                    ),
                })
            }
            BinOp::Mul => {
                return Some(match a.checked_mul(b) {
                    Some(v) => (
                        Instr::ConstInt { dest, value: v },
                        TypeInfo::int_range(NumRange::exact(v as i64)),
                    ),
                    None => (
                        Instr::ConstNum {
                            dest,
                            value: a as f64 * b as f64,
                        },
                        TypeInfo::of(JsType::Double),
                    ),
                })
            }
            _ => {}
        }
    }
    let (a, b) = (l.as_f64()?, r.as_f64()?);
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a % b,
    };
    Some((
        Instr::ConstNum { dest, value: v },
        TypeInfo::of(JsType::Double),
    ))
}

fn fold_compare(op: CmpOp, l: Known, r: Known) -> Option<bool> {
    let (a, b) = (l.as_f64()?, r.as_f64()?);
    Some(match op {
        CmpOp::Eq | CmpOp::StrictEq => a == b,
        CmpOp::Ne | CmpOp::StrictNe => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::builder::SiteTable;
    use crate::jit::ir::{DeoptId, Terminator};
    use crate::profiler::ProfileSnapshot;
    use aero_core::FunctionId;

    fn ctx<'a>(
        profile: &'a ProfileSnapshot,
        sites: &'a SiteTable,
    ) -> PassContext<'a> {
        PassContext {
            profile,
            sites,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        }
    }

    fn one_block() -> (IrFunction, crate::jit::ir::BlockId) {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b = f.add_block(0);
        (f, b)
    }

    #[test]
    fn test_fold_int_add() {
        let (mut f, b) = one_block();
        let r0 = f.alloc_reg();
        let r1 = f.alloc_reg();
        let r2 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: r0, value: 3 },
            Instr::ConstInt { dest: r1, value: 5 },
            Instr::Binary {
                op: BinOp::Add,
                dest: r2,
                left: r0,
                right: r1,
                site: 0,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(r2);

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(ConstantFolding.run(&mut f, &ctx(&p, &s)));
        assert!(matches!(
            f.block(b).instrs[2],
            Instr::ConstInt { value: 8, .. }
        ));
        assert_eq!(f.type_of(r2).ty, JsType::Int);
    }

    #[test]
    fn test_fold_overflow_promotes() {
        let (mut f, b) = one_block();
        let r0 = f.alloc_reg();
        let r1 = f.alloc_reg();
        let r2 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt {
                dest: r0,
                value: i32::MAX,
            },
            Instr::ConstInt { dest: r1, value: 1 },
            Instr::Binary {
                op: BinOp::Add,
                dest: r2,
                left: r0,
                right: r1,
                site: 0,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(r2);

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        ConstantFolding.run(&mut f, &ctx(&p, &s));
        match f.block(b).instrs[2] {
            Instr::ConstNum { value, .. } => assert_eq!(value, 2147483648.0),
            ref other => panic!("expected ConstNum, got {other:?}"),
        }
    }

    #[test]
    fn test_fold_division_and_compare() {
        let (mut f, b) = one_block();
        let r0 = f.alloc_reg();
        let r1 = f.alloc_reg();
        let r2 = f.alloc_reg();
        let r3 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: r0, value: 1 },
            Instr::ConstInt { dest: r1, value: 2 },
            Instr::Binary {
                op: BinOp::Div,
                dest: r2,
                left: r0,
                right: r1,
                site: 0,
                deopt: DeoptId(0),
            },
            Instr::Compare {
                op: CmpOp::Lt,
                dest: r3,
                left: r0,
                right: r1,
                site: 4,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(r3);

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        ConstantFolding.run(&mut f, &ctx(&p, &s));
        assert!(matches!(
            f.block(b).instrs[2],
            Instr::ConstNum { value, .. } if value == 0.5
        ));
        assert!(matches!(
            f.block(b).instrs[3],
            Instr::ConstBool { value: true, .. }
        ));
    }

    #[test]
    fn test_fold_is_idempotent() {
        let (mut f, b) = one_block();
        let r0 = f.alloc_reg();
        let r1 = f.alloc_reg();
        let r2 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstInt { dest: r0, value: 3 },
            Instr::ConstInt { dest: r1, value: 5 },
            Instr::Binary {
                op: BinOp::Add,
                dest: r2,
                left: r0,
                right: r1,
                site: 0,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(r2);

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(ConstantFolding.run(&mut f, &ctx(&p, &s)));
        let after_once = format!("{f}");
        assert!(!ConstantFolding.run(&mut f, &ctx(&p, &s)) || format!("{f}") == after_once);
        assert_eq!(format!("{f}"), after_once);
    }

    #[test]
    fn test_fold_string_concat() {
        let (mut f, b) = one_block();
        f.pool_strings.insert(0, "foo".into());
        f.pool_strings.insert(1, "bar".into());
        let r0 = f.alloc_reg();
        let r1 = f.alloc_reg();
        let r2 = f.alloc_reg();
        f.block_mut(b).instrs = vec![
            Instr::ConstPool { dest: r0, index: 0 },
            Instr::ConstPool { dest: r1, index: 1 },
            Instr::Binary {
                op: BinOp::Add,
                dest: r2,
                left: r0,
                right: r1,
                site: 0,
                deopt: DeoptId(0),
            },
        ];
        f.block_mut(b).terminator = Terminator::Return(r2);

        let p = ProfileSnapshot::default();
        let s = SiteTable::default();
        assert!(ConstantFolding.run(&mut f, &ctx(&p, &s)));
        match f.block(b).instrs[2] {
            Instr::ConstPool { index, .. } => {
                assert!(index & SYNTH_POOL_BIT != 0);
                assert_eq!(
                    f.synth_strings[(index & !SYNTH_POOL_BIT) as usize].as_ref(),
                    "foobar"
                );
            }
            ref other => panic!("expected ConstPool, got {other:?}"),
        }
    }
}
