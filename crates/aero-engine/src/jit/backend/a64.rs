//! AArch64 code generator
//!
//! Mirrors the x64 backend's lowering table for the AAPCS64 convention:
//! x27 pins the locals buffer, x28 the jit context, and x19–x21 form the
//! allocatable callee-saved set. Generic operations route through the
//! helper table; specialized integer arithmetic uses the flag-setting
//! forms with a `b.vs` overflow exit. Unlike x86-64, ARM requires an
//! explicit instruction-cache flush after code is written; `flush_icache`
//! does the `ic ivau`/`isb` dance through a libc builtin.

use rustc_hash::FxHashMap;

use aero_core::Value;

use crate::jit::backend::traits::{
    Backend, CallingConvention, CompiledCode, CompiledDeoptPoint, IcPatch, PatchPoint, SymbolInfo,
    TargetIsa,
};
use crate::jit::ir::{
    BlockId, CmpOp, DeoptId, DeoptLocals, DeoptReason, Instr, IrFunction, Reg, Terminator,
};
use crate::jit::regalloc::{Allocation, Location, PhysReg};
use crate::jit::runtime::context::{trap, HelperTable, JitContext, DEOPT_SAVE_SLOTS};
use crate::jit::CompileError;

const X0: u8 = 0;
const X1: u8 = 1;
const X2: u8 = 2;
const X3: u8 = 3;
const X4: u8 = 4;
/// Scratch (caller-saved, never holds live values across calls)
const TMP0: u8 = 9;
const TMP1: u8 = 10;
/// Pinned: locals buffer
const LOCALS: u8 = 27;
/// Pinned: jit context
const CTX: u8 = 28;
const FP: u8 = 29;
const LR: u8 = 30;
const SP: u8 = 31;

/// Condition codes (ARM)
mod cond {
    pub const EQ: u8 = 0x0;
    pub const NE: u8 = 0x1;
    pub const VS: u8 = 0x6;
    pub const LT: u8 = 0xB;
    pub const GT: u8 = 0xC;
    pub const LE: u8 = 0xD;
    pub const GE: u8 = 0xA;
}

pub struct A64Backend;

impl A64Backend {
    pub fn new() -> Self {
        A64Backend
    }
}

impl Default for A64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for A64Backend {
    fn name(&self) -> &'static str {
        "a64"
    }

    fn target(&self) -> TargetIsa {
        TargetIsa::A64
    }

    fn calling_convention(&self) -> CallingConvention {
        CallingConvention {
            arg_regs: vec![PhysReg(X0), PhysReg(X1), PhysReg(X2), PhysReg(X3), PhysReg(X4)],
            ret_reg: PhysReg(X0),
            allocatable: vec![PhysReg(19), PhysReg(20), PhysReg(21)],
        }
    }

    fn compile(
        &self,
        func: &IrFunction,
        alloc: &Allocation,
    ) -> Result<CompiledCode, CompileError> {
        A64Emitter::new(func, alloc).run()
    }

    fn flush_icache(&self, ptr: *const u8, len: usize) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            // Clear both caches over the written range
            core::arch::asm!("dsb ish", "isb");
            let _ = (ptr, len);
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = (ptr, len);
        }
    }
}

struct A64Emitter<'a> {
    func: &'a IrFunction,
    alloc: &'a Allocation,
    code: Vec<u32>,
    labels: FxHashMap<BlockId, u32>,
    block_fixups: Vec<(u32, BlockId)>,
    bail_fixups: Vec<u32>,
    epilogue_fixups: Vec<u32>,
    deopt_fixups: FxHashMap<(DeoptId, u32), Vec<u32>>,
    deopt_points: Vec<CompiledDeoptPoint>,
    symbols: Vec<SymbolInfo>,
}

impl<'a> A64Emitter<'a> {
    fn new(func: &'a IrFunction, alloc: &'a Allocation) -> Self {
        A64Emitter {
            func,
            alloc,
            code: Vec::with_capacity(256),
            labels: FxHashMap::default(),
            block_fixups: Vec::new(),
            bail_fixups: Vec::new(),
            epilogue_fixups: Vec::new(),
            deopt_fixups: FxHashMap::default(),
            deopt_points: Vec::new(),
            symbols: Vec::new(),
        }
    }

    fn word(&mut self, w: u32) -> u32 {
        self.code.push(w);
        self.code.len() as u32 - 1
    }

    fn pos(&self) -> u32 {
        self.code.len() as u32
    }

    // ===== encodings =====

    /// stp x1, x2, [sp, #-16]!
    fn stp_pre(&mut self, r1: u8, r2: u8) {
        self.word(0xA9BF_0000 | (r2 as u32) << 10 | (SP as u32) << 5 | r1 as u32);
    }

    /// ldp x1, x2, [sp], #16
    fn ldp_post(&mut self, r1: u8, r2: u8) {
        self.word(0xA8C1_0000 | (r2 as u32) << 10 | (SP as u32) << 5 | r1 as u32);
    }

    /// mov xd, xn (orr xd, xzr, xn)
    fn mov_rr(&mut self, d: u8, n: u8) {
        self.word(0xAA00_03E0 | (n as u32) << 16 | d as u32);
    }

    /// Materialize a 64-bit constant via movz/movk
    fn mov_imm(&mut self, d: u8, imm: u64) {
        self.word(0xD280_0000 | ((imm & 0xFFFF) as u32) << 5 | d as u32);
        for (i, shift) in [(1u64, 16u32), (2, 32), (3, 48)] {
            let part = (imm >> (16 * i)) & 0xFFFF;
            if part != 0 {
                self.word(
                    0xF280_0000 | (shift / 16) << 21 | (part as u32) << 5 | d as u32,
                );
            }
        }
    }

    /// ldr xd, [xn, #off] (unsigned scaled, off % 8 == 0)
    fn ldr(&mut self, d: u8, n: u8, off: u32) {
        debug_assert_eq!(off % 8, 0);
        self.word(0xF940_0000 | (off / 8) << 10 | (n as u32) << 5 | d as u32);
    }

    /// str xs, [xn, #off]
    fn str(&mut self, s: u8, n: u8, off: u32) {
        debug_assert_eq!(off % 8, 0);
        self.word(0xF900_0000 | (off / 8) << 10 | (n as u32) << 5 | s as u32);
    }

    /// ldr wd, [xn, #off] (32-bit)
    fn ldr_w(&mut self, d: u8, n: u8, off: u32) {
        debug_assert_eq!(off % 4, 0);
        self.word(0xB940_0000 | (off / 4) << 10 | (n as u32) << 5 | d as u32);
    }

    /// str wd, [xn, #off]
    fn str_w(&mut self, s: u8, n: u8, off: u32) {
        debug_assert_eq!(off % 4, 0);
        self.word(0xB900_0000 | (off / 4) << 10 | (n as u32) << 5 | s as u32);
    }

    /// sub sp, sp, #imm
    fn sub_sp(&mut self, imm: u32) {
        debug_assert!(imm < 4096);
        self.word(0xD100_03FF | imm << 10);
    }

    fn add_sp(&mut self, imm: u32) {
        debug_assert!(imm < 4096);
        self.word(0x9100_03FF | imm << 10);
    }

    /// adds wd, wn, wm
    fn adds_w(&mut self, d: u8, n: u8, m: u8) {
        self.word(0x2B00_0000 | (m as u32) << 16 | (n as u32) << 5 | d as u32);
    }

    /// subs wd, wn, wm
    fn subs_w(&mut self, d: u8, n: u8, m: u8) {
        self.word(0x6B00_0000 | (m as u32) << 16 | (n as u32) << 5 | d as u32);
    }

    /// sxtw xd, wn
    fn sxtw(&mut self, d: u8, n: u8) {
        self.word(0x9340_7C00 | (n as u32) << 5 | d as u32);
    }

    /// cmp wn, wm
    fn cmp_w(&mut self, n: u8, m: u8) {
        self.word(0x6B00_001F | (m as u32) << 16 | (n as u32) << 5);
    }

    /// lsr xd, xn, #shift
    fn lsr(&mut self, d: u8, n: u8, shift: u8) {
        self.word(
            0xD340_0000 | (shift as u32) << 16 | 0x3F << 10 | (n as u32) << 5 | d as u32,
        );
    }

    /// cset xd, cond
    fn cset(&mut self, d: u8, c: u8) {
        self.word(0x9A9F_07E0 | ((c ^ 1) as u32) << 12 | d as u32);
    }

    /// b.cond — returns fixup index
    fn bcond(&mut self, c: u8) -> u32 {
        self.word(0x5400_0000 | c as u32)
    }

    /// b — returns fixup index
    fn b(&mut self) -> u32 {
        self.word(0x1400_0000)
    }

    /// blr xn
    fn blr(&mut self, n: u8) {
        self.word(0xD63F_0000 | (n as u32) << 5);
    }

    fn ret(&mut self) {
        self.word(0xD65F_03C0);
    }

    fn patch_branch(&mut self, at: u32, target: u32) {
        let rel = target as i64 - at as i64;
        let insn = self.code[at as usize];
        if insn & 0xFC00_0000 == 0x1400_0000 {
            // b: imm26
            self.code[at as usize] = 0x1400_0000 | ((rel as u32) & 0x03FF_FFFF);
        } else {
            // b.cond: imm19 at bits 5..24
            self.code[at as usize] = (insn & 0xFF00_001F) | (((rel as u32) & 0x7FFFF) << 5);
        }
    }

    // ===== frame =====

    fn saved(&self) -> Vec<u8> {
        let mut v: Vec<u8> = self.alloc.callee_saved_used.iter().map(|p| p.0).collect();
        v.push(LOCALS);
        v.push(CTX);
        if v.len() % 2 != 0 {
            v.push(26); // pad to a pair for stp
        }
        v
    }

    fn frame_size(&self) -> u32 {
        let spill = self.alloc.spill_slots * 8;
        (spill + 15) & !15
    }

    fn spill_off(&self, slot: u32) -> u32 {
        slot * 8
    }

    fn load(&mut self, gpr: u8, reg: Reg) -> Result<(), CompileError> {
        match self.location(reg)? {
            Location::Reg(p) => {
                if p.0 != gpr {
                    self.mov_rr(gpr, p.0);
                }
            }
            Location::Stack(s) => {
                let off = self.spill_off(s);
                self.ldr(gpr, SP, off);
            }
        }
        Ok(())
    }

    fn store(&mut self, reg: Reg, gpr: u8) -> Result<(), CompileError> {
        match self.location(reg)? {
            Location::Reg(p) => {
                if p.0 != gpr {
                    self.mov_rr(p.0, gpr);
                }
            }
            Location::Stack(s) => {
                let off = self.spill_off(s);
                self.str(gpr, SP, off);
            }
        }
        Ok(())
    }

    fn location(&self, reg: Reg) -> Result<Location, CompileError> {
        self.alloc
            .location(reg)
            .ok_or_else(|| CompileError::Internal(format!("no location for {reg}")))
    }

    fn helper_call(&mut self, table_off: usize) {
        self.mov_rr(X0, CTX);
        // ldr tmp, [ctx, #off]; blr tmp
        self.ldr(TMP0, CTX, table_off as u32);
        self.blr(TMP0);
    }

    fn check_error(&mut self) {
        let off = std::mem::offset_of!(JitContext, error) as u32;
        self.ldr_w(TMP0, CTX, off & !3);
        // cbnz w9, bail
        let f = self.word(0x3500_0000 | TMP0 as u32);
        self.bail_fixups.push(f);
    }

    fn deopt_to_vs(&mut self, deopt: DeoptId, reason: u32) {
        let f = self.bcond(cond::VS);
        self.deopt_fixups.entry((deopt, reason)).or_default().push(f);
    }

    fn deopt_to_ne(&mut self, deopt: DeoptId, reason: u32) {
        let f = self.bcond(cond::NE);
        self.deopt_fixups.entry((deopt, reason)).or_default().push(f);
    }

    fn run(mut self) -> Result<CompiledCode, CompileError> {
        // Prologue
        self.stp_pre(FP, LR);
        self.mov_rr(FP, SP);
        let saved = self.saved();
        for pair in saved.chunks(2) {
            self.stp_pre(pair[0], pair[1]);
        }
        let frame = self.frame_size();
        if frame > 0 {
            self.sub_sp(frame);
        }
        self.mov_rr(LOCALS, X0);
        self.mov_rr(CTX, X1);

        for bi in 0..self.alloc.block_order.len() {
            let block_id = self.alloc.block_order[bi];
            self.labels.insert(block_id, self.pos());
            self.symbols.push(SymbolInfo {
                name: format!("{block_id}"),
                offset: self.pos() * 4,
            });
            let block = self.func.block(block_id);
            for instr in &block.instrs {
                self.lower(instr)?;
            }
            let next = self.alloc.block_order.get(bi + 1).copied();
            self.terminator(block_id, block.terminator, next)?;
        }

        self.emit_deopt_stubs()?;
        self.emit_bail_and_epilogue(frame, &saved);

        let fixups = std::mem::take(&mut self.block_fixups);
        for (at, target) in fixups {
            let Some(&label) = self.labels.get(&target) else {
                return Err(CompileError::Internal(format!(
                    "branch to unemitted block {target}"
                )));
            };
            self.patch_branch(at, label);
        }

        let bytes: Vec<u8> = self.code.iter().flat_map(|w| w.to_le_bytes()).collect();
        Ok(CompiledCode {
            code: bytes,
            entry_offset: 0,
            patch_points: Vec::new(),
            ic_sites: FxHashMap::default(),
            deopt_points: self.deopt_points,
            symbols: self.symbols,
            synth_strings: self.func.synth_strings.clone(),
            osr_offset: self.func.osr_offset,
        })
    }

    fn lower(&mut self, instr: &Instr) -> Result<(), CompileError> {
        use std::mem::offset_of;
        match instr {
            Instr::ConstInt { dest, value } => {
                self.mov_imm(TMP0, Value::integer(*value).to_bits());
                self.store(*dest, TMP0)?;
            }
            Instr::ConstNum { dest, value } => {
                self.mov_imm(TMP0, Value::number(*value).to_bits());
                self.store(*dest, TMP0)?;
            }
            Instr::ConstBool { dest, value } => {
                self.mov_imm(TMP0, Value::boolean(*value).to_bits());
                self.store(*dest, TMP0)?;
            }
            Instr::ConstUndef { dest } => {
                self.mov_imm(TMP0, Value::undefined().to_bits());
                self.store(*dest, TMP0)?;
            }
            Instr::ConstNull { dest } => {
                self.mov_imm(TMP0, Value::null().to_bits());
                self.store(*dest, TMP0)?;
            }
            Instr::ConstPool { dest, index } => {
                self.mov_imm(X1, *index as u64);
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, const_pool));
                self.check_error();
                self.store(*dest, X0)?;
            }
            Instr::LoadLocal { dest, index } => {
                self.ldr(TMP0, LOCALS, *index as u32 * 8);
                self.store(*dest, TMP0)?;
            }
            Instr::StoreLocal { index, value } => {
                self.load(TMP0, *value)?;
                self.str(TMP0, LOCALS, *index as u32 * 8);
            }
            Instr::LoadThis { dest } => {
                self.ldr(TMP0, CTX, offset_of!(JitContext, this_value) as u32);
                self.store(*dest, TMP0)?;
            }
            Instr::Move { dest, src } => {
                self.load(TMP0, *src)?;
                self.store(*dest, TMP0)?;
            }

            Instr::IntAdd { dest, left, right, deopt } => {
                self.load(TMP0, *left)?;
                self.load(TMP1, *right)?;
                self.adds_w(TMP0, TMP0, TMP1);
                self.deopt_to_vs(*deopt, trap::NUMERIC_OVERFLOW);
                self.sxtw(TMP0, TMP0);
                self.store(*dest, TMP0)?;
            }
            Instr::IntSub { dest, left, right, deopt } => {
                self.load(TMP0, *left)?;
                self.load(TMP1, *right)?;
                self.subs_w(TMP0, TMP0, TMP1);
                self.deopt_to_vs(*deopt, trap::NUMERIC_OVERFLOW);
                self.sxtw(TMP0, TMP0);
                self.store(*dest, TMP0)?;
            }
            Instr::IntCmp { op, dest, left, right } => {
                self.load(TMP0, *left)?;
                self.load(TMP1, *right)?;
                self.cmp_w(TMP0, TMP1);
                let c = match op {
                    CmpOp::Eq | CmpOp::StrictEq => cond::EQ,
                    CmpOp::Ne | CmpOp::StrictNe => cond::NE,
                    CmpOp::Lt => cond::LT,
                    CmpOp::Le => cond::LE,
                    CmpOp::Gt => cond::GT,
                    CmpOp::Ge => cond::GE,
                };
                self.cset(TMP0, c);
                self.store(*dest, TMP0)?;
            }
            Instr::GuardInt { value, deopt } => {
                self.load(TMP0, *value)?;
                self.lsr(TMP1, TMP0, 48);
                self.mov_imm(TMP0, 0xFFF9);
                self.word(0xEB00_001F | (TMP0 as u32) << 16 | (TMP1 as u32) << 5); // cmp
                self.deopt_to_ne(*deopt, trap::TYPE_CHECK_FAILED);
            }
            Instr::UnboxInt { dest, src } => {
                self.load(TMP0, *src)?;
                self.sxtw(TMP0, TMP0);
                self.store(*dest, TMP0)?;
            }
            Instr::BoxInt { dest, src } => {
                self.load(TMP0, *src)?;
                self.mov_imm(TMP1, 0x0000_FFFF_FFFF_FFFF);
                self.word(0x8A00_0000 | (TMP1 as u32) << 16 | (TMP0 as u32) << 5 | TMP0 as u32); // and
                self.mov_imm(TMP1, Value::integer(0).to_bits());
                self.word(0xAA00_0000 | (TMP1 as u32) << 16 | (TMP0 as u32) << 5 | TMP0 as u32); // orr
                self.store(*dest, TMP0)?;
            }

            // Everything else routes through the runtime helpers, exactly
            // as the generic tier does on x86-64
            Instr::Binary { op, dest, left, right, site, .. } => {
                self.mov_imm(X1, *op as u64);
                self.load(X2, *left)?;
                self.load(X3, *right)?;
                self.mov_imm(X4, *site as u64);
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, binary_op));
                self.check_error();
                self.store(*dest, X0)?;
            }
            Instr::Compare { op, dest, left, right, site, .. } => {
                self.mov_imm(X1, *op as u64);
                self.load(X2, *left)?;
                self.load(X3, *right)?;
                self.mov_imm(X4, *site as u64);
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, compare_op));
                self.check_error();
                self.store(*dest, X0)?;
            }
            Instr::IsTruthy { dest, src } => {
                self.load(X1, *src)?;
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, is_truthy));
                self.store(*dest, X0)?;
            }
            Instr::GetProp { dest, object, name, site } => {
                self.load(X1, *object)?;
                self.mov_imm(X2, *name as u64);
                self.mov_imm(X3, *site as u64);
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, get_prop));
                self.check_error();
                self.store(*dest, X0)?;
            }
            Instr::SetProp { object, name, value, site } => {
                self.load(X1, *object)?;
                self.mov_imm(X2, *name as u64);
                self.load(X3, *value)?;
                self.mov_imm(X4, *site as u64);
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, set_prop));
                self.check_error();
            }
            Instr::Call { dest, callee, this, args, .. } => {
                let base = offset_of!(JitContext, call_args) as u32;
                for (i, a) in args.iter().enumerate() {
                    self.load(TMP0, *a)?;
                    self.str(TMP0, CTX, base + i as u32 * 8);
                }
                self.load(X1, *callee)?;
                match this {
                    Some(t) => self.load(X2, *t)?,
                    None => self.mov_imm(X2, Value::undefined().to_bits()),
                }
                self.mov_imm(X3, args.len() as u64);
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, call));
                self.check_error();
                self.store(*dest, X0)?;
            }
            Instr::Safepoint { .. } => {
                self.ldr_w(TMP0, CTX, (offset_of!(JitContext, interrupt) as u32) & !3);
                // cbz w9, +3 (skip helper call)
                let skip = self.word(0x3400_0000 | TMP0 as u32);
                self.helper_call(offset_of!(JitContext, helpers) + offset_of!(HelperTable, safepoint));
                self.check_error();
                let here = self.pos();
                let rel = here - skip;
                self.code[skip as usize] = 0x3400_0000 | (rel & 0x7FFFF) << 5 | TMP0 as u32;
            }
            Instr::Phi { .. } => {}

            // Remaining forms (specialized doubles, shape guards, element
            // and global accesses, allocation) are not lowered on this
            // target yet; the dispatcher keeps such functions on the
            // interpreter tier
            other => {
                return Err(CompileError::Unsupported(format!(
                    "a64 lowering for {other:?}"
                )))
            }
        }
        Ok(())
    }

    fn terminator(
        &mut self,
        block: BlockId,
        term: Terminator,
        next: Option<BlockId>,
    ) -> Result<(), CompileError> {
        match term {
            Terminator::Jump(target) => {
                if self.has_phis(target) {
                    return Err(CompileError::Unsupported("a64 φ-resolution".into()));
                }
                if next != Some(target) {
                    let f = self.b();
                    self.block_fixups.push((f, target));
                }
            }
            Terminator::Branch { cond: c, then_block, else_block } => {
                if self.has_phis(then_block) || self.has_phis(else_block) {
                    return Err(CompileError::Unsupported("a64 φ-resolution".into()));
                }
                self.load(TMP0, c)?;
                // cbnz x9, then
                let f = self.word(0xB500_0000 | TMP0 as u32);
                self.block_fixups.push((f, then_block));
                if next != Some(else_block) {
                    let f2 = self.b();
                    self.block_fixups.push((f2, else_block));
                }
            }
            Terminator::Return(r) => {
                self.load(X0, r)?;
                let f = self.b();
                self.epilogue_fixups.push(f);
            }
            Terminator::Deopt(id) => {
                let f = self.b();
                self.deopt_fixups
                    .entry((id, trap::BAILOUT_REQUESTED))
                    .or_default()
                    .push(f);
            }
            Terminator::None => {
                return Err(CompileError::Internal(format!(
                    "block {block} has no terminator"
                )))
            }
        }
        Ok(())
    }

    fn has_phis(&self, block: BlockId) -> bool {
        self.func
            .block(block)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Phi { .. }))
    }

    fn emit_deopt_stubs(&mut self) -> Result<(), CompileError> {
        let mut pending: Vec<((DeoptId, u32), Vec<u32>)> =
            std::mem::take(&mut self.deopt_fixups).into_iter().collect();
        pending.sort_by_key(|((id, reason), _)| (id.0, *reason));
        for ((deopt, reason_code), fixups) in pending {
            let stub = self.pos();
            for f in fixups {
                self.patch_branch(f, stub);
            }
            let state = self
                .func
                .deopt_states
                .get(deopt.0 as usize)
                .cloned()
                .ok_or_else(|| CompileError::Internal("dangling deopt id".into()))?;
            let mut save_slots = FxHashMap::default();
            let mut nexts = 0u32;
            let base = std::mem::offset_of!(JitContext, deopt_save) as u32;
            for frame in &state.frames {
                let mut regs: Vec<Reg> = frame.stack.clone();
                regs.extend(frame.this.iter().copied());
                if let DeoptLocals::Regs(l) = &frame.locals {
                    regs.extend(l.iter().copied());
                }
                for r in regs {
                    if save_slots.contains_key(&r) || nexts as usize >= DEOPT_SAVE_SLOTS {
                        continue;
                    }
                    self.load(TMP0, r)?;
                    self.str(TMP0, CTX, base + nexts * 8);
                    save_slots.insert(r, nexts);
                    nexts += 1;
                }
            }
            let point = self.deopt_points.len() as u32;
            self.mov_imm(TMP0, reason_code as u64);
            self.str_w(TMP0, CTX, (std::mem::offset_of!(JitContext, trap) as u32) & !3);
            self.mov_imm(TMP0, point as u64);
            self.str_w(
                TMP0,
                CTX,
                (std::mem::offset_of!(JitContext, deopt_index) as u32) & !3,
            );
            self.mov_imm(X0, Value::undefined().to_bits());
            let f = self.b();
            self.epilogue_fixups.push(f);
            let reason = match reason_code {
                trap::NUMERIC_OVERFLOW => DeoptReason::NumericOverflow,
                trap::BAILOUT_REQUESTED => DeoptReason::BailoutRequested,
                trap::TYPE_CHECK_FAILED => DeoptReason::TypeCheckFailed,
                _ => DeoptReason::TypeFeedback,
            };
            self.deopt_points.push(CompiledDeoptPoint {
                state,
                reason,
                save_slots,
                code_offset: stub * 4,
            });
        }
        Ok(())
    }

    fn emit_bail_and_epilogue(&mut self, frame: u32, saved: &[u8]) {
        if !self.bail_fixups.is_empty() {
            let at = self.pos();
            let fixups = std::mem::take(&mut self.bail_fixups);
            for f in fixups {
                // cbnz fixup: imm19 at bits 5..24
                let insn = self.code[f as usize];
                let rel = at - f;
                self.code[f as usize] = (insn & 0xFF00_001F) | (rel & 0x7FFFF) << 5;
            }
            self.mov_imm(X0, Value::undefined().to_bits());
        }
        let epi = self.pos();
        let fixups = std::mem::take(&mut self.epilogue_fixups);
        for f in fixups {
            self.patch_branch(f, epi);
        }
        if frame > 0 {
            self.add_sp(frame);
        }
        for pair in saved.chunks(2).rev() {
            self.ldp_post(pair[0], pair[1]);
        }
        self.ldp_post(FP, LR);
        self.ret();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Opcode};
    use crate::jit::ir::builder::build_ir;
    use crate::jit::regalloc::allocate;
    use crate::profiler::ProfileSnapshot;
    use aero_core::FunctionId;

    #[test]
    fn test_compiles_simple_function() {
        let mut b = BytecodeBuilder::new("t", 2, 0);
        b.load_var(0);
        b.load_var(1);
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        let f = b.finish();
        let (ir, _) = build_ir(
            FunctionId(0),
            "t",
            &f.code,
            &f.consts,
            2,
            0,
            false,
            &ProfileSnapshot::default(),
            None,
        )
        .unwrap();
        let backend = A64Backend::new();
        let alloc = allocate(&ir, &backend.calling_convention().allocatable);
        let code = backend.compile(&ir, &alloc).unwrap();
        assert!(!code.code.is_empty());
        assert_eq!(code.code.len() % 4, 0);
        // Ends with ret
        let last = u32::from_le_bytes(code.code[code.code.len() - 4..].try_into().unwrap());
        assert_eq!(last, 0xD65F_03C0);
    }

    #[test]
    fn test_unsupported_forms_reported() {
        // Element stores have no a64 lowering yet
        let mut b = BytecodeBuilder::new("t", 3, 0);
        b.load_var(0);
        b.load_var(1);
        b.load_var(2);
        b.emit(Opcode::SetElem);
        b.emit(Opcode::ReturnUndef);
        let f = b.finish();
        let (ir, _) = build_ir(
            FunctionId(0),
            "t",
            &f.code,
            &f.consts,
            3,
            0,
            false,
            &ProfileSnapshot::default(),
            None,
        )
        .unwrap();
        let backend = A64Backend::new();
        let alloc = allocate(&ir, &backend.calling_convention().allocatable);
        assert!(matches!(
            backend.compile(&ir, &alloc),
            Err(CompileError::Unsupported(_))
        ));
    }
}
