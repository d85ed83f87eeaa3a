//! x86-64 code generator
//!
//! Lowers allocated IR by table dispatch, one instruction at a time:
//! operands are fetched from their assigned location (register or
//! frame-pointer-relative spill slot) into scratch registers, the machine
//! op is emitted, and the result is stored back. Generic operations call
//! through the helper table in the jit context, which stays pinned in r15
//! (r14 holds the locals buffer). Allocatable registers are callee-saved
//! (rbx, r12, r13), so values survive helper calls without shuffling.
//!
//! Frame layout (System V):
//!
//! ```text
//! [rbp+8]  return address
//! [rbp]    saved rbp
//! [rbp-8]  ... saved callee-saved registers (used set + r14, r15)
//! [ .. ]   spill slots, 8 bytes each
//! ```
//!
//! Deopt exit stubs sit after the body: each flushes the live values named
//! by its deopt state into the context's save area, records the trap
//! reason and point index, and returns through the epilogue. Inline-cache
//! fast paths embed two patchable 32-bit immediates (expected shape, slot
//! index) that the IC machinery rewrites under the code-cache lock.

use rustc_hash::FxHashMap;

use aero_core::Value;

use crate::jit::backend::traits::{
    Backend, CallingConvention, CompiledCode, CompiledDeoptPoint, IcPatch, PatchPoint, SymbolInfo,
    TargetIsa,
};
use crate::jit::ir::{
    BlockId, CmpOp, DeoptId, DeoptLocals, DeoptReason, Instr, IrFunction, Reg, Terminator,
};
use crate::jit::opt::inline::INLINED_SITE;
use crate::jit::regalloc::{Allocation, Location, PhysReg};
use crate::jit::runtime::context::{
    trap, HelperTable, JitContext, DEOPT_SAVE_SLOTS, MAX_NATIVE_ARGS,
};
use crate::jit::CompileError;

// GPR encodings
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R12: u8 = 12;
const R13: u8 = 13;
/// Pinned: locals buffer
const LOCALS: u8 = 14;
/// Pinned: jit context
const CTX: u8 = 15;

/// Condition codes
mod cc {
    pub const O: u8 = 0x0;
    pub const B: u8 = 0x2;
    pub const AE: u8 = 0x3;
    pub const E: u8 = 0x4;
    pub const NE: u8 = 0x5;
    pub const A: u8 = 0x7;
    pub const P: u8 = 0xA;
    pub const NP: u8 = 0xB;
    pub const L: u8 = 0xC;
    pub const GE: u8 = 0xD;
    pub const LE: u8 = 0xE;
    pub const G: u8 = 0xF;
}

const UNDEFINED_BITS: u64 = {
    // Value::undefined() is const; mirror its bits for immediates
    Value::undefined().to_bits()
};

pub struct X64Backend;

impl X64Backend {
    pub fn new() -> Self {
        X64Backend
    }
}

impl Default for X64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for X64Backend {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn target(&self) -> TargetIsa {
        TargetIsa::X64
    }

    fn calling_convention(&self) -> CallingConvention {
        CallingConvention {
            arg_regs: vec![
                PhysReg(RDI),
                PhysReg(RSI),
                PhysReg(RDX),
                PhysReg(RCX),
                PhysReg(R8),
            ],
            ret_reg: PhysReg(RAX),
            allocatable: vec![PhysReg(RBX), PhysReg(R12), PhysReg(R13)],
        }
    }

    fn compile(
        &self,
        func: &IrFunction,
        alloc: &Allocation,
    ) -> Result<CompiledCode, CompileError> {
        Emitter::new(func, alloc).run()
    }

    fn flush_icache(&self, _ptr: *const u8, _len: usize) {
        // x86-64 keeps instruction fetch coherent with stores
    }
}

// ===== Raw instruction encoding =====

struct Asm {
    buf: Vec<u8>,
}

impl Asm {
    fn new() -> Self {
        Asm { buf: Vec::with_capacity(1024) }
    }

    fn pos(&self) -> u32 {
        self.buf.len() as u32
    }

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn imm32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn imm64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn rex(&mut self, w: bool, reg: u8, index: u8, rm: u8) {
        let mut b = 0x40u8;
        if w {
            b |= 8;
        }
        if reg >= 8 {
            b |= 4;
        }
        if index >= 8 {
            b |= 2;
        }
        if rm >= 8 {
            b |= 1;
        }
        if b != 0x40 || w {
            self.byte(b);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.byte((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// [base + disp32] addressing with mod=10 (SIB when base is rsp/r12)
    fn mem(&mut self, reg: u8, base: u8, disp: i32) {
        self.modrm(0b10, reg, base & 7);
        if base & 7 == 4 {
            self.byte(0x24); // SIB: no index, base in low bits
        }
        self.imm32(disp);
    }

    // --- moves ---

    fn push_r(&mut self, r: u8) {
        self.rex(false, 0, 0, r);
        self.byte(0x50 + (r & 7));
    }

    fn pop_r(&mut self, r: u8) {
        self.rex(false, 0, 0, r);
        self.byte(0x58 + (r & 7));
    }

    fn mov_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, src, 0, dst);
        self.byte(0x89);
        self.modrm(0b11, src, dst);
    }

    fn mov_r32_r32(&mut self, dst: u8, src: u8) {
        self.rex(false, src, 0, dst);
        self.byte(0x89);
        self.modrm(0b11, src, dst);
    }

    fn mov_ri(&mut self, dst: u8, imm: u64) {
        self.rex(true, 0, 0, dst);
        self.byte(0xB8 + (dst & 7));
        self.imm64(imm);
    }

    fn mov_r_m(&mut self, dst: u8, base: u8, disp: i32) {
        self.rex(true, dst, 0, base);
        self.byte(0x8B);
        self.mem(dst, base, disp);
    }

    fn mov_m_r(&mut self, base: u8, disp: i32, src: u8) {
        self.rex(true, src, 0, base);
        self.byte(0x89);
        self.mem(src, base, disp);
    }

    fn mov_r32_m(&mut self, dst: u8, base: u8, disp: i32) {
        self.rex(false, dst, 0, base);
        self.byte(0x8B);
        self.mem(dst, base, disp);
    }

    /// mov dword [base+disp], imm32
    fn mov_m32_imm(&mut self, base: u8, disp: i32, imm: i32) {
        self.rex(false, 0, 0, base);
        self.byte(0xC7);
        self.mem(0, base, disp);
        self.imm32(imm);
    }

    /// mov r32, [base + index*4] — shape-table indexed load
    fn mov_r32_sib4(&mut self, dst: u8, base: u8, index: u8) {
        self.rex(false, dst, index, base);
        self.byte(0x8B);
        self.modrm(0b10, dst, 0b100);
        self.byte((2 << 6) | ((index & 7) << 3) | (base & 7));
        self.imm32(0);
    }

    /// mov r32, imm32 — returns the offset of the immediate (patchable)
    fn mov_r32_imm_patchable(&mut self, dst: u8, imm: u32) -> u32 {
        self.rex(false, 0, 0, dst);
        self.byte(0xB8 + (dst & 7));
        let at = self.pos();
        self.imm32(imm as i32);
        at
    }

    fn movsxd(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, 0, src);
        self.byte(0x63);
        self.modrm(0b11, dst, src);
    }

    // --- arithmetic / logic ---

    fn add_r32_r32(&mut self, dst: u8, src: u8) {
        self.rex(false, src, 0, dst);
        self.byte(0x01);
        self.modrm(0b11, src, dst);
    }

    fn sub_r32_r32(&mut self, dst: u8, src: u8) {
        self.rex(false, src, 0, dst);
        self.byte(0x29);
        self.modrm(0b11, src, dst);
    }

    fn imul_r32_r32(&mut self, dst: u8, src: u8) {
        self.rex(false, dst, 0, src);
        self.byte(0x0F);
        self.byte(0xAF);
        self.modrm(0b11, dst, src);
    }

    fn and_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, src, 0, dst);
        self.byte(0x21);
        self.modrm(0b11, src, dst);
    }

    fn or_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, src, 0, dst);
        self.byte(0x09);
        self.modrm(0b11, src, dst);
    }

    fn shr_ri(&mut self, r: u8, imm: u8) {
        self.rex(true, 0, 0, r);
        self.byte(0xC1);
        self.modrm(0b11, 5, r);
        self.byte(imm);
    }

    fn shl_r32_i(&mut self, r: u8, imm: u8) {
        self.rex(false, 0, 0, r);
        self.byte(0xC1);
        self.modrm(0b11, 4, r);
        self.byte(imm);
    }

    fn sub_rsp(&mut self, imm: i32) {
        self.rex(true, 0, 0, RSP);
        self.byte(0x81);
        self.modrm(0b11, 5, RSP);
        self.imm32(imm);
    }

    /// lea rsp, [rbp - disp]
    fn lea_rsp_rbp(&mut self, disp: i32) {
        self.rex(true, RSP, 0, RBP);
        self.byte(0x8D);
        self.mem(RSP, RBP, -disp);
    }

    // --- compare / test ---

    fn cmp_r32_r32(&mut self, a: u8, b: u8) {
        self.rex(false, b, 0, a);
        self.byte(0x39);
        self.modrm(0b11, b, a);
    }

    fn cmp_r32_imm(&mut self, r: u8, imm: i32) {
        self.rex(false, 0, 0, r);
        self.byte(0x81);
        self.modrm(0b11, 7, r);
        self.imm32(imm);
    }

    /// cmp r32, imm32 returning the immediate offset (patchable)
    fn cmp_r32_imm_patchable(&mut self, r: u8, imm: u32) -> u32 {
        self.rex(false, 0, 0, r);
        self.byte(0x81);
        self.modrm(0b11, 7, r);
        let at = self.pos();
        self.imm32(imm as i32);
        at
    }

    fn cmp_m32_imm(&mut self, base: u8, disp: i32, imm: i32) {
        self.rex(false, 0, 0, base);
        self.byte(0x81);
        self.mem(7, base, disp);
        self.imm32(imm);
    }

    fn test_r32_r32(&mut self, a: u8, b: u8) {
        self.rex(false, b, 0, a);
        self.byte(0x85);
        self.modrm(0b11, b, a);
    }

    fn test_rr(&mut self, a: u8, b: u8) {
        self.rex(true, b, 0, a);
        self.byte(0x85);
        self.modrm(0b11, b, a);
    }

    /// setcc into al/cl (r must be rax or rcx)
    fn setcc(&mut self, cond: u8, r: u8) {
        debug_assert!(r < 4);
        self.byte(0x0F);
        self.byte(0x90 + cond);
        self.modrm(0b11, 0, r);
    }

    fn movzx_r32_r8(&mut self, dst: u8, src: u8) {
        debug_assert!(src < 4);
        self.rex(false, dst, 0, src);
        self.byte(0x0F);
        self.byte(0xB6);
        self.modrm(0b11, dst, src);
    }

    // --- SSE2 ---

    fn movq_x_r(&mut self, xmm: u8, r: u8) {
        self.byte(0x66);
        self.rex(true, xmm, 0, r);
        self.byte(0x0F);
        self.byte(0x6E);
        self.modrm(0b11, xmm, r);
    }

    fn movq_r_x(&mut self, r: u8, xmm: u8) {
        self.byte(0x66);
        self.rex(true, xmm, 0, r);
        self.byte(0x0F);
        self.byte(0x7E);
        self.modrm(0b11, xmm, r);
    }

    fn sse_op(&mut self, op: u8, dst: u8, src: u8) {
        self.byte(0xF2);
        self.byte(0x0F);
        self.byte(op);
        self.modrm(0b11, dst, src);
    }

    fn ucomisd(&mut self, a: u8, b: u8) {
        self.byte(0x66);
        self.byte(0x0F);
        self.byte(0x2E);
        self.modrm(0b11, a, b);
    }

    fn cvtsi2sd(&mut self, xmm: u8, r: u8) {
        self.byte(0xF2);
        self.rex(true, xmm, 0, r);
        self.byte(0x0F);
        self.byte(0x2A);
        self.modrm(0b11, xmm, r);
    }

    // --- control flow ---

    /// jcc rel32; returns the fixup position of the displacement
    fn jcc(&mut self, cond: u8) -> u32 {
        self.byte(0x0F);
        self.byte(0x80 + cond);
        let at = self.pos();
        self.imm32(0);
        at
    }

    fn jmp(&mut self) -> u32 {
        self.byte(0xE9);
        let at = self.pos();
        self.imm32(0);
        at
    }

    fn call_m(&mut self, base: u8, disp: i32) {
        self.rex(false, 0, 0, base);
        self.byte(0xFF);
        self.mem(2, base, disp);
    }

    fn ret(&mut self) {
        self.byte(0xC3);
    }

    fn patch_rel32(&mut self, at: u32, target: u32) {
        let rel = target as i64 - (at as i64 + 4);
        self.buf[at as usize..at as usize + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }
}

// ===== Context field offsets =====

fn off_this() -> i32 {
    std::mem::offset_of!(JitContext, this_value) as i32
}
fn off_trap() -> i32 {
    std::mem::offset_of!(JitContext, trap) as i32
}
fn off_deopt_index() -> i32 {
    std::mem::offset_of!(JitContext, deopt_index) as i32
}
fn off_error() -> i32 {
    std::mem::offset_of!(JitContext, error) as i32
}
fn off_interrupt() -> i32 {
    std::mem::offset_of!(JitContext, interrupt) as i32
}
fn off_shape_ids() -> i32 {
    std::mem::offset_of!(JitContext, shape_ids_ptr) as i32
}
fn off_deopt_save(slot: u32) -> i32 {
    (std::mem::offset_of!(JitContext, deopt_save) + slot as usize * 8) as i32
}
fn off_call_arg(i: usize) -> i32 {
    (std::mem::offset_of!(JitContext, call_args) + i * 8) as i32
}
fn helper_off(field: usize) -> i32 {
    (std::mem::offset_of!(JitContext, helpers) + field) as i32
}

macro_rules! helper {
    ($name:ident) => {
        helper_off(std::mem::offset_of!(HelperTable, $name))
    };
}

// ===== The emitter =====

struct Emitter<'a> {
    func: &'a IrFunction,
    alloc: &'a Allocation,
    asm: Asm,
    /// Block label offsets (by block index)
    labels: FxHashMap<BlockId, u32>,
    /// (fixup position, target block)
    block_fixups: Vec<(u32, BlockId)>,
    /// Fixups to the shared bail path
    bail_fixups: Vec<u32>,
    /// Fixups to the epilogue
    epilogue_fixups: Vec<u32>,
    /// Deopt stub requests: (deopt id, reason) → fixup positions
    deopt_fixups: FxHashMap<(DeoptId, u32), Vec<u32>>,
    deopt_points: Vec<CompiledDeoptPoint>,
    patch_points: Vec<PatchPoint>,
    ic_sites: FxHashMap<u32, IcPatch>,
    symbols: Vec<SymbolInfo>,
    saved: Vec<u8>,
}

impl<'a> Emitter<'a> {
    fn new(func: &'a IrFunction, alloc: &'a Allocation) -> Self {
        let mut saved: Vec<u8> = alloc.callee_saved_used.iter().map(|p| p.0).collect();
        saved.push(LOCALS);
        saved.push(CTX);
        Emitter {
            func,
            alloc,
            asm: Asm::new(),
            labels: FxHashMap::default(),
            block_fixups: Vec::new(),
            bail_fixups: Vec::new(),
            epilogue_fixups: Vec::new(),
            deopt_fixups: FxHashMap::default(),
            deopt_points: Vec::new(),
            patch_points: Vec::new(),
            ic_sites: FxHashMap::default(),
            symbols: Vec::new(),
            saved,
        }
    }

    fn spill_disp(&self, slot: u32) -> i32 {
        -((self.saved.len() as i32 + 1 + slot as i32) * 8)
    }

    fn frame_size(&self) -> i32 {
        let spill = self.alloc.spill_slots as i32 * 8;
        if (self.saved.len() as i32 * 8 + spill) % 16 == 0 {
            spill
        } else {
            spill + 8
        }
    }

    fn location(&self, reg: Reg) -> Result<Location, CompileError> {
        self.alloc
            .location(reg)
            .ok_or_else(|| CompileError::Internal(format!("no location for {reg}")))
    }

    /// Fetch an IR value into a machine register
    fn load(&mut self, gpr: u8, reg: Reg) -> Result<(), CompileError> {
        match self.location(reg)? {
            Location::Reg(p) => {
                if p.0 != gpr {
                    self.asm.mov_rr(gpr, p.0);
                }
            }
            Location::Stack(s) => {
                let disp = self.spill_disp(s);
                self.asm.mov_r_m(gpr, RBP, disp);
            }
        }
        Ok(())
    }

    /// Store a machine register into an IR value's home
    fn store(&mut self, reg: Reg, gpr: u8) -> Result<(), CompileError> {
        match self.location(reg)? {
            Location::Reg(p) => {
                if p.0 != gpr {
                    self.asm.mov_rr(p.0, gpr);
                }
            }
            Location::Stack(s) => {
                let disp = self.spill_disp(s);
                self.asm.mov_m_r(RBP, disp, gpr);
            }
        }
        Ok(())
    }

    fn run(mut self) -> Result<CompiledCode, CompileError> {
        self.check_limits()?;
        self.prologue();

        for bi in 0..self.alloc.block_order.len() {
            let block_id = self.alloc.block_order[bi];
            self.labels.insert(block_id, self.asm.pos());
            self.symbols.push(SymbolInfo {
                name: format!("{block_id}"),
                offset: self.asm.pos(),
            });

            let block = self.func.block(block_id);
            for instr in &block.instrs {
                self.lower(instr)?;
            }
            let next = self.alloc.block_order.get(bi + 1).copied();
            self.terminator(block_id, block.terminator, next)?;
        }

        self.emit_deopt_stubs()?;
        self.emit_bail();
        self.emit_epilogue();

        // Resolve block fixups
        let fixups = std::mem::take(&mut self.block_fixups);
        for (at, target) in fixups {
            let Some(&label) = self.labels.get(&target) else {
                return Err(CompileError::Internal(format!(
                    "branch to unemitted block {target}"
                )));
            };
            self.asm.patch_rel32(at, label);
        }

        Ok(CompiledCode {
            code: self.asm.buf,
            entry_offset: 0,
            patch_points: self.patch_points,
            ic_sites: self.ic_sites,
            deopt_points: self.deopt_points,
            symbols: self.symbols,
            synth_strings: self.func.synth_strings.clone(),
            osr_offset: self.func.osr_offset,
        })
    }

    fn check_limits(&self) -> Result<(), CompileError> {
        for state in &self.func.deopt_states {
            let regs: usize = state
                .frames
                .iter()
                .map(|f| {
                    f.stack.len()
                        + f.this.is_some() as usize
                        + match &f.locals {
                            DeoptLocals::Regs(r) => r.len(),
                            DeoptLocals::Buffer => 0,
                        }
                })
                .sum();
            if regs > DEOPT_SAVE_SLOTS {
                return Err(CompileError::Unsupported(
                    "deopt state exceeds the save area".into(),
                ));
            }
        }
        for block in &self.func.blocks {
            for instr in &block.instrs {
                if let Instr::Call { args, .. } = instr {
                    if args.len() > MAX_NATIVE_ARGS - 1 {
                        return Err(CompileError::Unsupported(
                            "call arity exceeds the native argument buffer".into(),
                        ));
                    }
                }
                if let Instr::NewArray { elems, .. } = instr {
                    if elems.len() > MAX_NATIVE_ARGS {
                        return Err(CompileError::Unsupported(
                            "array literal exceeds the native argument buffer".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn prologue(&mut self) {
        self.asm.push_r(RBP);
        self.asm.mov_rr(RBP, RSP);
        let saved = self.saved.clone();
        for r in saved {
            self.asm.push_r(r);
        }
        let frame = self.frame_size();
        if frame > 0 {
            self.asm.sub_rsp(frame);
        }
        // Arguments: rdi = locals, rsi = ctx
        self.asm.mov_rr(LOCALS, RDI);
        self.asm.mov_rr(CTX, RSI);
    }

    fn emit_epilogue(&mut self) {
        let at = self.asm.pos();
        let fixups = std::mem::take(&mut self.epilogue_fixups);
        for f in fixups {
            self.asm.patch_rel32(f, at);
        }
        self.asm.lea_rsp_rbp(self.saved.len() as i32 * 8);
        let saved = self.saved.clone();
        for r in saved.into_iter().rev() {
            self.asm.pop_r(r);
        }
        self.asm.pop_r(RBP);
        self.asm.ret();
    }

    /// Shared error-bail path: helpers already recorded the error; hand
    /// back undefined and let the dispatcher surface it
    fn emit_bail(&mut self) {
        if self.bail_fixups.is_empty() {
            return;
        }
        let at = self.asm.pos();
        let fixups = std::mem::take(&mut self.bail_fixups);
        for f in fixups {
            self.asm.patch_rel32(f, at);
        }
        self.asm.mov_ri(RAX, UNDEFINED_BITS);
        let f = self.asm.jmp();
        self.epilogue_fixups.push(f);
    }

    /// After a fallible helper call: bail out if the error flag is set
    fn check_error(&mut self) {
        self.asm.cmp_m32_imm(CTX, off_error(), 0);
        let f = self.asm.jcc(cc::NE);
        self.bail_fixups.push(f);
    }

    fn deopt_to(&mut self, cond: u8, deopt: DeoptId, reason: u32) {
        let f = self.asm.jcc(cond);
        self.deopt_fixups.entry((deopt, reason)).or_default().push(f);
    }

    // --- helper call plumbing ---

    fn helper_call0(&mut self, table_off: i32) {
        self.asm.mov_rr(RDI, CTX);
        self.asm.call_m(CTX, table_off);
    }

    fn arg_u32(&mut self, arg_reg: u8, v: u32) {
        self.asm.mov_r32_imm_patchable(arg_reg, v);
    }

    fn arg_val(&mut self, arg_reg: u8, reg: Reg) -> Result<(), CompileError> {
        self.load(arg_reg, reg)
    }

    // --- lowering ---

    fn lower(&mut self, instr: &Instr) -> Result<(), CompileError> {
        match instr {
            Instr::ConstInt { dest, value } => {
                self.asm.mov_ri(RAX, Value::integer(*value).to_bits());
                self.store(*dest, RAX)?;
            }
            Instr::ConstNum { dest, value } => {
                self.asm.mov_ri(RAX, Value::number(*value).to_bits());
                self.store(*dest, RAX)?;
            }
            Instr::ConstBool { dest, value } => {
                self.asm.mov_ri(RAX, Value::boolean(*value).to_bits());
                self.store(*dest, RAX)?;
            }
            Instr::ConstUndef { dest } => {
                self.asm.mov_ri(RAX, UNDEFINED_BITS);
                self.store(*dest, RAX)?;
            }
            Instr::ConstNull { dest } => {
                self.asm.mov_ri(RAX, Value::null().to_bits());
                self.store(*dest, RAX)?;
            }
            Instr::ConstPool { dest, index } => {
                self.arg_u32(RSI, *index as u32);
                self.helper_call0(helper!(const_pool));
                self.check_error();
                self.store(*dest, RAX)?;
            }

            Instr::LoadLocal { dest, index } => {
                self.asm.mov_r_m(RAX, LOCALS, *index as i32 * 8);
                self.store(*dest, RAX)?;
            }
            Instr::StoreLocal { index, value } => {
                self.load(RAX, *value)?;
                self.asm.mov_m_r(LOCALS, *index as i32 * 8, RAX);
            }
            Instr::LoadThis { dest } => {
                self.asm.mov_r_m(RAX, CTX, off_this());
                self.store(*dest, RAX)?;
            }
            Instr::Move { dest, src } => {
                self.load(RAX, *src)?;
                self.store(*dest, RAX)?;
            }

            Instr::Binary {
                op,
                dest,
                left,
                right,
                site,
                ..
            } => {
                self.arg_u32(RSI, *op as u32);
                self.arg_val(RDX, *left)?;
                self.arg_val(RCX, *right)?;
                self.arg_u32(R8, *site);
                self.helper_call0(helper!(binary_op));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::Compare {
                op,
                dest,
                left,
                right,
                site,
                ..
            } => {
                self.arg_u32(RSI, *op as u32);
                self.arg_val(RDX, *left)?;
                self.arg_val(RCX, *right)?;
                self.arg_u32(R8, *site);
                self.helper_call0(helper!(compare_op));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::Neg { dest, operand } => {
                self.arg_val(RSI, *operand)?;
                self.helper_call0(helper!(neg));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::Not { dest, operand } => {
                self.arg_val(RSI, *operand)?;
                self.helper_call0(helper!(not));
                self.store(*dest, RAX)?;
            }
            Instr::IsTruthy { dest, src } => {
                self.arg_val(RSI, *src)?;
                self.helper_call0(helper!(is_truthy));
                self.store(*dest, RAX)?;
            }
            Instr::Typeof { dest, operand } => {
                self.arg_val(RSI, *operand)?;
                self.helper_call0(helper!(type_of));
                self.store(*dest, RAX)?;
            }
            Instr::InstanceOf { dest, value, ctor } => {
                self.arg_val(RSI, *value)?;
                self.arg_val(RDX, *ctor)?;
                self.helper_call0(helper!(instance_of));
                self.check_error();
                self.store(*dest, RAX)?;
            }

            // --- specialized integer arithmetic (raw i32) ---
            Instr::IntAdd {
                dest,
                left,
                right,
                deopt,
            } => {
                self.load(RAX, *left)?;
                self.load(RCX, *right)?;
                self.asm.add_r32_r32(RAX, RCX);
                self.deopt_to(cc::O, *deopt, trap::NUMERIC_OVERFLOW);
                self.asm.movsxd(RAX, RAX);
                self.store(*dest, RAX)?;
            }
            Instr::IntSub {
                dest,
                left,
                right,
                deopt,
            } => {
                self.load(RAX, *left)?;
                self.load(RCX, *right)?;
                self.asm.sub_r32_r32(RAX, RCX);
                self.deopt_to(cc::O, *deopt, trap::NUMERIC_OVERFLOW);
                self.asm.movsxd(RAX, RAX);
                self.store(*dest, RAX)?;
            }
            Instr::IntMul {
                dest,
                left,
                right,
                deopt,
            } => {
                self.load(RAX, *left)?;
                self.load(RCX, *right)?;
                self.asm.imul_r32_r32(RAX, RCX);
                self.deopt_to(cc::O, *deopt, trap::NUMERIC_OVERFLOW);
                self.asm.movsxd(RAX, RAX);
                self.store(*dest, RAX)?;
            }
            Instr::IntShl { dest, left, amount } => {
                self.load(RAX, *left)?;
                self.asm.shl_r32_i(RAX, *amount);
                self.asm.movsxd(RAX, RAX);
                self.store(*dest, RAX)?;
            }
            Instr::IntCmp {
                op,
                dest,
                left,
                right,
            } => {
                self.load(RAX, *left)?;
                self.load(RCX, *right)?;
                self.asm.cmp_r32_r32(RAX, RCX);
                let cond = match op {
                    CmpOp::Eq | CmpOp::StrictEq => cc::E,
                    CmpOp::Ne | CmpOp::StrictNe => cc::NE,
                    CmpOp::Lt => cc::L,
                    CmpOp::Le => cc::LE,
                    CmpOp::Gt => cc::G,
                    CmpOp::Ge => cc::GE,
                };
                self.asm.setcc(cond, RAX);
                self.asm.movzx_r32_r8(RAX, RAX);
                self.store(*dest, RAX)?;
            }

            // --- specialized double arithmetic (raw f64 bits) ---
            Instr::NumAdd { dest, left, right } => self.num_arith(0x58, *dest, *left, *right)?,
            Instr::NumSub { dest, left, right } => self.num_arith(0x5C, *dest, *left, *right)?,
            Instr::NumMul { dest, left, right } => self.num_arith(0x59, *dest, *left, *right)?,
            Instr::NumDiv { dest, left, right } => self.num_arith(0x5E, *dest, *left, *right)?,
            Instr::NumCmp {
                op,
                dest,
                left,
                right,
            } => {
                self.load(RAX, *left)?;
                self.asm.movq_x_r(0, RAX);
                self.load(RAX, *right)?;
                self.asm.movq_x_r(1, RAX);
                match op {
                    CmpOp::Lt => {
                        // a < b  ≡  b > a, false on NaN via CF=0 ∧ ZF=0
                        self.asm.ucomisd(1, 0);
                        self.asm.setcc(cc::A, RAX);
                        self.asm.movzx_r32_r8(RAX, RAX);
                    }
                    CmpOp::Le => {
                        self.asm.ucomisd(1, 0);
                        self.asm.setcc(cc::AE, RAX);
                        self.asm.movzx_r32_r8(RAX, RAX);
                    }
                    CmpOp::Gt => {
                        self.asm.ucomisd(0, 1);
                        self.asm.setcc(cc::A, RAX);
                        self.asm.movzx_r32_r8(RAX, RAX);
                    }
                    CmpOp::Ge => {
                        self.asm.ucomisd(0, 1);
                        self.asm.setcc(cc::AE, RAX);
                        self.asm.movzx_r32_r8(RAX, RAX);
                    }
                    CmpOp::Eq | CmpOp::StrictEq => {
                        // equal ≡ ZF=1 ∧ PF=0
                        self.asm.ucomisd(0, 1);
                        self.asm.setcc(cc::E, RAX);
                        self.asm.setcc(cc::NP, RCX);
                        self.asm.movzx_r32_r8(RAX, RAX);
                        self.asm.movzx_r32_r8(RCX, RCX);
                        self.asm.and_rr(RAX, RCX);
                    }
                    CmpOp::Ne | CmpOp::StrictNe => {
                        self.asm.ucomisd(0, 1);
                        self.asm.setcc(cc::NE, RAX);
                        self.asm.setcc(cc::P, RCX);
                        self.asm.movzx_r32_r8(RAX, RAX);
                        self.asm.movzx_r32_r8(RCX, RCX);
                        self.asm.or_rr(RAX, RCX);
                    }
                }
                self.store(*dest, RAX)?;
            }

            // --- guards ---
            Instr::GuardInt { value, deopt } => {
                self.load(RAX, *value)?;
                self.asm.mov_rr(RCX, RAX);
                self.asm.shr_ri(RCX, 48);
                self.asm.cmp_r32_imm(RCX, 0xFFF9);
                self.deopt_to(cc::NE, *deopt, trap::TYPE_CHECK_FAILED);
            }
            Instr::GuardNumber { value, deopt } => {
                self.load(RAX, *value)?;
                self.asm.mov_rr(RCX, RAX);
                self.asm.shr_ri(RCX, 48);
                // doubles: upper16 < 0xFFF8; SMIs: == 0xFFF9
                self.asm.cmp_r32_imm(RCX, 0xFFF8);
                let ok = self.asm.jcc(cc::B);
                self.asm.cmp_r32_imm(RCX, 0xFFF9);
                self.deopt_to(cc::NE, *deopt, trap::TYPE_CHECK_FAILED);
                let here = self.asm.pos();
                self.asm.patch_rel32(ok, here);
            }
            Instr::GuardShape {
                object,
                shape,
                deopt,
            } => {
                self.load(RAX, *object)?;
                self.asm.mov_rr(RCX, RAX);
                self.asm.shr_ri(RCX, 48);
                self.asm.cmp_r32_imm(RCX, 0xFFF8);
                self.deopt_to(cc::NE, *deopt, trap::TYPE_CHECK_FAILED);
                self.asm.mov_r32_r32(RCX, RAX); // object id
                self.asm.mov_r_m(RDX, CTX, off_shape_ids());
                self.asm.mov_r32_sib4(RDX, RDX, RCX);
                self.asm.cmp_r32_imm(RDX, shape.0 as i32);
                self.deopt_to(cc::NE, *deopt, trap::TYPE_CHECK_FAILED);
            }

            // --- representation changes ---
            Instr::UnboxInt { dest, src } => {
                self.load(RAX, *src)?;
                self.asm.movsxd(RAX, RAX);
                self.store(*dest, RAX)?;
            }
            Instr::UnboxNum { dest, src } => {
                self.load(RAX, *src)?;
                self.asm.mov_rr(RCX, RAX);
                self.asm.shr_ri(RCX, 48);
                self.asm.cmp_r32_imm(RCX, 0xFFF9);
                let dbl = self.asm.jcc(cc::NE);
                // SMI: sign-extend and convert
                self.asm.movsxd(RAX, RAX);
                self.asm.cvtsi2sd(0, RAX);
                self.asm.movq_r_x(RAX, 0);
                let done = self.asm.jmp();
                let here = self.asm.pos();
                self.asm.patch_rel32(dbl, here);
                // double: bits pass through
                let end = self.asm.pos();
                self.asm.patch_rel32(done, end);
                self.store(*dest, RAX)?;
            }
            Instr::BoxInt { dest, src } => {
                self.load(RAX, *src)?;
                self.asm.mov_ri(RCX, 0x0000_FFFF_FFFF_FFFF);
                self.asm.and_rr(RAX, RCX);
                self.asm.mov_ri(RCX, Value::integer(0).to_bits());
                self.asm.or_rr(RAX, RCX);
                self.store(*dest, RAX)?;
            }
            Instr::BoxNum { dest, src } => {
                self.load(RAX, *src)?;
                // Canonicalize NaN: the hardware's negative quiet NaN
                // would alias the tag space
                self.asm.movq_x_r(0, RAX);
                self.asm.ucomisd(0, 0);
                let ok = self.asm.jcc(cc::NP);
                self.asm.mov_ri(RAX, Value::number(f64::NAN).to_bits());
                let here = self.asm.pos();
                self.asm.patch_rel32(ok, here);
                self.store(*dest, RAX)?;
            }
            Instr::BoxBool { dest, src } => {
                self.load(RAX, *src)?;
                self.asm.mov_ri(RCX, Value::boolean(false).to_bits());
                self.asm.or_rr(RAX, RCX);
                self.store(*dest, RAX)?;
            }

            // --- memory ---
            Instr::GetProp {
                dest,
                object,
                name,
                site,
            } => {
                self.lower_get_prop(*dest, *object, *name, *site)?;
            }
            Instr::SetProp {
                object,
                name,
                value,
                site,
            } => {
                self.arg_val(RSI, *object)?;
                self.arg_u32(RDX, *name as u32);
                self.arg_val(RCX, *value)?;
                self.arg_u32(R8, *site);
                self.helper_call0(helper!(set_prop));
                self.check_error();
            }
            Instr::GetElem {
                dest,
                object,
                index,
                ..
            } => {
                self.arg_val(RSI, *object)?;
                self.arg_val(RDX, *index)?;
                self.helper_call0(helper!(get_elem));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::SetElem {
                object,
                index,
                value,
                ..
            } => {
                self.arg_val(RSI, *object)?;
                self.arg_val(RDX, *index)?;
                self.arg_val(RCX, *value)?;
                self.helper_call0(helper!(set_elem));
                self.check_error();
            }
            Instr::LoadGlobal { dest, name, .. } => {
                self.arg_u32(RSI, *name as u32);
                self.helper_call0(helper!(load_global));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::StoreGlobal { name, value, .. } => {
                self.arg_u32(RSI, *name as u32);
                self.arg_val(RDX, *value)?;
                self.helper_call0(helper!(store_global));
                self.check_error();
            }

            // --- calls and allocation ---
            Instr::Call {
                dest,
                callee,
                this,
                args,
                ..
            } => {
                for (i, arg) in args.iter().enumerate() {
                    self.load(RAX, *arg)?;
                    self.asm.mov_m_r(CTX, off_call_arg(i), RAX);
                }
                self.arg_val(RSI, *callee)?;
                match this {
                    Some(t) => self.arg_val(RDX, *t)?,
                    None => self.asm.mov_ri(RDX, UNDEFINED_BITS),
                }
                self.arg_u32(RCX, args.len() as u32);
                self.helper_call0(helper!(call));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::NewObject { dest } => {
                self.helper_call0(helper!(new_object));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::NewArray { dest, elems } => {
                for (i, e) in elems.iter().enumerate() {
                    self.load(RAX, *e)?;
                    self.asm.mov_m_r(CTX, off_call_arg(i), RAX);
                }
                self.arg_u32(RSI, elems.len() as u32);
                self.helper_call0(helper!(new_array));
                self.check_error();
                self.store(*dest, RAX)?;
            }
            Instr::MakeFunction { dest, index } => {
                self.arg_u32(RSI, *index as u32);
                self.helper_call0(helper!(make_function));
                self.check_error();
                self.store(*dest, RAX)?;
            }

            Instr::Phi { .. } => {
                // Resolved as moves on the incoming edges
            }
            Instr::Safepoint { .. } => {
                self.asm.cmp_m32_imm(CTX, off_interrupt(), 0);
                let skip = self.asm.jcc(cc::E);
                self.helper_call0(helper!(safepoint));
                self.check_error();
                let here = self.asm.pos();
                self.asm.patch_rel32(skip, here);
            }
        }
        Ok(())
    }

    fn num_arith(&mut self, op: u8, dest: Reg, left: Reg, right: Reg) -> Result<(), CompileError> {
        self.load(RAX, left)?;
        self.asm.movq_x_r(0, RAX);
        self.load(RAX, right)?;
        self.asm.movq_x_r(1, RAX);
        self.asm.sse_op(op, 0, 1);
        self.asm.movq_r_x(RAX, 0);
        self.store(dest, RAX)?;
        Ok(())
    }

    /// Property load with a patchable monomorphic inline-cache fast path
    fn lower_get_prop(
        &mut self,
        dest: Reg,
        object: Reg,
        name: u16,
        site: u32,
    ) -> Result<(), CompileError> {
        if site == INLINED_SITE {
            // No cache identity: generic path only
            self.arg_val(RSI, object)?;
            self.arg_u32(RDX, name as u32);
            self.arg_u32(RCX, site);
            self.helper_call0(helper!(get_prop));
            self.check_error();
            self.store(dest, RAX)?;
            return Ok(());
        }

        let slab_start = self.asm.pos();
        self.load(RAX, object)?;
        // Heap-tagged?
        self.asm.mov_rr(RCX, RAX);
        self.asm.shr_ri(RCX, 48);
        self.asm.cmp_r32_imm(RCX, 0xFFF8);
        let generic1 = self.asm.jcc(cc::NE);
        // Shape from the side table
        self.asm.mov_r32_r32(RCX, RAX);
        self.asm.mov_r_m(RDX, CTX, off_shape_ids());
        self.asm.test_rr(RDX, RDX);
        let generic2 = self.asm.jcc(cc::E);
        self.asm.mov_r32_sib4(RDX, RDX, RCX);
        // Patchable: expected shape (miss sentinel until the site goes
        // monomorphic)
        let shape_imm = self.asm.cmp_r32_imm_patchable(RDX, u32::MAX);
        let generic3 = self.asm.jcc(cc::NE);
        // Patchable: slot index
        let slot_imm = self.asm.mov_r32_imm_patchable(RSI, 0);
        self.asm.mov_rr(RDX, RAX);
        self.asm.mov_rr(RDI, CTX);
        self.asm.call_m(CTX, helper!(get_slot));
        let done = self.asm.jmp();

        // Generic path
        let generic = self.asm.pos();
        for f in [generic1, generic2, generic3] {
            self.asm.patch_rel32(f, generic);
        }
        self.load(RSI, object)?;
        self.arg_u32(RDX, name as u32);
        self.arg_u32(RCX, site);
        self.helper_call0(helper!(get_prop));
        self.check_error();

        let end = self.asm.pos();
        self.asm.patch_rel32(done, end);
        self.store(dest, RAX)?;

        self.patch_points.push(PatchPoint {
            offset: slab_start,
            length: end - slab_start,
            name: format!("ic_load_{site}"),
        });
        self.ic_sites.insert(site, IcPatch { shape_imm, slot_imm });
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
                self.edge_moves(block, target)?;
                if next != Some(target) {
                    let f = self.asm.jmp();
                    self.block_fixups.push((f, target));
                }
            }
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                self.load(RAX, cond)?;
                self.asm.test_r32_r32(RAX, RAX);
                let then_has = self.has_phis(then_block);
                let else_has = self.has_phis(else_block);
                if !then_has && !else_has {
                    let f = self.asm.jcc(cc::NE);
                    self.block_fixups.push((f, then_block));
                    if next != Some(else_block) {
                        let f2 = self.asm.jmp();
                        self.block_fixups.push((f2, else_block));
                    }
                } else {
                    let to_then = self.asm.jcc(cc::NE);
                    self.edge_moves(block, else_block)?;
                    let f2 = self.asm.jmp();
                    self.block_fixups.push((f2, else_block));
                    let here = self.asm.pos();
                    self.asm.patch_rel32(to_then, here);
                    self.edge_moves(block, then_block)?;
                    let f3 = self.asm.jmp();
                    self.block_fixups.push((f3, then_block));
                }
            }
            Terminator::Return(r) => {
                self.load(RAX, r)?;
                let f = self.asm.jmp();
                self.epilogue_fixups.push(f);
            }
            Terminator::Deopt(id) => {
                // Unconditional bailout of an unsupported region
                let f = self.asm.jmp();
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

    /// Materialize φ moves for the edge `pred → succ`
    fn edge_moves(&mut self, pred: BlockId, succ: BlockId) -> Result<(), CompileError> {
        let mut moves: Vec<(Location, Location)> = Vec::new();
        for instr in &self.func.block(succ).instrs {
            if let Instr::Phi { dest, inputs } = instr {
                for (p, src) in inputs {
                    if *p == pred {
                        let from = self.location(*src)?;
                        let to = self.location(*dest)?;
                        if from != to {
                            moves.push((to, from));
                        }
                    }
                }
            }
        }
        if moves.is_empty() {
            return Ok(());
        }
        // Sequentialize the parallel move set: emit moves whose target no
        // pending move still reads; cycles are broken by stashing one
        // source in rcx and finishing that move last.
        #[derive(Clone, Copy, PartialEq)]
        enum Src {
            Loc(Location),
            Scratch,
        }
        let mut pending: Vec<(Location, Src)> =
            moves.into_iter().map(|(to, from)| (to, Src::Loc(from))).collect();
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|(to, _)| !pending.iter().any(|(_, s)| *s == Src::Loc(*to)));
            match ready {
                Some(i) => {
                    let (to, src) = pending.remove(i);
                    match src {
                        Src::Loc(from) => self.loc_move(to, from),
                        Src::Scratch => self.loc_store(to, RCX),
                    }
                }
                None => {
                    // Pure cycle: capture the first source and mark it
                    let (_, src) = pending[0];
                    if let Src::Loc(from) = src {
                        self.loc_load(RCX, from);
                    }
                    pending[0].1 = Src::Scratch;
                }
            }
        }
        Ok(())
    }

    fn loc_move(&mut self, to: Location, from: Location) {
        self.loc_load(RAX, from);
        self.loc_store(to, RAX);
    }

    fn loc_load(&mut self, gpr: u8, loc: Location) {
        match loc {
            Location::Reg(p) => {
                if p.0 != gpr {
                    self.asm.mov_rr(gpr, p.0);
                }
            }
            Location::Stack(s) => {
                let d = self.spill_disp(s);
                self.asm.mov_r_m(gpr, RBP, d);
            }
        }
    }

    fn loc_store(&mut self, loc: Location, gpr: u8) {
        match loc {
            Location::Reg(p) => {
                if p.0 != gpr {
                    self.asm.mov_rr(p.0, gpr);
                }
            }
            Location::Stack(s) => {
                let d = self.spill_disp(s);
                self.asm.mov_m_r(RBP, d, gpr);
            }
        }
    }

    /// Emit one exit stub per (deopt state, reason) pair in use
    fn emit_deopt_stubs(&mut self) -> Result<(), CompileError> {
        let mut pending: Vec<((DeoptId, u32), Vec<u32>)> =
            std::mem::take(&mut self.deopt_fixups).into_iter().collect();
        pending.sort_by_key(|((id, reason), _)| (id.0, *reason));

        for ((deopt, reason_code), fixups) in pending {
            let stub = self.asm.pos();
            for f in fixups {
                self.asm.patch_rel32(f, stub);
            }
            let state = self
                .func
                .deopt_states
                .get(deopt.0 as usize)
                .cloned()
                .ok_or_else(|| CompileError::Internal("dangling deopt id".into()))?;

            // Park every live value in the save area, in a deterministic
            // order the deoptimizer can replay
            let mut save_slots: FxHashMap<Reg, u32> = FxHashMap::default();
            let mut next = 0u32;
            for frame in &state.frames {
                let mut regs: Vec<Reg> = frame.stack.clone();
                regs.extend(frame.this.iter().copied());
                if let DeoptLocals::Regs(locals) = &frame.locals {
                    regs.extend(locals.iter().copied());
                }
                for r in regs {
                    if save_slots.contains_key(&r) {
                        continue;
                    }
                    self.load(RAX, r)?;
                    self.asm.mov_m_r(CTX, off_deopt_save(next), RAX);
                    save_slots.insert(r, next);
                    next += 1;
                }
            }

            let point_index = self.deopt_points.len() as u32;
            self.asm.mov_m32_imm(CTX, off_trap(), reason_code as i32);
            self.asm
                .mov_m32_imm(CTX, off_deopt_index(), point_index as i32);
            self.asm.mov_ri(RAX, UNDEFINED_BITS);
            let f = self.asm.jmp();
            self.epilogue_fixups.push(f);

            let reason = match reason_code {
                trap::NUMERIC_OVERFLOW => DeoptReason::NumericOverflow,
                trap::BAILOUT_REQUESTED => DeoptReason::BailoutRequested,
                trap::DEBUGGER_ATTACHED => DeoptReason::DebuggerAttached,
                trap::TYPE_CHECK_FAILED => DeoptReason::TypeCheckFailed,
                _ => DeoptReason::TypeFeedback,
            };
            self.deopt_points.push(CompiledDeoptPoint {
                state,
                reason,
                save_slots,
                code_offset: stub,
            });
        }
        Ok(())
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

    fn compile_snippet(b: BytecodeBuilder) -> CompiledCode {
        let f = b.finish();
        let (ir, _) = build_ir(
            FunctionId(0),
            "t",
            &f.code,
            &f.consts,
            f.param_count,
            f.local_count,
            false,
            &ProfileSnapshot::default(),
            None,
        )
        .unwrap();
        let backend = X64Backend::new();
        let alloc = allocate(&ir, &backend.calling_convention().allocatable);
        backend.compile(&ir, &alloc).unwrap()
    }

    #[test]
    fn test_prologue_shape() {
        let mut b = BytecodeBuilder::new("t", 0, 0);
        b.emit(Opcode::ReturnUndef);
        let code = compile_snippet(b);
        // push rbp; mov rbp, rsp
        assert_eq!(&code.code[0..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(code.entry_offset, 0);
        // Ends in ret
        assert_eq!(*code.code.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_mov_ri_encoding() {
        let mut asm = Asm::new();
        asm.mov_ri(RAX, 0x1122334455667788);
        assert_eq!(
            asm.buf,
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        let mut asm = Asm::new();
        asm.mov_ri(R13, 1);
        assert_eq!(asm.buf[0], 0x49); // REX.W | REX.B
        assert_eq!(asm.buf[1], 0xB8 + 5);
    }

    #[test]
    fn test_mem_encoding_uses_sib_for_r12() {
        let mut asm = Asm::new();
        asm.mov_r_m(RAX, R12, 8);
        // REX.W+B, 8B, modrm(10,rax,100), SIB 0x24, disp32
        assert_eq!(asm.buf[0], 0x49);
        assert_eq!(asm.buf[1], 0x8B);
        assert_eq!(asm.buf[2], 0b10_000_100);
        assert_eq!(asm.buf[3], 0x24);
    }

    #[test]
    fn test_get_prop_emits_patch_point() {
        let mut b = BytecodeBuilder::new("t", 1, 0);
        let mut m = crate::bytecode::ModuleBuilder::new();
        let name = m.name("k");
        b.load_var(0);
        b.emit_u16(Opcode::GetProp, name);
        b.emit(Opcode::Return);
        let code = compile_snippet(b);
        assert_eq!(code.patch_points.len(), 1);
        assert!(code.patch_points[0].name.starts_with("ic_load_"));
        assert_eq!(code.ic_sites.len(), 1);
        let patch = code.ic_sites.values().next().unwrap();
        // The initial shape immediate is the always-miss sentinel
        let at = patch.shape_imm as usize;
        assert_eq!(&code.code[at..at + 4], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_deopt_stub_emitted_for_guards() {
        use crate::profiler::Profiler;
        use aero_core::Value;

        let mut b = BytecodeBuilder::new("t", 2, 0);
        b.load_var(0);
        b.load_var(1);
        let site = b.offset();
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        let f = b.finish();

        let profiler = Profiler::new(true);
        for _ in 0..100 {
            profiler.record_type(FunctionId(0), site, 0, Value::integer(1));
            profiler.record_type(FunctionId(0), site, 1, Value::integer(2));
        }
        let profile = profiler.snapshot(FunctionId(0));
        let (mut ir, sites) = build_ir(
            FunctionId(0),
            "t",
            &f.code,
            &f.consts,
            2,
            0,
            false,
            &profile,
            None,
        )
        .unwrap();
        let ctx = crate::jit::opt::PassContext {
            profile: &profile,
            sites: &sites,
            funcs: None,
            profiler: None,
            flags: crate::jit::opt::OptFlags::for_level(2),
        };
        crate::jit::opt::Optimizer::new().optimize(&mut ir, &ctx);

        let backend = X64Backend::new();
        let alloc = allocate(&ir, &backend.calling_convention().allocatable);
        let code = backend.compile(&ir, &alloc).unwrap();
        // Guards + overflow check share deopt states but produce stubs
        assert!(!code.deopt_points.is_empty());
        for p in &code.deopt_points {
            assert!(!p.state.frames.is_empty());
        }
    }

    #[test]
    fn test_calling_convention() {
        let b = X64Backend::new();
        let cc = b.calling_convention();
        assert_eq!(cc.ret_reg, PhysReg(RAX));
        assert_eq!(cc.allocatable, vec![PhysReg(RBX), PhysReg(R12), PhysReg(R13)]);
        assert_eq!(cc.arg_regs[0], PhysReg(RDI));
    }
}
