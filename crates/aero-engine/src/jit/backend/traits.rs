//! Backend-agnostic code generation interface
//!
//! A `Backend` lowers allocated IR to machine code for one ISA. The
//! pipeline is: `IrFunction` → register allocation → `compile` →
//! `CompiledCode` (position-independent bytes plus metadata) → code-cache
//! finalization into executable memory. Backends never touch executable
//! pages themselves; the code cache owns the W^X discipline.

use rustc_hash::FxHashMap;

use crate::jit::ir::{DeoptReason, DeoptState, IrFunction};
use crate::jit::regalloc::{Allocation, PhysReg};
use crate::jit::CompileError;

/// Target instruction-set architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetIsa {
    X64,
    A64,
}

/// Calling-convention description a backend exposes
#[derive(Debug, Clone)]
pub struct CallingConvention {
    /// Argument registers, in order
    pub arg_regs: Vec<PhysReg>,
    /// Return-value register
    pub ret_reg: PhysReg,
    /// Callee-saved registers available to the allocator
    pub allocatable: Vec<PhysReg>,
}

/// A nop-filled region reserved for runtime rewriting
#[derive(Debug, Clone)]
pub struct PatchPoint {
    pub offset: u32,
    pub length: u32,
    pub name: String,
}

/// Offsets of the patchable immediates of one inline-cache site
#[derive(Debug, Clone, Copy)]
pub struct IcPatch {
    /// Offset of the 4-byte expected-shape immediate
    pub shape_imm: u32,
    /// Offset of the 4-byte slot-index immediate
    pub slot_imm: u32,
}

/// One deoptimization point as compiled: which interpreter state it
/// reconstructs and where each live value was parked by the exit stub
#[derive(Debug, Clone)]
pub struct CompiledDeoptPoint {
    pub state: DeoptState,
    pub reason: DeoptReason,
    /// IR value → index into the jit context's save area
    pub save_slots: FxHashMap<crate::jit::ir::Reg, u32>,
    /// Code offset of the trapping check (diagnostics)
    pub code_offset: u32,
}

/// Named offset into the emitted code (diagnostics, perf maps)
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub offset: u32,
}

/// Machine code plus metadata, not yet executable
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub entry_offset: u32,
    pub patch_points: Vec<PatchPoint>,
    /// site id → patchable immediates
    pub ic_sites: FxHashMap<u32, IcPatch>,
    pub deopt_points: Vec<CompiledDeoptPoint>,
    pub symbols: Vec<SymbolInfo>,
    /// Strings the optimizer synthesized; resolved by the const-pool
    /// helper at indices with the high bit set
    pub synth_strings: Vec<Box<str>>,
    /// OSR entries map one bytecode offset to this code's entry
    pub osr_offset: Option<u32>,
}

/// A machine-code backend for one ISA
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn target(&self) -> TargetIsa;

    fn calling_convention(&self) -> CallingConvention;

    /// Lower an allocated IR function to machine code
    fn compile(&self, func: &IrFunction, alloc: &Allocation)
        -> Result<CompiledCode, CompileError>;

    /// Flush the instruction cache for a freshly written range. A no-op on
    /// x86-64 (coherent icache); required on ARM.
    fn flush_icache(&self, ptr: *const u8, len: usize);
}

/// The backend for the host architecture
pub fn host_backend() -> Box<dyn Backend> {
    #[cfg(target_arch = "x86_64")]
    {
        Box::new(super::x64::X64Backend::new())
    }
    #[cfg(target_arch = "aarch64")]
    {
        Box::new(super::a64::A64Backend::new())
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Box::new(super::a64::A64Backend::new()) // placeholder; never executed
    }
}
