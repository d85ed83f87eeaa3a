//! Backend-agnostic optimization passes on the SSA IR
//!
//! Each pass implements `OptPass` and transforms an `IrFunction` in
//! place. The pipeline runs them in a fixed order — folding, DCE,
//! CSE/GVN, LICM, inlining, unrolling, type specialization, peephole —
//! with each pass individually gated by the optimization level. Every
//! pass preserves SSA and keeps type annotations conservative.

pub mod dce;
pub mod fold;
pub mod gvn;
pub mod inline;
pub mod licm;
pub mod peephole;
pub mod specialize;
pub mod unroll;

use crate::functions::FunctionTable;
use crate::jit::ir::builder::SiteTable;
use crate::jit::ir::IrFunction;
use crate::profiler::{ProfileSnapshot, Profiler};

/// Which passes are enabled, derived from the optimization level
#[derive(Debug, Clone, Copy)]
pub struct OptFlags {
    pub fold: bool,
    pub dce: bool,
    pub gvn: bool,
    pub licm: bool,
    pub inline: bool,
    pub unroll: bool,
    pub specialize: bool,
    pub peephole: bool,
}

impl OptFlags {
    /// Levels: 0 = none, 1 = cheap cleanup (baseline tier),
    /// 2 = full local + specialization, 3 = everything
    pub fn for_level(level: u8) -> OptFlags {
        OptFlags {
            fold: level >= 1,
            dce: level >= 1,
            peephole: level >= 1,
            gvn: level >= 2,
            licm: level >= 2,
            specialize: level >= 2,
            inline: level >= 3,
            unroll: level >= 3,
        }
    }

    pub fn none() -> OptFlags {
        OptFlags::for_level(0)
    }
}

/// Shared read-only inputs to passes
pub struct PassContext<'a> {
    pub profile: &'a ProfileSnapshot,
    pub sites: &'a SiteTable,
    /// For inlining: resolve callee bytecode and profiles
    pub funcs: Option<&'a FunctionTable>,
    pub profiler: Option<&'a Profiler>,
    pub flags: OptFlags,
}

/// An optimization pass
pub trait OptPass {
    fn name(&self) -> &'static str;
    fn enabled(&self, flags: &OptFlags) -> bool;
    /// Run the pass; return whether the function changed
    fn run(&self, func: &mut IrFunction, ctx: &PassContext) -> bool;
}

/// The fixed-order pass pipeline
pub struct Optimizer {
    passes: Vec<Box<dyn OptPass + Send + Sync>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Optimizer {
            passes: vec![
                Box::new(fold::ConstantFolding),
                Box::new(dce::DeadCodeElimination),
                Box::new(gvn::GlobalValueNumbering),
                Box::new(licm::LoopInvariantCodeMotion),
                Box::new(inline::Inlining),
                Box::new(unroll::LoopUnrolling),
                Box::new(specialize::TypeSpecialization),
                Box::new(peephole::Peephole),
            ],
        }
    }

    /// Run the enabled passes in order, repeating the pipeline until it
    /// stops changing the function (bounded): later passes expose work
    /// for earlier ones — specialization unboxes what LICM can then
    /// hoist — and the fixed point is what makes a re-run a no-op.
    pub fn optimize(&self, func: &mut IrFunction, ctx: &PassContext) {
        const MAX_ROUNDS: usize = 4;
        for round in 0..MAX_ROUNDS {
            let mut changed_any = false;
            for pass in &self.passes {
                if !pass.enabled(&ctx.flags) {
                    continue;
                }
                let changed = pass.run(func, ctx);
                if changed {
                    changed_any = true;
                    func.recompute_preds();
                    debug_assert!(
                        func.verify_ssa().is_ok(),
                        "pass {} broke SSA: {:?}",
                        pass.name(),
                        func.verify_ssa()
                    );
                }
                tracing::trace!(pass = pass.name(), round, changed, "optimizer pass");
            }
            if !changed_any {
                break;
            }
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Substitute register uses across the whole function (SSA-safe when the
/// replacement's definition dominates the replaced definition)
pub(crate) fn substitute_uses(
    func: &mut IrFunction,
    subs: &rustc_hash::FxHashMap<crate::jit::ir::Reg, crate::jit::ir::Reg>,
) {
    if subs.is_empty() {
        return;
    }
    // Resolve transitive chains
    let resolved: rustc_hash::FxHashMap<_, _> = subs
        .keys()
        .map(|&r| {
            let mut cur = r;
            let mut depth = 0;
            while let Some(&next) = subs.get(&cur) {
                cur = next;
                depth += 1;
                if depth > 1000 {
                    break;
                }
            }
            (r, cur)
        })
        .collect();

    for block in &mut func.blocks {
        for instr in &mut block.instrs {
            instr.replace_operands(&resolved);
        }
        if let crate::jit::ir::Terminator::Branch { cond, .. } = &mut block.terminator {
            if let Some(&n) = resolved.get(cond) {
                *cond = n;
            }
        }
        if let crate::jit::ir::Terminator::Return(r) = &mut block.terminator {
            if let Some(&n) = resolved.get(r) {
                *r = n;
            }
        }
    }
    // Deopt states reference live regs too
    for state in &mut func.deopt_states {
        for frame in &mut state.frames {
            for r in &mut frame.stack {
                if let Some(&n) = resolved.get(r) {
                    *r = n;
                }
            }
            if let Some(t) = &mut frame.this {
                if let Some(&n) = resolved.get(t) {
                    *t = n;
                }
            }
            if let crate::jit::ir::DeoptLocals::Regs(regs) = &mut frame.locals {
                for r in regs {
                    if let Some(&n) = resolved.get(r) {
                        *r = n;
                    }
                }
            }
        }
    }
}
