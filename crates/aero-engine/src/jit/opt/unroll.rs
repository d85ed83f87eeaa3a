//! Loop unrolling
//!
//! Duplicates the body of small single-block loops so that several
//! iterations run per back edge. Every copy re-evaluates the loop
//! condition and can exit, which keeps the transform sound without
//! induction-variable reasoning; what is saved is the back-edge jump and
//! its safepoint poll. The factor comes from the profiled trip count when
//! it is small (full unroll below 8), otherwise from body size: under 10
//! instructions ×8, under 20 ×4, else ×2.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::jit::analysis::{find_loops, Dominators};
use crate::jit::ir::{BlockId, DeoptLocals, Instr, IrFunction, Reg, Terminator};

use super::{OptFlags, OptPass, PassContext};

/// Profiled trip counts below this fully unroll
pub const FULL_UNROLL_TRIPS: u64 = 8;

pub struct LoopUnrolling;

impl OptPass for LoopUnrolling {
    fn name(&self) -> &'static str {
        "loop-unrolling"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.unroll
    }

    fn run(&self, func: &mut IrFunction, ctx: &PassContext) -> bool {
        func.recompute_preds();
        let dom = Dominators::compute(func);
        let loops = find_loops(func, &dom);
        let mut changed = false;

        // Snapshot the loop shapes first; unrolling invalidates the
        // analysis (each loop is re-checked against the live function)
        let candidates: Vec<(BlockId, BlockId)> = loops
            .iter()
            .filter(|l| l.body.len() == 2 && l.latch != l.header)
            .map(|l| (l.header, l.latch))
            .collect();

        for (header, body) in candidates {
            if unroll_one(func, ctx, header, body) {
                changed = true;
            }
        }
        changed
    }
}

fn unroll_one(
    func: &mut IrFunction,
    ctx: &PassContext,
    header: BlockId,
    body: BlockId,
) -> bool {
    // Shape check: header branches (into body | out), body jumps back
    let Terminator::Branch {
        then_block,
        else_block,
        ..
    } = func.block(header).terminator
    else {
        return false;
    };
    let exit = if then_block == body {
        else_block
    } else if else_block == body {
        then_block
    } else {
        return false;
    };
    if !matches!(func.block(body).terminator, Terminator::Jump(t) if t == header) {
        return false;
    }
    // Re-unrolling an already widened loop would grow code without bound
    if func.block(body).unrolled || func.block(header).unrolled {
        return false;
    }

    let has_phi = |b: BlockId| {
        func.block(b)
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Phi { .. }))
    };
    if has_phi(header) || has_phi(body) || has_phi(exit) {
        return false;
    }

    // The body must be self-contained: a body instruction consuming a
    // header definition would need cross-copy renaming in its deopt
    // states, so such loops are left alone
    let header_defs: FxHashSet<Reg> = func
        .block(header)
        .instrs
        .iter()
        .filter_map(|i| i.dest())
        .collect();
    let body_reads_header = func.block(body).instrs.iter().any(|i| {
        i.operands().iter().any(|r| header_defs.contains(r))
    });
    if body_reads_header {
        return false;
    }

    // Values defined in the loop must not escape: paths through the new
    // copies would otherwise observe stale iteration-1 values
    let mut defined: FxHashSet<Reg> = FxHashSet::default();
    for &b in &[header, body] {
        for instr in &func.block(b).instrs {
            if let Some(d) = instr.dest() {
                defined.insert(d);
            }
        }
    }
    for block in &func.blocks {
        if block.id == header || block.id == body {
            continue;
        }
        for instr in &block.instrs {
            if instr.operands().iter().any(|r| defined.contains(r)) {
                return false;
            }
        }
        match &block.terminator {
            Terminator::Branch { cond, .. } if defined.contains(cond) => return false,
            Terminator::Return(r) if defined.contains(r) => return false,
            _ => {}
        }
    }

    let body_size = func.block(body).instrs.len();
    let factor = pick_factor(ctx, body_size);
    if factor < 2 {
        return false;
    }

    // Strip the original body's back-edge safepoint; only the last copy
    // polls on its way back around
    let header_offset = func.block(header).bytecode_offset;
    func.block_mut(body)
        .instrs
        .retain(|i| !matches!(i, Instr::Safepoint { .. }));

    // Build copies: H2..Hf (condition re-checks) and B2..Bf (bodies)
    let mut prev_body = body;
    for k in 2..=factor {
        let hk = func.add_block(header_offset);
        let bk = func.add_block(func.block(body).bytecode_offset);
        func.block_mut(hk).unrolled = true;
        func.block_mut(bk).unrolled = true;

        let (h_instrs, h_map) = copy_instrs(func, header);
        let (b_instrs, mut b_map) = copy_instrs(func, body);
        // Body copies see the header copy's definitions
        for (&old, &new) in h_map.iter() {
            b_map.entry(old).or_insert(new);
        }
        let h_instrs = substitute(h_instrs, &h_map);
        let b_instrs = substitute(b_instrs, &b_map);

        func.block_mut(hk).instrs = h_instrs;
        func.block_mut(bk).instrs = b_instrs;

        // Condition register of the header copy
        let Terminator::Branch { cond, .. } = func.block(header).terminator else {
            unreachable!("checked above");
        };
        let cond_k = h_map.get(&cond).copied().unwrap_or(cond);
        func.block_mut(hk).terminator = if then_block == body {
            Terminator::Branch {
                cond: cond_k,
                then_block: bk,
                else_block: exit,
            }
        } else {
            Terminator::Branch {
                cond: cond_k,
                then_block: exit,
                else_block: bk,
            }
        };

        // Previous body now falls into this check instead of the header
        func.block_mut(prev_body).terminator = Terminator::Jump(hk);
        if k == factor {
            func.block_mut(bk).instrs.push(Instr::Safepoint {
                offset: header_offset,
            });
            func.block_mut(bk).terminator = Terminator::Jump(header);
        }
        prev_body = bk;
    }

    func.block_mut(header).unrolled = true;
    func.block_mut(body).unrolled = true;
    func.recompute_preds();
    true
}

fn pick_factor(ctx: &PassContext, body_size: usize) -> usize {
    let execs = ctx.profile.execution_count.max(1);
    let trips = ctx.profile.backedge_count / execs;
    if trips >= 1 && trips < FULL_UNROLL_TRIPS {
        return trips as usize;
    }
    if body_size < 10 {
        8
    } else if body_size < 20 {
        4
    } else {
        2
    }
}

/// Clone a block's instructions with fresh destination registers; the
/// returned map sends original defs to their copies. Deopt states carried
/// by copied instructions are cloned with the same renaming.
fn copy_instrs(func: &mut IrFunction, block: BlockId) -> (Vec<Instr>, FxHashMap<Reg, Reg>) {
    let instrs = func.block(block).instrs.clone();
    let mut map: FxHashMap<Reg, Reg> = FxHashMap::default();
    let mut out = Vec::with_capacity(instrs.len());
    for mut instr in instrs {
        if let Some(old) = instr.dest() {
            let new = func.alloc_reg();
            map.insert(old, new);
            let ty = func.type_of(old);
            func.set_type(new, ty);
            replace_dest(&mut instr, new);
        }
        if let Some(d) = instr.deopt_id() {
            let mut state = func.deopt_states[d.0 as usize].clone();
            for frame in &mut state.frames {
                for r in &mut frame.stack {
                    if let Some(&n) = map.get(r) {
                        *r = n;
                    }
                }
                if let Some(t) = &mut frame.this {
                    if let Some(&n) = map.get(t) {
                        *t = n;
                    }
                }
                if let DeoptLocals::Regs(regs) = &mut frame.locals {
                    for r in regs {
                        if let Some(&n) = map.get(r) {
                            *r = n;
                        }
                    }
                }
            }
            let new_id = func.add_deopt_state(state);
            instr.set_deopt_id(new_id);
        }
        out.push(instr);
    }
    (out, map)
}

fn substitute(mut instrs: Vec<Instr>, map: &FxHashMap<Reg, Reg>) -> Vec<Instr> {
    for instr in &mut instrs {
        instr.replace_operands(map);
    }
    instrs
}

fn replace_dest(instr: &mut Instr, new: Reg) {
    // Reuse the inliner's rewrite through the public accessor pattern:
    // every value-producing variant stores its destination in a field
    // named `dest`
    if let Some(old) = instr.dest() {
        crate::jit::opt::inline::rewrite_dest(instr, old, new);
    }
}
