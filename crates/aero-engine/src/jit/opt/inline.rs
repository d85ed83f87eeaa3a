//! Call-site inlining
//!
//! Replaces monomorphic calls to small functions with the callee's body.
//! Candidates must be single-block (straight-line) functions from the
//! same module, under the instruction budget, within the depth limit, and
//! never recursive. The callee's locals become SSA values; its deopt
//! states grow the full caller frame chain, so a guard failure inside an
//! inlined body reconstructs every frame up to the outermost root.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use aero_core::{Atom, FunctionId};

use crate::functions::FunctionRecord;
use crate::jit::ir::builder::build_ir;
use crate::jit::ir::{
    BlockId, DeoptFrame, DeoptLocals, DeoptState, Instr, IrFunction, Reg, Terminator,
};
use crate::jit::opt::fold::SYNTH_POOL_BIT;
use crate::profiler::ProfileSnapshot;

use super::{OptFlags, OptPass, PassContext};

/// Maximum callee size in IR instructions
pub const INLINE_BUDGET: usize = 64;
/// Maximum inlining depth
pub const INLINE_DEPTH: usize = 3;
/// Site id meaning "no feedback / no cache" on instructions that were
/// spliced from another function
pub const INLINED_SITE: u32 = u32::MAX;

pub struct Inlining;

impl OptPass for Inlining {
    fn name(&self) -> &'static str {
        "inlining"
    }

    fn enabled(&self, flags: &OptFlags) -> bool {
        flags.inline
    }

    fn run(&self, func: &mut IrFunction, ctx: &PassContext) -> bool {
        let Some(funcs) = ctx.funcs else {
            return false;
        };
        let Some(caller_record) = funcs.record(func.function_id) else {
            return false;
        };
        let caller_atoms = caller_record.atoms.clone();
        let mut changed = false;

        for bi in 0..func.blocks.len() {
            let block_id = BlockId(bi as u32);
            loop {
                // Find the next inlinable call in this block
                let candidate = func.block(block_id).instrs.iter().enumerate().find_map(
                    |(i, instr)| match instr {
                        Instr::Call {
                            dest,
                            this,
                            args,
                            site,
                            ..
                        } if *site != INLINED_SITE => ctx
                            .profile
                            .site(*site)
                            .and_then(|s| s.monomorphic_call_target())
                            .map(|target| (i, *dest, *this, args.clone(), *site, target)),
                        _ => None,
                    },
                );
                let Some((i, dest, this, args, site, target)) = candidate else {
                    break;
                };

                // Caller state for deopts inside the inlinee
                let Some((caller_stack, resume_at)) = ctx.sites.call_stacks.get(&site).cloned()
                else {
                    mark_site_done(func, block_id, i);
                    continue;
                };
                let root_frame = DeoptFrame {
                    function: func.function_id,
                    bytecode_offset: resume_at,
                    locals: DeoptLocals::Buffer,
                    stack: caller_stack,
                    this: None,
                };

                let inlined = try_splice(
                    func,
                    funcs,
                    ctx,
                    &caller_atoms,
                    target,
                    &args,
                    this,
                    dest,
                    vec![root_frame],
                    1,
                );
                match inlined {
                    Some(body) => {
                        let block = func.block_mut(block_id);
                        block.instrs.splice(i..=i, body);
                        changed = true;
                    }
                    None => {
                        mark_site_done(func, block_id, i);
                    }
                }
            }
        }
        changed
    }
}

/// Mark a call so the search loop does not reconsider it
fn mark_site_done(func: &mut IrFunction, block: BlockId, i: usize) {
    if let Instr::Call { site, .. } = &mut func.block_mut(block).instrs[i] {
        *site = INLINED_SITE;
    }
}

/// Produce the replacement instruction sequence for one call, or None if
/// the callee is not inlinable. Recurses into the callee's own
/// monomorphic calls up to the depth limit.
#[allow(clippy::too_many_arguments)]
fn try_splice(
    func: &mut IrFunction,
    funcs: &crate::functions::FunctionTable,
    ctx: &PassContext,
    caller_atoms: &Arc<Vec<Atom>>,
    target: FunctionId,
    args: &[Reg],
    this: Option<Reg>,
    call_dest: Reg,
    outer_frames: Vec<DeoptFrame>,
    depth: usize,
) -> Option<Vec<Instr>> {
    if depth > INLINE_DEPTH {
        return None;
    }
    // Never inline recursion into any function already on the chain
    if target == func.function_id || outer_frames.iter().any(|f| f.function == target) {
        return None;
    }
    let record: Arc<FunctionRecord> = funcs.record(target)?;
    // Same-module only: spliced name indices must resolve through the
    // caller's atom table
    if !Arc::ptr_eq(caller_atoms, &record.atoms) {
        return None;
    }
    let callee_profile = ctx
        .profiler
        .map(|p| p.snapshot(target))
        .unwrap_or_else(ProfileSnapshot::default);

    let bc = &record.bytecode;
    let (callee_ir, callee_sites) = build_ir(
        target,
        &bc.name,
        &bc.code,
        &bc.consts,
        bc.param_count,
        bc.local_count,
        !bc.handlers.is_empty(),
        &callee_profile,
        None,
    )
    .ok()?;

    if callee_ir.blocks.len() != 1 || callee_ir.instr_count() > INLINE_BUDGET {
        return None;
    }
    let callee_block = callee_ir.block(callee_ir.entry);
    let Terminator::Return(ret_reg) = callee_block.terminator else {
        return None;
    };

    // Fresh register range for the callee's values
    let base = func.reserve_regs(callee_ir.reg_count());
    let map = |r: Reg| Reg(base + r.0);

    let mut out: Vec<Instr> = Vec::with_capacity(callee_block.instrs.len() + 4);

    // Parameter and local environment
    let param_count = callee_ir.param_count as usize;
    let local_count = callee_ir.local_count as usize;
    let undef = func.alloc_reg();
    out.push(Instr::ConstUndef { dest: undef });
    let mut env: Vec<Reg> = Vec::with_capacity(param_count + local_count);
    for p in 0..param_count {
        env.push(args.get(p).copied().unwrap_or(undef));
    }
    env.extend(std::iter::repeat(undef).take(local_count));
    let this_reg = this.unwrap_or(undef);

    // Remap a callee deopt id into the caller, with the frame chain
    let remap_deopt = |func: &mut IrFunction,
                           env: &[Reg],
                           deopt: crate::jit::ir::DeoptId|
     -> crate::jit::ir::DeoptId {
        let state = &callee_ir.deopt_states[deopt.0 as usize];
        let mut frames = outer_frames.clone();
        for frame in &state.frames {
            frames.push(DeoptFrame {
                function: frame.function,
                bytecode_offset: frame.bytecode_offset,
                locals: DeoptLocals::Regs(env.to_vec()),
                stack: frame.stack.iter().map(|&r| map(r)).collect(),
                this: Some(this_reg),
            });
        }
        func.add_deopt_state(DeoptState {
            reason: state.reason,
            frames,
        })
    };

    for instr in &callee_block.instrs {
        match instr {
            Instr::LoadLocal { dest, index } => {
                out.push(Instr::Move {
                    dest: map(*dest),
                    src: *env.get(*index as usize)?,
                });
            }
            Instr::StoreLocal { index, value } => {
                let slot = env.get_mut(*index as usize)?;
                *slot = map(*value);
            }
            Instr::LoadThis { dest } => {
                out.push(Instr::Move {
                    dest: map(*dest),
                    src: this_reg,
                });
            }
            Instr::ConstPool { dest, index } => {
                // Move the string into the caller's synthesized pool
                let content = if index & SYNTH_POOL_BIT != 0 {
                    callee_ir
                        .synth_strings
                        .get((index & !SYNTH_POOL_BIT) as usize)?
                        .clone()
                } else {
                    callee_ir.pool_strings.get(index)?.clone()
                };
                let new_index = SYNTH_POOL_BIT | func.synth_strings.len() as u16;
                func.synth_strings.push(content);
                out.push(Instr::ConstPool {
                    dest: map(*dest),
                    index: new_index,
                });
            }
            Instr::Safepoint { .. } => {
                // Single-block callees have no back edges; drop defensively
            }
            Instr::Call {
                dest,
                callee,
                this: inner_this,
                args: inner_args,
                site,
            } => {
                // Try to inline the nested call with the extended chain
                let mapped_args: Vec<Reg> = inner_args.iter().map(|&r| map(r)).collect();
                let mapped_this = inner_this.map(&map);
                let mapped_dest = map(*dest);
                let nested = callee_sites.call_stacks.get(site).and_then(|(stack, resume)| {
                    let mut frames = outer_frames.clone();
                    frames.push(DeoptFrame {
                        function: target,
                        bytecode_offset: *resume,
                        locals: DeoptLocals::Regs(env.clone()),
                        stack: stack.iter().map(|&r| map(r)).collect(),
                        this: Some(this_reg),
                    });
                    let nested_target = callee_profile
                        .site(*site)
                        .and_then(|s| s.monomorphic_call_target())?;
                    try_splice(
                        func,
                        funcs,
                        ctx,
                        caller_atoms,
                        nested_target,
                        &mapped_args,
                        mapped_this,
                        mapped_dest,
                        frames,
                        depth + 1,
                    )
                });
                match nested {
                    Some(body) => out.extend(body),
                    None => out.push(Instr::Call {
                        dest: mapped_dest,
                        callee: map(*callee),
                        this: mapped_this,
                        args: mapped_args,
                        site: INLINED_SITE,
                    }),
                }
            }
            other => {
                let mut clone = other.clone();
                // Rename operands into the fresh range
                let subs: FxHashMap<Reg, Reg> = clone
                    .operands()
                    .iter()
                    .map(|&r| (r, map(r)))
                    .collect();
                clone.replace_operands(&subs);
                clone = rename_dest(clone, &map);
                // Feedback sites in spliced code have no cache entry
                clear_site(&mut clone);
                if let Some(d) = clone.deopt_id() {
                    let new_id = remap_deopt(func, &env, d);
                    clone.set_deopt_id(new_id);
                }
                out.push(clone);
            }
        }
    }

    // The callee's return value becomes the call's result
    out.push(Instr::Move {
        dest: call_dest,
        src: map(ret_reg),
    });
    Some(out)
}

fn rename_dest(mut instr: Instr, map: &impl Fn(Reg) -> Reg) -> Instr {
    // Destinations are rewritten by reconstruction: operands were already
    // substituted, so only the dest field needs the mapping.
    if let Some(old) = instr.dest() {
        let new = map(old);
        rewrite_dest(&mut instr, old, new);
    }
    instr
}

/// Rewrite an instruction's destination register in place (shared with
/// the unroller, which renames defs in copied blocks)
pub(crate) fn rewrite_dest(instr: &mut Instr, old: Reg, new: Reg) {
    macro_rules! rewrite {
        ($($variant:ident),* $(,)?) => {
            match instr {
                $(Instr::$variant { dest, .. } if *dest == old => *dest = new,)*
                _ => {}
            }
        };
    }
    rewrite!(
        ConstInt, ConstNum, ConstBool, ConstUndef, ConstNull, ConstPool, LoadLocal, LoadThis,
        Binary, Compare, Neg, Not, IsTruthy, Typeof, InstanceOf, IntAdd, IntSub, IntMul, IntShl,
        IntCmp, NumAdd, NumSub, NumMul, NumDiv, NumCmp, UnboxInt, UnboxNum, BoxInt, BoxNum,
        BoxBool, GetProp, GetElem, LoadGlobal, Call, NewObject, NewArray, MakeFunction, Phi, Move,
    );
}

fn clear_site(instr: &mut Instr) {
    match instr {
        Instr::Binary { site, .. }
        | Instr::Compare { site, .. }
        | Instr::GetProp { site, .. }
        | Instr::SetProp { site, .. }
        | Instr::GetElem { site, .. }
        | Instr::SetElem { site, .. }
        | Instr::LoadGlobal { site, .. }
        | Instr::StoreGlobal { site, .. }
        | Instr::Call { site, .. } => *site = INLINED_SITE,
        _ => {}
    }
}
