//! Bytecode → SSA lifting
//!
//! Walks the bytecode CFG in reverse post-order, simulating the operand
//! stack with SSA registers. Stack slots that merge across predecessors
//! become φ-nodes whose inputs are filled in a second phase, once every
//! predecessor's exit stack is known. Locals are not SSA-renamed: they
//! load and store through the frame's locals buffer, which is what makes
//! deoptimization and OSR state trivial to reconstruct.
//!
//! Every arithmetic, comparison, property and call site keeps its bytecode
//! offset as its site id: that is the key into profile feedback and the
//! inline-cache table, and the offset deoptimized frames resume at.

use rustc_hash::FxHashMap;

use aero_core::FunctionId;

use crate::bytecode::{Const, Opcode};
use crate::jit::analysis::{build_cfg, decode_function, CfgTerminator, Operands};
use crate::jit::CompileError;
use crate::profiler::ProfileSnapshot;

use super::instr::{
    BinOp, BlockId, CmpOp, DeoptFrame, DeoptLocals, DeoptReason, DeoptState, Instr, IrFunction,
    Reg, Terminator,
};
use super::types::{JsType, TypeInfo};

/// Extra per-site metadata the optimizer consumes
#[derive(Debug, Default)]
pub struct SiteTable {
    /// Deopt state capturing interpreter state at each specializable site
    pub deopts: FxHashMap<u32, super::instr::DeoptId>,
    /// At each call site: the caller's operand stack after the call's
    /// operands are popped, and the offset of the next opcode. The inliner
    /// uses this to describe the caller frame at deopts inside inlinees.
    pub call_stacks: FxHashMap<u32, (Vec<Reg>, u32)>,
}

/// Build SSA IR for a function from its bytecode and profile snapshot.
/// `osr_offset` selects on-stack-replacement mode: execution enters at the
/// loop header with locals read from the frame buffer.
pub fn build_ir(
    function_id: FunctionId,
    name: &str,
    code: &[u8],
    consts: &[Const],
    param_count: u16,
    local_count: u16,
    has_handlers: bool,
    profile: &ProfileSnapshot,
    osr_offset: Option<u32>,
) -> Result<(IrFunction, SiteTable), CompileError> {
    if has_handlers {
        return Err(CompileError::Unsupported(
            "exception handler tables stay in the interpreter".into(),
        ));
    }
    let decoded =
        decode_function(code).map_err(|e| CompileError::Internal(e.to_string()))?;
    let cfg = build_cfg(&decoded);

    let mut func = IrFunction::new(function_id, name.to_string(), param_count, local_count);
    for (i, c) in consts.iter().enumerate() {
        if let Const::String(s) = c {
            func.pool_strings.insert(i as u16, s.clone());
        }
    }
    let mut sites = SiteTable::default();

    // One IR block per CFG block, same order
    for cb in &cfg.blocks {
        func.add_block(cb.start_offset as u32);
    }

    // Per-block entry/exit stacks of SSA registers
    let n = cfg.blocks.len();
    let mut entry_stacks: Vec<Option<Vec<Reg>>> = vec![None; n];
    let mut exit_stacks: Vec<Option<Vec<Reg>>> = vec![None; n];
    // φs awaiting inputs: (block, stack slot, phi reg)
    let mut pending_phis: Vec<(usize, usize, Reg)> = Vec::new();

    entry_stacks[0] = Some(Vec::new());

    // Process in an order where at least one predecessor of each block is
    // done first (RPO over the bytecode CFG; loop headers get their φs
    // from the forward edge and the latch fills in later)
    let order = rpo_order(&cfg);

    for &bi in &order {
        let block_id = BlockId(bi as u32);
        // Entry stack: inherited, or φs if the depth came from a pred
        let mut stack: Vec<Reg> = match &entry_stacks[bi] {
            Some(s) => s.clone(),
            None => {
                // Unreachable from entry (dead code): give it an empty stack
                entry_stacks[bi] = Some(Vec::new());
                Vec::new()
            }
        };

        // Multi-predecessor blocks with a non-empty stack merge through φs
        let preds = &cfg.blocks[bi].preds;
        if preds.len() > 1 && !stack.is_empty() {
            let mut phi_stack = Vec::with_capacity(stack.len());
            for (slot, _) in stack.iter().enumerate() {
                let phi = func.alloc_reg();
                func.block_mut(block_id).instrs.push(Instr::Phi {
                    dest: phi,
                    inputs: Vec::new(),
                });
                pending_phis.push((bi, slot, phi));
                phi_stack.push(phi);
            }
            stack = phi_stack;
        }

        for &ii in &cfg.blocks[bi].instrs {
            let instr = &decoded[ii];
            lift_instr(
                &mut func,
                &mut sites,
                block_id,
                &mut stack,
                instr.offset as u32,
                instr.opcode,
                instr.operands,
                function_id,
                consts,
            )?;
        }

        // Terminator
        let term = match cfg.blocks[bi].terminator {
            CfgTerminator::Fallthrough(t) => {
                let target = BlockId(t.0);
                propagate_stack(&mut entry_stacks, t.0 as usize, &stack)?;
                Terminator::Jump(target)
            }
            CfgTerminator::Jump(t) => {
                let target = BlockId(t.0);
                // Back edges poll the safepoint
                if cfg.blocks[t.0 as usize].start_offset <= cfg.blocks[bi].start_offset {
                    func.block_mut(block_id).instrs.push(Instr::Safepoint {
                        offset: cfg.blocks[t.0 as usize].start_offset as u32,
                    });
                }
                propagate_stack(&mut entry_stacks, t.0 as usize, &stack)?;
                Terminator::Jump(target)
            }
            CfgTerminator::Branch {
                jump_if,
                target,
                fallthrough,
            } => {
                let cond = pop(&mut stack)?;
                let raw = func.alloc_reg();
                func.block_mut(block_id)
                    .instrs
                    .push(Instr::IsTruthy { dest: raw, src: cond });
                func.set_type(raw, TypeInfo::of(JsType::Boolean));
                if cfg.blocks[target.0 as usize].start_offset <= cfg.blocks[bi].start_offset {
                    func.block_mut(block_id).instrs.push(Instr::Safepoint {
                        offset: cfg.blocks[target.0 as usize].start_offset as u32,
                    });
                }
                propagate_stack(&mut entry_stacks, target.0 as usize, &stack)?;
                propagate_stack(&mut entry_stacks, fallthrough.0 as usize, &stack)?;
                let (then_block, else_block) = if jump_if {
                    (BlockId(target.0), BlockId(fallthrough.0))
                } else {
                    (BlockId(fallthrough.0), BlockId(target.0))
                };
                Terminator::Branch {
                    cond: raw,
                    then_block,
                    else_block,
                }
            }
            CfgTerminator::Return => {
                // Return/ReturnUndef already emitted the value in lift_instr
                let v = pop(&mut stack)?;
                Terminator::Return(v)
            }
            CfgTerminator::Throw => {
                return Err(CompileError::Unsupported(
                    "throw stays in the interpreter".into(),
                ))
            }
            CfgTerminator::End => {
                let r = func.alloc_reg();
                func.block_mut(block_id).instrs.push(Instr::ConstUndef { dest: r });
                Terminator::Return(r)
            }
        };
        func.block_mut(block_id).terminator = term;
        exit_stacks[bi] = Some(stack);
    }

    // Fill φ inputs from predecessor exit stacks
    for (bi, slot, phi) in pending_phis {
        let mut inputs = Vec::new();
        for p in &cfg.blocks[bi].preds {
            let Some(exit) = &exit_stacks[p.0 as usize] else {
                continue; // unreachable predecessor
            };
            let v = *exit.get(slot).ok_or_else(|| {
                CompileError::Unsupported("inconsistent stack depth at merge".into())
            })?;
            inputs.push((BlockId(p.0), v));
        }
        for instr in &mut func.block_mut(BlockId(bi as u32)).instrs {
            if let Instr::Phi { dest, inputs: phi_inputs } = instr {
                if *dest == phi {
                    *phi_inputs = inputs;
                    break;
                }
            }
        }
    }

    // OSR mode: enter at the loop header instead of offset 0
    if let Some(off) = osr_offset {
        let Some(&target) = cfg.offset_to_block.get(&(off as usize)) else {
            return Err(CompileError::Unsupported(format!(
                "no block starts at OSR offset {off}"
            )));
        };
        if entry_stacks[target.0 as usize]
            .as_ref()
            .map(|s| !s.is_empty())
            .unwrap_or(true)
        {
            return Err(CompileError::Unsupported(
                "OSR target expects a non-empty operand stack".into(),
            ));
        }
        let osr_entry = func.add_block(off);
        func.block_mut(osr_entry).terminator = Terminator::Jump(BlockId(target.0));
        func.entry = osr_entry;
        func.osr_offset = Some(off);
    }

    func.recompute_preds();
    attach_profile_hints(&mut func, profile);

    if let Err(e) = func.verify_ssa() {
        return Err(CompileError::Internal(format!("SSA violation: {e}")));
    }
    Ok((func, sites))
}

/// RPO over the bytecode CFG by block index
fn rpo_order(cfg: &crate::jit::analysis::BytecodeCfg) -> Vec<usize> {
    let n = cfg.blocks.len();
    let mut visited = vec![false; n];
    let mut post: Vec<usize> = Vec::with_capacity(n);
    let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
    visited[0] = true;
    while let Some(&mut (b, ref mut next)) = stack.last_mut() {
        let succs = cfg.successors(crate::jit::analysis::CfgBlockId(b as u32));
        if *next < succs.len() {
            let s = succs[*next].0 as usize;
            *next += 1;
            if !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            post.push(b);
            stack.pop();
        }
    }
    post.reverse();
    // Unreachable blocks go last, untouched
    for b in 0..n {
        if !visited[b] {
            post.push(b);
        }
    }
    post
}

fn propagate_stack(
    entry_stacks: &mut [Option<Vec<Reg>>],
    target: usize,
    stack: &[Reg],
) -> Result<(), CompileError> {
    match &entry_stacks[target] {
        None => {
            entry_stacks[target] = Some(stack.to_vec());
            Ok(())
        }
        Some(existing) if existing.len() == stack.len() => Ok(()),
        Some(_) => Err(CompileError::Unsupported(
            "inconsistent stack depth at merge".into(),
        )),
    }
}

fn pop(stack: &mut Vec<Reg>) -> Result<Reg, CompileError> {
    stack
        .pop()
        .ok_or_else(|| CompileError::Internal("operand stack underflow in lifter".into()))
}

#[allow(clippy::too_many_arguments)]
fn lift_instr(
    func: &mut IrFunction,
    sites: &mut SiteTable,
    block: BlockId,
    stack: &mut Vec<Reg>,
    offset: u32,
    opcode: Opcode,
    operands: Operands,
    function_id: FunctionId,
    consts: &[Const],
) -> Result<(), CompileError> {
    use Opcode::*;

    // Interpreter state at this opcode, for guards placed here: the stack
    // below already excludes nothing (operands still on it), locals are
    // current in the buffer.
    let record_site_deopt = |func: &mut IrFunction, sites: &mut SiteTable, stack: &[Reg]| {
        let id = func.add_deopt_state(DeoptState {
            reason: DeoptReason::TypeFeedback,
            frames: vec![DeoptFrame {
                function: function_id,
                bytecode_offset: offset,
                locals: DeoptLocals::Buffer,
                stack: stack.to_vec(),
                this: None,
            }],
        });
        sites.deopts.insert(offset, id);
        id
    };

    match opcode {
        Nop => {}

        LoadConst => {
            let Operands::U16(idx) = operands else { unreachable!() };
            let dest = func.alloc_reg();
            let (instr, ty) = match consts.get(idx as usize) {
                Some(Const::Integer(v)) => (Instr::ConstInt { dest, value: *v }, JsType::Int),
                Some(Const::Number(v)) => (Instr::ConstNum { dest, value: *v }, JsType::Double),
                Some(Const::Boolean(v)) => (Instr::ConstBool { dest, value: *v }, JsType::Boolean),
                Some(Const::Undefined) => (Instr::ConstUndef { dest }, JsType::Undefined),
                Some(Const::Null) => (Instr::ConstNull { dest }, JsType::Null),
                // Strings allocate, so they load through the runtime
                Some(Const::String(_)) | None => {
                    (Instr::ConstPool { dest, index: idx }, JsType::String)
                }
            };
            func.block_mut(block).instrs.push(instr);
            func.set_type(dest, TypeInfo::of(ty));
            stack.push(dest);
        }
        LoadUndef => {
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::ConstUndef { dest });
            func.set_type(dest, TypeInfo::of(JsType::Undefined));
            stack.push(dest);
        }
        LoadNull => {
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::ConstNull { dest });
            func.set_type(dest, TypeInfo::of(JsType::Null));
            stack.push(dest);
        }
        LoadTrue | LoadFalse => {
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::ConstBool {
                dest,
                value: opcode == LoadTrue,
            });
            func.set_type(dest, TypeInfo::of(JsType::Boolean));
            stack.push(dest);
        }
        Pop => {
            pop(stack)?;
        }
        Dup => {
            let top = *stack
                .last()
                .ok_or_else(|| CompileError::Internal("dup underflow".into()))?;
            stack.push(top);
        }
        LoadThis => {
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::LoadThis { dest });
            stack.push(dest);
        }

        LoadVar => {
            let Operands::U16(idx) = operands else { unreachable!() };
            let dest = func.alloc_reg();
            func.block_mut(block)
                .instrs
                .push(Instr::LoadLocal { dest, index: idx });
            stack.push(dest);
        }
        StoreVar => {
            let Operands::U16(idx) = operands else { unreachable!() };
            let value = pop(stack)?;
            func.block_mut(block)
                .instrs
                .push(Instr::StoreLocal { index: idx, value });
        }

        LoadGlobal | LoadName => {
            let Operands::U16(idx) = operands else { unreachable!() };
            if opcode == LoadName {
                return Err(CompileError::Unsupported(
                    "scope-chain name lookup stays in the interpreter".into(),
                ));
            }
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::LoadGlobal {
                dest,
                name: idx,
                site: offset,
            });
            stack.push(dest);
        }
        StoreGlobal | StoreName => {
            let Operands::U16(idx) = operands else { unreachable!() };
            if opcode == StoreName {
                return Err(CompileError::Unsupported(
                    "scope-chain name store stays in the interpreter".into(),
                ));
            }
            let value = pop(stack)?;
            func.block_mut(block).instrs.push(Instr::StoreGlobal {
                name: idx,
                value,
                site: offset,
            });
        }
        DeclName | PushScope | PopScope => {
            return Err(CompileError::Unsupported(
                "lexical scope manipulation stays in the interpreter".into(),
            ))
        }

        Add | Sub | Mul | Div | Mod => {
            let right = pop(stack)?;
            let left = pop(stack)?;
            // Deopt state captures the stack with both operands re-pushed,
            // so the interpreter re-executes this opcode from scratch
            let mut dstack = stack.clone();
            dstack.push(left);
            dstack.push(right);
            let deopt = record_site_deopt(func, sites, &dstack);
            let dest = func.alloc_reg();
            let op = match opcode {
                Add => BinOp::Add,
                Sub => BinOp::Sub,
                Mul => BinOp::Mul,
                Div => BinOp::Div,
                _ => BinOp::Mod,
            };
            func.block_mut(block).instrs.push(Instr::Binary {
                op,
                dest,
                left,
                right,
                site: offset,
                deopt,
            });
            stack.push(dest);
        }
        Neg => {
            let operand = pop(stack)?;
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::Neg { dest, operand });
            stack.push(dest);
        }
        Not => {
            let operand = pop(stack)?;
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::Not { dest, operand });
            func.set_type(dest, TypeInfo::of(JsType::Boolean));
            stack.push(dest);
        }

        Eq | Ne | StrictEq | StrictNe | Lt | Le | Gt | Ge => {
            let right = pop(stack)?;
            let left = pop(stack)?;
            let mut dstack = stack.clone();
            dstack.push(left);
            dstack.push(right);
            let deopt = record_site_deopt(func, sites, &dstack);
            let dest = func.alloc_reg();
            let op = match opcode {
                Eq => CmpOp::Eq,
                Ne => CmpOp::Ne,
                StrictEq => CmpOp::StrictEq,
                StrictNe => CmpOp::StrictNe,
                Lt => CmpOp::Lt,
                Le => CmpOp::Le,
                Gt => CmpOp::Gt,
                _ => CmpOp::Ge,
            };
            func.block_mut(block).instrs.push(Instr::Compare {
                op,
                dest,
                left,
                right,
                site: offset,
                deopt,
            });
            func.set_type(dest, TypeInfo::of(JsType::Boolean));
            stack.push(dest);
        }

        Typeof => {
            let operand = pop(stack)?;
            let dest = func.alloc_reg();
            func.block_mut(block)
                .instrs
                .push(Instr::Typeof { dest, operand });
            func.set_type(dest, TypeInfo::of(JsType::String));
            stack.push(dest);
        }
        InstanceOf => {
            let ctor = pop(stack)?;
            let value = pop(stack)?;
            let dest = func.alloc_reg();
            func.block_mut(block)
                .instrs
                .push(Instr::InstanceOf { dest, value, ctor });
            func.set_type(dest, TypeInfo::of(JsType::Boolean));
            stack.push(dest);
        }

        Jump | JumpIfFalse | JumpIfTrue => {
            // Handled by the CFG terminator translation
        }
        Return => {
            // Value stays on the stack for the terminator
        }
        ReturnUndef => {
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::ConstUndef { dest });
            stack.push(dest);
        }
        Throw => {
            return Err(CompileError::Unsupported(
                "throw stays in the interpreter".into(),
            ))
        }

        Call | CallMethod => {
            let Operands::U8(argc) = operands else { unreachable!() };
            let argc = argc as usize;
            if stack.len() < argc + 1 + (opcode == CallMethod) as usize {
                return Err(CompileError::Internal("call underflow in lifter".into()));
            }
            let args: Vec<Reg> = stack.split_off(stack.len() - argc);
            let callee = pop(stack)?;
            let this = if opcode == CallMethod {
                Some(pop(stack)?)
            } else {
                None
            };
            let dest = func.alloc_reg();
            // Caller state for deopts inside a future inlinee: stack with
            // the call operands gone, resuming after this opcode (the
            // inlinee's return value arrives like a frame return)
            let next = offset + 2; // opcode + argc byte
            sites
                .call_stacks
                .insert(offset, (stack.clone(), next));
            func.block_mut(block).instrs.push(Instr::Call {
                dest,
                callee,
                this,
                args,
                site: offset,
            });
            stack.push(dest);
        }

        GetProp => {
            let Operands::U16(idx) = operands else { unreachable!() };
            let object = pop(stack)?;
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::GetProp {
                dest,
                object,
                name: idx,
                site: offset,
            });
            stack.push(dest);
        }
        SetProp => {
            let Operands::U16(idx) = operands else { unreachable!() };
            let value = pop(stack)?;
            let object = pop(stack)?;
            func.block_mut(block).instrs.push(Instr::SetProp {
                object,
                name: idx,
                value,
                site: offset,
            });
        }
        GetElem => {
            let index = pop(stack)?;
            let object = pop(stack)?;
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::GetElem {
                dest,
                object,
                index,
                site: offset,
            });
            stack.push(dest);
        }
        SetElem => {
            let value = pop(stack)?;
            let index = pop(stack)?;
            let object = pop(stack)?;
            func.block_mut(block).instrs.push(Instr::SetElem {
                object,
                index,
                value,
                site: offset,
            });
        }

        NewObject => {
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::NewObject { dest });
            func.set_type(dest, TypeInfo::of(JsType::Object));
            stack.push(dest);
        }
        NewArray => {
            let Operands::U16(count) = operands else { unreachable!() };
            let count = count as usize;
            if stack.len() < count {
                return Err(CompileError::Internal("newarray underflow in lifter".into()));
            }
            let elems: Vec<Reg> = stack.split_off(stack.len() - count);
            let dest = func.alloc_reg();
            func.block_mut(block).instrs.push(Instr::NewArray { dest, elems });
            func.set_type(dest, TypeInfo::of(JsType::Array));
            stack.push(dest);
        }
        MakeFunction => {
            let Operands::U16(idx) = operands else { unreachable!() };
            let dest = func.alloc_reg();
            func.block_mut(block)
                .instrs
                .push(Instr::MakeFunction { dest, index: idx });
            func.set_type(dest, TypeInfo::of(JsType::Function));
            stack.push(dest);
        }
    }
    Ok(())
}

/// Attach dominant profiled types to generic-site operand values
fn attach_profile_hints(func: &mut IrFunction, profile: &ProfileSnapshot) {
    let mut hints: Vec<(Reg, JsType)> = Vec::new();
    for block in &func.blocks {
        for instr in &block.instrs {
            let (site, left, right) = match instr {
                Instr::Binary {
                    site, left, right, ..
                }
                | Instr::Compare {
                    site, left, right, ..
                } => (*site, *left, *right),
                _ => continue,
            };
            let Some(snap) = profile.site(site) else { continue };
            if let Some(t) = snap.stable_type(0) {
                hints.push((left, JsType::from_observed(t)));
            }
            if let Some(t) = snap.stable_type(1) {
                hints.push((right, JsType::from_observed(t)));
            }
        }
    }
    for (reg, ty) in hints {
        if func.type_of(reg).ty == JsType::Unknown {
            func.set_type(reg, TypeInfo::of(ty));
        }
    }
}
