//! Deoptimization: from a native trap back to interpreter frames
//!
//! A guard failure returns from compiled code with a trap code and a
//! deopt-point index in the jit context; the exit stub has already parked
//! every live value in the context's save area. This module reads the
//! point's live-value map and rebuilds the interpreter frames — all of
//! them, when the trap happened inside an inlined callee: the chain runs
//! from the outermost inlined root down to the faulting frame. Root-frame
//! locals come straight from the locals buffer, which compiled code keeps
//! current by writing through on every local store.
//!
//! Deoptimization is not an error: the caller resumes interpretation at
//! the recorded bytecode offsets and user code never observes the tier
//! change.

use std::sync::Arc;

use aero_core::{JsError, Value};

use crate::functions::{FunctionRecord, FunctionTable};
use crate::jit::backend::traits::CompiledDeoptPoint;
use crate::jit::code::CodeEntry;
use crate::jit::ir::{DeoptLocals, DeoptReason, Reg};

/// Guard failures after which a function is polluted: optimizing
/// recompiles are inhibited until the profile stabilizes
pub const DEOPT_LIMIT: u32 = 5;

/// One reconstructed interpreter frame
pub struct ResumeFrame {
    pub function: Arc<FunctionRecord>,
    pub pc: u32,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    pub this_value: Value,
}

/// What a native invocation produced
pub enum NativeOutcome {
    Return(Value),
    /// Reconstructed frames, outermost first; the interpreter resumes the
    /// innermost at its recorded offset
    Trap(Vec<ResumeFrame>),
}

/// Rebuild interpreter frames for a trap at `point`
pub fn reconstruct_frames(
    entry: &CodeEntry,
    point_index: u32,
    save_area: &[u64],
    locals_buffer: &[Value],
    root_this: Value,
    funcs: &FunctionTable,
) -> Result<Vec<ResumeFrame>, JsError> {
    let point: &CompiledDeoptPoint = entry
        .deopt_point(point_index)
        .ok_or_else(|| JsError::internal(format!("unknown deopt point {point_index}")))?;

    let fetch = |r: Reg| -> Result<Value, JsError> {
        let slot = point
            .save_slots
            .get(&r)
            .copied()
            .ok_or_else(|| JsError::internal(format!("deopt value {r} was not saved")))?;
        let bits = save_area
            .get(slot as usize)
            .copied()
            .ok_or_else(|| JsError::internal("deopt save slot out of range"))?;
        Ok(Value::from_bits(bits))
    };

    let mut frames = Vec::with_capacity(point.state.frames.len());
    for frame in &point.state.frames {
        let function = funcs
            .record(frame.function)
            .ok_or_else(|| JsError::internal("deopt frame names an unknown function"))?;
        let locals = match &frame.locals {
            DeoptLocals::Buffer => {
                let want =
                    function.bytecode.param_count as usize + function.bytecode.local_count as usize;
                let mut l = locals_buffer.to_vec();
                l.resize(want, Value::undefined());
                l
            }
            DeoptLocals::Regs(regs) => {
                let mut l = Vec::with_capacity(regs.len());
                for &r in regs {
                    l.push(fetch(r)?);
                }
                let want =
                    function.bytecode.param_count as usize + function.bytecode.local_count as usize;
                l.resize(want, Value::undefined());
                l
            }
        };
        let mut stack = Vec::with_capacity(frame.stack.len());
        for &r in &frame.stack {
            stack.push(fetch(r)?);
        }
        let this_value = match frame.this {
            Some(r) => fetch(r)?,
            None => root_this,
        };
        frames.push(ResumeFrame {
            function,
            pc: frame.bytecode_offset,
            locals,
            stack,
            this_value,
        });
    }

    tracing::debug!(
        function = entry.function_id.0,
        point = point_index,
        reason = ?point.reason,
        frames = frames.len(),
        "deoptimizing"
    );
    Ok(frames)
}

/// Per-function bookkeeping after a deopt. Returns true when the function
/// crossed the pollution threshold and was demoted.
pub fn record_deopt(record: &FunctionRecord, reason: DeoptReason) -> bool {
    let count = record.record_deopt();
    tracing::debug!(
        function = record.id.0,
        count,
        ?reason,
        "guard failure recorded"
    );
    if count >= DEOPT_LIMIT {
        record
            .polluted
            .store(true, std::sync::atomic::Ordering::Release);
        record.demote();
        true
    } else {
        // Below the threshold the optimized entry stays installed: a
        // one-off type excursion should not throw away good code
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, ModuleBuilder, Opcode};
    use aero_core::Heap;

    fn table_with_one() -> (FunctionTable, Arc<FunctionRecord>) {
        let mut m = ModuleBuilder::new();
        let mut f = BytecodeBuilder::new("f", 1, 1);
        f.load_var(0);
        f.emit(Opcode::Return);
        m.function(f.finish());
        let table = FunctionTable::new();
        let mut heap = Heap::new(0);
        let ids = table.load_module(&mut heap, &m.finish());
        let rec = table.record(ids[0]).unwrap();
        (table, rec)
    }

    #[test]
    fn test_deopt_counting_and_pollution() {
        let (_t, rec) = table_with_one();
        for i in 1..DEOPT_LIMIT {
            let polluted = record_deopt(&rec, DeoptReason::TypeCheckFailed);
            assert!(!polluted, "polluted too early at {i}");
        }
        assert!(record_deopt(&rec, DeoptReason::TypeCheckFailed));
        assert!(rec.polluted.load(std::sync::atomic::Ordering::Acquire));
    }
}
