//! Runtime helper implementations
//!
//! Every generic operation in compiled code lands here. Each helper
//! rebuilds the engine views from the raw pointers in `VmRefs`, runs the
//! same semantics the interpreter uses (the `ops` module), records an
//! engine-context error plus the context error flag on failure, and
//! refreshes the shape-id side table before returning (any helper may
//! have moved it by allocating).
//!
//! Safety: helpers run on the executor thread only, between two
//! well-defined points of the native code's execution; the engine
//! references they reconstruct do not alias any Rust reference held
//! across the native call.

use aero_core::{Heap, JsError, Value};

use crate::bytecode::{Const, Opcode};
use crate::context::{Context, LookupResult, StoreResult};
use crate::functions::{FunctionRecord, FunctionTable};
use crate::interpreter::{ops, Vm};
use crate::jit::ir::{BinOp, CmpOp};
use crate::jit::runtime::context::{HelperTable, JitContext};
use crate::jit::runtime::JitRuntime;
use crate::profiler::Profiler;

/// Build the function-pointer table compiled code dispatches through
pub fn helper_table() -> HelperTable {
    HelperTable {
        const_pool,
        binary_op,
        compare_op,
        neg,
        not,
        is_truthy,
        type_of,
        instance_of,
        get_prop,
        get_slot,
        set_prop,
        get_elem,
        set_elem,
        load_global,
        store_global,
        call,
        new_object,
        new_array,
        make_function,
        safepoint,
    }
}

struct Parts<'a> {
    heap: &'a mut Heap,
    ctx: &'a mut Context,
    funcs: &'a FunctionTable,
    profiler: &'a Profiler,
    jit: &'a JitRuntime,
    record: &'a FunctionRecord,
    synth: &'a Vec<Box<str>>,
}

unsafe fn parts<'a>(jc: *mut JitContext) -> Parts<'a> {
    let refs = &(*jc).vm;
    Parts {
        heap: &mut *(refs.heap as *mut Heap),
        ctx: &mut *(refs.ctx as *mut Context),
        funcs: &*(refs.funcs as *const FunctionTable),
        profiler: &*(refs.profiler as *const Profiler),
        jit: &*(refs.jit as *const JitRuntime),
        record: &*(refs.record as *const FunctionRecord),
        synth: &*(refs.synth as *const Vec<Box<str>>),
    }
}

unsafe fn finish(jc: *mut JitContext, heap: &Heap, result: Result<Value, JsError>) -> u64 {
    let (ptr, len) = heap.shape_ids_raw();
    (*jc).shape_ids_ptr = ptr;
    (*jc).shape_ids_len = len;
    match result {
        Ok(v) => v.to_bits(),
        Err(_) => {
            (*jc).error = 1;
            Value::undefined().to_bits()
        }
    }
}

/// Run a fallible body and route errors into the engine context
unsafe fn with_parts<'a>(
    jc: *mut JitContext,
    body: impl FnOnce(&mut Parts<'a>) -> Result<Value, JsError>,
) -> u64 {
    let mut p = parts::<'a>(jc);
    let result = body(&mut p);
    if let Err(ref e) = result {
        if !p.ctx.has_error() {
            p.ctx.set_error(e.clone());
        }
    }
    let heap: &Heap = p.heap;
    finish(jc, heap, result)
}

fn vm<'a, 'b>(p: &'a mut Parts<'b>) -> Vm<'a> {
    Vm::new(p.heap, p.ctx, p.funcs, p.profiler, p.jit)
}

// ===== helpers =====

pub unsafe extern "C" fn const_pool(jc: *mut JitContext, index: u32) -> u64 {
    with_parts(jc, |p| {
        if index & 0x8000 != 0 {
            let s = p
                .synth
                .get((index & 0x7FFF) as usize)
                .ok_or_else(|| JsError::internal("synthesized constant out of range"))?;
            let s = s.clone();
            return Ok(p.heap.alloc_string(&s));
        }
        match p.record.bytecode.consts.get(index as usize) {
            Some(Const::String(s)) => {
                let s = s.clone();
                Ok(p.heap.alloc_string(&s))
            }
            Some(Const::Integer(v)) => Ok(Value::integer(*v)),
            Some(Const::Number(v)) => Ok(Value::number(*v)),
            Some(Const::Boolean(v)) => Ok(Value::boolean(*v)),
            Some(Const::Null) => Ok(Value::null()),
            Some(Const::Undefined) => Ok(Value::undefined()),
            None => Err(JsError::internal("constant index out of range")),
        }
    })
}

pub unsafe extern "C" fn binary_op(jc: *mut JitContext, op: u32, l: u64, r: u64, site: u32) -> u64 {
    with_parts(jc, |p| {
        let (a, b) = (Value::from_bits(l), Value::from_bits(r));
        if site != u32::MAX {
            p.profiler.record_type(p.record.id, site, 0, a);
            p.profiler.record_type(p.record.id, site, 1, b);
        }
        match decode_binop(op) {
            BinOp::Add => ops::add(p.heap, a, b),
            BinOp::Sub => ops::arith(p.heap, Opcode::Sub, a, b),
            BinOp::Mul => ops::arith(p.heap, Opcode::Mul, a, b),
            BinOp::Div => ops::arith(p.heap, Opcode::Div, a, b),
            BinOp::Mod => ops::arith(p.heap, Opcode::Mod, a, b),
        }
    })
}

pub unsafe extern "C" fn compare_op(
    jc: *mut JitContext,
    op: u32,
    l: u64,
    r: u64,
    site: u32,
) -> u64 {
    with_parts(jc, |p| {
        let (a, b) = (Value::from_bits(l), Value::from_bits(r));
        if site != u32::MAX {
            p.profiler.record_type(p.record.id, site, 0, a);
            p.profiler.record_type(p.record.id, site, 1, b);
        }
        let opcode = match decode_cmpop(op) {
            CmpOp::Eq => Opcode::Eq,
            CmpOp::Ne => Opcode::Ne,
            CmpOp::StrictEq => Opcode::StrictEq,
            CmpOp::StrictNe => Opcode::StrictNe,
            CmpOp::Lt => Opcode::Lt,
            CmpOp::Le => Opcode::Le,
            CmpOp::Gt => Opcode::Gt,
            CmpOp::Ge => Opcode::Ge,
        };
        match opcode {
            Opcode::Eq | Opcode::Ne | Opcode::StrictEq | Opcode::StrictNe => {
                ops::equality(p.heap, opcode, a, b)
            }
            _ => ops::relational(p.heap, opcode, a, b),
        }
    })
}

pub unsafe extern "C" fn neg(jc: *mut JitContext, v: u64) -> u64 {
    with_parts(jc, |p| ops::negate(p.heap, Value::from_bits(v)))
}

pub unsafe extern "C" fn not(jc: *mut JitContext, v: u64) -> u64 {
    with_parts(jc, |p| {
        Ok(Value::boolean(!p.heap.is_truthy(Value::from_bits(v))))
    })
}

pub unsafe extern "C" fn is_truthy(jc: *mut JitContext, v: u64) -> u64 {
    let p = parts(jc);
    p.heap.is_truthy(Value::from_bits(v)) as u64
}

pub unsafe extern "C" fn type_of(jc: *mut JitContext, v: u64) -> u64 {
    with_parts(jc, |p| Ok(ops::type_of(p.heap, Value::from_bits(v))))
}

pub unsafe extern "C" fn instance_of(jc: *mut JitContext, v: u64, ctor: u64) -> u64 {
    with_parts(jc, |p| {
        ops::instance_of(p.heap, p.ctx, Value::from_bits(v), Value::from_bits(ctor))
    })
}

pub unsafe extern "C" fn get_prop(jc: *mut JitContext, obj: u64, name: u32, site: u32) -> u64 {
    with_parts(jc, |p| {
        let atom = *p
            .record
            .atoms
            .get(name as usize)
            .ok_or_else(|| JsError::internal("name index out of range"))?;
        let fid = p.record.id;
        vm(p).get_prop_named(fid, site, Value::from_bits(obj), atom)
    })
}

/// Monomorphic fast-path tail: the shape check already passed, so the
/// slot holds the property as a data value
pub unsafe extern "C" fn get_slot(jc: *mut JitContext, slot: u32, obj: u64) -> u64 {
    let p = parts(jc);
    let v = Value::from_bits(obj);
    let value = v
        .object_id()
        .and_then(|id| match p.heap.object(id).slots.get(slot as usize) {
            Some(aero_core::PropertySlot::Data(v)) => Some(*v),
            _ => None,
        })
        .unwrap_or(Value::undefined());
    value.to_bits()
}

pub unsafe extern "C" fn set_prop(
    jc: *mut JitContext,
    obj: u64,
    name: u32,
    value: u64,
    site: u32,
) -> u64 {
    with_parts(jc, |p| {
        let atom = *p
            .record
            .atoms
            .get(name as usize)
            .ok_or_else(|| JsError::internal("name index out of range"))?;
        let fid = p.record.id;
        vm(p).set_prop_named(
            fid,
            site,
            Value::from_bits(obj),
            atom,
            Value::from_bits(value),
        )?;
        Ok(Value::undefined())
    })
}

pub unsafe extern "C" fn get_elem(jc: *mut JitContext, obj: u64, index: u64) -> u64 {
    with_parts(jc, |p| {
        vm(p).get_element(Value::from_bits(obj), Value::from_bits(index))
    })
}

pub unsafe extern "C" fn set_elem(jc: *mut JitContext, obj: u64, index: u64, value: u64) -> u64 {
    with_parts(jc, |p| {
        vm(p).set_element(
            Value::from_bits(obj),
            Value::from_bits(index),
            Value::from_bits(value),
        )?;
        Ok(Value::undefined())
    })
}

pub unsafe extern "C" fn load_global(jc: *mut JitContext, name: u32) -> u64 {
    with_parts(jc, |p| {
        let atom = *p
            .record
            .atoms
            .get(name as usize)
            .ok_or_else(|| JsError::internal("name index out of range"))?;
        let global = p.ctx.global_object();
        match p.ctx.lookup_named(p.heap, global, atom) {
            LookupResult::Data(v) => Ok(v),
            LookupResult::Accessor { getter } => {
                let this = p.heap.value_of(global);
                match getter {
                    Some(g) => {
                        let gv = p.heap.value_of(g);
                        vm(p).call_value(gv, this, &[])
                    }
                    None => Ok(Value::undefined()),
                }
            }
            LookupResult::Missing => Err(JsError::reference(format!(
                "{} is not defined",
                p.heap.atoms.name(atom)
            ))),
        }
    })
}

pub unsafe extern "C" fn store_global(jc: *mut JitContext, name: u32, value: u64) -> u64 {
    with_parts(jc, |p| {
        let atom = *p
            .record
            .atoms
            .get(name as usize)
            .ok_or_else(|| JsError::internal("name index out of range"))?;
        let global = p.ctx.global_object();
        let v = Value::from_bits(value);
        match p.ctx.store_named(p.heap, global, atom, v) {
            StoreResult::Done => Ok(Value::undefined()),
            StoreResult::Setter { setter } => {
                let this = p.heap.value_of(global);
                let sv = p.heap.value_of(setter);
                vm(p).call_value(sv, this, &[v])?;
                Ok(Value::undefined())
            }
            StoreResult::Rejected => {
                if p.ctx.config.strict_mode {
                    Err(JsError::type_error(format!(
                        "cannot assign to read-only property {}",
                        p.heap.atoms.name(atom)
                    )))
                } else {
                    Ok(Value::undefined())
                }
            }
        }
    })
}

pub unsafe extern "C" fn call(jc: *mut JitContext, callee: u64, this: u64, argc: u32) -> u64 {
    // Copy the staged arguments before any reentrancy can overwrite them
    let args: Vec<Value> = (0..argc as usize)
        .map(|i| Value::from_bits((*jc).call_args[i]))
        .collect();
    with_parts(jc, |p| {
        vm(p).call_value(Value::from_bits(callee), Value::from_bits(this), &args)
    })
}

pub unsafe extern "C" fn new_object(jc: *mut JitContext) -> u64 {
    with_parts(jc, |p| Ok(p.heap.alloc_object(None)))
}

pub unsafe extern "C" fn new_array(jc: *mut JitContext, count: u32) -> u64 {
    let elems: Vec<Value> = (0..count as usize)
        .map(|i| Value::from_bits((*jc).call_args[i]))
        .collect();
    with_parts(jc, |p| {
        let mut storage = aero_core::ArrayStorage::new();
        for (i, e) in elems.iter().enumerate() {
            storage.set(i as u32, *e);
        }
        Ok(p.heap.alloc_array(None, storage))
    })
}

pub unsafe extern "C" fn make_function(jc: *mut JitContext, index: u32) -> u64 {
    with_parts(jc, |p| {
        let inner_id = *p
            .record
            .inner
            .get(index as usize)
            .ok_or_else(|| JsError::internal("function index out of range"))?;
        let inner = p
            .funcs
            .record(inner_id)
            .ok_or_else(|| JsError::internal("dangling inner function"))?;
        let data = aero_core::FunctionData {
            function_id: inner_id,
            param_count: inner.bytecode.param_count as u32,
            kind: aero_core::FunctionKind::Bytecode,
        };
        Ok(p.heap.alloc_function(None, data))
    })
}

/// Back-edge poll: execution-limit accounting and interrupt handling.
/// GC is deliberately deferred to interpreter safepoints, where every
/// live value is a scanned root; compiled frames keep values in machine
/// registers the collector cannot see.
pub unsafe extern "C" fn safepoint(jc: *mut JitContext) -> u64 {
    let mut p = parts(jc);
    match p.ctx.tick(8) {
        Ok(()) => 0,
        Err(e) => {
            p.ctx.set_error(e);
            (*jc).error = 1;
            1
        }
    }
}

fn decode_binop(op: u32) -> BinOp {
    match op {
        0 => BinOp::Add,
        1 => BinOp::Sub,
        2 => BinOp::Mul,
        3 => BinOp::Div,
        _ => BinOp::Mod,
    }
}

fn decode_cmpop(op: u32) -> CmpOp {
    match op {
        0 => CmpOp::Eq,
        1 => CmpOp::Ne,
        2 => CmpOp::StrictEq,
        3 => CmpOp::StrictNe,
        4 => CmpOp::Lt,
        5 => CmpOp::Le,
        6 => CmpOp::Gt,
        _ => CmpOp::Ge,
    }
}
