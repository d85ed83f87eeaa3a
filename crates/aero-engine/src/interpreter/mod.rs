//! Bytecode interpreter
//!
//! An explicit-frame-stack loop: JS-level calls push a `Frame` instead of
//! recursing in Rust, which is what lets the deoptimizer materialize
//! reconstructed frames and lets OSR splice a running loop out to native
//! code. Safepoints sit at function entry and loop back-edges; they are
//! the only places the GC runs, the execution limit trips, OSR enters, or
//! a deopt resumes.

pub mod ops;

use std::sync::Arc;

use aero_core::{
    ErrorKind, FunctionKind, Heap, HeapKind, JsError, ObjectData, PropertyKey, Value,
};

use crate::bytecode::{read_i32, read_u16, DeclKind, Const, Opcode};
use crate::context::{Context, LookupResult, StoreResult};
use crate::functions::{FunctionCode, FunctionRecord, FunctionTable};
use crate::jit::ic::IcKind;
use crate::jit::{JitRuntime, NativeOutcome, ResumeFrame};
use crate::profiler::{EntryToken, Profiler};

/// Instructions between execution-limit/GC checks inside straight-line
/// code (back-edges and calls always check)
const SAFEPOINT_GRANULARITY: u64 = 256;

/// One interpreter activation
pub struct Frame {
    pub function: Arc<FunctionRecord>,
    pub pc: usize,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    pub this_value: Value,
    scope_depth_at_entry: usize,
    entry_token: Option<EntryToken>,
}

impl Frame {
    pub fn new(
        function: Arc<FunctionRecord>,
        this_value: Value,
        args: &[Value],
        scope_depth: usize,
        entry_token: Option<EntryToken>,
    ) -> Frame {
        let param_count = function.bytecode.param_count as usize;
        let local_count = function.bytecode.local_count as usize;
        let mut locals = vec![Value::undefined(); param_count + local_count];
        for (i, arg) in args.iter().take(param_count).enumerate() {
            locals[i] = *arg;
        }
        Frame {
            function,
            pc: 0,
            locals,
            stack: Vec::with_capacity(8),
            this_value,
            scope_depth_at_entry: scope_depth,
            entry_token,
        }
    }

    /// Rebuild a frame from deoptimization state
    pub fn resume(resume: ResumeFrame, scope_depth: usize) -> Frame {
        Frame {
            function: resume.function,
            pc: resume.pc as usize,
            locals: resume.locals,
            stack: resume.stack,
            this_value: resume.this_value,
            scope_depth_at_entry: scope_depth,
            entry_token: None,
        }
    }
}

/// The executor: mutable views over everything one JS thread touches
pub struct Vm<'a> {
    pub heap: &'a mut Heap,
    pub ctx: &'a mut Context,
    pub funcs: &'a FunctionTable,
    pub profiler: &'a Profiler,
    pub jit: &'a JitRuntime,
}

impl<'a> Vm<'a> {
    pub fn new(
        heap: &'a mut Heap,
        ctx: &'a mut Context,
        funcs: &'a FunctionTable,
        profiler: &'a Profiler,
        jit: &'a JitRuntime,
    ) -> Self {
        Vm {
            heap,
            ctx,
            funcs,
            profiler,
            jit,
        }
    }

    // ===== Public call surface =====

    /// Call a callable value. Failures set the context error slot and
    /// propagate as `Err`.
    pub fn call_value(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, JsError> {
        let result = self.call_value_inner(callee, this, args);
        if let Err(ref e) = result {
            if !self.ctx.has_error() {
                self.ctx.set_error(e.clone());
            }
        }
        result
    }

    fn call_value_inner(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, JsError> {
        let Some(data) = callee
            .object_id()
            .filter(|_| callee.is_function())
            .map(|id| *self.heap.object(id).function_data().expect("function cell"))
        else {
            return Err(JsError::type_error(format!(
                "{} is not a function",
                self.heap.to_display(callee)
            )));
        };
        match data.kind {
            FunctionKind::Native => self.call_native(data.function_id, this, args),
            FunctionKind::Bytecode => {
                let record = self
                    .funcs
                    .record(data.function_id)
                    .ok_or_else(|| JsError::internal("dangling function id"))?;
                self.call_record(record, this, args)
            }
        }
    }

    fn call_native(
        &mut self,
        id: aero_core::FunctionId,
        this: Value,
        args: &[Value],
    ) -> Result<Value, JsError> {
        match self.funcs.resolve(id) {
            Some(FunctionCode::Native(f)) => f(self.heap, self.ctx, this, args),
            _ => Err(JsError::internal("native function id does not resolve")),
        }
    }

    /// Call a bytecode function record: counts the entry, consults the
    /// dispatcher for a compiled entry, and falls back to interpretation.
    pub fn call_record(
        &mut self,
        record: Arc<FunctionRecord>,
        this: Value,
        args: &[Value],
    ) -> Result<Value, JsError> {
        let token = self.profiler.record_entry(record.id);
        self.ctx.tick(1)?;

        if let Some(entry) = self.jit.on_function_entry(&record, self.profiler) {
            match self.execute_native(&entry, &record, this, args)? {
                NativeOutcome::Return(v) => {
                    self.profiler.record_exit(record.id, token, v);
                    return Ok(v);
                }
                NativeOutcome::Trap(frames) => {
                    let v = self.run_resumed(frames, this)?;
                    self.profiler.record_exit(record.id, token, v);
                    return Ok(v);
                }
            }
        }

        let frame = Frame::new(record, this, args, self.ctx.scope_depth(), Some(token));
        self.run(vec![frame])
    }

    fn execute_native(
        &mut self,
        entry: &Arc<crate::jit::code::CodeEntry>,
        record: &Arc<FunctionRecord>,
        this: Value,
        args: &[Value],
    ) -> Result<NativeOutcome, JsError> {
        let jit = self.jit;
        jit.execute(
            entry,
            self.heap,
            self.ctx,
            self.funcs,
            self.profiler,
            record,
            this,
            args,
        )
    }

    fn run_resumed(&mut self, resumed: Vec<ResumeFrame>, _this: Value) -> Result<Value, JsError> {
        let depth = self.ctx.scope_depth();
        let frames: Vec<Frame> = resumed
            .into_iter()
            .map(|r| Frame::resume(r, depth))
            .collect();
        self.run(frames)
    }

    // ===== The dispatch loop =====

    fn run(&mut self, mut frames: Vec<Frame>) -> Result<Value, JsError> {
        debug_assert!(!frames.is_empty());
        let mut ticks: u64 = 0;
        let mut last_return = Value::undefined();

        'dispatch: loop {
            if ticks >= SAFEPOINT_GRANULARITY {
                self.safepoint(&mut frames, &mut ticks)?;
            }
            let Some(frame) = frames.last_mut() else {
                return Ok(last_return);
            };
            let code: &[u8] = &frame.function.bytecode.code;
            if frame.pc >= code.len() {
                // Implicit return at end of code
                let done = self.finish_frame(&mut frames, Value::undefined());
                last_return = done;
                continue;
            }

            let op_pc = frame.pc;
            let op = match Opcode::from_u8(code[op_pc]) {
                Some(op) => op,
                None => {
                    let e = JsError::internal(format!(
                        "invalid opcode {:#04x} at {}",
                        code[op_pc], op_pc
                    ));
                    if self.raise(&mut frames, e.clone())? {
                        continue;
                    }
                    return Err(e);
                }
            };
            frame.pc += 1 + op.operand_size();
            ticks += 1;

            let step = self.step(&mut frames, op, op_pc);
            match step {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Returned(v)) => {
                    last_return = v;
                }
                Ok(StepResult::Safepoint) => {
                    self.safepoint(&mut frames, &mut ticks)?;
                }
                Err(e) => {
                    if self.raise(&mut frames, e.clone())? {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn step(
        &mut self,
        frames: &mut Vec<Frame>,
        op: Opcode,
        op_pc: usize,
    ) -> Result<StepResult, JsError> {
        use Opcode::*;
        match op {
            Nop => {}

            // ===== Constants and stack =====
            LoadConst => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let c = frame.function.bytecode.consts[idx].clone();
                let v = self.materialize_const(&c);
                frames.last_mut().unwrap().stack.push(v);
            }
            LoadUndef => frames.last_mut().unwrap().stack.push(Value::undefined()),
            LoadNull => frames.last_mut().unwrap().stack.push(Value::null()),
            LoadTrue => frames.last_mut().unwrap().stack.push(Value::boolean(true)),
            LoadFalse => frames.last_mut().unwrap().stack.push(Value::boolean(false)),
            Pop => {
                self.pop(frames)?;
            }
            Dup => {
                let frame = frames.last_mut().unwrap();
                let top = *frame
                    .stack
                    .last()
                    .ok_or_else(|| JsError::internal("dup on empty stack"))?;
                frame.stack.push(top);
            }
            LoadThis => {
                let frame = frames.last_mut().unwrap();
                frame.stack.push(frame.this_value);
            }

            // ===== Locals =====
            LoadVar => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let v = *frame
                    .locals
                    .get(idx)
                    .ok_or_else(|| JsError::internal("local index out of range"))?;
                frame.stack.push(v);
            }
            StoreVar => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let v = frame
                    .stack
                    .pop()
                    .ok_or_else(|| JsError::internal("store on empty stack"))?;
                *frame
                    .locals
                    .get_mut(idx)
                    .ok_or_else(|| JsError::internal("local index out of range"))? = v;
            }

            // ===== Globals and names =====
            LoadGlobal | LoadName => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let atom = frame.function.atoms[idx];
                let v = if op == LoadName {
                    self.ctx.get_variable(self.heap, atom)?
                } else {
                    match self
                        .ctx
                        .lookup_named(self.heap, self.ctx.global_object(), atom)
                    {
                        LookupResult::Data(v) => v,
                        LookupResult::Accessor { getter } => {
                            let this = self.heap.value_of(self.ctx.global_object());
                            self.call_accessor(getter, this)?
                        }
                        LookupResult::Missing => {
                            return Err(JsError::reference(format!(
                                "{} is not defined",
                                self.heap.atoms.name(atom)
                            )))
                        }
                    }
                };
                frames.last_mut().unwrap().stack.push(v);
            }
            StoreGlobal | StoreName => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let atom = frame.function.atoms[idx];
                let v = frame
                    .stack
                    .pop()
                    .ok_or_else(|| JsError::internal("store on empty stack"))?;
                if op == StoreName {
                    self.ctx.set_variable(self.heap, atom, v)?;
                } else {
                    let global = self.ctx.global_object();
                    match self.ctx.store_named(self.heap, global, atom, v) {
                        StoreResult::Done => {}
                        StoreResult::Setter { setter } => {
                            let this = self.heap.value_of(global);
                            self.call_value_inner(self.heap.value_of(setter), this, &[v])?;
                        }
                        StoreResult::Rejected => {
                            if self.ctx.config.strict_mode {
                                return Err(JsError::type_error(format!(
                                    "cannot assign to read-only property {}",
                                    self.heap.atoms.name(atom)
                                )));
                            }
                        }
                    }
                }
            }
            DeclName => {
                let frame = frames.last_mut().unwrap();
                let code = &frame.function.bytecode.code;
                let kind = DeclKind::from_u8(code[op_pc + 1]);
                let idx = read_u16(code, op_pc + 2) as usize;
                let atom = frame.function.atoms[idx];
                let v = frame
                    .stack
                    .pop()
                    .ok_or_else(|| JsError::internal("decl on empty stack"))?;
                self.ctx.declare_variable(atom, kind.into(), v);
            }
            PushScope => self.ctx.push_scope(),
            PopScope => self.ctx.pop_scope(),

            // ===== Arithmetic =====
            Add | Sub | Mul | Div | Mod => {
                let (a, b) = self.pop2(frames)?;
                let frame = frames.last().unwrap();
                let fid = frame.function.id;
                self.profiler.record_type(fid, op_pc as u32, 0, a);
                self.profiler.record_type(fid, op_pc as u32, 1, b);
                let r = if op == Add {
                    ops::add(self.heap, a, b)?
                } else {
                    ops::arith(self.heap, op, a, b)?
                };
                frames.last_mut().unwrap().stack.push(r);
            }
            Neg => {
                let a = self.pop(frames)?;
                let r = ops::negate(self.heap, a)?;
                frames.last_mut().unwrap().stack.push(r);
            }
            Not => {
                let a = self.pop(frames)?;
                let r = Value::boolean(!self.heap.is_truthy(a));
                frames.last_mut().unwrap().stack.push(r);
            }

            // ===== Comparison =====
            Eq | Ne | StrictEq | StrictNe => {
                let (a, b) = self.pop2(frames)?;
                let r = ops::equality(self.heap, op, a, b)?;
                frames.last_mut().unwrap().stack.push(r);
            }
            Lt | Le | Gt | Ge => {
                let (a, b) = self.pop2(frames)?;
                let frame = frames.last().unwrap();
                let fid = frame.function.id;
                self.profiler.record_type(fid, op_pc as u32, 0, a);
                self.profiler.record_type(fid, op_pc as u32, 1, b);
                let r = ops::relational(self.heap, op, a, b)?;
                frames.last_mut().unwrap().stack.push(r);
            }

            Typeof => {
                let a = self.pop(frames)?;
                let r = ops::type_of(self.heap, a);
                frames.last_mut().unwrap().stack.push(r);
            }
            InstanceOf => {
                let (a, b) = self.pop2(frames)?;
                let r = ops::instance_of(self.heap, self.ctx, a, b)?;
                frames.last_mut().unwrap().stack.push(r);
            }

            // ===== Control flow =====
            Jump => {
                let frame = frames.last_mut().unwrap();
                let off = read_i32(&frame.function.bytecode.code, op_pc + 1);
                frame.pc = (op_pc as i64 + off as i64) as usize;
                if off < 0 {
                    return self.backedge(frames, op_pc);
                }
            }
            JumpIfFalse | JumpIfTrue => {
                let cond = self.pop(frames)?;
                let truthy = self.heap.is_truthy(cond);
                let jump_taken = if op == JumpIfFalse { !truthy } else { truthy };
                let frame = frames.last_mut().unwrap();
                self.profiler
                    .record_branch(frame.function.id, op_pc as u32, jump_taken);
                if jump_taken {
                    let off = read_i32(&frame.function.bytecode.code, op_pc + 1);
                    frame.pc = (op_pc as i64 + off as i64) as usize;
                    if off < 0 {
                        return self.backedge(frames, op_pc);
                    }
                }
            }

            Call | CallMethod => {
                let frame = frames.last_mut().unwrap();
                let argc = frame.function.bytecode.code[op_pc + 1] as usize;
                if frame.stack.len() < argc + 1 + (op == CallMethod) as usize {
                    return Err(JsError::internal("call with underfull stack"));
                }
                let args: Vec<Value> = frame.stack.split_off(frame.stack.len() - argc);
                let callee = frame.stack.pop().unwrap();
                let this = if op == CallMethod {
                    frame.stack.pop().unwrap()
                } else {
                    Value::undefined()
                };
                let fid = frame.function.id;
                if let Some(id) = callee.object_id().filter(|_| callee.is_function()) {
                    if let Some(fd) = self.heap.object(id).function_data() {
                        self.profiler
                            .record_call_target(fid, op_pc as u32, fd.function_id);
                    }
                }
                if op == CallMethod {
                    if let Some(rid) = this.object_id().filter(|_| this.is_object_like()) {
                        let shape = self.heap.object(rid).shape;
                        self.profiler.record_shape(fid, op_pc as u32, shape);
                    }
                }
                self.ctx.tick(1)?;
                return self.dispatch_call(frames, callee, this, &args);
            }

            Return | ReturnUndef => {
                let v = if op == Return {
                    self.pop(frames)?
                } else {
                    Value::undefined()
                };
                let v = self.finish_frame(frames, v);
                return Ok(StepResult::Returned(v));
            }

            Throw => {
                let v = self.pop(frames)?;
                let kind = self.thrown_kind(v);
                let msg = format!("uncaught {}", self.heap.to_display(v));
                let err = JsError::new(kind, msg);
                self.ctx.set_thrown(err.clone(), v);
                return Err(err);
            }

            // ===== Properties =====
            GetProp => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let atom = frame.function.atoms[idx];
                let fid = frame.function.id;
                let receiver = frame
                    .stack
                    .pop()
                    .ok_or_else(|| JsError::internal("getprop on empty stack"))?;
                let v = self.get_prop_named(fid, op_pc as u32, receiver, atom)?;
                frames.last_mut().unwrap().stack.push(v);
            }
            SetProp => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let atom = frame.function.atoms[idx];
                let fid = frame.function.id;
                let v = frame.stack.pop();
                let receiver = frame.stack.pop();
                let (Some(v), Some(receiver)) = (v, receiver) else {
                    return Err(JsError::internal("setprop on underfull stack"));
                };
                self.set_prop_named(fid, op_pc as u32, receiver, atom, v)?;
            }
            GetElem => {
                let (receiver, key) = self.pop2(frames)?;
                let v = self.get_element(receiver, key)?;
                frames.last_mut().unwrap().stack.push(v);
            }
            SetElem => {
                let frame = frames.last_mut().unwrap();
                let v = frame.stack.pop();
                let key = frame.stack.pop();
                let receiver = frame.stack.pop();
                let (Some(v), Some(key), Some(receiver)) = (v, key, receiver) else {
                    return Err(JsError::internal("setelem on underfull stack"));
                };
                self.set_element(receiver, key, v)?;
            }

            // ===== Allocation =====
            NewObject => {
                let v = self.heap.alloc_object(None);
                frames.last_mut().unwrap().stack.push(v);
            }
            NewArray => {
                let frame = frames.last_mut().unwrap();
                let count = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                if frame.stack.len() < count {
                    return Err(JsError::internal("newarray with underfull stack"));
                }
                let elems: Vec<Value> = frame.stack.split_off(frame.stack.len() - count);
                let mut storage = aero_core::ArrayStorage::new();
                for (i, e) in elems.into_iter().enumerate() {
                    storage.set(i as u32, e);
                }
                let v = self.heap.alloc_array(None, storage);
                frames.last_mut().unwrap().stack.push(v);
            }
            MakeFunction => {
                let frame = frames.last_mut().unwrap();
                let idx = read_u16(&frame.function.bytecode.code, op_pc + 1) as usize;
                let inner_id = *frame
                    .inner_id(idx)
                    .ok_or_else(|| JsError::internal("function index out of range"))?;
                let record = self
                    .funcs
                    .record(inner_id)
                    .ok_or_else(|| JsError::internal("dangling inner function"))?;
                let data = aero_core::FunctionData {
                    function_id: inner_id,
                    param_count: record.bytecode.param_count as u32,
                    kind: FunctionKind::Bytecode,
                };
                let v = self.heap.alloc_function(None, data);
                frames.last_mut().unwrap().stack.push(v);
            }
        }
        Ok(StepResult::Continue)
    }

    // ===== Call plumbing =====

    fn dispatch_call(
        &mut self,
        frames: &mut Vec<Frame>,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> Result<StepResult, JsError> {
        let Some(data) = callee
            .object_id()
            .filter(|_| callee.is_function())
            .map(|id| *self.heap.object(id).function_data().expect("function cell"))
        else {
            return Err(JsError::type_error(format!(
                "{} is not a function",
                self.heap.to_display(callee)
            )));
        };
        match data.kind {
            FunctionKind::Native => {
                let v = self.call_native(data.function_id, this, args)?;
                frames.last_mut().unwrap().stack.push(v);
                Ok(StepResult::Continue)
            }
            FunctionKind::Bytecode => {
                let record = self
                    .funcs
                    .record(data.function_id)
                    .ok_or_else(|| JsError::internal("dangling function id"))?;
                let token = self.profiler.record_entry(record.id);

                if let Some(entry) = self.jit.on_function_entry(&record, self.profiler) {
                    match self.execute_native(&entry, &record, this, args)? {
                        NativeOutcome::Return(v) => {
                            self.profiler.record_exit(record.id, token, v);
                            frames.last_mut().unwrap().stack.push(v);
                            return Ok(StepResult::Continue);
                        }
                        NativeOutcome::Trap(resumed) => {
                            let depth = self.ctx.scope_depth();
                            for r in resumed {
                                frames.push(Frame::resume(r, depth));
                            }
                            return Ok(StepResult::Continue);
                        }
                    }
                }

                let frame = Frame::new(record, this, args, self.ctx.scope_depth(), Some(token));
                frames.push(frame);
                Ok(StepResult::Continue)
            }
        }
    }

    /// Pop the current frame, record its exit, and hand the return value
    /// to the parent (or out of `run`)
    fn finish_frame(&mut self, frames: &mut Vec<Frame>, value: Value) -> Value {
        let frame = frames.pop().expect("finish without frame");
        self.ctx.truncate_scopes(frame.scope_depth_at_entry);
        if let Some(token) = frame.entry_token {
            self.profiler.record_exit(frame.function.id, token, value);
        }
        if let Some(parent) = frames.last_mut() {
            parent.stack.push(value);
        }
        value
    }

    // ===== Safepoints, OSR, GC =====

    fn backedge(&mut self, frames: &mut Vec<Frame>, _op_pc: usize) -> Result<StepResult, JsError> {
        let frame = frames.last_mut().unwrap();
        let fid = frame.function.id;
        let target_pc = frame.pc as u32;
        self.profiler.record_backedge(fid);

        // OSR probe: a compiled loop entry for this exact offset
        let record = frame.function.clone();
        if frame.stack.is_empty() {
            if let Some(entry) = self.jit.on_backedge(&record, target_pc, self.profiler) {
                let this = frame.this_value;
                let mut locals = std::mem::take(&mut frame.locals);
                let outcome = self.jit.execute_osr(
                    &entry,
                    self.heap,
                    self.ctx,
                    self.funcs,
                    self.profiler,
                    &record,
                    this,
                    &mut locals,
                );
                match outcome {
                    Ok(NativeOutcome::Return(v)) => {
                        let v = self.finish_frame(frames, v);
                        return Ok(StepResult::Returned(v));
                    }
                    Ok(NativeOutcome::Trap(resumed)) => {
                        frames.pop();
                        let depth = self.ctx.scope_depth();
                        for r in resumed {
                            frames.push(Frame::resume(r, depth));
                        }
                        return Ok(StepResult::Continue);
                    }
                    Err(e) => {
                        frames.last_mut().unwrap().locals = locals;
                        return Err(e);
                    }
                }
            }
        }
        Ok(StepResult::Safepoint)
    }

    fn safepoint(&mut self, frames: &mut [Frame], ticks: &mut u64) -> Result<(), JsError> {
        self.ctx.tick(*ticks)?;
        *ticks = 0;
        if self.heap.should_collect() || self.jit.safepoint_flags().take_gc_request() {
            let mut roots: Vec<Value> = Vec::new();
            for f in frames.iter() {
                roots.extend_from_slice(&f.locals);
                roots.extend_from_slice(&f.stack);
                roots.push(f.this_value);
            }
            roots.extend(self.ctx.scope_roots());
            roots.push(self.heap.value_of(self.ctx.global_object()));
            self.heap.collect(&roots);
            self.ctx.gc_count += 1;
        }
        Ok(())
    }

    // ===== Property access =====

    /// Named property read with inline-cache fast path
    pub fn get_prop_named(
        &mut self,
        fid: aero_core::FunctionId,
        site: u32,
        receiver: Value,
        atom: aero_core::Atom,
    ) -> Result<Value, JsError> {
        // String specials
        if receiver.is_string() {
            let id = receiver.object_id().unwrap();
            if self.heap.atoms.name(atom) == "length" {
                let len = self.heap.string(id).utf16_len();
                return Ok(Value::integer(len as i32));
            }
            return Ok(Value::undefined());
        }
        if receiver.is_nullish() {
            return Err(JsError::type_error(format!(
                "cannot read properties of {} (reading '{}')",
                self.heap.to_display(receiver),
                self.heap.atoms.name(atom)
            )));
        }
        let Some(id) = receiver.object_id().filter(|_| receiver.is_object_like()) else {
            return Ok(Value::undefined());
        };

        // The sentinel site id means "no feedback identity" (inlined code,
        // embedder API calls): skip profiling and caching entirely
        let cacheable = site != u32::MAX;
        let shape = self.heap.object(id).shape;
        if cacheable {
            self.profiler.record_shape(fid, site, shape);

            // IC fast path: own data slot keyed by shape
            if let Some(slot) = self
                .jit
                .ics()
                .lookup(fid, site, IcKind::PropertyLoad, shape)
            {
                if let Some(aero_core::PropertySlot::Data(v)) =
                    self.heap.object(id).slots.get(slot as usize)
                {
                    return Ok(*v);
                }
            }
        }

        // Generic path
        match self.ctx.lookup_named(self.heap, id, atom) {
            LookupResult::Data(v) => {
                // Cache own data properties only
                if cacheable {
                    if let Some(info) = self.heap.shapes.lookup(shape, atom) {
                        if !info.attrs.accessor {
                            let transition = self.jit.ics().record(
                                fid,
                                site,
                                IcKind::PropertyLoad,
                                shape,
                                info.index,
                            );
                            self.jit
                                .patch_ic_site(fid, site, transition, shape, info.index);
                        }
                    }
                }
                Ok(v)
            }
            LookupResult::Accessor { getter } => self.call_accessor(getter, receiver),
            LookupResult::Missing => Ok(Value::undefined()),
        }
    }

    fn call_accessor(&mut self, getter: Option<aero_core::ObjectId>, this: Value) -> Result<Value, JsError> {
        match getter {
            Some(g) => {
                let gv = self.heap.value_of(g);
                self.call_value_inner(gv, this, &[])
            }
            None => Ok(Value::undefined()),
        }
    }

    /// Named property write honoring writability and strict mode
    pub fn set_prop_named(
        &mut self,
        fid: aero_core::FunctionId,
        site: u32,
        receiver: Value,
        atom: aero_core::Atom,
        value: Value,
    ) -> Result<(), JsError> {
        if receiver.is_nullish() {
            return Err(JsError::type_error(format!(
                "cannot set properties of {}",
                self.heap.to_display(receiver)
            )));
        }
        let Some(id) = receiver.object_id().filter(|_| receiver.is_object_like()) else {
            // Primitive receivers silently drop writes (sloppy) or throw
            if self.ctx.config.strict_mode {
                return Err(JsError::type_error("cannot create property on primitive"));
            }
            return Ok(());
        };

        // Array length writes resize
        if self.heap.atoms.name(atom) == "length" {
            if let ObjectData::Array(_) = self.heap.object(id).data {
                let n = self.heap.to_number(value)?;
                if n < 0.0 || n.fract() != 0.0 || n > u32::MAX as f64 {
                    return Err(JsError::range("invalid array length"));
                }
                if let Some(storage) = self.heap.object_mut(id).array_storage_mut() {
                    storage.set_length(n as u32);
                }
                return Ok(());
            }
        }

        let cacheable = site != u32::MAX;
        let shape = self.heap.object(id).shape;
        if cacheable {
            self.profiler.record_shape(fid, site, shape);

            // IC fast path: existing writable own data slot
            if let Some(slot) = self
                .jit
                .ics()
                .lookup(fid, site, IcKind::PropertyStore, shape)
            {
                self.heap.set_slot(id, slot, value);
                return Ok(());
            }
        }

        match self.ctx.store_named(self.heap, id, atom, value) {
            StoreResult::Done => {
                // Cache only when the write did not transition the shape
                // (an added property changes the shape, so the old key
                // would never hit anyway)
                if cacheable && self.heap.object(id).shape == shape {
                    if let Some(info) = self.heap.shapes.lookup(shape, atom) {
                        if info.attrs.writable && !info.attrs.accessor {
                            let transition = self.jit.ics().record(
                                fid,
                                site,
                                IcKind::PropertyStore,
                                shape,
                                info.index,
                            );
                            self.jit
                                .patch_ic_site(fid, site, transition, shape, info.index);
                        }
                    }
                }
                Ok(())
            }
            StoreResult::Setter { setter } => {
                let sv = self.heap.value_of(setter);
                self.call_value_inner(sv, receiver, &[value])?;
                Ok(())
            }
            StoreResult::Rejected => {
                if self.ctx.config.strict_mode {
                    Err(JsError::type_error(format!(
                        "cannot assign to read-only property {}",
                        self.heap.atoms.name(atom)
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Computed element read
    pub fn get_element(&mut self, receiver: Value, key: Value) -> Result<Value, JsError> {
        if receiver.is_nullish() {
            return Err(JsError::type_error("cannot read properties of null or undefined"));
        }
        // Integer keys on arrays take the element path
        if let (Some(id), Some(index)) = (receiver.object_id(), element_index(key)) {
            if receiver.is_array() {
                let obj = self.heap.object(id);
                if let ObjectData::Array(storage) = &obj.data {
                    if let Some(v) = storage.get(index) {
                        return Ok(v);
                    }
                }
                return Ok(Value::undefined());
            }
            if receiver.is_string() {
                let s = self.heap.string(id).as_str().to_string();
                if let Some(unit) = s.encode_utf16().nth(index as usize) {
                    let ch = String::from_utf16_lossy(&[unit]);
                    return Ok(self.heap.alloc_string(&ch));
                }
                return Ok(Value::undefined());
            }
        }
        // Everything else goes through the named path
        let key_str = self.heap.to_display(key);
        let pk = PropertyKey::from_str(&mut self.heap.atoms, &key_str);
        match pk {
            PropertyKey::Atom(atom) => {
                if let Some(id) = receiver.object_id().filter(|_| receiver.is_object_like()) {
                    match self.ctx.lookup_named(self.heap, id, atom) {
                        LookupResult::Data(v) => Ok(v),
                        LookupResult::Accessor { getter } => self.call_accessor(getter, receiver),
                        LookupResult::Missing => Ok(Value::undefined()),
                    }
                } else if receiver.is_string() && key_str == "length" {
                    let id = receiver.object_id().unwrap();
                    Ok(Value::integer(self.heap.string(id).utf16_len() as i32))
                } else {
                    Ok(Value::undefined())
                }
            }
            PropertyKey::Index(i) => {
                // Index key on a non-array object: consult element chain
                if let Some(id) = receiver.object_id().filter(|_| receiver.is_object_like()) {
                    match self.ctx.lookup_property(self.heap, self.heap.value_of(id), PropertyKey::Index(i))? {
                        LookupResult::Data(v) => Ok(v),
                        _ => Ok(Value::undefined()),
                    }
                } else {
                    Ok(Value::undefined())
                }
            }
            PropertyKey::Symbol(_) => Ok(Value::undefined()),
        }
    }

    /// Computed element write
    pub fn set_element(&mut self, receiver: Value, key: Value, value: Value) -> Result<(), JsError> {
        if receiver.is_nullish() {
            return Err(JsError::type_error("cannot set properties of null or undefined"));
        }
        if let (Some(id), Some(index)) = (receiver.object_id(), element_index(key)) {
            if receiver.is_array() {
                self.heap.array_set(id, index, value);
                return Ok(());
            }
        }
        let Some(id) = receiver.object_id().filter(|_| receiver.is_object_like()) else {
            return Ok(());
        };
        let key_str = self.heap.to_display(key);
        let pk = PropertyKey::from_str(&mut self.heap.atoms, &key_str);
        match pk {
            PropertyKey::Atom(atom) => {
                match self.ctx.store_named(self.heap, id, atom, value) {
                    StoreResult::Done => Ok(()),
                    StoreResult::Setter { setter } => {
                        let sv = self.heap.value_of(setter);
                        self.call_value_inner(sv, receiver, &[value])?;
                        Ok(())
                    }
                    StoreResult::Rejected => {
                        if self.ctx.config.strict_mode {
                            Err(JsError::type_error("cannot assign to read-only property"))
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            PropertyKey::Index(i) => {
                if receiver.is_array() {
                    self.heap.array_set(id, i, value);
                }
                Ok(())
            }
            PropertyKey::Symbol(_) => Ok(()),
        }
    }

    // ===== Errors =====

    /// Route an error to the innermost matching handler. Returns Ok(true)
    /// if a handler was installed, Ok(false) if the error escapes `run`.
    fn raise(&mut self, frames: &mut Vec<Frame>, err: JsError) -> Result<bool, JsError> {
        if !err.kind.is_catchable() {
            return Ok(false);
        }
        while let Some(frame) = frames.last_mut() {
            let pc = frame.pc.saturating_sub(1) as u32;
            if let Some(h) = frame.function.bytecode.handler_for(pc).copied() {
                frame.stack.truncate(h.stack_depth as usize);
                let target_depth = frame.scope_depth_at_entry + h.scope_depth as usize;
                self.ctx.truncate_scopes(target_depth);
                let error_value = self.error_value(&err);
                let frame = frames.last_mut().unwrap();
                frame.stack.push(error_value);
                frame.pc = h.handler as usize;
                self.ctx.take_error();
                return Ok(true);
            }
            let frame = frames.pop().unwrap();
            self.ctx.truncate_scopes(frame.scope_depth_at_entry);
        }
        Ok(false)
    }

    /// The value a catch clause receives: the thrown value if there was
    /// one, otherwise a fresh error object `{name, message}`
    fn error_value(&mut self, err: &JsError) -> Value {
        if let Some(pending) = self.ctx.peek_error() {
            if let Some(v) = pending.value {
                return v;
            }
        }
        let obj = self.heap.alloc_object(None);
        let id = obj.object_id().unwrap();
        let name_atom = self.heap.atoms.intern("name");
        let msg_atom = self.heap.atoms.intern("message");
        let name = self.heap.alloc_string(err.kind.name());
        let msg = self.heap.alloc_string(&err.message);
        self.ctx.define_data_property(self.heap, id, name_atom, name);
        self.ctx.define_data_property(self.heap, id, msg_atom, msg);
        obj
    }

    /// Classify a thrown value into the error taxonomy by its `name`
    fn thrown_kind(&self, v: Value) -> ErrorKind {
        if let Some(id) = v.object_id().filter(|_| v.is_object_like()) {
            if let Some(name_atom) = self.heap.atoms.get("name") {
                if let LookupResult::Data(name_v) = self.ctx.lookup_named(self.heap, id, name_atom)
                {
                    if let Some((HeapKind::String, sid)) = name_v.as_handle() {
                        return match self.heap.string(sid).as_str() {
                            "ReferenceError" => ErrorKind::Reference,
                            "RangeError" => ErrorKind::Range,
                            "SyntaxError" => ErrorKind::Syntax,
                            "SecurityError" => ErrorKind::Security,
                            _ => ErrorKind::Type,
                        };
                    }
                }
            }
        }
        ErrorKind::Type
    }

    // ===== Small helpers =====

    fn materialize_const(&mut self, c: &Const) -> Value {
        match c {
            Const::Undefined => Value::undefined(),
            Const::Null => Value::null(),
            Const::Boolean(b) => Value::boolean(*b),
            Const::Integer(i) => Value::integer(*i),
            Const::Number(n) => Value::number(*n),
            Const::String(s) => self.heap.alloc_string(s),
        }
    }

    fn pop(&mut self, frames: &mut [Frame]) -> Result<Value, JsError> {
        frames
            .last_mut()
            .unwrap()
            .stack
            .pop()
            .ok_or_else(|| JsError::internal("pop on empty stack"))
    }

    fn pop2(&mut self, frames: &mut [Frame]) -> Result<(Value, Value), JsError> {
        let frame = frames.last_mut().unwrap();
        let b = frame.stack.pop();
        let a = frame.stack.pop();
        match (a, b) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(JsError::internal("pop on empty stack")),
        }
    }
}

impl Frame {
    fn inner_id(&self, idx: usize) -> Option<&aero_core::FunctionId> {
        self.function.inner.get(idx)
    }
}

enum StepResult {
    Continue,
    Returned(Value),
    Safepoint,
}

/// Interpret a computed key as an array index when it is a non-negative
/// integer-valued number
fn element_index(key: Value) -> Option<u32> {
    if let Some(i) = key.as_integer() {
        return (i >= 0).then_some(i as u32);
    }
    if let Some(d) = key.as_double() {
        if d >= 0.0 && d.fract() == 0.0 && d < u32::MAX as f64 {
            return Some(d as u32);
        }
    }
    None
}
