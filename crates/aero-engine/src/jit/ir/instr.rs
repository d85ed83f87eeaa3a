//! SSA IR: registers, instructions, blocks, functions
//!
//! Each virtual register has exactly one defining instruction; φ-nodes
//! reconcile values across predecessors. Generic operations carry the
//! bytecode site id they came from so the specializer can find their
//! profile feedback; specialized operations carry a deopt-state index
//! naming the interpreter state to reconstruct when their guard fails.

use rustc_hash::FxHashMap;

use aero_core::{FunctionId, ShapeId};

use super::types::TypeInfo;

/// SSA virtual register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Index into `IrFunction::deopt_states`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptId(pub u32);

/// Why a guard can bail out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum DeoptReason {
    TypeFeedback,
    NumericOverflow,
    BailoutRequested,
    DebuggerAttached,
    TypeCheckFailed,
}

/// Where an inlined frame's locals live at a deopt point
#[derive(Debug, Clone)]
pub enum DeoptLocals {
    /// The on-heap locals buffer is current (root frame: locals write
    /// through on every store)
    Buffer,
    /// Locals are IR values (inlined frames have no buffer)
    Regs(Vec<Reg>),
}

/// One interpreter frame to reconstruct
#[derive(Debug, Clone)]
pub struct DeoptFrame {
    pub function: FunctionId,
    pub bytecode_offset: u32,
    pub locals: DeoptLocals,
    /// Operand stack contents, bottom first
    pub stack: Vec<Reg>,
    /// `this` binding for inlined frames; `None` inherits the call's
    /// root `this`
    pub this: Option<Reg>,
}

/// Full interpreter state at a potential deopt: every frame from the
/// outermost inlined root down to the faulting inlinee
#[derive(Debug, Clone)]
pub struct DeoptState {
    pub reason: DeoptReason,
    /// Outermost first; the innermost frame resumes at its offset
    pub frames: Vec<DeoptFrame>,
}

/// Generic binary arithmetic selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Comparison selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

/// IR instruction
#[derive(Debug, Clone)]
pub enum Instr {
    // ===== Constants =====
    ConstInt { dest: Reg, value: i32 },
    ConstNum { dest: Reg, value: f64 },
    ConstBool { dest: Reg, value: bool },
    ConstUndef { dest: Reg },
    ConstNull { dest: Reg },
    /// Pool constants that need allocation (strings) load via helper
    ConstPool { dest: Reg, index: u16 },

    // ===== Locals (write-through to the locals buffer) =====
    LoadLocal { dest: Reg, index: u16 },
    StoreLocal { index: u16, value: Reg },
    LoadThis { dest: Reg },

    // ===== Generic operations (runtime helper calls) =====
    /// `deopt` names the interpreter state at this site; the specializer
    /// attaches it to the guards it derives from this instruction
    Binary { op: BinOp, dest: Reg, left: Reg, right: Reg, site: u32, deopt: DeoptId },
    Compare { op: CmpOp, dest: Reg, left: Reg, right: Reg, site: u32, deopt: DeoptId },
    Neg { dest: Reg, operand: Reg },
    Not { dest: Reg, operand: Reg },
    /// ToBoolean producing a raw 0/1 for `Branch`
    IsTruthy { dest: Reg, src: Reg },
    Typeof { dest: Reg, operand: Reg },
    InstanceOf { dest: Reg, value: Reg, ctor: Reg },

    // ===== Specialized integer ops (unboxed i32, overflow deopts) =====
    IntAdd { dest: Reg, left: Reg, right: Reg, deopt: DeoptId },
    IntSub { dest: Reg, left: Reg, right: Reg, deopt: DeoptId },
    IntMul { dest: Reg, left: Reg, right: Reg, deopt: DeoptId },
    /// Strength-reduced multiply/shift
    IntShl { dest: Reg, left: Reg, amount: u8 },
    IntCmp { op: CmpOp, dest: Reg, left: Reg, right: Reg },

    // ===== Specialized double ops (unboxed f64) =====
    NumAdd { dest: Reg, left: Reg, right: Reg },
    NumSub { dest: Reg, left: Reg, right: Reg },
    NumMul { dest: Reg, left: Reg, right: Reg },
    NumDiv { dest: Reg, left: Reg, right: Reg },
    NumCmp { op: CmpOp, dest: Reg, left: Reg, right: Reg },

    // ===== Guards =====
    GuardInt { value: Reg, deopt: DeoptId },
    GuardNumber { value: Reg, deopt: DeoptId },
    GuardShape { object: Reg, shape: ShapeId, deopt: DeoptId },

    // ===== Representation changes =====
    /// Boxed int → raw i32 (valid after GuardInt)
    UnboxInt { dest: Reg, src: Reg },
    /// Boxed int-or-double → raw f64 (valid after GuardNumber)
    UnboxNum { dest: Reg, src: Reg },
    /// Raw i32 → boxed SMI
    BoxInt { dest: Reg, src: Reg },
    /// Raw f64 → boxed number
    BoxNum { dest: Reg, src: Reg },
    /// Raw 0/1 → boxed boolean
    BoxBool { dest: Reg, src: Reg },

    // ===== Memory =====
    GetProp { dest: Reg, object: Reg, name: u16, site: u32 },
    SetProp { object: Reg, name: u16, value: Reg, site: u32 },
    GetElem { dest: Reg, object: Reg, index: Reg, site: u32 },
    SetElem { object: Reg, index: Reg, value: Reg, site: u32 },
    LoadGlobal { dest: Reg, name: u16, site: u32 },
    StoreGlobal { name: u16, value: Reg, site: u32 },

    // ===== Calls and allocation =====
    Call {
        dest: Reg,
        callee: Reg,
        this: Option<Reg>,
        args: Vec<Reg>,
        site: u32,
    },
    NewObject { dest: Reg },
    NewArray { dest: Reg, elems: Vec<Reg> },
    MakeFunction { dest: Reg, index: u16 },

    // ===== SSA =====
    Phi { dest: Reg, inputs: Vec<(BlockId, Reg)> },
    Move { dest: Reg, src: Reg },

    // ===== Runtime integration =====
    /// Loop back-edge safepoint poll (GC / interrupt / execution limit)
    Safepoint { offset: u32 },
}

impl Instr {
    /// Destination register, if the instruction produces a value
    pub fn dest(&self) -> Option<Reg> {
        use Instr::*;
        match self {
            ConstInt { dest, .. }
            | ConstNum { dest, .. }
            | ConstBool { dest, .. }
            | ConstUndef { dest }
            | ConstNull { dest }
            | ConstPool { dest, .. }
            | LoadLocal { dest, .. }
            | LoadThis { dest }
            | Binary { dest, .. }
            | Compare { dest, .. }
            | Neg { dest, .. }
            | Not { dest, .. }
            | IsTruthy { dest, .. }
            | Typeof { dest, .. }
            | InstanceOf { dest, .. }
            | IntAdd { dest, .. }
            | IntSub { dest, .. }
            | IntMul { dest, .. }
            | IntShl { dest, .. }
            | IntCmp { dest, .. }
            | NumAdd { dest, .. }
            | NumSub { dest, .. }
            | NumMul { dest, .. }
            | NumDiv { dest, .. }
            | NumCmp { dest, .. }
            | UnboxInt { dest, .. }
            | UnboxNum { dest, .. }
            | BoxInt { dest, .. }
            | BoxNum { dest, .. }
            | BoxBool { dest, .. }
            | GetProp { dest, .. }
            | GetElem { dest, .. }
            | LoadGlobal { dest, .. }
            | Call { dest, .. }
            | NewObject { dest }
            | NewArray { dest, .. }
            | MakeFunction { dest, .. }
            | Phi { dest, .. }
            | Move { dest, .. } => Some(*dest),

            StoreLocal { .. }
            | SetProp { .. }
            | SetElem { .. }
            | StoreGlobal { .. }
            | GuardInt { .. }
            | GuardNumber { .. }
            | GuardShape { .. }
            | Safepoint { .. } => None,
        }
    }

    /// Register operands, in a fixed order
    pub fn operands(&self) -> Vec<Reg> {
        use Instr::*;
        match self {
            ConstInt { .. } | ConstNum { .. } | ConstBool { .. } | ConstUndef { .. }
            | ConstNull { .. } | ConstPool { .. } | LoadLocal { .. } | LoadThis { .. }
            | NewObject { .. } | MakeFunction { .. } | LoadGlobal { .. } | Safepoint { .. } => {
                vec![]
            }

            StoreLocal { value, .. } | StoreGlobal { value, .. } => vec![*value],
            Neg { operand, .. } | Not { operand, .. } | Typeof { operand, .. } => vec![*operand],
            UnboxInt { src, .. } | UnboxNum { src, .. } | BoxInt { src, .. }
            | BoxNum { src, .. } | BoxBool { src, .. } | Move { src, .. }
            | IsTruthy { src, .. } => vec![*src],
            GuardInt { value, .. } | GuardNumber { value, .. } => vec![*value],
            GuardShape { object, .. } => vec![*object],
            IntShl { left, .. } => vec![*left],

            Binary { left, right, .. }
            | Compare { left, right, .. }
            | IntAdd { left, right, .. }
            | IntSub { left, right, .. }
            | IntMul { left, right, .. }
            | IntCmp { left, right, .. }
            | NumAdd { left, right, .. }
            | NumSub { left, right, .. }
            | NumMul { left, right, .. }
            | NumDiv { left, right, .. }
            | NumCmp { left, right, .. } => vec![*left, *right],

            InstanceOf { value, ctor, .. } => vec![*value, *ctor],
            GetProp { object, .. } => vec![*object],
            SetProp { object, value, .. } => vec![*object, *value],
            GetElem { object, index, .. } => vec![*object, *index],
            SetElem { object, index, value, .. } => vec![*object, *index, *value],

            Call {
                callee, this, args, ..
            } => {
                let mut v = vec![*callee];
                v.extend(this.iter().copied());
                v.extend(args.iter().copied());
                v
            }
            NewArray { elems, .. } => elems.clone(),
            Phi { inputs, .. } => inputs.iter().map(|(_, r)| *r).collect(),
        }
    }

    /// Apply a substitution to every register operand (not destinations)
    pub fn replace_operands(&mut self, subs: &FxHashMap<Reg, Reg>) {
        use Instr::*;
        let sub = |r: &mut Reg| {
            if let Some(&n) = subs.get(r) {
                *r = n;
            }
        };
        match self {
            ConstInt { .. } | ConstNum { .. } | ConstBool { .. } | ConstUndef { .. }
            | ConstNull { .. } | ConstPool { .. } | LoadLocal { .. } | LoadThis { .. }
            | NewObject { .. } | MakeFunction { .. } | LoadGlobal { .. } | Safepoint { .. } => {}

            StoreLocal { value, .. } | StoreGlobal { value, .. } => sub(value),
            Neg { operand, .. } | Not { operand, .. } | Typeof { operand, .. } => sub(operand),
            UnboxInt { src, .. } | UnboxNum { src, .. } | BoxInt { src, .. }
            | BoxNum { src, .. } | BoxBool { src, .. } | Move { src, .. }
            | IsTruthy { src, .. } => sub(src),
            GuardInt { value, .. } | GuardNumber { value, .. } => sub(value),
            GuardShape { object, .. } => sub(object),
            IntShl { left, .. } => sub(left),

            Binary { left, right, .. }
            | Compare { left, right, .. }
            | IntAdd { left, right, .. }
            | IntSub { left, right, .. }
            | IntMul { left, right, .. }
            | IntCmp { left, right, .. }
            | NumAdd { left, right, .. }
            | NumSub { left, right, .. }
            | NumMul { left, right, .. }
            | NumDiv { left, right, .. }
            | NumCmp { left, right, .. } => {
                sub(left);
                sub(right);
            }

            InstanceOf { value, ctor, .. } => {
                sub(value);
                sub(ctor);
            }
            GetProp { object, .. } => sub(object),
            SetProp { object, value, .. } => {
                sub(object);
                sub(value);
            }
            GetElem { object, index, .. } => {
                sub(object);
                sub(index);
            }
            SetElem {
                object,
                index,
                value,
                ..
            } => {
                sub(object);
                sub(index);
                sub(value);
            }
            Call {
                callee, this, args, ..
            } => {
                sub(callee);
                if let Some(t) = this {
                    sub(t);
                }
                for a in args {
                    sub(a);
                }
            }
            NewArray { elems, .. } => {
                for e in elems {
                    sub(e);
                }
            }
            Phi { inputs, .. } => {
                for (_, r) in inputs {
                    sub(r);
                }
            }
        }
    }

    /// Whether this instruction observably affects engine state (cannot be
    /// removed by DCE even if its result is unused). Guards count: their
    /// deopt is an observable transfer of control.
    pub fn has_side_effects(&self) -> bool {
        use Instr::*;
        match self {
            ConstInt { .. } | ConstNum { .. } | ConstBool { .. } | ConstUndef { .. }
            | ConstNull { .. } | LoadLocal { .. } | LoadThis { .. }
            | IntShl { .. } | IntCmp { .. }
            | NumAdd { .. } | NumSub { .. } | NumMul { .. } | NumDiv { .. } | NumCmp { .. }
            | UnboxInt { .. } | UnboxNum { .. } | BoxInt { .. } | BoxNum { .. }
            | BoxBool { .. } | Not { .. } | IsTruthy { .. } | Move { .. } | Phi { .. } => false,

            // Allocation is observable through GC pressure but carries no
            // program-visible effect; still, keep allocations that feed
            // nothing out of DCE's reach only when used — they are pure.
            NewObject { .. } | NewArray { .. } | MakeFunction { .. } | ConstPool { .. } => false,

            // Specialized int arithmetic may deopt on overflow
            IntAdd { .. } | IntSub { .. } | IntMul { .. } => true,

            // Generic operations can run arbitrary coercions
            Binary { .. } | Compare { .. } | Neg { .. } | Typeof { .. } | InstanceOf { .. } => true,

            StoreLocal { .. } | SetProp { .. } | SetElem { .. } | StoreGlobal { .. }
            | GetProp { .. } | GetElem { .. } | LoadGlobal { .. } | Call { .. }
            | GuardInt { .. } | GuardNumber { .. } | GuardShape { .. } | Safepoint { .. } => true,
        }
    }

    /// Whether two executions with identical operands produce identical
    /// results and effects — the bar for CSE/GVN participation
    pub fn is_value_numberable(&self) -> bool {
        use Instr::*;
        matches!(
            self,
            ConstInt { .. }
                | ConstNum { .. }
                | ConstBool { .. }
                | ConstUndef { .. }
                | ConstNull { .. }
                | IntShl { .. }
                | IntCmp { .. }
                | NumAdd { .. }
                | NumSub { .. }
                | NumMul { .. }
                | NumDiv { .. }
                | NumCmp { .. }
                | UnboxInt { .. }
                | UnboxNum { .. }
                | BoxInt { .. }
                | BoxNum { .. }
                | BoxBool { .. }
                | Not { .. }
                | IsTruthy { .. }
        )
    }

    /// The deopt state this instruction references, if any (guards and
    /// overflow-checked arithmetic trigger it; generic binary/compare
    /// carry it as specialization metadata)
    pub fn deopt_id(&self) -> Option<DeoptId> {
        use Instr::*;
        match self {
            IntAdd { deopt, .. } | IntSub { deopt, .. } | IntMul { deopt, .. }
            | GuardInt { deopt, .. } | GuardNumber { deopt, .. } | GuardShape { deopt, .. }
            | Binary { deopt, .. } | Compare { deopt, .. } => Some(*deopt),
            _ => None,
        }
    }

    /// Re-point this instruction's deopt state
    pub fn set_deopt_id(&mut self, id: DeoptId) {
        use Instr::*;
        match self {
            IntAdd { deopt, .. } | IntSub { deopt, .. } | IntMul { deopt, .. }
            | GuardInt { deopt, .. } | GuardNumber { deopt, .. } | GuardShape { deopt, .. }
            | Binary { deopt, .. } | Compare { deopt, .. } => *deopt = id,
            _ => {}
        }
    }
}

/// Block terminator
#[derive(Debug, Clone, Copy)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        cond: Reg,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return(Reg),
    /// Unconditional bailout (unsupported region)
    Deopt(DeoptId),
    /// Not yet assigned (only during construction)
    None,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(b) => vec![*b],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            _ => vec![],
        }
    }
}

/// A basic block
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
    pub preds: Vec<BlockId>,
    /// Bytecode offset this block starts at
    pub bytecode_offset: u32,
    /// Natural-loop nesting depth (filled by loop analysis)
    pub loop_depth: u32,
    /// Set once a block has been through loop unrolling, so repeated
    /// optimizer runs do not widen the loop again
    pub unrolled: bool,
}

/// A complete IR function
#[derive(Debug)]
pub struct IrFunction {
    pub function_id: FunctionId,
    pub name: String,
    pub param_count: u16,
    pub local_count: u16,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    next_reg: u32,
    pub types: FxHashMap<Reg, TypeInfo>,
    pub deopt_states: Vec<DeoptState>,
    /// When compiling an OSR entry: the loop-header bytecode offset
    /// execution starts at
    pub osr_offset: Option<u32>,
    /// String contents of const-pool entries (for folding)
    pub pool_strings: FxHashMap<u16, Box<str>>,
    /// Strings synthesized by the optimizer; addressed with the high pool
    /// bit set
    pub synth_strings: Vec<Box<str>>,
}

impl IrFunction {
    pub fn new(function_id: FunctionId, name: String, param_count: u16, local_count: u16) -> Self {
        IrFunction {
            function_id,
            name,
            param_count,
            local_count,
            blocks: Vec::new(),
            entry: BlockId(0),
            next_reg: 0,
            types: FxHashMap::default(),
            deopt_states: Vec::new(),
            osr_offset: None,
            pool_strings: FxHashMap::default(),
            synth_strings: Vec::new(),
        }
    }

    pub fn alloc_reg(&mut self) -> Reg {
        let r = Reg(self.next_reg);
        self.next_reg += 1;
        r
    }

    /// Reserve a contiguous range of `n` registers (inlining renames a
    /// callee's registers into such a range); returns the first id
    pub fn reserve_regs(&mut self, n: u32) -> u32 {
        let base = self.next_reg;
        self.next_reg += n;
        base
    }

    pub fn reg_count(&self) -> u32 {
        self.next_reg
    }

    pub fn add_block(&mut self, bytecode_offset: u32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            instrs: Vec::new(),
            terminator: Terminator::None,
            preds: Vec::new(),
            bytecode_offset,
            loop_depth: 0,
            unrolled: false,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn add_deopt_state(&mut self, state: DeoptState) -> DeoptId {
        self.deopt_states.push(state);
        DeoptId(self.deopt_states.len() as u32 - 1)
    }

    pub fn type_of(&self, reg: Reg) -> TypeInfo {
        self.types.get(&reg).copied().unwrap_or_default()
    }

    pub fn set_type(&mut self, reg: Reg, info: TypeInfo) {
        self.types.insert(reg, info);
    }

    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Recompute predecessor lists from terminators
    pub fn recompute_preds(&mut self) {
        for b in &mut self.blocks {
            b.preds.clear();
        }
        let edges: Vec<(BlockId, BlockId)> = self
            .blocks
            .iter()
            .flat_map(|b| {
                b.terminator
                    .successors()
                    .into_iter()
                    .map(move |s| (b.id, s))
            })
            .collect();
        for (from, to) in edges {
            self.blocks[to.0 as usize].preds.push(from);
        }
    }

    /// Reverse post-order over reachable blocks
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry.0 as usize] = true;
        while let Some(&mut (block, ref mut next)) = stack.last_mut() {
            let succs = self.block(block).terminator.successors();
            if *next < succs.len() {
                let s = succs[*next];
                *next += 1;
                if !visited[s.0 as usize] {
                    visited[s.0 as usize] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        post.reverse();
        post
    }

    /// Check the SSA invariant: every register has exactly one defining
    /// instruction, and φ inputs reference existing predecessors.
    pub fn verify_ssa(&self) -> Result<(), String> {
        let mut defined: FxHashMap<Reg, (BlockId, usize)> = FxHashMap::default();
        for b in &self.blocks {
            for (i, instr) in b.instrs.iter().enumerate() {
                if let Some(d) = instr.dest() {
                    if let Some((prev_b, prev_i)) = defined.insert(d, (b.id, i)) {
                        return Err(format!(
                            "{d} defined twice: at {prev_b}:{prev_i} and {}:{i}",
                            b.id
                        ));
                    }
                }
            }
        }
        for b in &self.blocks {
            for instr in &b.instrs {
                if let Instr::Phi { dest, inputs } = instr {
                    for (pred, _) in inputs {
                        if !b.preds.contains(pred) {
                            return Err(format!(
                                "phi {dest} in {} references non-predecessor {pred}",
                                b.id
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dest_and_operands() {
        let i = Instr::IntAdd {
            dest: Reg(2),
            left: Reg(0),
            right: Reg(1),
            deopt: DeoptId(0),
        };
        assert_eq!(i.dest(), Some(Reg(2)));
        assert_eq!(i.operands(), vec![Reg(0), Reg(1)]);
        assert!(i.has_side_effects()); // overflow deopt
        assert_eq!(i.deopt_id(), Some(DeoptId(0)));

        let s = Instr::StoreLocal {
            index: 0,
            value: Reg(5),
        };
        assert_eq!(s.dest(), None);
        assert_eq!(s.operands(), vec![Reg(5)]);
    }

    #[test]
    fn test_replace_operands() {
        let mut subs = FxHashMap::default();
        subs.insert(Reg(1), Reg(9));
        let mut i = Instr::NumAdd {
            dest: Reg(2),
            left: Reg(1),
            right: Reg(1),
        };
        i.replace_operands(&subs);
        assert_eq!(i.operands(), vec![Reg(9), Reg(9)]);
        // Destinations are never substituted
        assert_eq!(i.dest(), Some(Reg(2)));
    }

    #[test]
    fn test_rpo_linear() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(10);
        let b2 = f.add_block(20);
        f.block_mut(b0).terminator = Terminator::Jump(b1);
        f.block_mut(b1).terminator = Terminator::Jump(b2);
        let r = f.alloc_reg();
        f.block_mut(b2).instrs.push(Instr::ConstUndef { dest: r });
        f.block_mut(b2).terminator = Terminator::Return(r);
        assert_eq!(f.rpo(), vec![b0, b1, b2]);
    }

    #[test]
    fn test_rpo_diamond() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(1);
        let b2 = f.add_block(2);
        let b3 = f.add_block(3);
        let c = f.alloc_reg();
        f.block_mut(b0).instrs.push(Instr::ConstBool {
            dest: c,
            value: true,
        });
        f.block_mut(b0).terminator = Terminator::Branch {
            cond: c,
            then_block: b1,
            else_block: b2,
        };
        f.block_mut(b1).terminator = Terminator::Jump(b3);
        f.block_mut(b2).terminator = Terminator::Jump(b3);
        let r = f.alloc_reg();
        f.block_mut(b3).instrs.push(Instr::ConstUndef { dest: r });
        f.block_mut(b3).terminator = Terminator::Return(r);

        let rpo = f.rpo();
        assert_eq!(rpo[0], b0);
        assert_eq!(*rpo.last().unwrap(), b3);
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn test_verify_ssa_catches_double_def() {
        let mut f = IrFunction::new(FunctionId(0), "t".into(), 0, 0);
        let b0 = f.add_block(0);
        let r = f.alloc_reg();
        f.block_mut(b0).instrs.push(Instr::ConstInt { dest: r, value: 1 });
        f.block_mut(b0).instrs.push(Instr::ConstInt { dest: r, value: 2 });
        f.block_mut(b0).terminator = Terminator::Return(r);
        assert!(f.verify_ssa().is_err());
    }
}
