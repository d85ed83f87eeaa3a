//! Linear-scan register allocation
//!
//! Blocks are linearized in reverse post-order and instructions numbered
//! globally. Live intervals come from a backward liveness dataflow, so a
//! value that crosses a loop back edge stays live to the end of the loop.
//! Allocation walks intervals by start with an active set sorted by end;
//! when no register is free the interval with the largest
//! `(end − start) × frequency` score is spilled — the fresh interval
//! itself when it scores highest. Spilled values get frame-pointer-indexed
//! slots. A post-pass coalesces move-related intervals whose ranges do not
//! interfere. The whole procedure is deterministic: identical IR and
//! register set produce identical assignments.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::jit::ir::{BlockId, Instr, IrFunction, Reg, Terminator};

/// A machine register, in the target's native encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg(pub u8);

/// Where a value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(PhysReg),
    /// Frame-pointer-relative spill slot index
    Stack(u32),
}

/// One live interval
#[derive(Debug, Clone)]
pub struct LiveInterval {
    pub reg: Reg,
    pub start: u32,
    pub end: u32,
    /// Loop-depth-derived weight of the defining block
    pub frequency: u32,
}

impl LiveInterval {
    fn score(&self) -> u64 {
        (self.end - self.start) as u64 * self.frequency as u64
    }
}

/// Allocation result consumed by the code generator
#[derive(Debug)]
pub struct Allocation {
    pub locations: FxHashMap<Reg, Location>,
    /// Number of spill slots to reserve in the frame
    pub spill_slots: u32,
    /// Callee-saved registers the prologue must preserve
    pub callee_saved_used: Vec<PhysReg>,
    /// Linearized block order the numbering is based on
    pub block_order: Vec<BlockId>,
    /// Global position of each (block, instruction) for debugging
    pub intervals: Vec<LiveInterval>,
}

impl Allocation {
    pub fn location(&self, reg: Reg) -> Option<Location> {
        self.locations.get(&reg).copied()
    }
}

/// Run linear-scan allocation against an allocatable register set (all
/// assumed callee-saved by the backends)
pub fn allocate(func: &IrFunction, allocatable: &[PhysReg]) -> Allocation {
    let order = func.rpo();
    let (positions, block_bounds) = number_instrs(func, &order);
    let liveness = compute_liveness(func, &order);
    let mut intervals = build_intervals(func, &order, &positions, &block_bounds, &liveness);

    intervals.sort_by_key(|iv| (iv.start, iv.reg));

    let mut locations: FxHashMap<Reg, Location> = FxHashMap::default();
    let mut active: Vec<LiveInterval> = Vec::new();
    let mut free: Vec<PhysReg> = allocatable.to_vec();
    let mut next_slot: u32 = 0;
    let mut used_regs: FxHashSet<PhysReg> = FxHashSet::default();

    for iv in &intervals {
        // Expire finished intervals
        let mut expired: Vec<usize> = Vec::new();
        for (i, a) in active.iter().enumerate() {
            if a.end < iv.start {
                expired.push(i);
            }
        }
        for &i in expired.iter().rev() {
            let done = active.remove(i);
            if let Some(Location::Reg(r)) = locations.get(&done.reg).copied() {
                free.push(r);
                free.sort_by_key(|p| p.0);
            }
        }

        if let Some(reg) = free.first().copied() {
            free.remove(0);
            used_regs.insert(reg);
            locations.insert(iv.reg, Location::Reg(reg));
            active.push(iv.clone());
            active.sort_by_key(|a| (a.end, a.reg));
            continue;
        }

        // No free register: pick the spill victim by score
        let victim_idx = active
            .iter()
            .enumerate()
            .max_by_key(|(_, a)| (a.score(), a.reg))
            .map(|(i, _)| i);
        match victim_idx {
            Some(vi) if active[vi].score() > iv.score() => {
                let victim = active.remove(vi);
                let reclaimed = match locations.get(&victim.reg).copied() {
                    Some(Location::Reg(r)) => r,
                    _ => unreachable!("active interval without a register"),
                };
                locations.insert(victim.reg, Location::Stack(next_slot));
                next_slot += 1;
                locations.insert(iv.reg, Location::Reg(reclaimed));
                active.push(iv.clone());
                active.sort_by_key(|a| (a.end, a.reg));
            }
            _ => {
                // The new interval is the most spill-worthy
                locations.insert(iv.reg, Location::Stack(next_slot));
                next_slot += 1;
            }
        }
    }

    let mut allocation = Allocation {
        locations,
        spill_slots: next_slot,
        callee_saved_used: {
            let mut v: Vec<PhysReg> = used_regs.into_iter().collect();
            v.sort_by_key(|p| p.0);
            v
        },
        block_order: order,
        intervals,
    };
    coalesce_moves(func, &mut allocation);
    allocation
}

/// Assign a global position to each instruction; terminators get the
/// position one past the last instruction of their block.
fn number_instrs(
    func: &IrFunction,
    order: &[BlockId],
) -> (FxHashMap<(BlockId, usize), u32>, FxHashMap<BlockId, (u32, u32)>) {
    let mut positions = FxHashMap::default();
    let mut bounds = FxHashMap::default();
    let mut pos: u32 = 0;
    for &b in order {
        let start = pos;
        for i in 0..func.block(b).instrs.len() {
            positions.insert((b, i), pos);
            pos += 1;
        }
        // terminator position
        let term = pos;
        pos += 1;
        bounds.insert(b, (start, term));
    }
    (positions, bounds)
}

struct Liveness {
    live_out: FxHashMap<BlockId, FxHashSet<Reg>>,
}

fn compute_liveness(func: &IrFunction, order: &[BlockId]) -> Liveness {
    // use/def per block; φ inputs count as uses in the predecessor
    let mut uses: FxHashMap<BlockId, FxHashSet<Reg>> = FxHashMap::default();
    let mut defs: FxHashMap<BlockId, FxHashSet<Reg>> = FxHashMap::default();
    let mut phi_uses: FxHashMap<BlockId, FxHashSet<Reg>> = FxHashMap::default();

    for &b in order {
        let block = func.block(b);
        let u = uses.entry(b).or_default();
        let d = defs.entry(b).or_default();
        for instr in &block.instrs {
            match instr {
                Instr::Phi { dest, inputs } => {
                    // φ is a def here; inputs are uses at the predecessors
                    d.insert(*dest);
                    for (pred, r) in inputs {
                        phi_uses.entry(*pred).or_default().insert(*r);
                    }
                }
                _ => {
                    for r in instr.operands() {
                        if !d.contains(&r) {
                            u.insert(r);
                        }
                    }
                    if let Some(dd) = instr.dest() {
                        d.insert(dd);
                    }
                }
            }
        }
        match &block.terminator {
            Terminator::Branch { cond, .. } => {
                if !d.contains(cond) {
                    u.insert(*cond);
                }
            }
            Terminator::Return(r) => {
                if !d.contains(r) {
                    u.insert(*r);
                }
            }
            _ => {}
        }
    }

    let mut live_in: FxHashMap<BlockId, FxHashSet<Reg>> = FxHashMap::default();
    let mut live_out: FxHashMap<BlockId, FxHashSet<Reg>> = FxHashMap::default();
    let mut changed = true;
    while changed {
        changed = false;
        for &b in order.iter().rev() {
            let mut out: FxHashSet<Reg> = phi_uses.get(&b).cloned().unwrap_or_default();
            for succ in func.block(b).terminator.successors() {
                if let Some(li) = live_in.get(&succ) {
                    out.extend(li.iter().copied());
                }
            }
            let mut inn: FxHashSet<Reg> = out.clone();
            for d in defs.get(&b).into_iter().flatten() {
                inn.remove(d);
            }
            inn.extend(uses.get(&b).into_iter().flatten().copied());

            if live_out.get(&b) != Some(&out) {
                live_out.insert(b, out);
                changed = true;
            }
            if live_in.get(&b) != Some(&inn) {
                live_in.insert(b, inn);
                changed = true;
            }
        }
    }
    Liveness { live_out }
}

fn build_intervals(
    func: &IrFunction,
    order: &[BlockId],
    positions: &FxHashMap<(BlockId, usize), u32>,
    bounds: &FxHashMap<BlockId, (u32, u32)>,
    liveness: &Liveness,
) -> Vec<LiveInterval> {
    let mut starts: FxHashMap<Reg, u32> = FxHashMap::default();
    let mut ends: FxHashMap<Reg, u32> = FxHashMap::default();
    let mut freq: FxHashMap<Reg, u32> = FxHashMap::default();

    let weight = |b: BlockId| 1 + 9 * func.block(b).loop_depth;

    for &b in order {
        let block = func.block(b);
        for (i, instr) in block.instrs.iter().enumerate() {
            let pos = positions[&(b, i)];
            if let Some(d) = instr.dest() {
                starts.entry(d).or_insert(pos);
                ends.entry(d).or_insert(pos);
                freq.entry(d).or_insert_with(|| weight(b));
            }
            let use_regs = match instr {
                // φ inputs are live at their predecessor's end, not here
                Instr::Phi { .. } => vec![],
                _ => instr.operands(),
            };
            for r in use_regs {
                let e = ends.entry(r).or_insert(pos);
                *e = (*e).max(pos);
                starts.entry(r).or_insert(pos);
            }
        }
        let (_, term_pos) = bounds[&b];
        let mut term_uses: Vec<Reg> = Vec::new();
        match &block.terminator {
            Terminator::Branch { cond, .. } => term_uses.push(*cond),
            Terminator::Return(r) => term_uses.push(*r),
            _ => {}
        }
        // φ inputs flowing along this block's out-edges
        for succ in block.terminator.successors() {
            for instr in &func.block(succ).instrs {
                if let Instr::Phi { inputs, .. } = instr {
                    for (pred, r) in inputs {
                        if *pred == b {
                            term_uses.push(*r);
                        }
                    }
                }
            }
        }
        for r in term_uses {
            let e = ends.entry(r).or_insert(term_pos);
            *e = (*e).max(term_pos);
            starts.entry(r).or_insert(term_pos);
        }
        // Everything live out of the block survives to its end
        if let Some(out) = liveness.live_out.get(&b) {
            for &r in out {
                let e = ends.entry(r).or_insert(term_pos);
                *e = (*e).max(term_pos);
                starts.entry(r).or_insert(term_pos);
            }
        }
    }

    let mut intervals: Vec<LiveInterval> = starts
        .into_iter()
        .map(|(reg, start)| LiveInterval {
            reg,
            start,
            end: ends[&reg],
            frequency: freq.get(&reg).copied().unwrap_or(1),
        })
        .collect();
    intervals.sort_by_key(|iv| iv.reg);
    intervals
}

/// Merge move-related intervals: when `dest = Move src` and giving `dest`
/// the source's location conflicts with nothing, the move becomes a no-op
/// at emission time.
fn coalesce_moves(func: &IrFunction, allocation: &mut Allocation) {
    let interval_of: FxHashMap<Reg, &LiveInterval> =
        allocation.intervals.iter().map(|iv| (iv.reg, iv)).collect();

    for block in &func.blocks {
        for instr in &block.instrs {
            let Instr::Move { dest, src } = instr else {
                continue;
            };
            let (Some(dl), Some(sl)) = (
                allocation.locations.get(dest).copied(),
                allocation.locations.get(src).copied(),
            ) else {
                continue;
            };
            if dl == sl {
                continue;
            }
            let Location::Reg(src_reg) = sl else { continue };
            let (Some(&div), Some(&siv)) = (interval_of.get(dest), interval_of.get(src)) else {
                continue;
            };
            // The source must die at the move for the ranges not to
            // interfere
            if siv.end > div.start {
                continue;
            }
            // The source's register must be unclaimed over the dest range
            let conflict = allocation.intervals.iter().any(|other| {
                other.reg != *dest
                    && other.reg != *src
                    && allocation.locations.get(&other.reg) == Some(&Location::Reg(src_reg))
                    && ranges_overlap(other, div)
            });
            if !conflict {
                allocation.locations.insert(*dest, Location::Reg(src_reg));
            }
        }
    }
}

fn ranges_overlap(a: &LiveInterval, b: &LiveInterval) -> bool {
    a.start <= b.end && b.start <= a.end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Opcode};
    use crate::jit::ir::builder::build_ir;
    use crate::profiler::ProfileSnapshot;
    use aero_core::FunctionId;

    const REGS: &[PhysReg] = &[PhysReg(3), PhysReg(12), PhysReg(13)];

    fn lift(b: BytecodeBuilder) -> IrFunction {
        let f = b.finish();
        build_ir(
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
        .unwrap()
        .0
    }

    fn simple_add() -> IrFunction {
        let mut b = BytecodeBuilder::new("add", 2, 0);
        b.load_var(0);
        b.load_var(1);
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        lift(b)
    }

    #[test]
    fn test_every_value_gets_a_location() {
        let ir = simple_add();
        let alloc = allocate(&ir, REGS);
        for block in &ir.blocks {
            for instr in &block.instrs {
                if let Some(d) = instr.dest() {
                    assert!(alloc.location(d).is_some(), "no location for {d}");
                }
            }
        }
    }

    #[test]
    fn test_small_function_needs_no_spills() {
        let ir = simple_add();
        let alloc = allocate(&ir, REGS);
        assert_eq!(alloc.spill_slots, 0);
    }

    #[test]
    fn test_pressure_forces_spills() {
        // Build 8 simultaneously-live values with only 3 registers:
        // load 8 locals, then add them pairwise
        let mut b = BytecodeBuilder::new("wide", 8, 0);
        for i in 0..8 {
            b.load_var(i);
        }
        for _ in 0..7 {
            b.emit(Opcode::Add);
        }
        b.emit(Opcode::Return);
        let ir = lift(b);
        let alloc = allocate(&ir, REGS);
        assert!(alloc.spill_slots > 0);
        // Still: every value has exactly one location
        let reg_count: usize = alloc
            .locations
            .values()
            .filter(|l| matches!(l, Location::Reg(_)))
            .count();
        assert!(reg_count > 0);
    }

    #[test]
    fn test_determinism() {
        let ir1 = simple_add();
        let ir2 = simple_add();
        let a1 = allocate(&ir1, REGS);
        let a2 = allocate(&ir2, REGS);
        let mut l1: Vec<(Reg, Location)> = a1.locations.into_iter().collect();
        let mut l2: Vec<(Reg, Location)> = a2.locations.into_iter().collect();
        l1.sort_by_key(|(r, _)| *r);
        l2.sort_by_key(|(r, _)| *r);
        assert_eq!(l1, l2);
        assert_eq!(a1.spill_slots, a2.spill_slots);
        assert_eq!(a1.callee_saved_used, a2.callee_saved_used);
    }

    #[test]
    fn test_callee_saved_tracking() {
        let ir = simple_add();
        let alloc = allocate(&ir, REGS);
        assert!(!alloc.callee_saved_used.is_empty());
        for r in &alloc.callee_saved_used {
            assert!(REGS.contains(r));
        }
    }

    #[test]
    fn test_loop_value_lives_across_back_edge() {
        // while (x < 1000) { x = x + 1 } — the condition's constant 1000
        // is re-materialized per iteration, but LoadVar results must not
        // share registers across the back edge incorrectly. Smoke-check
        // that allocation succeeds and positions are consistent.
        let mut b = BytecodeBuilder::new("loop", 1, 0);
        let top = b.new_label();
        let out = b.new_label();
        b.bind(top);
        b.load_var(0);
        b.load_int(1000);
        b.emit(Opcode::Lt);
        b.jump_if_false(out);
        b.load_var(0);
        b.load_int(1);
        b.emit(Opcode::Add);
        b.store_var(0);
        b.jump(top);
        b.bind(out);
        b.load_var(0);
        b.emit(Opcode::Return);
        let ir = lift(b);
        let alloc = allocate(&ir, REGS);
        for block in &ir.blocks {
            for instr in &block.instrs {
                if let Some(d) = instr.dest() {
                    assert!(alloc.location(d).is_some());
                }
            }
        }
        // Loop-depth weighting reached the intervals
        assert!(alloc.intervals.iter().any(|iv| iv.frequency > 1));
    }
}
