//! Optimizer-level properties: pipeline fixed point, specialization
//! against real profiles, SSA preservation

use aero_core::{FunctionId, Value};
use aero_engine::bytecode::{BytecodeBuilder, Opcode};
use aero_engine::jit::ir::builder::build_ir;
use aero_engine::jit::ir::Instr;
use aero_engine::jit::opt::{OptFlags, Optimizer, PassContext};
use aero_engine::jit::regalloc::{allocate, PhysReg};
use aero_engine::profiler::Profiler;

/// while (i < n) { s = s + i; i = i + 1 } return s — with int feedback
fn hot_loop() -> (
    aero_engine::jit::ir::IrFunction,
    aero_engine::jit::ir::builder::SiteTable,
    aero_engine::profiler::ProfileSnapshot,
) {
    let mut b = BytecodeBuilder::new("f", 1, 2);
    b.load_int(0);
    b.store_var(1);
    b.load_int(0);
    b.store_var(2);
    let top = b.new_label();
    let out = b.new_label();
    b.bind(top);
    b.load_var(2);
    b.load_var(0);
    let lt_site = b.offset();
    b.emit(Opcode::Lt);
    b.jump_if_false(out);
    b.load_var(1);
    b.load_var(2);
    let add_site = b.offset();
    b.emit(Opcode::Add);
    b.store_var(1);
    b.load_var(2);
    b.load_int(1);
    let inc_site = b.offset();
    b.emit(Opcode::Add);
    b.store_var(2);
    b.jump(top);
    b.bind(out);
    b.load_var(1);
    b.emit(Opcode::Return);
    let f = b.finish();

    let profiler = Profiler::new(true);
    for site in [lt_site, add_site, inc_site] {
        for _ in 0..100 {
            profiler.record_type(FunctionId(0), site, 0, Value::integer(1));
            profiler.record_type(FunctionId(0), site, 1, Value::integer(2));
        }
    }
    let profile = profiler.snapshot(FunctionId(0));
    let (ir, sites) = build_ir(
        FunctionId(0),
        "f",
        &f.code,
        &f.consts,
        1,
        2,
        false,
        &profile,
        None,
    )
    .unwrap();
    (ir, sites, profile)
}

#[test]
fn test_specialization_produces_guarded_int_ops() {
    let (mut ir, sites, profile) = hot_loop();
    let ctx = PassContext {
        profile: &profile,
        sites: &sites,
        funcs: None,
        profiler: None,
        flags: OptFlags::for_level(2),
    };
    Optimizer::new().optimize(&mut ir, &ctx);

    let instrs: Vec<&Instr> = ir.blocks.iter().flat_map(|b| b.instrs.iter()).collect();
    assert!(instrs.iter().any(|i| matches!(i, Instr::IntAdd { .. })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::GuardInt { .. })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::IntCmp { .. })));
    // The generic forms are gone
    assert!(!instrs.iter().any(|i| matches!(i, Instr::Binary { .. })));
    assert!(!instrs.iter().any(|i| matches!(i, Instr::Compare { .. })));
    assert!(ir.verify_ssa().is_ok());
}

#[test]
fn test_optimizer_reaches_fixed_point() {
    let (mut ir, sites, profile) = hot_loop();
    let ctx = PassContext {
        profile: &profile,
        sites: &sites,
        funcs: None,
        profiler: None,
        flags: OptFlags::for_level(2),
    };
    let optimizer = Optimizer::new();
    optimizer.optimize(&mut ir, &ctx);
    let once = format!("{ir}");
    optimizer.optimize(&mut ir, &ctx);
    let twice = format!("{ir}");
    assert_eq!(once, twice, "second optimizer run changed the IR");
}

#[test]
fn test_allocation_is_deterministic_after_optimization() {
    let regs = [PhysReg(3), PhysReg(12), PhysReg(13)];
    let run = || {
        let (mut ir, sites, profile) = hot_loop();
        let ctx = PassContext {
            profile: &profile,
            sites: &sites,
            funcs: None,
            profiler: None,
            flags: OptFlags::for_level(2),
        };
        Optimizer::new().optimize(&mut ir, &ctx);
        let alloc = allocate(&ir, &regs);
        let mut pairs: Vec<String> = ir
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter_map(|i| i.dest())
            .map(|d| format!("{d}:{:?}", alloc.location(d)))
            .collect();
        pairs.sort();
        (pairs, alloc.spill_slots)
    };
    assert_eq!(run(), run());
}

#[test]
fn test_deopt_states_survive_optimization() {
    let (mut ir, sites, profile) = hot_loop();
    let ctx = PassContext {
        profile: &profile,
        sites: &sites,
        funcs: None,
        profiler: None,
        flags: OptFlags::for_level(2),
    };
    Optimizer::new().optimize(&mut ir, &ctx);

    // Every guard and checked-arith instruction points at a valid state
    for block in &ir.blocks {
        for instr in &block.instrs {
            if let Some(d) = instr.deopt_id() {
                let state = &ir.deopt_states[d.0 as usize];
                assert!(!state.frames.is_empty());
            }
        }
    }
}
