//! End-to-end engine scenarios: tier-up, deoptimization, prototype
//! semantics, inline-cache polymorphism, GC retention, execution limits

use std::sync::Arc;

use aero_core::Value;
use aero_engine::bytecode::{BytecodeBuilder, BytecodeModule, ModuleBuilder, Opcode};
use aero_engine::engine::{Engine, EngineConfig};
use aero_engine::jit::ic::IcState;
use aero_engine::ErrorKind;

fn interp_config() -> EngineConfig {
    EngineConfig {
        enable_jit: false,
        ..Default::default()
    }
}

/// f(n) { var s = 0; for (var i = 0; i < n; i++) s += i; return s; }
fn sum_loop_module() -> BytecodeModule {
    let mut m = ModuleBuilder::new();
    // locals: 0 = n (param), 1 = s, 2 = i
    let mut f = BytecodeBuilder::new("f", 1, 2);
    f.load_int(0);
    f.store_var(1);
    f.load_int(0);
    f.store_var(2);
    let top = f.new_label();
    let out = f.new_label();
    f.bind(top);
    f.load_var(2);
    f.load_var(0);
    f.emit(Opcode::Lt);
    f.jump_if_false(out);
    f.load_var(1);
    f.load_var(2);
    f.emit(Opcode::Add);
    f.store_var(1);
    f.load_var(2);
    f.load_int(1);
    f.emit(Opcode::Add);
    f.store_var(2);
    f.jump(top);
    f.bind(out);
    f.load_var(1);
    f.emit(Opcode::Return);
    m.function(f.finish());
    m.finish()
}

/// g(x) { return x + 1; }
fn inc_module() -> BytecodeModule {
    let mut m = ModuleBuilder::new();
    let mut g = BytecodeBuilder::new("g", 1, 0);
    g.load_var(0);
    g.load_int(1);
    g.emit(Opcode::Add);
    g.emit(Opcode::Return);
    m.function(g.finish());
    m.finish()
}

#[test]
fn test_arithmetic_loop_interpreter_result() {
    let mut engine = Engine::new(interp_config());
    let ids = engine.load_module(&sum_loop_module());
    let r = engine
        .call_function(ids[0], Value::undefined(), &[Value::integer(100_000)])
        .unwrap();
    assert_eq!(engine.heap().to_number(r).unwrap(), 4_999_950_000.0);
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_arithmetic_tier_up_matches_interpreter() {
    // Aggressive thresholds so the loop crosses the optimizing bar and an
    // OSR entry lands mid-execution; the sum overflows i32, so the
    // specialized IntAdd eventually deopts and the run must still agree
    // with the interpreter
    let mut engine = Engine::new(EngineConfig {
        jit_threshold: 20,
        ..Default::default()
    });
    let ids = engine.load_module(&sum_loop_module());
    let r = engine
        .call_function(ids[0], Value::undefined(), &[Value::integer(100_000)])
        .unwrap();
    assert_eq!(engine.heap().to_number(r).unwrap(), 4_999_950_000.0);

    // Run it again a few times: entries installed in the background get
    // picked up at function entry and the result stays stable
    for _ in 0..10 {
        let r = engine
            .call_function(ids[0], Value::undefined(), &[Value::integer(100_000)])
            .unwrap();
        assert_eq!(engine.heap().to_number(r).unwrap(), 4_999_950_000.0);
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_deopt_on_type_change() {
    use std::time::{Duration, Instant};

    let mut engine = Engine::new(EngineConfig {
        jit_threshold: 20,
        ..Default::default()
    });
    let ids = engine.load_module(&inc_module());
    let record = engine.functions().record(ids[0]).unwrap();

    // Warm with integers until a native entry is installed
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        for i in 0..100 {
            let r = engine
                .call_function(ids[0], Value::undefined(), &[Value::integer(i)])
                .unwrap();
            assert_eq!(r.as_integer(), Some(i + 1));
        }
        if record.native_entry().is_some() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "native entry was never installed"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    // Keep calling through the native entry
    for i in 0..100 {
        let r = engine
            .call_function(ids[0], Value::undefined(), &[Value::integer(i)])
            .unwrap();
        assert_eq!(r.as_integer(), Some(i + 1));
    }

    // The type excursion: "5" + 1 must concatenate
    let s = engine.heap_mut().alloc_string("5");
    let r = engine.call_function(ids[0], Value::undefined(), &[s]).unwrap();
    assert_eq!(engine.heap().to_display(r), "51");

    // Integers still work afterwards
    let r = engine
        .call_function(ids[0], Value::undefined(), &[Value::integer(41)])
        .unwrap();
    assert_eq!(r.as_integer(), Some(42));
}

#[test]
fn test_prototype_lookup_and_shadowing() {
    let mut engine = Engine::new(interp_config());
    // var p = {x: 1}; var o = Object.create(p);
    let p = engine.heap_mut().alloc_object(None);
    engine.set_property(p, "x", Value::integer(1)).unwrap();
    let o = engine.heap_mut().alloc_object(p.object_id());

    // o.x reads through the chain
    assert_eq!(engine.get_property(o, "x").unwrap(), Value::integer(1));

    // o.x = 2 shadows; p.x unchanged
    engine.set_property(o, "x", Value::integer(2)).unwrap();
    assert_eq!(engine.get_property(o, "x").unwrap(), Value::integer(2));
    assert_eq!(engine.get_property(p, "x").unwrap(), Value::integer(1));
}

#[test]
fn test_inline_cache_polymorphism_to_megamorphic() {
    let mut engine = Engine::new(interp_config());

    // reader(o) { return o.k; }
    let mut m = ModuleBuilder::new();
    let k = m.name("k");
    let mut f = BytecodeBuilder::new("reader", 1, 0);
    f.load_var(0);
    let site = f.offset();
    f.emit_u16(Opcode::GetProp, k);
    f.emit(Opcode::Return);
    m.function(f.finish());
    let ids = engine.load_module(&m.finish());
    let reader = ids[0];

    // Four distinct shapes, same `k` property at different slots
    let prefixes: [&[&str]; 4] = [&[], &["a"], &["a", "b"], &["a", "b", "c"]];
    let mut objects = Vec::new();
    for (n, prefix) in prefixes.iter().enumerate() {
        let o = engine.heap_mut().alloc_object(None);
        for p in prefix.iter() {
            engine.set_property(o, p, Value::integer(0)).unwrap();
        }
        engine
            .set_property(o, "k", Value::integer(n as i32 + 10))
            .unwrap();
        objects.push(o);
    }

    // Warm: the site grows to four entries, every read correct
    for _ in 0..50 {
        for (n, &o) in objects.iter().enumerate() {
            let r = engine.call_function(reader, Value::undefined(), &[o]).unwrap();
            assert_eq!(r.as_integer(), Some(n as i32 + 10));
        }
    }
    assert_eq!(engine.jit().ics().entry_count(reader, site), 4);
    assert_eq!(engine.jit().ics().state(reader, site), IcState::Polymorphic);

    // A fifth shape tips the site megamorphic; results stay correct
    let e = engine.heap_mut().alloc_object(None);
    for p in ["a", "b", "c", "d"] {
        engine.set_property(e, p, Value::integer(0)).unwrap();
    }
    engine.set_property(e, "k", Value::integer(99)).unwrap();
    let r = engine.call_function(reader, Value::undefined(), &[e]).unwrap();
    assert_eq!(r.as_integer(), Some(99));
    assert_eq!(engine.jit().ics().state(reader, site), IcState::Megamorphic);

    for (n, &o) in objects.iter().enumerate() {
        let r = engine.call_function(reader, Value::undefined(), &[o]).unwrap();
        assert_eq!(r.as_integer(), Some(n as i32 + 10));
    }
}

#[test]
fn test_gc_reachability() {
    let mut engine = Engine::new(interp_config());
    let before = engine.stats().heap_cells;

    let keep = engine.heap_mut().alloc_object(None);
    engine.global_set("keep", keep);
    for _ in 0..10_000 {
        engine.heap_mut().alloc_object(None);
    }
    assert!(engine.stats().heap_cells >= before + 10_001);

    let bytes_before = engine.stats().heap_bytes;
    engine.collect_garbage();
    let after = engine.stats();

    // Only the retained object (plus pre-existing cells) survives
    assert_eq!(after.heap_cells, before + 1);
    assert!(after.heap_bytes < bytes_before);

    // The handle still refers to the same logical object
    let kept = engine.global_get("keep");
    assert_eq!(kept, keep);
    engine.set_property(kept, "alive", Value::boolean(true)).unwrap();
    assert_eq!(
        engine.get_property(kept, "alive").unwrap(),
        Value::boolean(true)
    );
}

#[test]
fn test_execution_limit() {
    let mut engine = Engine::new(EngineConfig {
        enable_jit: false,
        execution_limit: Some(10_000),
        ..Default::default()
    });

    // while (true) {}
    let mut m = ModuleBuilder::new();
    let mut f = BytecodeBuilder::new("spin", 0, 0);
    let top = f.new_label();
    f.bind(top);
    f.emit(Opcode::Nop);
    f.jump(top);
    m.function(f.finish());

    let err = engine.run_module(&m.finish()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionLimit);
    // Bounded overshoot: the check fires at safepoint granularity
    assert!(engine.stats().instructions_executed <= 11_000);

    // The engine stays usable for the next evaluation
    let mut m2 = ModuleBuilder::new();
    let mut ok = BytecodeBuilder::new("ok", 0, 0);
    ok.load_int(7);
    ok.emit(Opcode::Return);
    m2.function(ok.finish());
    let v = engine.run_module(&m2.finish()).unwrap();
    assert_eq!(v, Value::integer(7));
}

#[test]
fn test_execution_limit_not_catchable() {
    // A try/catch region must not swallow the limit abort
    let mut engine = Engine::new(EngineConfig {
        enable_jit: false,
        execution_limit: Some(5_000),
        ..Default::default()
    });
    let mut m = ModuleBuilder::new();
    let mut f = BytecodeBuilder::new("spin", 0, 0);
    let top = f.new_label();
    let handler = f.new_label();
    let start = f.offset();
    f.bind(top);
    f.emit(Opcode::Nop);
    f.jump(top);
    let end = f.offset();
    f.bind(handler);
    f.load_int(0);
    f.emit(Opcode::Return);
    f.add_handler(start, end, end, 0, 0);
    m.function(f.finish());

    let err = engine.run_module(&m.finish()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionLimit);
}

#[test]
fn test_call_and_native_interop() {
    let mut engine = Engine::new(interp_config());
    engine.register_native(
        "mul2",
        Arc::new(|heap, _ctx, _this, args: &[Value]| {
            let n = heap.to_number(args.first().copied().unwrap_or(Value::undefined()))?;
            Ok(Value::from_f64_normalized(n * 2.0))
        }),
    );

    // caller() { return mul2(21); }
    let mut m = ModuleBuilder::new();
    let name = m.name("mul2");
    let mut f = BytecodeBuilder::new("caller", 0, 0);
    f.emit_u16(Opcode::LoadGlobal, name);
    f.load_int(21);
    f.call(1);
    f.emit(Opcode::Return);
    m.function(f.finish());

    let v = engine.run_module(&m.finish()).unwrap();
    assert_eq!(v, Value::integer(42));
}

#[test]
fn test_try_catch_recovers_thrown_value() {
    let mut engine = Engine::new(interp_config());

    // try { throw 7 } catch (e) { return e + 1 }
    let mut m = ModuleBuilder::new();
    let mut f = BytecodeBuilder::new("t", 0, 0);
    let handler = f.new_label();
    let start = f.offset();
    f.load_int(7);
    f.emit(Opcode::Throw);
    let end = f.offset();
    f.bind(handler);
    // thrown value is on the stack here
    f.load_int(1);
    f.emit(Opcode::Add);
    f.emit(Opcode::Return);
    f.add_handler(start, end, end, 0, 0);
    m.function(f.finish());

    let v = engine.run_module(&m.finish()).unwrap();
    assert_eq!(v, Value::integer(8));
}

#[test]
fn test_uncaught_throw_maps_to_script_error() {
    let mut engine = Engine::new(interp_config());
    let mut m = ModuleBuilder::new();
    let mut f = BytecodeBuilder::new("boom", 0, 0);
    f.load_string("kaput");
    f.emit(Opcode::Throw);
    m.function(f.finish());
    let err = engine.run_module(&m.finish()).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_execution_counts_are_monotonic() {
    let mut engine = Engine::new(interp_config());
    let ids = engine.load_module(&inc_module());
    let mut last = 0;
    for i in 0..50 {
        engine
            .call_function(ids[0], Value::undefined(), &[Value::integer(i)])
            .unwrap();
        let count = engine.profiler().execution_count(ids[0]);
        assert!(count > last);
        last = count;
    }
}
