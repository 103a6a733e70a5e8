use super::*;
use crate::vm::{GeneratorSnapshot, GeneratorStatus, IteratorStep};

fn step(value: Val, done: bool) -> IteratorStep {
    IteratorStep { value, done }
}

fn status(generator: &Val) -> GeneratorStatus {
    match generator {
        Val::Generator(g) => g.status(),
        other => panic!("expected a generator, got {other:?}"),
    }
}

/// function* counter(a) {
///     let x = yield a;
///     try { yield x + 1; } finally { runs++; }
///     return 100;
/// }
fn counter_gen() -> Arc<FunctionBody> {
    let mut b = FunctionBuilder::new("counter");
    b.kind(FunctionKind::Generator).params(1);
    let one = b.constant(Val::Int(1));
    let a = b.param_reg(0);
    let x = b.temp(0);
    let t = b.temp(1);
    let scratch = b.temp(2);
    let fin = b.label();
    let after = b.label();

    b.emit(Op::Yield { dst: x, src: a });
    b.emit(Op::TryFinally { finally_target: fin.0 });
    b.emit(Op::Add { dst: t, lhs: x, rhs: one });
    b.emit(Op::Yield { dst: t, src: t });
    b.emit(Op::Leave { target: after.0 });
    b.bind(fin);
    bump_global(&mut b, "runs", scratch);
    b.emit(Op::LeaveNull {});
    b.bind(after);
    b.emit(Op::LdInt { dst: 0, value: 100 });
    b.emit(Op::Ret {});
    b.build().unwrap()
}

fn gen_engine() -> Engine {
    let mut engine = Engine::new();
    engine.define_global("runs", Val::Int(0));
    engine
}

#[test]
fn test_yield_and_resume_with_sent_values() {
    let mut engine = gen_engine();
    let generator = engine.call_function(&counter_gen(), &[Val::Int(5)]).unwrap();
    assert_eq!(status(&generator), GeneratorStatus::SuspendedStart);

    // the value sent to a fresh generator has no Yield to land in
    let first = engine.resume_generator(&generator, Val::Int(-1)).unwrap();
    assert_eq!(first, step(Val::Int(5), false));
    let second = engine.resume_generator(&generator, Val::Int(10)).unwrap();
    assert_eq!(second, step(Val::Int(11), false));
    assert_eq!(counter(&engine, "runs"), 0);

    let last = engine.resume_generator(&generator, Val::Undefined).unwrap();
    assert_eq!(last, step(Val::Int(100), true));
    assert_eq!(counter(&engine, "runs"), 1);
    assert_eq!(status(&generator), GeneratorStatus::Completed);

    let after = engine.resume_generator(&generator, Val::Undefined).unwrap();
    assert_eq!(after, step(Val::Undefined, true));
    assert_eq!(engine.context().call_stack_depth(), 0);
}

#[test]
fn test_generator_frames_live_on_the_heap() {
    let mut engine = gen_engine();
    let before = engine.allocator_stats();
    let generator = engine.call_function(&counter_gen(), &[Val::Int(1)]).unwrap();
    let after = engine.allocator_stats();
    assert!(after.heap_slots_allocated > before.heap_slots_allocated);
    assert_eq!(after.stack_slots_in_use, before.stack_slots_in_use);
    engine.resume_generator(&generator, Val::Undefined).unwrap();
}

#[test]
fn test_yield_inside_catch_resumes_in_the_catch_body() {
    // function* g() { try { yield 1; throw 2; } catch (e) { yield e + 10; } return 0; }
    let mut b = FunctionBuilder::new("catching");
    b.kind(FunctionKind::Generator);
    let one = b.constant(Val::Int(1));
    let two = b.constant(Val::Int(2));
    let ten = b.constant(Val::Int(10));
    let e = b.temp(0);
    let t = b.temp(1);
    let catch = b.label();
    let after = b.label();

    b.emit(Op::TryCatch { catch_target: catch.0 });
    b.emit(Op::Yield { dst: t, src: one });
    b.emit(Op::Throw { src: two });
    b.bind(catch);
    b.emit(Op::Catch { dst: e });
    b.emit(Op::Add { dst: t, lhs: e, rhs: ten });
    b.emit(Op::Yield { dst: t, src: t });
    b.emit(Op::Leave { target: after.0 });
    b.bind(after);
    b.emit(Op::LdInt { dst: 0, value: 0 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = Engine::new();
    let generator = engine.call_function(&body, &[]).unwrap();
    assert_eq!(engine.resume_generator(&generator, Val::Undefined).unwrap(), step(Val::Int(1), false));

    let snap = engine.snapshot_generator(&generator).unwrap();
    assert_eq!(snap.regions.len(), 1);
    assert_eq!(snap.regions[0].kind, HandlerKind::None);
    assert_eq!(snap.regions[0].catch_offset, Some(catch_offset(&body)));

    assert_eq!(engine.resume_generator(&generator, Val::Undefined).unwrap(), step(Val::Int(12), false));
    let snap = engine.snapshot_generator(&generator).unwrap();
    assert_eq!(snap.regions.len(), 1);
    assert_eq!(snap.regions[0].kind, HandlerKind::Catch);

    assert_eq!(engine.resume_generator(&generator, Val::Undefined).unwrap(), step(Val::Int(0), true));
}

/// Offset of the first `Catch` instruction.
fn catch_offset(body: &FunctionBody) -> u32 {
    crate::vm::disassemble::<Op>(&body.code)
        .unwrap()
        .into_iter()
        .find(|line| line.text.starts_with("Catch"))
        .map(|line| line.offset)
        .unwrap()
}

#[test]
fn test_snapshot_survives_serialization_and_restores_equal() {
    let mut engine = gen_engine();
    let function = engine.instantiate(counter_gen());
    let generator = engine.call(&function, &[Val::Int(5)]).unwrap();
    engine.resume_generator(&generator, Val::Undefined).unwrap();
    engine.resume_generator(&generator, Val::Int(10)).unwrap();

    let snap = engine.snapshot_generator(&generator).unwrap();
    assert_eq!(snap.status, GeneratorStatus::SuspendedYield);
    assert_eq!(snap.regions.len(), 1);
    assert_eq!(snap.arguments.len(), 1);

    let json = serde_json::to_string(&snap).unwrap();
    let decoded: GeneratorSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, snap);

    let restored = engine.restore_generator(&function, &decoded).unwrap();
    assert_eq!(engine.snapshot_generator(&restored).unwrap(), snap);

    // both copies finish independently and each runs the finally once
    assert_eq!(engine.resume_generator(&restored, Val::Int(0)).unwrap(), step(Val::Int(100), true));
    assert_eq!(engine.resume_generator(&generator, Val::Int(0)).unwrap(), step(Val::Int(100), true));
    assert_eq!(counter(&engine, "runs"), 2);
}

#[test]
fn test_restore_rejects_mismatched_functions() {
    let mut engine = gen_engine();
    let function = engine.instantiate(counter_gen());
    let generator = engine.call(&function, &[Val::Int(5)]).unwrap();
    let mut snap = engine.snapshot_generator(&generator).unwrap();

    let mut other = FunctionBuilder::new("other");
    other.kind(FunctionKind::Generator);
    other.emit(Op::Ret {});
    let other = engine.instantiate(other.build().unwrap());
    assert!(engine.restore_generator(&other, &snap).is_err());

    snap.registers.pop();
    let err = engine.restore_generator(&function, &snap).unwrap_err();
    assert!(format!("{err:#}").contains("registers"));

    engine.resume_generator(&generator, Val::Undefined).unwrap();
    engine.resume_generator(&generator, Val::Undefined).unwrap();
    engine.resume_generator(&generator, Val::Undefined).unwrap();
    assert!(engine.snapshot_generator(&generator).is_err());
}

#[test]
fn test_resuming_a_running_generator_throws() {
    // function* selfish() { yield self_gen.next(); }
    let mut b = FunctionBuilder::new("selfish");
    b.kind(FunctionKind::Generator);
    let me = b.name("self_gen");
    let g = b.temp(0);
    let t = b.temp(1);
    b.emit(Op::LdRoot { dst: g, name: me });
    b.emit(Op::ResumeGenerator { dst: t, generator: g, value: t });
    b.emit(Op::Yield { dst: t, src: t });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = Engine::new();
    let generator = engine.call_function(&body, &[]).unwrap();
    engine.define_global("self_gen", generator.clone());
    let err = engine.resume_generator(&generator, Val::Undefined).unwrap_err();
    match vm_error(&err).exception_value() {
        Some(Val::Error(e)) => assert_eq!(e.kind, ErrorKind::TypeError),
        other => panic!("expected TypeError, got {other:?}"),
    }
    assert_eq!(status(&generator), GeneratorStatus::Completed);
}

/// function* upto(n) { for (let i = 0; i < n; i++) yield i; return -1; }
fn upto_gen() -> Arc<FunctionBody> {
    let mut b = FunctionBuilder::new("upto");
    b.kind(FunctionKind::Generator).params(1);
    let n = b.param_reg(0);
    let i = b.temp(0);
    let c = b.temp(1);
    let sent = b.temp(2);
    let top = b.label();
    let exit = b.label();

    b.emit(Op::LdInt { dst: i, value: 0 });
    b.emit(Op::ProfiledLoopStart { loop_num: 0 });
    let loop_num = b.begin_loop(false, true);
    b.bind(top);
    b.emit(Op::LoopBodyStart { loop_num });
    b.emit(Op::Lt { dst: c, lhs: i, rhs: n });
    b.emit(Op::BrFalse { src: c, target: exit.0 });
    b.emit(Op::Yield { dst: sent, src: i });
    b.emit(Op::Incr { dst: i, src: i });
    b.emit(Op::Br { target: top.0 });
    b.bind(exit);
    b.end_loop(loop_num);
    b.emit(Op::ProfiledLoopEnd { loop_num });
    b.emit(Op::LdInt { dst: 0, value: -1 });
    b.emit(Op::Ret {});
    b.build().unwrap()
}

#[test]
fn test_generator_suspended_inside_a_loop_restores_equal() {
    let body = upto_gen();
    let mut engine = Engine::new();
    let function = engine.instantiate(Arc::clone(&body));
    let generator = engine.call(&function, &[Val::Int(3)]).unwrap();
    assert_eq!(engine.resume_generator(&generator, Val::Undefined).unwrap(), step(Val::Int(0), false));
    assert_eq!(engine.resume_generator(&generator, Val::Undefined).unwrap(), step(Val::Int(1), false));

    let snap = engine.snapshot_generator(&generator).unwrap();
    assert_eq!(snap.loop_counts, vec![2]);
    assert_eq!(snap.loop_flags.len(), 1);

    let json = serde_json::to_string(&snap).unwrap();
    let decoded: GeneratorSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, snap);
    let restored = engine.restore_generator(&function, &decoded).unwrap();
    assert_eq!(engine.snapshot_generator(&restored).unwrap(), snap);

    // both copies continue the same iteration and finish the loop
    for copy in [&restored, &generator] {
        assert_eq!(engine.resume_generator(copy, Val::Undefined).unwrap(), step(Val::Int(2), false));
        assert_eq!(engine.resume_generator(copy, Val::Undefined).unwrap(), step(Val::Int(-1), true));
        assert_eq!(status(copy), GeneratorStatus::Completed);
    }
    // the header counter is shared and only moves forward
    assert_eq!(body.loops[0].interpret_count(), 6);
}
