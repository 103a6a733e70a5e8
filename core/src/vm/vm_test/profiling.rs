use super::*;
use crate::vm::ValueTypes;

/// function add(a, b) { return a + b; }
fn adder() -> (Arc<FunctionBody>, u32) {
    let mut b = FunctionBuilder::new("add");
    b.params(2);
    let (x, y) = (b.param_reg(0), b.param_reg(1));
    let add_at = b.emit(Op::Add { dst: 0, lhs: x, rhs: y });
    b.emit(Op::Ret {});
    (b.build().unwrap(), add_at)
}

/// function identity(v) { return v; }
fn identity(name: &str) -> Arc<FunctionBody> {
    let mut b = FunctionBuilder::new(name);
    b.params(1);
    let v = b.param_reg(0);
    b.emit(Op::Ld { dst: 0, src: v });
    b.emit(Op::Ret {});
    b.build().unwrap()
}

#[test]
fn test_first_calls_record_value_types() {
    let (body, add_at) = adder();
    let mut engine = engine_with(|c| c.profile_calls = 2);
    assert_eq!(engine.call_function(&body, &[Val::Int(1), Val::Int(2)]).unwrap(), Val::Int(3));
    assert_eq!(engine.call_function(&body, &[Val::Float(0.5), Val::Int(1)]).unwrap(), Val::Float(1.5));
    // past the profiling budget nothing more is recorded
    assert_eq!(engine.call_function(&body, &[Val::str("a"), Val::str("b")]).unwrap(), Val::str("ab"));

    let types = body.profile.value_types(add_at);
    assert!(types.contains(ValueTypes::INT));
    assert!(types.contains(ValueTypes::FLOAT));
    assert!(!types.contains(ValueTypes::STRING));
    assert!(types.is_polymorphic());
}

#[test]
fn test_unprofiled_calls_record_nothing() {
    let (body, add_at) = adder();
    let mut engine = engine_with(|c| c.profile_calls = 0);
    assert_eq!(engine.call_function(&body, &[Val::Int(1), Val::Int(2)]).unwrap(), Val::Int(3));
    assert_eq!(body.profile.value_types(add_at), ValueTypes::NONE);
}

#[test]
fn test_call_sites_track_their_callees() {
    // function site(f) { return f(1); }
    let mut b = FunctionBuilder::new("site");
    b.params(1);
    let one = b.constant(Val::Int(1));
    let f = b.param_reg(0);
    b.emit(Op::StartCall { argc: 1 });
    b.emit(Op::ArgOut { index: 0, src: one });
    let call_at = b.emit(Op::Call { dst: 0, callee: f, argc: 1 });
    b.emit(Op::Ret {});
    let site = b.build().unwrap();

    let mut engine = engine_with(|c| c.profile_calls = 10);
    let first = identity("first");
    let first_id = first.id;
    let first = engine.instantiate(first);
    let second = engine.instantiate(identity("second"));

    assert_eq!(site.profile.call_site_count(), 0);
    assert_eq!(engine.call_function(&site, &[first.clone()]).unwrap(), Val::Int(1));
    assert_eq!(engine.call_function(&site, &[first]).unwrap(), Val::Int(1));
    let profile = site.profile.call_site(call_at).unwrap();
    assert_eq!(profile.calls, 2);
    assert_eq!(profile.callee, Some(first_id));
    assert_eq!(profile.arg_count, 1);
    assert!(!profile.polymorphic);

    assert_eq!(engine.call_function(&site, &[second]).unwrap(), Val::Int(1));
    let profile = site.profile.call_site(call_at).unwrap();
    assert_eq!(profile.calls, 3);
    assert_eq!(profile.callee, None);
    assert!(profile.polymorphic);
    assert_eq!(site.profile.call_site_count(), 1);
}

struct ProfiledLoop {
    body: Arc<FunctionBody>,
    /// `s = s + obj` inside the loop.
    in_loop: u32,
    /// `r = s + 1` after the loop.
    after_loop: u32,
}

/// function sum(n, obj) { let s = 0; for (let i = 0; i < n; i++) s = s + obj; return s + 1; }
fn profiled_loop() -> ProfiledLoop {
    let mut b = FunctionBuilder::new("sum");
    b.params(2);
    let one = b.constant(Val::Int(1));
    let n = b.param_reg(0);
    let obj = b.param_reg(1);
    let s = b.temp(0);
    let i = b.temp(1);
    let c = b.temp(2);
    let top = b.label();
    let exit = b.label();

    b.emit(Op::LdInt { dst: s, value: 0 });
    b.emit(Op::LdInt { dst: i, value: 0 });
    b.emit(Op::ProfiledLoopStart { loop_num: 0 });
    let loop_num = b.begin_loop(false, true);
    b.bind(top);
    b.emit(Op::LoopBodyStart { loop_num });
    b.emit(Op::Lt { dst: c, lhs: i, rhs: n });
    b.emit(Op::BrFalse { src: c, target: exit.0 });
    let in_loop = b.emit(Op::Add { dst: s, lhs: s, rhs: obj });
    b.emit(Op::Incr { dst: i, src: i });
    b.emit(Op::Br { target: top.0 });
    b.bind(exit);
    b.end_loop(loop_num);
    b.emit(Op::ProfiledLoopEnd { loop_num });
    let after_loop = b.emit(Op::Add { dst: 0, lhs: s, rhs: one });
    b.emit(Op::Ret {});

    ProfiledLoop {
        body: b.build().unwrap(),
        in_loop,
        after_loop,
    }
}

fn value_of_one(_engine: &mut Engine, _args: &[Val]) -> VmResult<Val> {
    Ok(Val::Int(1))
}

fn convertible() -> Val {
    let object = PlainObject::new();
    object.set_own("valueOf", Val::native("valueOf", value_of_one));
    Val::Object(object)
}

#[test]
fn test_hot_loop_switches_to_profiling_for_its_duration() {
    let l = profiled_loop();
    let mut engine = engine_with(|c| {
        c.profile_calls = 0;
        c.min_profile_iterations = 3;
    });
    assert_eq!(engine.call_function(&l.body, &[Val::Int(5), convertible()]).unwrap(), Val::Int(6));

    // profiled from the third iteration until the loop exit
    assert!(l.body.profile.value_types(l.in_loop).contains(ValueTypes::INT));
    assert_eq!(l.body.profile.value_types(l.after_loop), ValueTypes::NONE);

    let implicit = l.body.profile.loop_implicit_calls(0);
    assert!(implicit.contains(ImplicitCallFlags::TO_PRIMITIVE));
    assert!(implicit.contains(ImplicitCallFlags::NATIVE));
}

#[test]
fn test_loops_stay_unprofiled_without_an_iteration_trigger() {
    let l = profiled_loop();
    let mut engine = engine_with(|c| c.profile_calls = 0);
    assert_eq!(engine.call_function(&l.body, &[Val::Int(5), convertible()]).unwrap(), Val::Int(6));
    assert_eq!(l.body.profile.value_types(l.in_loop), ValueTypes::NONE);
    assert!(l.body.profile.loop_implicit_calls(0).is_empty());
}

#[test]
fn test_profiled_loop_isolates_implicit_calls() {
    // the first call is profiled from the start; plain numbers cause no implicit calls
    let l = profiled_loop();
    let mut engine = Engine::new();
    assert_eq!(engine.call_function(&l.body, &[Val::Int(3), Val::Int(2)]).unwrap(), Val::Int(7));
    assert!(l.body.profile.loop_implicit_calls(0).is_empty());
    assert!(l.body.profile.value_types(l.after_loop).contains(ValueTypes::INT));
}

#[test]
fn test_auto_profiled_loop_ignores_earlier_implicit_calls() {
    // function count(n, obj) { let t = obj + obj; let i = 0; while (i < n) i++; return i; }
    let mut b = FunctionBuilder::new("count");
    b.params(2);
    let n = b.param_reg(0);
    let obj = b.param_reg(1);
    let t = b.temp(0);
    let i = b.temp(1);
    let c = b.temp(2);
    let top = b.label();
    let exit = b.label();

    b.emit(Op::Add { dst: t, lhs: obj, rhs: obj });
    b.emit(Op::LdInt { dst: i, value: 0 });
    b.emit(Op::ProfiledLoopStart { loop_num: 0 });
    let loop_num = b.begin_loop(false, true);
    b.bind(top);
    b.emit(Op::LoopBodyStart { loop_num });
    b.emit(Op::Lt { dst: c, lhs: i, rhs: n });
    b.emit(Op::BrFalse { src: c, target: exit.0 });
    b.emit(Op::Incr { dst: i, src: i });
    b.emit(Op::Br { target: top.0 });
    b.bind(exit);
    b.end_loop(loop_num);
    b.emit(Op::ProfiledLoopEnd { loop_num });
    b.emit(Op::Ld { dst: 0, src: i });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = engine_with(|c| {
        c.profile_calls = 0;
        c.min_profile_iterations = 3;
    });
    assert_eq!(engine.call_function(&body, &[Val::Int(5), convertible()]).unwrap(), Val::Int(5));
    assert_eq!(body.loops[0].interpret_count(), 6);
    assert!(body.profile.loop_implicit_calls(0).is_empty());
}
