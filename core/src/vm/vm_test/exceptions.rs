use super::*;

/// Define global `deep`, a function that recurses until the call depth runs out.
fn define_deep(engine: &mut Engine) {
    let mut b = FunctionBuilder::new("deep");
    let name = b.name("deep");
    let f = b.temp(0);
    b.emit(Op::LdRoot { dst: f, name });
    b.emit(Op::StartCall { argc: 0 });
    b.emit(Op::Call { dst: 0, callee: f, argc: 0 });
    b.emit(Op::Ret {});
    let deep = engine.instantiate(b.build().unwrap());
    engine.define_global("deep", deep);
}

/// Emit `deep()` into temp register `tmp`.
fn call_deep(b: &mut FunctionBuilder, tmp: u32) {
    let name = b.name("deep");
    b.emit(Op::LdRoot { dst: tmp, name });
    b.emit(Op::StartCall { argc: 0 });
    b.emit(Op::Call { dst: tmp, callee: tmp, argc: 0 });
}

/// Emits `try { <try_body> } finally { runs++; }` followed by `return 1`.
fn try_finally(try_body: impl FnOnce(&mut FunctionBuilder, u32)) -> Arc<FunctionBody> {
    let mut b = FunctionBuilder::new("guarded");
    let seven = b.constant(Val::Int(7));
    let t = b.temp(0);
    let fin = b.label();
    let after = b.label();

    b.emit(Op::TryFinally { finally_target: fin.0 });
    b.emit(Op::Ld { dst: t, src: seven });
    try_body(&mut b, t);
    b.emit(Op::Leave { target: after.0 });
    b.bind(fin);
    bump_global(&mut b, "runs", t);
    b.emit(Op::LeaveNull {});
    b.bind(after);
    b.emit(Op::LdInt { dst: 0, value: 1 });
    b.emit(Op::Ret {});
    b.build().unwrap()
}

fn counting_engine() -> Engine {
    let mut engine = Engine::new();
    engine.define_global("runs", Val::Int(0));
    engine
}

#[test]
fn test_finally_runs_on_normal_exit() {
    let body = try_finally(|_, _| {});
    let mut engine = counting_engine();
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(1));
    assert_eq!(counter(&engine, "runs"), 1);
}

#[test]
fn test_finally_runs_on_return_and_keeps_the_value() {
    // try { return 7; } finally { runs++; }
    let body = try_finally(|b, t| {
        b.emit(Op::Ld { dst: 0, src: t });
        b.emit(Op::Ret {});
    });
    let mut engine = counting_engine();
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(7));
    assert_eq!(counter(&engine, "runs"), 1);
}

#[test]
fn test_finally_runs_on_throw_and_rethrows() {
    // try { throw 7; } finally { runs++; }
    let body = try_finally(|b, t| {
        b.emit(Op::Throw { src: t });
    });
    let mut engine = counting_engine();
    let err = engine.call_function(&body, &[]).unwrap_err();
    assert_eq!(vm_error(&err).exception_value(), Some(&Val::Int(7)));
    assert_eq!(counter(&engine, "runs"), 1);
}

#[test]
fn test_return_in_finally_discards_pending_throw() {
    // try { throw "lost"; } finally { return 9; }
    let mut b = FunctionBuilder::new("override");
    let lost = b.constant(Val::str("lost"));
    let fin = b.label();
    b.emit(Op::TryFinally { finally_target: fin.0 });
    b.emit(Op::Throw { src: lost });
    b.bind(fin);
    b.emit(Op::LdInt { dst: 0, value: 9 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    assert_eq!(exec(&body, &[]), Val::Int(9));
}

#[test]
fn test_catch_binds_thrown_value_and_nested_finally_runs() {
    // try { try { throw 7; } finally { runs++; } } catch (e) { return e + runs; }
    let mut b = FunctionBuilder::new("nested");
    let seven = b.constant(Val::Int(7));
    let e = b.temp(0);
    let t = b.temp(1);
    let catch = b.label();
    let fin = b.label();
    let runs = b.name("runs");

    b.emit(Op::TryCatch { catch_target: catch.0 });
    b.emit(Op::TryFinally { finally_target: fin.0 });
    b.emit(Op::Throw { src: seven });
    b.bind(fin);
    bump_global(&mut b, "runs", t);
    b.emit(Op::LeaveNull {});
    b.bind(catch);
    b.emit(Op::Catch { dst: e });
    b.emit(Op::LdRoot { dst: t, name: runs });
    b.emit(Op::Add { dst: 0, lhs: e, rhs: t });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = counting_engine();
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(8));
}

#[test]
fn test_catch_receives_a_private_copy_of_static_errors() {
    // try { 5(); } catch (e) { return e; }
    let mut b = FunctionBuilder::new("catcher");
    let five = b.constant(Val::Int(5));
    let e = b.temp(0);
    let catch = b.label();
    b.emit(Op::TryCatch { catch_target: catch.0 });
    b.emit(Op::StartCall { argc: 0 });
    b.emit(Op::Call { dst: e, callee: five, argc: 0 });
    b.emit(Op::Leave { target: catch.0 });
    b.bind(catch);
    b.emit(Op::Catch { dst: e });
    b.emit(Op::Ld { dst: 0, src: e });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = Engine::new();
    let caught = engine.call_function(&body, &[]).unwrap();
    let Val::Error(err) = &caught else {
        panic!("expected an error value, got {caught:?}");
    };
    assert_eq!(err.kind, ErrorKind::TypeError);
    assert!(!err.is_static());
    assert!(engine.context().library().not_callable.is_static());
    assert!(!Arc::ptr_eq(err, &engine.context().library().not_callable));
}

#[test]
fn test_catch_does_not_see_stack_overflow() {
    // try { deep(); } catch (e) { return 0; }
    let mut b = FunctionBuilder::new("shielded");
    let t = b.temp(0);
    let catch = b.label();
    b.emit(Op::TryCatch { catch_target: catch.0 });
    call_deep(&mut b, t);
    b.emit(Op::Leave { target: catch.0 });
    b.bind(catch);
    b.emit(Op::Catch { dst: t });
    b.emit(Op::LdInt { dst: 0, value: 0 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = engine_with(|c| c.max_call_depth = 30);
    define_deep(&mut engine);
    let err = engine.call_function(&body, &[]).unwrap_err();
    assert!(matches!(vm_error(&err), VmError::StackOverflow));
    assert_eq!(engine.context().call_stack_depth(), 0);
}

#[test]
fn test_finally_cannot_swallow_stack_overflow() {
    // try { deep(); } finally { runs++; leave; }
    let mut b = FunctionBuilder::new("swallow");
    let t = b.temp(0);
    let fin = b.label();
    let after = b.label();
    b.emit(Op::TryFinally { finally_target: fin.0 });
    call_deep(&mut b, t);
    b.emit(Op::Leave { target: after.0 });
    b.bind(fin);
    bump_global(&mut b, "runs", t);
    b.emit(Op::Leave { target: after.0 });
    b.bind(after);
    b.emit(Op::LdInt { dst: 0, value: 1 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = engine_with(|c| c.max_call_depth = 30);
    define_deep(&mut engine);
    engine.define_global("runs", Val::Int(0));
    let err = engine.call_function(&body, &[]).unwrap_err();
    assert!(matches!(vm_error(&err), VmError::StackOverflow));
    assert_eq!(counter(&engine, "runs"), 1);
}

#[test]
fn test_runaway_finally_is_cut_off_during_exhaustion() {
    // try { deep(); } finally { for (;;) {} }
    let mut b = FunctionBuilder::new("spin");
    let t = b.temp(0);
    let fin = b.label();
    let after = b.label();
    b.emit(Op::TryFinally { finally_target: fin.0 });
    call_deep(&mut b, t);
    b.emit(Op::Leave { target: after.0 });
    b.bind(fin);
    b.emit(Op::Br { target: fin.0 });
    b.bind(after);
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = engine_with(|c| {
        c.max_call_depth = 30;
        c.exhaustion_finally_budget = 64;
    });
    define_deep(&mut engine);
    let err = engine.call_function(&body, &[]).unwrap_err();
    assert!(matches!(vm_error(&err), VmError::StackOverflow));

    // the budget is gone once the error has left the finally body
    let ok = try_finally(|_, _| {});
    engine.define_global("runs", Val::Int(0));
    assert_eq!(engine.call_function(&ok, &[]).unwrap(), Val::Int(1));
}

#[test]
fn test_fatal_errors_skip_finally() {
    // try { <write to constant slot> } finally { runs++; }
    let mut b = FunctionBuilder::new("corrupt");
    let c = b.constant(Val::Int(3));
    let t = b.temp(0);
    let fin = b.label();
    let after = b.label();
    b.emit(Op::TryFinally { finally_target: fin.0 });
    b.emit(Op::LdInt { dst: c, value: 4 });
    b.emit(Op::Leave { target: after.0 });
    b.bind(fin);
    bump_global(&mut b, "runs", t);
    b.emit(Op::LeaveNull {});
    b.bind(after);
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = counting_engine();
    let err = engine.call_function(&body, &[]).unwrap_err();
    assert!(vm_error(&err).is_fatal());
    assert_eq!(counter(&engine, "runs"), 0);
}

fn out_arg_reset_body(catch_stages_call: bool) -> Arc<FunctionBody> {
    // try { f(1, throw 7) } catch (e) { return add(e, 1); }
    let mut b = FunctionBuilder::new("reset");
    let one = b.constant(Val::Int(1));
    let seven = b.constant(Val::Int(7));
    let add = b.name("add");
    let e = b.temp(0);
    let f = b.temp(1);
    let catch = b.label();

    b.emit(Op::TryCatch { catch_target: catch.0 });
    b.emit(Op::StartCall { argc: 2 });
    b.emit(Op::ArgOut { index: 0, src: one });
    b.emit(Op::Throw { src: seven });
    b.bind(catch);
    b.emit(Op::Catch { dst: e });
    b.emit(Op::LdRoot { dst: f, name: add });
    if catch_stages_call {
        b.emit(Op::StartCall { argc: 2 });
        b.emit(Op::ArgOut { index: 0, src: e });
        b.emit(Op::ArgOut { index: 1, src: one });
    }
    b.emit(Op::Call { dst: 0, callee: f, argc: 2 });
    b.emit(Op::Ret {});
    b.build().unwrap()
}

fn native_add(_engine: &mut Engine, args: &[Val]) -> VmResult<Val> {
    let lhs = args.first().and_then(Val::as_int).unwrap_or(0);
    let rhs = args.get(1).and_then(Val::as_int).unwrap_or(0);
    Ok(Val::Int(lhs + rhs))
}

#[test]
fn test_catch_discards_out_args_staged_by_the_try_body() {
    let mut engine = Engine::new();
    engine.define_native("add", native_add);
    let body = out_arg_reset_body(true);
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(8));

    // the reservation opened before the throw is gone, so an unstaged call has nothing to use
    let body = out_arg_reset_body(false);
    let err = engine.call_function(&body, &[]).unwrap_err();
    assert!(vm_error(&err).is_fatal());
}
