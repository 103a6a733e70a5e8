use super::*;

fn add_body() -> Arc<FunctionBody> {
    // function add(a, b) { return a + b; }
    let mut b = FunctionBuilder::new("add");
    b.params(2);
    let (a, c) = (b.param_reg(0), b.param_reg(1));
    b.emit(Op::Add { dst: 0, lhs: a, rhs: c });
    b.emit(Op::Ret {});
    b.build().unwrap()
}

fn sum_args(_engine: &mut Engine, args: &[Val]) -> VmResult<Val> {
    Ok(Val::Int(args.iter().filter_map(Val::as_int).sum()))
}

fn arena_in_use(engine: &mut Engine, _args: &[Val]) -> VmResult<Val> {
    Ok(Val::Int(engine.allocator_stats().arena_slots_in_use as i32))
}

fn stack_in_use(engine: &mut Engine, _args: &[Val]) -> VmResult<Val> {
    Ok(Val::Int(engine.allocator_stats().stack_slots_in_use as i32))
}

#[test]
fn test_nested_out_arg_reservations() {
    // return add(1, add(2, 3));
    let mut b = FunctionBuilder::new("main");
    let one = b.constant(Val::Int(1));
    let two = b.constant(Val::Int(2));
    let three = b.constant(Val::Int(3));
    let func = b.nested(add_body());
    let f = b.temp(0);
    let inner = b.temp(1);
    b.emit(Op::NewClosure { dst: f, func });
    b.emit(Op::StartCall { argc: 2 });
    b.emit(Op::ArgOut { index: 0, src: one });
    b.emit(Op::StartCall { argc: 2 });
    b.emit(Op::ArgOut { index: 0, src: two });
    b.emit(Op::ArgOut { index: 1, src: three });
    b.emit(Op::Call { dst: inner, callee: f, argc: 2 });
    b.emit(Op::ArgOut { index: 1, src: inner });
    b.emit(Op::Call { dst: 0, callee: f, argc: 2 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    assert_eq!(body.max_out_param_depth, 4);
    assert_eq!(exec(&body, &[]), Val::Int(6));
}

#[test]
fn test_native_call_and_missing_params() {
    // return sum(x, 4) where x is a missing parameter
    let mut b = FunctionBuilder::new("main");
    let four = b.constant(Val::Int(4));
    let sum = b.name("sum");
    b.params(1);
    let x = b.param_reg(0);
    let f = b.temp(0);
    b.emit(Op::LdRoot { dst: f, name: sum });
    b.emit(Op::StartCall { argc: 2 });
    b.emit(Op::ArgOut { index: 0, src: x });
    b.emit(Op::ArgOut { index: 1, src: four });
    b.emit(Op::Call { dst: 0, callee: f, argc: 2 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = Engine::new();
    engine.define_native("sum", sum_args);
    assert_eq!(engine.call_function(&body, &[Val::Int(10)]).unwrap(), Val::Int(14));
    // undefined is not an int and is skipped by the native
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(4));
}

#[test]
fn test_calling_a_non_function_throws_shared_type_error() {
    let mut b = FunctionBuilder::new("main");
    let five = b.constant(Val::Int(5));
    b.emit(Op::StartCall { argc: 0 });
    b.emit(Op::Call { dst: 0, callee: five, argc: 0 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = Engine::new();
    let err = engine.call_function(&body, &[]).unwrap_err();
    match vm_error(&err).exception_value() {
        Some(Val::Error(e)) => {
            assert_eq!(e.kind, ErrorKind::TypeError);
            assert!(e.is_static());
        }
        other => panic!("expected TypeError, got {other:?}"),
    }
}

#[test]
fn test_runaway_recursion_is_a_stack_overflow() {
    // function deep() { return deep(); }
    let mut b = FunctionBuilder::new("deep");
    let name = b.name("deep");
    let f = b.temp(0);
    b.emit(Op::LdRoot { dst: f, name });
    b.emit(Op::StartCall { argc: 0 });
    b.emit(Op::Call { dst: 0, callee: f, argc: 0 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let mut engine = engine_with(|c| c.max_call_depth = 50);
    let deep = engine.instantiate(Arc::clone(&body));
    engine.define_global("deep", deep.clone());
    let err = engine.call(&deep, &[]).unwrap_err();
    assert!(matches!(vm_error(&err), VmError::StackOverflow));
    assert_eq!(engine.context().call_stack_depth(), 0);
    assert_eq!(engine.allocator_stats().stack_slots_in_use, 0);
}

#[test]
fn test_arguments_object_sees_every_argument() {
    let mut b = FunctionBuilder::new("args");
    b.params(1).uses_arguments();
    b.emit(Op::LdArguments { dst: 0 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    match exec(&body, &[Val::Int(1), Val::Int(2), Val::Int(3)]) {
        Val::Array(items) => assert_eq!(items.to_vec(), vec![Val::Int(1), Val::Int(2), Val::Int(3)]),
        other => panic!("expected array, got {other:?}"),
    }
}

fn probing_body(name: &str, temps: u32, probe: &str) -> Arc<FunctionBody> {
    let mut b = FunctionBuilder::new(name);
    let probe = b.name(probe);
    b.temps(temps);
    let f = b.temp(0);
    b.emit(Op::LdRoot { dst: f, name: probe });
    b.emit(Op::StartCall { argc: 0 });
    b.emit(Op::Call { dst: 0, callee: f, argc: 0 });
    b.emit(Op::Ret {});
    b.build().unwrap()
}

#[test]
fn test_oversized_frames_use_the_arena_and_release_it() {
    let mut engine = engine_with(|c| c.locals_threshold = 200);
    engine.define_native("arena_in_use", arena_in_use);
    engine.define_native("stack_in_use", stack_in_use);

    let big = probing_body("big", 400, "arena_in_use");
    let in_use = engine.call_function(&big, &[]).unwrap().as_int().unwrap();
    assert!(in_use > 400, "arena charged {in_use} slots");
    assert_eq!(engine.allocator_stats().arena_slots_in_use, 0);

    let small = probing_body("small", 2, "stack_in_use");
    let in_use = engine.call_function(&small, &[]).unwrap().as_int().unwrap();
    assert!(in_use > 0);
    assert_eq!(engine.allocator_stats().stack_slots_in_use, 0);
}

#[test]
fn test_exhausted_arena_reports_out_of_memory() {
    let mut engine = engine_with(|c| {
        c.locals_threshold = 200;
        c.max_arena_slots = 300;
    });
    engine.define_native("arena_in_use", arena_in_use);
    let big = probing_body("big", 400, "arena_in_use");
    let err = engine.call_function(&big, &[]).unwrap_err();
    assert!(matches!(vm_error(&err), VmError::OutOfMemory));
}
