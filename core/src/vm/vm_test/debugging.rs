use super::*;

/// Hook that moves execution from one offset to another, on a step or at a breakpoint.
struct Redirect {
    from: u32,
    to: u32,
    breakpoints: Mutex<u32>,
}

impl Redirect {
    fn new(from: u32, to: u32) -> Arc<Self> {
        Arc::new(Self {
            from,
            to,
            breakpoints: Mutex::new(0),
        })
    }
}

impl DebugHook for Redirect {
    fn on_step(&self, info: &StepInfo) -> StepAction {
        if info.offset == self.from {
            StepAction::SetNextStatement(self.to)
        } else {
            StepAction::Continue
        }
    }

    fn on_breakpoint(&self, _info: &StepInfo) -> StepAction {
        *self.breakpoints.lock().unwrap() += 1;
        StepAction::SetNextStatement(self.to)
    }
}

struct Statements {
    body: Arc<FunctionBody>,
    second: u32,
    third: u32,
}

/// function pick() { r = 1; r = 2; return r; }
fn three_statements() -> Statements {
    let mut b = FunctionBuilder::new("pick");
    let r = b.temp(0);
    b.statement();
    b.emit(Op::LdInt { dst: r, value: 1 });
    b.statement();
    let second = b.emit(Op::LdInt { dst: r, value: 2 });
    b.statement();
    let third = b.emit(Op::Ld { dst: 0, src: r });
    b.emit(Op::Ret {});
    Statements {
        body: b.build().unwrap(),
        second,
        third,
    }
}

#[test]
fn test_step_hook_sees_every_instruction() {
    let s = three_statements();
    let hook = Arc::new(RecordingHook::default());
    let mut engine = debug_engine(hook.clone());
    assert_eq!(engine.call_function(&s.body, &[]).unwrap(), Val::Int(2));

    let steps = hook.steps();
    let opcodes: Vec<&str> = steps.iter().map(|s| s.opcode).collect();
    assert_eq!(opcodes, ["LdInt", "LdInt", "Ld", "Ret"]);
    assert!(steps.iter().all(|step| &*step.function == "pick"));
    assert!(steps.iter().all(|step| step.function_id == s.body.id));
}

#[test]
fn test_set_next_statement_skips_code() {
    let s = three_statements();
    let mut engine = debug_engine(Redirect::new(s.second, s.third));
    assert_eq!(engine.call_function(&s.body, &[]).unwrap(), Val::Int(1));
}

#[test]
fn test_set_next_statement_requires_a_statement_boundary() {
    let s = three_statements();
    // one past the start of the second statement is mid-instruction
    let mut engine = debug_engine(Redirect::new(s.second, s.second + 1));
    let err = engine.call_function(&s.body, &[]).unwrap_err();
    assert!(vm_error(&err).is_fatal());
    assert_eq!(engine.context().call_stack_depth(), 0);
}

#[test]
fn test_hooks_are_ignored_outside_debug_mode() {
    let s = three_statements();
    let mut engine = Engine::new();
    engine.set_debug_hook(Some(Redirect::new(s.second, s.third)));
    assert_eq!(engine.call_function(&s.body, &[]).unwrap(), Val::Int(2));
}

#[test]
fn test_skip_exception_resumes_at_next_statement() {
    // throw 7; return 3;
    let mut b = FunctionBuilder::new("skip");
    let seven = b.constant(Val::Int(7));
    b.statement();
    let throw_at = b.emit(Op::Throw { src: seven });
    b.statement();
    b.emit(Op::LdInt { dst: 0, value: 3 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let hook = Arc::new(RecordingHook {
        skip_exceptions: true,
        ..RecordingHook::default()
    });
    let mut engine = debug_engine(hook.clone());
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(3));
    let exceptions = hook.exceptions.lock().unwrap().clone();
    assert_eq!(exceptions, vec![(throw_at, Val::Int(7))]);
}

#[test]
fn test_exception_is_reported_once_at_the_raising_frame() {
    // function thrower() { throw 7; }
    let mut b = FunctionBuilder::new("thrower");
    let seven = b.constant(Val::Int(7));
    b.emit(Op::Throw { src: seven });
    let thrower = b.build().unwrap();

    // function main() { try { thrower(); } catch (e) { return e; } }
    let mut b = FunctionBuilder::new("main");
    let name = b.name("thrower");
    let f = b.temp(0);
    let catch = b.label();
    b.emit(Op::TryCatch { catch_target: catch.0 });
    b.emit(Op::LdRoot { dst: f, name });
    b.emit(Op::StartCall { argc: 0 });
    b.emit(Op::Call { dst: f, callee: f, argc: 0 });
    b.emit(Op::Leave { target: catch.0 });
    b.bind(catch);
    b.emit(Op::Catch { dst: 0 });
    b.emit(Op::Ret {});
    let main = b.build().unwrap();

    let hook = Arc::new(RecordingHook::default());
    let mut engine = debug_engine(hook.clone());
    let thrower = engine.instantiate(thrower);
    engine.define_global("thrower", thrower);
    assert_eq!(engine.call_function(&main, &[]).unwrap(), Val::Int(7));

    let exceptions = hook.exceptions.lock().unwrap().clone();
    assert_eq!(exceptions, vec![(0, Val::Int(7))]);
}

#[test]
fn test_end_of_block_returns_undefined_when_debugging() {
    // return 5; <end of block>
    let mut b = FunctionBuilder::new("tail");
    b.statement();
    b.emit(Op::LdInt { dst: 0, value: 5 });
    b.statement();
    let ret = b.emit(Op::Ret {});
    b.statement();
    let end = b.emit(Op::EndOfBlock {});
    let body = b.build().unwrap();

    let mut engine = debug_engine(Redirect::new(ret, end));
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Undefined);

    // reaching it without a debugger is a corrupt function
    let mut b = FunctionBuilder::new("no_return");
    b.emit(Op::LdInt { dst: 0, value: 5 });
    b.emit(Op::EndOfBlock {});
    let err = Engine::new().call_function(&b.build().unwrap(), &[]).unwrap_err();
    assert!(vm_error(&err).is_fatal());
}

#[test]
fn test_breakpoint_can_move_execution() {
    // debugger; return 1; return 2;
    let mut b = FunctionBuilder::new("paused");
    b.statement();
    b.emit(Op::Break {});
    b.emit(Op::LdInt { dst: 0, value: 1 });
    b.emit(Op::Ret {});
    b.statement();
    let second = b.emit(Op::LdInt { dst: 0, value: 2 });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let hook = Redirect::new(u32::MAX, second);
    let mut engine = debug_engine(hook.clone());
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(2));
    assert_eq!(*hook.breakpoints.lock().unwrap(), 1);

    // without a debugger the breakpoint is a no-op
    assert_eq!(exec(&body, &[]), Val::Int(1));
}

#[test]
fn test_step_depths_track_handler_regions() {
    // try { r = 1; } finally { r = 2; }
    let mut b = FunctionBuilder::new("depths");
    let r = b.temp(0);
    let fin = b.label();
    let after = b.label();
    b.emit(Op::TryFinally { finally_target: fin.0 });
    let in_try = b.emit(Op::LdInt { dst: r, value: 1 });
    b.emit(Op::Leave { target: after.0 });
    b.bind(fin);
    let in_finally = b.emit(Op::LdInt { dst: r, value: 2 });
    b.emit(Op::LeaveNull {});
    b.bind(after);
    let outside = b.emit(Op::Ld { dst: 0, src: r });
    b.emit(Op::Ret {});
    let body = b.build().unwrap();

    let hook = Arc::new(RecordingHook::default());
    let mut engine = debug_engine(hook.clone());
    assert_eq!(engine.call_function(&body, &[]).unwrap(), Val::Int(2));

    let at = |offset| {
        let step = hook.step_at(offset).unwrap();
        (step.try_depth, step.finally_depth)
    };
    assert_eq!(at(in_try), (1, 0));
    assert_eq!(at(in_finally), (0, 1));
    assert_eq!(at(outside), (0, 0));
    assert!(hook.step_at(in_finally).unwrap().flags.contains(FrameFlags::WITHIN_FINALLY));
}
