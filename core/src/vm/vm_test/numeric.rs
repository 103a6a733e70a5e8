use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::*;
use crate::vm::Simd128;

fn i32_binary(name: &str, op: impl FnOnce(u32, u32, u32) -> NumOp) -> Arc<FunctionBody> {
    let mut b = FunctionBuilder::new(name);
    b.numeric(NumericLayout {
        i32_slots: 3,
        params: vec![NumType::I32, NumType::I32],
        ret: NumType::I32,
        ..NumericLayout::default()
    });
    b.emit_num(op(2, 0, 1));
    b.emit_num(NumOp::RetI32 { src: 2 });
    b.build().unwrap()
}

#[test]
fn test_integer_arithmetic_wraps_and_coerces_arguments() {
    let add = i32_binary("add", |dst, lhs, rhs| NumOp::AddI32 { dst, lhs, rhs });
    assert_eq!(exec(&add, &[Val::Int(i32::MAX), Val::Int(1)]), Val::Int(i32::MIN));
    // script values are truncated into the declared parameter type
    assert_eq!(exec(&add, &[Val::Float(3.7), Val::Int(4)]), Val::Int(7));
    // missing arguments read as undefined, which is zero here
    assert_eq!(exec(&add, &[Val::Int(9)]), Val::Int(9));
}

#[test]
fn test_integer_division_by_zero_is_zero() {
    let div = i32_binary("div", |dst, lhs, rhs| NumOp::DivI32 { dst, lhs, rhs });
    let rem = i32_binary("rem", |dst, lhs, rhs| NumOp::RemI32 { dst, lhs, rhs });
    assert_eq!(exec(&div, &[Val::Int(7), Val::Int(2)]), Val::Int(3));
    assert_eq!(exec(&div, &[Val::Int(7), Val::Int(0)]), Val::Int(0));
    assert_eq!(exec(&div, &[Val::Int(i32::MIN), Val::Int(-1)]), Val::Int(i32::MIN));
    assert_eq!(exec(&rem, &[Val::Int(7), Val::Int(0)]), Val::Int(0));
    assert_eq!(exec(&rem, &[Val::Int(-7), Val::Int(3)]), Val::Int(-1));
}

/// function half_sum(n: i32): f64 { let s = 0; for (let i = 0; i < n; i++) s += i; return s * 0.5; }
fn half_sum() -> Arc<FunctionBody> {
    let (zero, one, n, i, sum, c) = (0, 1, 2, 3, 4, 5);
    let (half, out) = (0, 1);
    let mut b = FunctionBuilder::new("half_sum");
    b.numeric(NumericLayout {
        i32_slots: 6,
        f64_slots: 2,
        consts: NumericConsts {
            i32: vec![0, 1],
            f64: vec![0.5],
            ..NumericConsts::default()
        },
        params: vec![NumType::I32],
        ret: NumType::F64,
        ..NumericLayout::default()
    });
    let top = b.label();
    let exit = b.label();
    b.emit_num(NumOp::MovI32 { dst: i, src: zero });
    b.emit_num(NumOp::MovI32 { dst: sum, src: zero });
    let loop_num = b.begin_loop(false, false);
    b.bind(top);
    b.emit_num(NumOp::LoopBodyStart { loop_num });
    b.emit_num(NumOp::LtI32 { dst: c, lhs: i, rhs: n });
    b.emit_num(NumOp::BrFalseI32 { src: c, target: exit.0 });
    b.emit_num(NumOp::AddI32 { dst: sum, lhs: sum, rhs: i });
    b.emit_num(NumOp::AddI32 { dst: i, lhs: i, rhs: one });
    b.emit_num(NumOp::Br { target: top.0 });
    b.bind(exit);
    b.end_loop(loop_num);
    b.emit_num(NumOp::I32ToF64 { dst: out, src: sum });
    b.emit_num(NumOp::MulF64 { dst: out, lhs: out, rhs: half });
    b.emit_num(NumOp::RetF64 { src: out });
    b.build().unwrap()
}

#[test]
fn test_typed_loop_counts_iterations_and_boxes_the_result() {
    let body = half_sum();
    let mut engine = Engine::new();
    assert_eq!(engine.call_function(&body, &[Val::Int(4)]).unwrap(), Val::Int(3));
    // four iterations plus the failing test
    assert_eq!(body.loops[0].interpret_count(), 5);
    assert_eq!(engine.call_function(&body, &[Val::Int(3)]).unwrap(), Val::Float(1.5));
}

/// Native `half_sum` loop over the typed slots: one iteration then a bailout to the loop top
/// on the first entry, the rest of the loop on later entries.
struct NativeHalfSum {
    loop_start: u32,
    bailed: AtomicBool,
    runs: AtomicUsize,
}

impl NativeLoopBody for NativeHalfSum {
    fn execute(&self, frame: &mut LoopBodyFrame<'_>, _engine: &mut Engine) -> VmResult<u32> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let slots = frame.numeric()?;
        let n = slots.i32(2)?;
        let mut i = slots.i32(3)?;
        let mut sum = slots.i32(4)?;
        let bail = !self.bailed.swap(true, Ordering::SeqCst);
        while i < n {
            sum += i;
            i += 1;
            if bail {
                break;
            }
        }
        slots.set_i32(3, i)?;
        slots.set_i32(4, sum)?;
        Ok(if bail { self.loop_start } else { 0 })
    }
}

#[derive(Default)]
struct HalfSumBackend {
    compiles: AtomicUsize,
    native: Mutex<Option<Arc<NativeHalfSum>>>,
}

impl OptimizingBackend for HalfSumBackend {
    fn compile_loop_body(&self, body: &FunctionBody, loop_num: u32) -> Option<Arc<dyn NativeLoopBody>> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let native = Arc::new(NativeHalfSum {
            loop_start: body.loops[loop_num as usize].start,
            bailed: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        });
        *self.native.lock().unwrap() = Some(Arc::clone(&native));
        Some(native)
    }
}

#[test]
fn test_hot_typed_loop_runs_natively() {
    let body = half_sum();
    let backend = Arc::new(HalfSumBackend::default());
    let mut engine = engine_with(|c| c.loop_jit_threshold = 10);
    engine.set_backend(Some(backend.clone()));

    // sum of 0..100 is 4950
    assert_eq!(engine.call_function(&body, &[Val::Int(100)]).unwrap(), Val::Int(2475));
    assert_eq!(backend.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(body.loops[0].interpret_count(), 11);
    let native = backend.native.lock().unwrap().clone().unwrap();
    // the bailout resumes at the loop top, which re-enters native code
    assert_eq!(native.runs.load(Ordering::SeqCst), 2);

    assert_eq!(engine.call_function(&body, &[Val::Int(4)]).unwrap(), Val::Int(3));
    assert_eq!(native.runs.load(Ordering::SeqCst), 3);
    assert_eq!(body.loops[0].interpret_count(), 11);
}

#[test]
fn test_typed_loops_stay_interpreted_with_the_jit_disabled() {
    let body = half_sum();
    let backend = Arc::new(HalfSumBackend::default());
    let mut engine = engine_with(|c| {
        c.loop_jit_threshold = 10;
        c.loop_jit_enabled = false;
    });
    engine.set_backend(Some(backend.clone()));
    assert_eq!(engine.call_function(&body, &[Val::Int(100)]).unwrap(), Val::Int(2475));
    assert_eq!(backend.compiles.load(Ordering::SeqCst), 0);
    assert_eq!(body.loops[0].interpret_count(), 101);
}

#[test]
fn test_script_code_calls_into_numeric_functions() {
    // function main() { return half_sum(5); }
    let mut b = FunctionBuilder::new("main");
    let five = b.constant(Val::Int(5));
    let name = b.name("half_sum");
    let f = b.temp(0);
    b.emit(Op::LdRoot { dst: f, name });
    b.emit(Op::StartCall { argc: 1 });
    b.emit(Op::ArgOut { index: 0, src: five });
    b.emit(Op::Call { dst: 0, callee: f, argc: 1 });
    b.emit(Op::Ret {});
    let main = b.build().unwrap();

    let mut engine = Engine::new();
    let callee = engine.instantiate(half_sum());
    engine.define_global("half_sum", callee);
    assert_eq!(engine.call_function(&main, &[]).unwrap(), Val::Int(5));
    assert_eq!(engine.context().call_stack_depth(), 0);
}

#[test]
fn test_vector_lanes() {
    // i32x4: splat(1) + splat(2), lane 2
    let mut b = FunctionBuilder::new("lanes");
    b.numeric(NumericLayout {
        i32_slots: 3,
        simd_slots: 2,
        consts: NumericConsts {
            i32: vec![1, 2],
            ..NumericConsts::default()
        },
        ret: NumType::I32,
        ..NumericLayout::default()
    });
    b.emit_num(NumOp::I32x4Splat { dst: 0, src: 0 });
    b.emit_num(NumOp::I32x4Splat { dst: 1, src: 1 });
    b.emit_num(NumOp::I32x4Add { dst: 0, lhs: 0, rhs: 1 });
    b.emit_num(NumOp::I32x4ExtractLane { dst: 2, src: 0, lane: 2 });
    b.emit_num(NumOp::RetI32 { src: 2 });
    assert_eq!(exec(&b.build().unwrap(), &[]), Val::Int(3));

    // f32x4: v * v with a constant vector, lane 3
    let mut b = FunctionBuilder::new("squares");
    b.numeric(NumericLayout {
        f32_slots: 1,
        simd_slots: 1,
        consts: NumericConsts {
            simd: vec![Simd128::from_f32x4([0.0, 1.0, 2.0, 1.5])],
            ..NumericConsts::default()
        },
        ret: NumType::F32,
        ..NumericLayout::default()
    });
    b.emit_num(NumOp::F32x4Mul { dst: 0, lhs: 0, rhs: 0 });
    b.emit_num(NumOp::F32x4ExtractLane { dst: 0, src: 0, lane: 3 });
    b.emit_num(NumOp::RetF32 { src: 0 });
    assert_eq!(exec(&b.build().unwrap(), &[]), Val::Float(2.25));
}

#[test]
fn test_float_to_int_conversion_saturates() {
    let mut b = FunctionBuilder::new("trunc");
    b.numeric(NumericLayout {
        i32_slots: 1,
        f64_slots: 1,
        params: vec![NumType::F64],
        ret: NumType::I32,
        ..NumericLayout::default()
    });
    b.emit_num(NumOp::F64ToI32 { dst: 0, src: 0 });
    b.emit_num(NumOp::RetI32 { src: 0 });
    let body = b.build().unwrap();
    assert_eq!(exec(&body, &[Val::Float(-2.9)]), Val::Int(-2));
    assert_eq!(exec(&body, &[Val::Float(1e20)]), Val::Int(i32::MAX));
    assert_eq!(exec(&body, &[Val::Float(f64::NAN)]), Val::Int(0));
}

#[test]
fn test_numeric_faults() {
    let mut engine = Engine::new();

    // bad lane index
    let mut b = FunctionBuilder::new("bad_lane");
    b.numeric(NumericLayout {
        i32_slots: 1,
        simd_slots: 1,
        ret: NumType::I32,
        ..NumericLayout::default()
    });
    b.emit_num(NumOp::I32x4ExtractLane { dst: 0, src: 0, lane: 4 });
    b.emit_num(NumOp::RetI32 { src: 0 });
    let err = engine.call_function(&b.build().unwrap(), &[]).unwrap_err();
    assert!(vm_error(&err).is_fatal());

    // slot outside its namespace
    let mut b = FunctionBuilder::new("bad_slot");
    b.numeric(NumericLayout {
        i32_slots: 1,
        ret: NumType::I32,
        ..NumericLayout::default()
    });
    b.emit_num(NumOp::RetI32 { src: 1 });
    let err = engine.call_function(&b.build().unwrap(), &[]).unwrap_err();
    assert!(vm_error(&err).is_fatal());

    // no return
    let mut b = FunctionBuilder::new("falls_off");
    b.numeric(NumericLayout::default());
    b.emit_num(NumOp::EndOfBlock {});
    let err = engine.call_function(&b.build().unwrap(), &[]).unwrap_err();
    assert!(vm_error(&err).is_fatal());

    // vectors cannot cross from script code
    let mut b = FunctionBuilder::new("takes_vector");
    b.numeric(NumericLayout {
        simd_slots: 1,
        params: vec![NumType::Simd],
        ..NumericLayout::default()
    });
    b.emit_num(NumOp::RetVoid {});
    let err = engine.call_function(&b.build().unwrap(), &[Val::Int(1)]).unwrap_err();
    match vm_error(&err).exception_value() {
        Some(Val::Error(e)) => assert_eq!(e.kind, ErrorKind::TypeError),
        other => panic!("expected TypeError, got {other:?}"),
    }
    assert_eq!(engine.context().call_stack_depth(), 0);
}
