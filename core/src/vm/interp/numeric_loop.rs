//! Dispatch loop of the numeric dialect.
//!
//! Registers live in typed namespaces; the opcode decides which one each operand addresses.
//! Integer division and remainder by zero produce zero, integer arithmetic wraps, and float to
//! integer conversion saturates. Numeric code never calls out, so there is no profiling or
//! debugging variant. Hot loops go to native code through the same protocol as script loops.

use std::sync::Arc;

use super::loop_jit::numeric_loop_body_start;
use crate::error::{VmResult, fatal};
use crate::val::ops;
use crate::val::{ScriptClosure, Val};
use crate::vm::bytecode::NumOp;
use crate::vm::encoding::decode_at;
use crate::vm::engine::Engine;
use crate::vm::frame::{Activation, ActivationInit, new_activation};
use crate::vm::guards::{DepthGuard, ImplicitCallGuard};
use crate::vm::numeric::{NumType, NumValue, NumericSlots, Simd128};

macro_rules! bin {
    ($slots:ident, $get:ident, $set:ident, $dst:expr, $lhs:expr, $rhs:expr, |$a:ident, $b:ident| $e:expr) => {{
        let $a = $slots.$get($lhs)?;
        let $b = $slots.$get($rhs)?;
        $slots.$set($dst, $e)?;
    }};
}

macro_rules! cmp {
    ($slots:ident, $get:ident, $dst:expr, $lhs:expr, $rhs:expr, $op:tt) => {{
        let a = $slots.$get($lhs)?;
        let b = $slots.$get($rhs)?;
        $slots.set_i32($dst, i32::from(a $op b))?;
    }};
}

macro_rules! conv {
    ($slots:ident, $get:ident, $set:ident, $dst:expr, $src:expr, |$v:ident| $e:expr) => {{
        let $v = $slots.$get($src)?;
        $slots.$set($dst, $e)?;
    }};
}

/// Entry from script code: coerce arguments to the declared parameter types, run, and box
/// the typed result.
pub(crate) fn call(engine: &mut Engine, closure: &Arc<ScriptClosure>, args: &[Val]) -> VmResult<Val> {
    let body = Arc::clone(&closure.body);
    let layout = body
        .numeric
        .as_ref()
        .ok_or_else(|| fatal(format!("numeric function '{}' has no typed layout", body.name)))?;

    let mut engine = DepthGuard::call(engine, &body.name)?;
    let mut frame = new_activation(&engine, ActivationInit::for_closure(closure), &[])?;
    for idx in 0..layout.params.len() {
        let (ty, slot) = layout
            .param_slot(idx)
            .ok_or_else(|| fatal(format!("parameter {idx} of '{}' has no typed slot", body.name)))?;
        let arg = args.get(idx).cloned().unwrap_or_default();
        let value = {
            let mut scope = ImplicitCallGuard::new(&mut engine);
            coerce_arg(&mut scope, ty, &arg)?
        };
        frame.numeric_mut()?.store(ty, slot, value)?;
    }

    let result = run(&mut engine, &mut frame)?;
    Ok(box_result(result))
}

fn coerce_arg(engine: &mut Engine, ty: NumType, arg: &Val) -> VmResult<NumValue> {
    Ok(match ty {
        NumType::I32 => NumValue::I32(ops::to_int32(engine, arg)?),
        NumType::I64 => NumValue::I64(ops::to_number(engine, arg)? as i64),
        NumType::F32 => NumValue::F32(ops::to_number(engine, arg)? as f32),
        NumType::F64 => NumValue::F64(ops::to_number(engine, arg)?),
        NumType::Simd => return Err(engine.ctx.type_error("vector parameters cannot be passed from script code")),
        NumType::Void => return Err(fatal("void parameter type")),
    })
}

fn box_result(value: NumValue) -> Val {
    match value {
        NumValue::Void => Val::Undefined,
        NumValue::I32(v) => Val::Int(v),
        NumValue::I64(v) => Val::number(v as f64),
        NumValue::F32(v) => Val::number(f64::from(v)),
        NumValue::F64(v) => Val::number(v),
        NumValue::Simd(v) => Val::array(v.i32x4().into_iter().map(Val::Int).collect()),
    }
}

fn lane(lane: u32) -> VmResult<usize> {
    if lane < 4 {
        Ok(lane as usize)
    } else {
        Err(fatal(format!("vector lane {lane} out of range")))
    }
}

/// Run a numeric activation until it returns.
pub(crate) fn run(engine: &mut Engine, frame: &mut Activation) -> VmResult<NumValue> {
    let body = Arc::clone(&frame.body);
    let code = body.code.as_slice();
    loop {
        if let Some(budget) = engine.ctx.exhaustion.as_mut() {
            if budget.remaining == 0 {
                return Err(budget.error.clone());
            }
            budget.remaining -= 1;
        }

        let offset = frame.ip;
        if offset as usize >= code.len() {
            return Err(fatal(format!(
                "execution ran off the end of numeric function '{}'",
                body.name
            )));
        }
        let op: NumOp = decode_at(code, &mut frame.ip)?;
        let s: &mut NumericSlots = frame
            .numeric
            .as_mut()
            .ok_or_else(|| fatal(format!("'{}' has no numeric slots", body.name)))?;
        match op {
            NumOp::RetVoid {} => return Ok(NumValue::Void),
            NumOp::RetI32 { src } => return Ok(NumValue::I32(s.i32(src)?)),
            NumOp::RetI64 { src } => return Ok(NumValue::I64(s.i64(src)?)),
            NumOp::RetF32 { src } => return Ok(NumValue::F32(s.f32(src)?)),
            NumOp::RetF64 { src } => return Ok(NumValue::F64(s.f64(src)?)),
            NumOp::RetSimd { src } => return Ok(NumValue::Simd(s.simd(src)?)),

            NumOp::LdI32 { dst, value } => s.set_i32(dst, value)?,
            NumOp::MovI32 { dst, src } => conv!(s, i32, set_i32, dst, src, |v| v),
            NumOp::MovI64 { dst, src } => conv!(s, i64, set_i64, dst, src, |v| v),
            NumOp::MovF32 { dst, src } => conv!(s, f32, set_f32, dst, src, |v| v),
            NumOp::MovF64 { dst, src } => conv!(s, f64, set_f64, dst, src, |v| v),
            NumOp::MovSimd { dst, src } => conv!(s, simd, set_simd, dst, src, |v| v),

            NumOp::AddI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a.wrapping_add(b)),
            NumOp::SubI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a.wrapping_sub(b)),
            NumOp::MulI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a.wrapping_mul(b)),
            NumOp::DivI32 { dst, lhs, rhs } => {
                bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| if b == 0 { 0 } else { a.wrapping_div(b) })
            }
            NumOp::RemI32 { dst, lhs, rhs } => {
                bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| if b == 0 { 0 } else { a.wrapping_rem(b) })
            }
            NumOp::AndI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a & b),
            NumOp::OrI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a | b),
            NumOp::XorI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a ^ b),
            NumOp::ShlI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a.wrapping_shl(b as u32)),
            NumOp::ShrI32 { dst, lhs, rhs } => bin!(s, i32, set_i32, dst, lhs, rhs, |a, b| a.wrapping_shr(b as u32)),

            NumOp::AddI64 { dst, lhs, rhs } => bin!(s, i64, set_i64, dst, lhs, rhs, |a, b| a.wrapping_add(b)),
            NumOp::SubI64 { dst, lhs, rhs } => bin!(s, i64, set_i64, dst, lhs, rhs, |a, b| a.wrapping_sub(b)),
            NumOp::MulI64 { dst, lhs, rhs } => bin!(s, i64, set_i64, dst, lhs, rhs, |a, b| a.wrapping_mul(b)),
            NumOp::DivI64 { dst, lhs, rhs } => {
                bin!(s, i64, set_i64, dst, lhs, rhs, |a, b| if b == 0 { 0 } else { a.wrapping_div(b) })
            }

            NumOp::AddF32 { dst, lhs, rhs } => bin!(s, f32, set_f32, dst, lhs, rhs, |a, b| a + b),
            NumOp::SubF32 { dst, lhs, rhs } => bin!(s, f32, set_f32, dst, lhs, rhs, |a, b| a - b),
            NumOp::MulF32 { dst, lhs, rhs } => bin!(s, f32, set_f32, dst, lhs, rhs, |a, b| a * b),
            NumOp::DivF32 { dst, lhs, rhs } => bin!(s, f32, set_f32, dst, lhs, rhs, |a, b| a / b),
            NumOp::AddF64 { dst, lhs, rhs } => bin!(s, f64, set_f64, dst, lhs, rhs, |a, b| a + b),
            NumOp::SubF64 { dst, lhs, rhs } => bin!(s, f64, set_f64, dst, lhs, rhs, |a, b| a - b),
            NumOp::MulF64 { dst, lhs, rhs } => bin!(s, f64, set_f64, dst, lhs, rhs, |a, b| a * b),
            NumOp::DivF64 { dst, lhs, rhs } => bin!(s, f64, set_f64, dst, lhs, rhs, |a, b| a / b),

            NumOp::LtI32 { dst, lhs, rhs } => cmp!(s, i32, dst, lhs, rhs, <),
            NumOp::LeI32 { dst, lhs, rhs } => cmp!(s, i32, dst, lhs, rhs, <=),
            NumOp::EqI32 { dst, lhs, rhs } => cmp!(s, i32, dst, lhs, rhs, ==),
            NumOp::LtF64 { dst, lhs, rhs } => cmp!(s, f64, dst, lhs, rhs, <),
            NumOp::LeF64 { dst, lhs, rhs } => cmp!(s, f64, dst, lhs, rhs, <=),
            NumOp::EqF64 { dst, lhs, rhs } => cmp!(s, f64, dst, lhs, rhs, ==),

            NumOp::I32ToF64 { dst, src } => conv!(s, i32, set_f64, dst, src, |v| f64::from(v)),
            NumOp::F64ToI32 { dst, src } => conv!(s, f64, set_i32, dst, src, |v| v as i32),
            NumOp::I32ToI64 { dst, src } => conv!(s, i32, set_i64, dst, src, |v| i64::from(v)),
            NumOp::I64ToI32 { dst, src } => conv!(s, i64, set_i32, dst, src, |v| v as i32),
            NumOp::I64ToF64 { dst, src } => conv!(s, i64, set_f64, dst, src, |v| v as f64),
            NumOp::F32ToF64 { dst, src } => conv!(s, f32, set_f64, dst, src, |v| f64::from(v)),
            NumOp::F64ToF32 { dst, src } => conv!(s, f64, set_f32, dst, src, |v| v as f32),

            NumOp::Br { target } => frame.ip = target,
            NumOp::BrTrueI32 { src, target } => {
                if s.i32(src)? != 0 {
                    frame.ip = target;
                }
            }
            NumOp::BrFalseI32 { src, target } => {
                if s.i32(src)? == 0 {
                    frame.ip = target;
                }
            }
            NumOp::LoopBodyStart { loop_num } => numeric_loop_body_start(engine, frame, &body, loop_num)?,

            NumOp::I32x4Splat { dst, src } => conv!(s, i32, set_simd, dst, src, |v| Simd128::from_i32x4([v; 4])),
            NumOp::I32x4Add { dst, lhs, rhs } => bin!(s, simd, set_simd, dst, lhs, rhs, |a, b| a.i32x4_add(b)),
            NumOp::I32x4ExtractLane { dst, src, lane: idx } => {
                let lanes = s.simd(src)?.i32x4();
                s.set_i32(dst, lanes[lane(idx)?])?;
            }
            NumOp::F32x4Splat { dst, src } => conv!(s, f32, set_simd, dst, src, |v| Simd128::from_f32x4([v; 4])),
            NumOp::F32x4Add { dst, lhs, rhs } => bin!(s, simd, set_simd, dst, lhs, rhs, |a, b| a.f32x4_add(b)),
            NumOp::F32x4Mul { dst, lhs, rhs } => bin!(s, simd, set_simd, dst, lhs, rhs, |a, b| a.f32x4_mul(b)),
            NumOp::F32x4ExtractLane { dst, src, lane: idx } => {
                let lanes = s.simd(src)?.f32x4();
                s.set_f32(dst, lanes[lane(idx)?])?;
            }

            NumOp::EndOfBlock {} => {
                return Err(fatal(format!(
                    "execution reached the end of numeric function '{}' at {offset}",
                    body.name
                )));
            }
        }
    }
}
