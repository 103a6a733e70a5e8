//! Operators, conversions, and property access used by the dispatch loop.
//!
//! Anything here may run user code (getters, setters, `valueOf`). Callers in the dispatch loop
//! wrap these calls in an implicit-call scope; the subsystem records what it ran through
//! [`ImplicitCallFlags`].

use std::sync::Arc;

use super::{Property, Val};
use crate::error::VmResult;
use crate::vm::{Engine, ImplicitCallFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

pub fn to_boolean(v: &Val) -> bool {
    match v {
        Val::Undefined | Val::Null => false,
        Val::Bool(b) => *b,
        Val::Int(i) => *i != 0,
        Val::Float(x) => !(*x == 0.0 || x.is_nan()),
        Val::Str(s) => !s.is_empty(),
        _ => true,
    }
}

/// Result of the `typeof` operator.
pub fn type_of(v: &Val) -> &'static str {
    match v {
        Val::Undefined => "undefined",
        Val::Bool(_) => "boolean",
        Val::Int(_) | Val::Float(_) => "number",
        Val::Str(_) => "string",
        Val::Closure(_) | Val::Native(_) => "function",
        Val::Null | Val::Array(_) | Val::Object(_) | Val::Error(_) | Val::Generator(_) => "object",
    }
}

fn is_primitive(v: &Val) -> bool {
    matches!(
        v,
        Val::Undefined | Val::Null | Val::Bool(_) | Val::Int(_) | Val::Float(_) | Val::Str(_)
    )
}

/// Run a getter, setter, or `valueOf` on behalf of a conversion.
fn implicit_call(engine: &mut Engine, flags: ImplicitCallFlags, target: &Val, args: &[Val]) -> VmResult<Val> {
    let mut flags = flags;
    if matches!(target, Val::Native(_)) {
        flags.insert(ImplicitCallFlags::NATIVE);
    }
    engine.ctx.note_implicit_call(flags);
    engine.invoke(target, args)
}

/// Objects with a callable `valueOf` convert through it; everything else is returned as is.
pub fn to_primitive(engine: &mut Engine, v: &Val) -> VmResult<Val> {
    let Val::Object(obj) = v else {
        return Ok(v.clone());
    };
    let value_of = match obj.get_own("valueOf") {
        Some(Property::Data(f)) if f.is_callable() => f,
        _ => return Ok(v.clone()),
    };
    let result = implicit_call(engine, ImplicitCallFlags::TO_PRIMITIVE, &value_of, &[])?;
    if is_primitive(&result) {
        Ok(result)
    } else {
        Err(engine.ctx.type_error("valueOf did not return a primitive"))
    }
}

fn parse_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

pub fn to_number(engine: &mut Engine, v: &Val) -> VmResult<f64> {
    Ok(match v {
        Val::Undefined => f64::NAN,
        Val::Null => 0.0,
        Val::Bool(b) => f64::from(u8::from(*b)),
        Val::Int(i) => f64::from(*i),
        Val::Float(x) => *x,
        Val::Str(s) => parse_number(s),
        Val::Object(_) => {
            let prim = to_primitive(engine, v)?;
            match prim {
                Val::Object(_) => f64::NAN,
                other => to_number(engine, &other)?,
            }
        }
        Val::Array(a) => match a.len() {
            0 => 0.0,
            1 => {
                let only = a.get(0).unwrap_or_default();
                to_number(engine, &only)?
            }
            _ => f64::NAN,
        },
        Val::Closure(_) | Val::Native(_) | Val::Error(_) | Val::Generator(_) => f64::NAN,
    })
}

/// Wrap a number into `i32` modulo 2^32; NaN and infinities become 0.
pub fn wrap_i32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let m = n.trunc().rem_euclid(4_294_967_296.0);
    (m as u64 as u32) as i32
}

pub fn to_int32(engine: &mut Engine, v: &Val) -> VmResult<i32> {
    match v {
        Val::Int(i) => Ok(*i),
        other => Ok(wrap_i32(to_number(engine, other)?)),
    }
}

pub fn to_display_string(engine: &mut Engine, v: &Val) -> VmResult<Arc<str>> {
    match v {
        Val::Str(s) => Ok(Arc::clone(s)),
        Val::Object(_) => {
            let prim = to_primitive(engine, v)?;
            Ok(Arc::from(prim.to_string()))
        }
        other => Ok(Arc::from(other.to_string())),
    }
}

/// `+`: string concatenation when either primitive side is a string, numeric addition otherwise.
pub fn add(engine: &mut Engine, a: &Val, b: &Val) -> VmResult<Val> {
    if let (Val::Int(x), Val::Int(y)) = (a, b) {
        return Ok(match x.checked_add(*y) {
            Some(sum) => Val::Int(sum),
            None => Val::Float(f64::from(*x) + f64::from(*y)),
        });
    }
    let lhs = to_primitive(engine, a)?;
    let rhs = to_primitive(engine, b)?;
    if matches!(lhs, Val::Str(_)) || matches!(rhs, Val::Str(_)) {
        let mut out = to_display_string(engine, &lhs)?.to_string();
        out.push_str(&to_display_string(engine, &rhs)?);
        return Ok(Val::Str(Arc::from(out)));
    }
    let x = to_number(engine, &lhs)?;
    let y = to_number(engine, &rhs)?;
    Ok(Val::number(x + y))
}

pub fn arith(engine: &mut Engine, op: ArithOp, a: &Val, b: &Val) -> VmResult<Val> {
    if let (Val::Int(x), Val::Int(y)) = (a, b) {
        let fast = match op {
            ArithOp::Sub => x.checked_sub(*y),
            ArithOp::Mul => x.checked_mul(*y).filter(|&p| p != 0 || (*x >= 0 && *y >= 0)),
            ArithOp::Div | ArithOp::Rem => None,
        };
        if let Some(v) = fast {
            return Ok(Val::Int(v));
        }
    }
    let x = to_number(engine, a)?;
    let y = to_number(engine, b)?;
    Ok(Val::number(match op {
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Rem => x % y,
    }))
}

pub fn increment(engine: &mut Engine, v: &Val, delta: i32) -> VmResult<Val> {
    if let Val::Int(i) = v
        && let Some(next) = i.checked_add(delta)
    {
        return Ok(Val::Int(next));
    }
    let n = to_number(engine, v)?;
    Ok(Val::number(n + f64::from(delta)))
}

pub fn negate(engine: &mut Engine, v: &Val) -> VmResult<Val> {
    if let Val::Int(i) = v
        && *i != 0
        && let Some(neg) = i.checked_neg()
    {
        return Ok(Val::Int(neg));
    }
    let n = to_number(engine, v)?;
    Ok(Val::number(-n))
}

fn number_of(v: &Val) -> Option<f64> {
    match v {
        Val::Int(i) => Some(f64::from(*i)),
        Val::Float(x) => Some(*x),
        _ => None,
    }
}

/// `===`: numbers by value (NaN unequal to itself), strings by content, heap values by identity.
pub fn strict_equals(a: &Val, b: &Val) -> bool {
    match (number_of(a), number_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

pub fn loose_equals(engine: &mut Engine, a: &Val, b: &Val) -> VmResult<bool> {
    match (a, b) {
        (Val::Undefined | Val::Null, Val::Undefined | Val::Null) => Ok(true),
        (Val::Undefined | Val::Null, _) | (_, Val::Undefined | Val::Null) => Ok(false),
        _ if is_primitive(a) && is_primitive(b) => {
            if std::mem::discriminant(a) == std::mem::discriminant(b)
                || (number_of(a).is_some() && number_of(b).is_some())
            {
                return Ok(strict_equals(a, b));
            }
            Ok(to_number(engine, a)? == to_number(engine, b)?)
        }
        (Val::Object(_), _) if is_primitive(b) => {
            let prim = to_primitive(engine, a)?;
            if is_primitive(&prim) { loose_equals(engine, &prim, b) } else { Ok(false) }
        }
        (_, Val::Object(_)) if is_primitive(a) => {
            let prim = to_primitive(engine, b)?;
            if is_primitive(&prim) { loose_equals(engine, a, &prim) } else { Ok(false) }
        }
        _ => Ok(strict_equals(a, b)),
    }
}

pub fn compare(engine: &mut Engine, op: CompareOp, a: &Val, b: &Val) -> VmResult<bool> {
    if let (Val::Int(x), Val::Int(y)) = (a, b) {
        return Ok(match op {
            CompareOp::Lt => x < y,
            CompareOp::Le => x <= y,
            CompareOp::Gt => x > y,
            CompareOp::Ge => x >= y,
        });
    }
    let lhs = to_primitive(engine, a)?;
    let rhs = to_primitive(engine, b)?;
    if let (Val::Str(x), Val::Str(y)) = (&lhs, &rhs) {
        return Ok(match op {
            CompareOp::Lt => x < y,
            CompareOp::Le => x <= y,
            CompareOp::Gt => x > y,
            CompareOp::Ge => x >= y,
        });
    }
    let x = to_number(engine, &lhs)?;
    let y = to_number(engine, &rhs)?;
    // NaN compares false on every operator
    Ok(match op {
        CompareOp::Lt => x < y,
        CompareOp::Le => x <= y,
        CompareOp::Gt => x > y,
        CompareOp::Ge => x >= y,
    })
}

pub fn get_property(engine: &mut Engine, obj: &Val, name: &str) -> VmResult<Val> {
    match obj {
        Val::Undefined | Val::Null => Err(engine.ctx.throw_static(&engine.ctx.library.nullish_access)),
        Val::Object(o) => match o.get_own(name) {
            Some(Property::Data(v)) => Ok(v),
            Some(Property::Accessor { getter, .. }) if getter.is_callable() => {
                implicit_call(engine, ImplicitCallFlags::ACCESSOR, &getter, &[])
            }
            Some(Property::Accessor { .. }) | None => Ok(Val::Undefined),
        },
        Val::Array(a) if name == "length" => Ok(Val::number(a.len() as f64)),
        Val::Str(s) if name == "length" => Ok(Val::number(s.chars().count() as f64)),
        Val::Error(e) => Ok(match name {
            "message" => Val::Str(Arc::clone(&e.message)),
            "name" => Val::str(e.kind.as_str()),
            _ => Val::Undefined,
        }),
        Val::Closure(c) => Ok(match name {
            "name" => Val::Str(Arc::clone(&c.body.name)),
            "length" => Val::number(f64::from(c.body.param_count)),
            _ => Val::Undefined,
        }),
        Val::Native(n) if name == "name" => Ok(Val::Str(Arc::clone(&n.name))),
        _ => Ok(Val::Undefined),
    }
}

/// Store a named property. Writes to non-object values are ignored.
pub fn set_property(engine: &mut Engine, obj: &Val, name: &str, value: Val) -> VmResult<()> {
    match obj {
        Val::Undefined | Val::Null => Err(engine.ctx.throw_static(&engine.ctx.library.nullish_access)),
        Val::Object(o) => {
            if let Some(Property::Accessor { setter, .. }) = o.get_own(name) {
                if setter.is_callable() {
                    implicit_call(engine, ImplicitCallFlags::ACCESSOR, &setter, &[value])?;
                }
                return Ok(());
            }
            o.set_own(name, value);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn array_index(v: &Val) -> Option<usize> {
    match v {
        Val::Int(i) if *i >= 0 => Some(*i as usize),
        Val::Float(x) if *x >= 0.0 && x.fract() == 0.0 && *x < 4_294_967_295.0 => Some(*x as usize),
        _ => None,
    }
}

pub fn get_element(engine: &mut Engine, obj: &Val, index: &Val) -> VmResult<Val> {
    match (obj, array_index(index)) {
        (Val::Array(a), Some(idx)) => Ok(a.get(idx).unwrap_or_default()),
        (Val::Str(s), Some(idx)) => Ok(s
            .chars()
            .nth(idx)
            .map(|c| Val::str(c.encode_utf8(&mut [0u8; 4])))
            .unwrap_or_default()),
        _ => {
            let key = to_display_string(engine, index)?;
            get_property(engine, obj, &key)
        }
    }
}

pub fn set_element(engine: &mut Engine, obj: &Val, index: &Val, value: Val) -> VmResult<()> {
    match (obj, array_index(index)) {
        (Val::Array(a), Some(idx)) => {
            if idx >= engine.config.max_array_length {
                return Err(engine.ctx.throw_static(&engine.ctx.library.invalid_array_length));
            }
            a.set(idx, value);
            Ok(())
        }
        _ => {
            let key = to_display_string(engine, index)?;
            set_property(engine, obj, &key, value)
        }
    }
}

pub fn length_of(engine: &mut Engine, v: &Val) -> VmResult<Val> {
    get_property(engine, v, "length")
}

/// Enumerable keys visited by `for-in`, in insertion or index order.
pub fn for_in_keys(v: &Val) -> Vec<Arc<str>> {
    let index_keys = |n: usize| -> Vec<Arc<str>> { (0..n).map(|i| Arc::from(i.to_string())).collect() };
    match v {
        Val::Object(o) => o.keys(),
        Val::Array(a) => index_keys(a.len()),
        Val::Str(s) => index_keys(s.chars().count()),
        _ => Vec::new(),
    }
}
