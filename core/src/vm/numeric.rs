//! Typed slot namespaces of the numeric dialect.
//!
//! Vector operations are treated as opaque lane operations: `I32x4*` lanes are wrapping
//! two's-complement 32-bit integers, `F32x4*` lanes are IEEE single-precision floats. Nothing
//! beyond that is promised about rounding or overflow.

use serde::{Deserialize, Serialize};

use crate::error::{VmResult, fatal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumType {
    #[default]
    Void,
    I32,
    I64,
    F32,
    F64,
    Simd,
}

/// A typed value crossing the numeric boundary (arguments and returns).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NumValue {
    Void,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Simd(Simd128),
}

impl NumValue {
    pub fn ty(&self) -> NumType {
        match self {
            NumValue::Void => NumType::Void,
            NumValue::I32(_) => NumType::I32,
            NumValue::I64(_) => NumType::I64,
            NumValue::F32(_) => NumType::F32,
            NumValue::F64(_) => NumType::F64,
            NumValue::Simd(_) => NumType::Simd,
        }
    }
}

/// 128-bit vector register, stored as raw lane bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Simd128(pub [u32; 4]);

impl Simd128 {
    pub fn from_i32x4(lanes: [i32; 4]) -> Self {
        Simd128(lanes.map(|lane| lane as u32))
    }

    pub fn from_f32x4(lanes: [f32; 4]) -> Self {
        Simd128(lanes.map(f32::to_bits))
    }

    pub fn i32x4(self) -> [i32; 4] {
        self.0.map(|lane| lane as i32)
    }

    pub fn f32x4(self) -> [f32; 4] {
        self.0.map(f32::from_bits)
    }

    pub fn i32x4_add(self, rhs: Self) -> Self {
        let (a, b) = (self.i32x4(), rhs.i32x4());
        Simd128::from_i32x4(std::array::from_fn(|i| a[i].wrapping_add(b[i])))
    }

    pub fn f32x4_add(self, rhs: Self) -> Self {
        let (a, b) = (self.f32x4(), rhs.f32x4());
        Simd128::from_f32x4(std::array::from_fn(|i| a[i] + b[i]))
    }

    pub fn f32x4_mul(self, rhs: Self) -> Self {
        let (a, b) = (self.f32x4(), rhs.f32x4());
        Simd128::from_f32x4(std::array::from_fn(|i| a[i] * b[i]))
    }
}

/// Typed constants copied into the low slots of each namespace at frame setup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericConsts {
    pub i32: Vec<i32>,
    pub i64: Vec<i64>,
    pub f32: Vec<f32>,
    pub f64: Vec<f64>,
    pub simd: Vec<Simd128>,
}

/// Per-function typed slot counts. Counts include the constants and parameters of that type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericLayout {
    pub i32_slots: u32,
    pub i64_slots: u32,
    pub f32_slots: u32,
    pub f64_slots: u32,
    pub simd_slots: u32,
    pub consts: NumericConsts,
    pub params: Vec<NumType>,
    pub ret: NumType,
}

impl NumericLayout {
    pub fn total_slots(&self) -> u32 {
        // i64/f64 take one slot each; vectors take two value-sized slots.
        self.i32_slots + self.i64_slots + self.f32_slots + self.f64_slots + self.simd_slots * 2
    }

    /// Slot assigned to parameter `idx`: after the constants of its type, in declaration order.
    pub fn param_slot(&self, idx: usize) -> Option<(NumType, u32)> {
        let ty = *self.params.get(idx)?;
        let before = self.params[..idx].iter().filter(|p| **p == ty).count() as u32;
        let consts = match ty {
            NumType::I32 => self.consts.i32.len(),
            NumType::I64 => self.consts.i64.len(),
            NumType::F32 => self.consts.f32.len(),
            NumType::F64 => self.consts.f64.len(),
            NumType::Simd => self.consts.simd.len(),
            NumType::Void => return None,
        } as u32;
        Some((ty, consts + before))
    }
}

macro_rules! typed_accessors {
    ($($get:ident / $set:ident : $field:ident => $ty:ty, $label:literal;)*) => {
        $(
            #[inline]
            pub fn $get(&self, idx: u32) -> VmResult<$ty> {
                self.$field
                    .get(idx as usize)
                    .copied()
                    .ok_or_else(|| fatal(format!(concat!($label, " slot {} out of range"), idx)))
            }

            #[inline]
            pub fn $set(&mut self, idx: u32, value: $ty) -> VmResult<()> {
                let slot = self
                    .$field
                    .get_mut(idx as usize)
                    .ok_or_else(|| fatal(format!(concat!($label, " slot {} out of range"), idx)))?;
                *slot = value;
                Ok(())
            }
        )*
    };
}

/// Typed numeric slot region of an activation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumericSlots {
    i32: Vec<i32>,
    i64: Vec<i64>,
    f32: Vec<f32>,
    f64: Vec<f64>,
    simd: Vec<Simd128>,
}

impl NumericSlots {
    pub fn new(layout: &NumericLayout) -> VmResult<Self> {
        fn fill<T: Copy + Default>(count: u32, consts: &[T], label: &str) -> VmResult<Vec<T>> {
            if consts.len() > count as usize {
                return Err(fatal(format!(
                    "{label} constants ({}) exceed slot count ({count})",
                    consts.len()
                )));
            }
            let mut slots = vec![T::default(); count as usize];
            slots[..consts.len()].copy_from_slice(consts);
            Ok(slots)
        }
        Ok(Self {
            i32: fill(layout.i32_slots, &layout.consts.i32, "i32")?,
            i64: fill(layout.i64_slots, &layout.consts.i64, "i64")?,
            f32: fill(layout.f32_slots, &layout.consts.f32, "f32")?,
            f64: fill(layout.f64_slots, &layout.consts.f64, "f64")?,
            simd: fill(layout.simd_slots, &layout.consts.simd, "simd")?,
        })
    }

    typed_accessors! {
        i32 / set_i32 : i32 => i32, "i32";
        i64 / set_i64 : i64 => i64, "i64";
        f32 / set_f32 : f32 => f32, "f32";
        f64 / set_f64 : f64 => f64, "f64";
        simd / set_simd : simd => Simd128, "simd";
    }

    pub fn store(&mut self, ty: NumType, idx: u32, value: NumValue) -> VmResult<()> {
        match (ty, value) {
            (NumType::I32, NumValue::I32(v)) => self.set_i32(idx, v),
            (NumType::I64, NumValue::I64(v)) => self.set_i64(idx, v),
            (NumType::F32, NumValue::F32(v)) => self.set_f32(idx, v),
            (NumType::F64, NumValue::F64(v)) => self.set_f64(idx, v),
            (NumType::Simd, NumValue::Simd(v)) => self.set_simd(idx, v),
            (ty, value) => Err(fatal(format!("numeric slot type {ty:?} cannot hold {value:?}"))),
        }
    }
}
