use std::sync::RwLock;

use rustc_hash::FxHashMap;
use serde::Serialize;

use super::context::ImplicitCallFlags;
use super::function::FunctionId;
use crate::val::{Val, read_lock, write_lock};

/// Observed value types at one profiled instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ValueTypes(u16);

impl ValueTypes {
    pub const NONE: Self = Self(0);
    pub const UNDEFINED: Self = Self(1 << 0);
    pub const NULL: Self = Self(1 << 1);
    pub const BOOL: Self = Self(1 << 2);
    pub const INT: Self = Self(1 << 3);
    pub const FLOAT: Self = Self(1 << 4);
    pub const STRING: Self = Self(1 << 5);
    pub const ARRAY: Self = Self(1 << 6);
    pub const OBJECT: Self = Self(1 << 7);
    pub const FUNCTION: Self = Self(1 << 8);
    pub const OTHER: Self = Self(1 << 9);

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn of(value: &Val) -> Self {
        match value {
            Val::Undefined => Self::UNDEFINED,
            Val::Null => Self::NULL,
            Val::Bool(_) => Self::BOOL,
            Val::Int(_) => Self::INT,
            Val::Float(_) => Self::FLOAT,
            Val::Str(_) => Self::STRING,
            Val::Array(_) => Self::ARRAY,
            Val::Object(_) => Self::OBJECT,
            Val::Closure(_) | Val::Native(_) => Self::FUNCTION,
            Val::Error(_) | Val::Generator(_) => Self::OTHER,
        }
    }

    /// More than one type bit observed.
    pub fn is_polymorphic(self) -> bool {
        self.0.count_ones() > 1
    }
}

/// Feedback for one call instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallSiteProfile {
    pub calls: u32,
    /// Script callee seen on the first call; cleared once a second target shows up.
    pub callee: Option<FunctionId>,
    pub polymorphic: bool,
    pub arg_count: u32,
}

/// Type and shape feedback gathered by the profiling dispatch loop.
#[derive(Debug, Default)]
pub struct DynamicProfileInfo {
    call_sites: RwLock<FxHashMap<u32, CallSiteProfile>>,
    value_types: RwLock<FxHashMap<u32, ValueTypes>>,
    loop_implicit_calls: RwLock<Vec<ImplicitCallFlags>>,
}

impl DynamicProfileInfo {
    pub fn new(loop_count: usize) -> Self {
        Self {
            call_sites: RwLock::new(FxHashMap::default()),
            value_types: RwLock::new(FxHashMap::default()),
            loop_implicit_calls: RwLock::new(vec![ImplicitCallFlags::NONE; loop_count]),
        }
    }

    pub(crate) fn record_call(&self, offset: u32, callee: &Val, arg_count: u32) {
        let target = match callee {
            Val::Closure(c) => Some(c.body.id),
            _ => None,
        };
        let mut sites = write_lock(&self.call_sites);
        let site = sites.entry(offset).or_default();
        if site.calls == 0 {
            site.callee = target;
        } else if site.callee != target {
            site.callee = None;
            site.polymorphic = true;
        }
        site.calls = site.calls.saturating_add(1);
        site.arg_count = arg_count;
    }

    pub(crate) fn record_value(&self, offset: u32, value: &Val) {
        write_lock(&self.value_types)
            .entry(offset)
            .or_default()
            .insert(ValueTypes::of(value));
    }

    pub(crate) fn record_loop_implicit_calls(&self, loop_num: u32, flags: ImplicitCallFlags) {
        if let Some(slot) = write_lock(&self.loop_implicit_calls).get_mut(loop_num as usize) {
            slot.insert(flags);
        }
    }

    pub fn call_site(&self, offset: u32) -> Option<CallSiteProfile> {
        read_lock(&self.call_sites).get(&offset).cloned()
    }

    pub fn value_types(&self, offset: u32) -> ValueTypes {
        read_lock(&self.value_types)
            .get(&offset)
            .copied()
            .unwrap_or_default()
    }

    pub fn loop_implicit_calls(&self, loop_num: u32) -> ImplicitCallFlags {
        read_lock(&self.loop_implicit_calls)
            .get(loop_num as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn call_site_count(&self) -> usize {
        read_lock(&self.call_sites).len()
    }
}
