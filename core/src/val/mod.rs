//! Runtime values seen by the frame engine.
//!
//! The heap is modelled with `Arc`: closures, scopes, arrays, objects, and generator frames
//! stay alive for as long as any slot, scope, or host handle references them.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::VmResult;
use crate::vm::{Engine, FrameDisplay, FunctionBody, GeneratorObject};

pub mod ops;
mod snapshot;

pub use snapshot::SnapshotValue;

/// Host function callable from bytecode.
pub type NativeFn = fn(&mut Engine, &[Val]) -> VmResult<Val>;

#[derive(Clone, Default)]
pub enum Val {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(Arc<str>),
    Array(Arc<ArrayObject>),
    Object(Arc<PlainObject>),
    Closure(Arc<ScriptClosure>),
    Native(Arc<NativeFunction>),
    Error(Arc<ErrorObject>),
    Generator(Arc<GeneratorObject>),
}

#[inline]
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Val {
    /// Canonical number: integral values that fit `i32` (and are not `-0`) become `Int`.
    pub fn number(n: f64) -> Val {
        if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 && !(n == 0.0 && n.is_sign_negative())
        {
            Val::Int(n as i32)
        } else {
            Val::Float(n)
        }
    }

    pub fn str(s: &str) -> Val {
        Val::Str(Arc::from(s))
    }

    pub fn array(items: Vec<Val>) -> Val {
        Val::Array(ArrayObject::new(items))
    }

    pub fn native(name: &str, func: NativeFn) -> Val {
        Val::Native(Arc::new(NativeFunction {
            name: Arc::from(name),
            func,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Undefined => "undefined",
            Val::Null => "null",
            Val::Bool(_) => "boolean",
            Val::Int(_) | Val::Float(_) => "number",
            Val::Str(_) => "string",
            Val::Array(_) => "array",
            Val::Object(_) => "object",
            Val::Closure(_) | Val::Native(_) => "function",
            Val::Error(_) => "error",
            Val::Generator(_) => "generator",
        }
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Val::Undefined)
    }

    #[inline]
    pub fn is_callable(&self) -> bool {
        matches!(self, Val::Closure(_) | Val::Native(_))
    }

    #[inline]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Val::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// True for closures still living in their creator's frame bookkeeping.
    #[inline]
    pub fn is_stack_resident(&self) -> bool {
        matches!(self, Val::Closure(c) if c.stack_resident)
    }

    /// Copy a stack-resident closure to the heap before it escapes its creating call.
    pub fn box_escaping(self) -> Val {
        match self {
            Val::Closure(c) if c.stack_resident => Val::Closure(Arc::new(ScriptClosure {
                body: Arc::clone(&c.body),
                env: c.env.clone(),
                stack_resident: false,
            })),
            other => other,
        }
    }

    /// Value bound by a catch: shared static error sentinels are cloned so user code never
    /// mutates the engine-wide instance.
    pub fn clone_for_catch(&self) -> Val {
        match self {
            Val::Error(err) if err.is_static => Val::Error(Arc::new(ErrorObject {
                kind: err.kind,
                message: Arc::clone(&err.message),
                is_static: false,
            })),
            other => other.clone(),
        }
    }
}

impl From<i32> for Val {
    fn from(value: i32) -> Self {
        Val::Int(value)
    }
}

impl From<f64> for Val {
    fn from(value: f64) -> Self {
        Val::Float(value)
    }
}

impl From<bool> for Val {
    fn from(value: bool) -> Self {
        Val::Bool(value)
    }
}

impl From<&str> for Val {
    fn from(value: &str) -> Self {
        Val::str(value)
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Undefined, Val::Undefined) | (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Array(a), Val::Array(b)) => Arc::ptr_eq(a, b),
            (Val::Object(a), Val::Object(b)) => Arc::ptr_eq(a, b),
            (Val::Closure(a), Val::Closure(b)) => Arc::ptr_eq(a, b),
            (Val::Native(a), Val::Native(b)) => Arc::ptr_eq(a, b),
            (Val::Error(a), Val::Error(b)) => Arc::ptr_eq(a, b),
            (Val::Generator(a), Val::Generator(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Undefined => write!(f, "Undefined"),
            Val::Null => write!(f, "Null"),
            Val::Bool(b) => write!(f, "Bool({b})"),
            Val::Int(i) => write!(f, "Int({i})"),
            Val::Float(x) => write!(f, "Float({x})"),
            Val::Str(s) => write!(f, "Str({s:?})"),
            Val::Array(a) => f.debug_list().entries(read_lock(&a.items).iter()).finish(),
            Val::Object(o) => write!(f, "Object({} props)", o.len()),
            Val::Closure(c) => write!(
                f,
                "Closure({}{})",
                c.body.name,
                if c.stack_resident { ", stack" } else { "" }
            ),
            Val::Native(n) => write!(f, "Native({})", n.name),
            Val::Error(e) => write!(f, "Error({:?}: {})", e.kind, e.message),
            Val::Generator(_) => write!(f, "Generator"),
        }
    }
}

pub(crate) fn write_number(out: &mut String, n: f64) {
    if n.is_nan() {
        out.push_str("NaN");
    } else if n.is_infinite() {
        out.push_str(if n > 0.0 { "Infinity" } else { "-Infinity" });
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        let mut buf = itoa::Buffer::new();
        out.push_str(buf.format(n as i64));
    } else {
        let mut buf = ryu::Buffer::new();
        out.push_str(buf.format(n));
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Undefined => f.write_str("undefined"),
            Val::Null => f.write_str("null"),
            Val::Bool(b) => write!(f, "{b}"),
            Val::Int(i) => {
                let mut buf = itoa::Buffer::new();
                f.write_str(buf.format(*i))
            }
            Val::Float(x) => {
                let mut out = String::new();
                write_number(&mut out, *x);
                f.write_str(&out)
            }
            Val::Str(s) => f.write_str(s),
            Val::Array(a) => {
                let items = read_lock(&a.items);
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Val::Object(_) => f.write_str("[object Object]"),
            Val::Closure(c) => write!(f, "function {}", c.body.name),
            Val::Native(n) => write!(f, "function {} [native]", n.name),
            Val::Error(e) => write!(f, "{}: {}", e.kind.as_str(), e.message),
            Val::Generator(_) => f.write_str("[object Generator]"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ArrayObject {
    items: RwLock<Vec<Val>>,
}

impl ArrayObject {
    pub fn new(items: Vec<Val>) -> Arc<Self> {
        Arc::new(Self {
            items: RwLock::new(items),
        })
    }

    pub fn len(&self) -> usize {
        read_lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Val> {
        read_lock(&self.items).get(index).cloned()
    }

    /// Store at `index`, padding any gap with `undefined`.
    pub fn set(&self, index: usize, value: Val) {
        let mut items = write_lock(&self.items);
        if index >= items.len() {
            items.resize(index + 1, Val::Undefined);
        }
        items[index] = value;
    }

    pub fn push(&self, value: Val) {
        write_lock(&self.items).push(value);
    }

    pub fn to_vec(&self) -> Vec<Val> {
        read_lock(&self.items).clone()
    }
}

#[derive(Debug, Clone)]
pub enum Property {
    Data(Val),
    Accessor { getter: Val, setter: Val },
}

#[derive(Debug, Default)]
struct PropertyTable {
    index: FxHashMap<Arc<str>, usize>,
    entries: Vec<(Arc<str>, Property)>,
}

/// Insertion-ordered property bag standing in for the external object model.
#[derive(Debug, Default)]
pub struct PlainObject {
    props: RwLock<PropertyTable>,
}

impl PlainObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        read_lock(&self.props).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_own(&self, name: &str) -> Option<Property> {
        let props = read_lock(&self.props);
        props.index.get(name).map(|&idx| props.entries[idx].1.clone())
    }

    pub fn has_own(&self, name: &str) -> bool {
        read_lock(&self.props).index.contains_key(name)
    }

    fn define(&self, name: &str, property: Property) {
        let mut props = write_lock(&self.props);
        if let Some(&idx) = props.index.get(name) {
            props.entries[idx].1 = property;
        } else {
            let key: Arc<str> = Arc::from(name);
            let idx = props.entries.len();
            props.entries.push((Arc::clone(&key), property));
            props.index.insert(key, idx);
        }
    }

    /// Define or overwrite a data property without running setters.
    pub fn set_own(&self, name: &str, value: Val) {
        self.define(name, Property::Data(value));
    }

    pub fn define_accessor(&self, name: &str, getter: Val, setter: Val) {
        self.define(name, Property::Accessor { getter, setter });
    }

    pub fn keys(&self) -> Vec<Arc<str>> {
        read_lock(&self.props).entries.iter().map(|(k, _)| Arc::clone(k)).collect()
    }

    /// Data properties in insertion order; accessors are skipped.
    pub fn data_entries(&self) -> Vec<(Arc<str>, Val)> {
        read_lock(&self.props)
            .entries
            .iter()
            .filter_map(|(k, p)| match p {
                Property::Data(v) => Some((Arc::clone(k), v.clone())),
                Property::Accessor { .. } => None,
            })
            .collect()
    }
}

/// Function value: compiled body plus the captured enclosing-scope chain.
pub struct ScriptClosure {
    pub body: Arc<FunctionBody>,
    pub env: FrameDisplay,
    pub(crate) stack_resident: bool,
}

impl ScriptClosure {
    pub fn new(body: Arc<FunctionBody>, env: FrameDisplay) -> Arc<Self> {
        Arc::new(Self {
            body,
            env,
            stack_resident: false,
        })
    }

    pub(crate) fn new_stack(body: Arc<FunctionBody>, env: FrameDisplay) -> Arc<Self> {
        Arc::new(Self {
            body,
            env,
            stack_resident: true,
        })
    }

    #[inline]
    pub fn is_stack_resident(&self) -> bool {
        self.stack_resident
    }
}

impl fmt::Debug for ScriptClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptClosure")
            .field("name", &self.body.name)
            .field("env_depth", &self.env.len())
            .field("stack_resident", &self.stack_resident)
            .finish()
    }
}

pub struct NativeFunction {
    pub name: Arc<str>,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    StackOverflow,
    OutOfMemory,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::OutOfMemory => "OutOfMemory",
        }
    }
}

#[derive(Debug)]
pub struct ErrorObject {
    pub kind: ErrorKind,
    pub message: Arc<str>,
    is_static: bool,
}

impl ErrorObject {
    pub fn new(kind: ErrorKind, message: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            message: Arc::from(message),
            is_static: false,
        })
    }

    /// Engine-wide sentinel shared by every throw site.
    pub fn new_static(kind: ErrorKind, message: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            message: Arc::from(message),
            is_static: true,
        })
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.is_static
    }
}
