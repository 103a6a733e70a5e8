use std::sync::Arc;

use crate::error::{Exception, VmError};
use crate::val::{ErrorKind, ErrorObject, PlainObject, Val};

/// Side effects observed while a handler called into the conversion/property subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImplicitCallFlags(u8);

impl ImplicitCallFlags {
    pub const NONE: Self = Self(0);
    /// A getter or setter ran.
    pub const ACCESSOR: Self = Self(1 << 0);
    /// `valueOf` ran during a primitive conversion.
    pub const TO_PRIMITIVE: Self = Self(1 << 1);
    /// A host function ran as part of a conversion or accessor.
    pub const NATIVE: Self = Self(1 << 2);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// 调用帧信息，用于错误报告。
#[derive(Debug, Clone)]
pub struct CallFrameInfo {
    pub function_name: Arc<str>,
    pub depth: usize,
}

/// Engine-wide error sentinels. Throw sites share one instance; `catch` binds a clone.
#[derive(Debug, Clone)]
pub struct Library {
    pub not_callable: Arc<ErrorObject>,
    pub generator_running: Arc<ErrorObject>,
    pub nullish_access: Arc<ErrorObject>,
    pub invalid_array_length: Arc<ErrorObject>,
}

impl Default for Library {
    fn default() -> Self {
        Self {
            not_callable: ErrorObject::new_static(ErrorKind::TypeError, "value is not a function"),
            generator_running: ErrorObject::new_static(ErrorKind::TypeError, "generator is already running"),
            nullish_access: ErrorObject::new_static(
                ErrorKind::TypeError,
                "cannot access a property of undefined or null",
            ),
            invalid_array_length: ErrorObject::new_static(ErrorKind::RangeError, "invalid array length"),
        }
    }
}

/// 执行期上下文：隐式调用标志、调用栈与全局对象。
///
/// Passed to every handler through the engine; implicit-call flags are only ever changed
/// inside an [`ImplicitCallGuard`](super::guards::ImplicitCallGuard) scope or by the loop
/// bookkeeping instructions.
#[derive(Debug)]
pub struct ExecutionContext {
    pub(crate) implicit_flags: ImplicitCallFlags,
    pub(crate) call_stack: Vec<CallFrameInfo>,
    /// Interpreted calls plus nested handler loops currently on the native stack.
    pub(crate) depth: usize,
    pub(crate) library: Library,
    pub(crate) globals: Arc<PlainObject>,
    /// Remaining instruction budget while a finally runs for a resource-exhaustion error.
    pub(crate) exhaustion: Option<ExhaustionBudget>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExhaustionBudget {
    pub(crate) error: VmError,
    pub(crate) remaining: u32,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            implicit_flags: ImplicitCallFlags::NONE,
            call_stack: Vec::new(),
            depth: 0,
            library: Library::default(),
            globals: PlainObject::new(),
            exhaustion: None,
        }
    }

    #[inline]
    pub fn implicit_flags(&self) -> ImplicitCallFlags {
        self.implicit_flags
    }

    #[inline]
    pub(crate) fn note_implicit_call(&mut self, flags: ImplicitCallFlags) {
        self.implicit_flags.insert(flags);
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn globals(&self) -> &Arc<PlainObject> {
        &self.globals
    }

    #[inline]
    pub fn call_stack_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn call_stack(&self) -> &[CallFrameInfo] {
        &self.call_stack
    }

    pub(crate) fn push_call_frame(&mut self, name: Arc<str>) {
        let depth = self.call_stack.len();
        self.call_stack.push(CallFrameInfo {
            function_name: name,
            depth,
        });
    }

    pub(crate) fn pop_call_frame(&mut self) -> Option<CallFrameInfo> {
        self.call_stack.pop()
    }

    pub fn current_function(&self) -> Option<&str> {
        self.call_stack.last().map(|f| f.function_name.as_ref())
    }

    /// Call chain outermost-first, as recorded into thrown exceptions.
    pub fn trace(&self) -> Vec<Arc<str>> {
        self.call_stack
            .iter()
            .map(|frame| Arc::clone(&frame.function_name))
            .collect()
    }

    pub fn call_stack_report(&self) -> Option<String> {
        if self.call_stack.is_empty() {
            return None;
        }
        let mut report = String::from("Call stack:");
        for frame in self.call_stack.iter().rev() {
            report.push_str(&format!("\n  #{} {}", frame.depth, frame.function_name));
        }
        Some(report)
    }

    /// Build a user exception carrying the current call chain.
    pub fn exception(&self, value: Val) -> VmError {
        VmError::Exception(Exception::new(value, self.trace()))
    }

    pub(crate) fn throw_static(&self, sentinel: &Arc<ErrorObject>) -> VmError {
        self.exception(Val::Error(Arc::clone(sentinel)))
    }

    pub fn type_error(&self, message: &str) -> VmError {
        self.exception(Val::Error(ErrorObject::new(ErrorKind::TypeError, message)))
    }

    pub fn reference_error(&self, message: &str) -> VmError {
        self.exception(Val::Error(ErrorObject::new(ErrorKind::ReferenceError, message)))
    }
}
