use std::fmt;
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};

use super::jit::NativeLoopBody;
use super::numeric::NumericLayout;
use super::profile::DynamicProfileInfo;
use crate::val::{Val, read_lock, write_lock};

static NEXT_FUNCTION_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl FunctionId {
    pub(crate) fn fresh() -> Self {
        FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    #[default]
    Normal,
    /// Frames are heap-resident and owned by the generator object.
    Generator,
    /// Statically typed numeric dialect with its own opcode table.
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Locals never referenced by nested functions.
    #[default]
    None,
    /// Captured locals live in a flat slot array.
    Slots,
    /// Captured locals live in a property-keyed object (dynamic scope constructs).
    Object,
}

/// Compile-time description of how an activation exposes its scope to nested functions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClosureShape {
    pub scope: ScopeKind,
    pub scope_slots: u32,
    /// Separate scope for parameters with default-value expressions.
    pub param_scope_slots: u32,
    /// The function reads outer variables and needs the enclosing chain at runtime.
    pub needs_display: bool,
    /// Local scope slots start inside the frame and are boxed before capture.
    pub stack_scope: bool,
    /// Nested closures created with `NewStackClosure` get per-frame bookkeeping slots.
    pub stack_nested: bool,
    pub inner_scopes: u32,
    /// Build the chain at prologue rather than at the first nested-function creation.
    pub eager_chain: bool,
}

/// Per-loop record shared by every activation of a function.
pub struct LoopHeader {
    pub start: u32,
    /// First byte after the loop; native code reporting offset 0 resumes here.
    pub end: u32,
    pub in_try: bool,
    /// Loop may be handed to native code even when nested in a handler region.
    pub allow_jit: bool,
    interpret_count: AtomicU32,
    native: RwLock<Option<Arc<dyn NativeLoopBody>>>,
}

impl LoopHeader {
    pub fn new(start: u32, end: u32, in_try: bool, allow_jit: bool) -> Self {
        Self {
            start,
            end,
            in_try,
            allow_jit,
            interpret_count: AtomicU32::new(0),
            native: RwLock::new(None),
        }
    }

    #[inline]
    pub fn interpret_count(&self) -> u32 {
        self.interpret_count.load(Ordering::Relaxed)
    }

    /// Count one interpreted entry and return the new total.
    #[inline]
    pub(crate) fn record_iteration(&self) -> u32 {
        let previous = self
            .interpret_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_add(1)))
            .unwrap_or_else(|n| n);
        previous.saturating_add(1)
    }

    /// Counters never move backwards, even when a snapshot is older than live state.
    pub(crate) fn restore_count(&self, count: u32) {
        self.interpret_count.fetch_max(count, Ordering::Relaxed);
    }

    pub fn native_entry(&self) -> Option<Arc<dyn NativeLoopBody>> {
        read_lock(&self.native).clone()
    }

    pub fn has_native_entry(&self) -> bool {
        read_lock(&self.native).is_some()
    }

    pub(crate) fn install_native(&self, entry: Arc<dyn NativeLoopBody>) {
        *write_lock(&self.native) = Some(entry);
    }
}

impl fmt::Debug for LoopHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHeader")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("in_try", &self.in_try)
            .field("allow_jit", &self.allow_jit)
            .field("interpret_count", &self.interpret_count())
            .field("native", &self.has_native_entry())
            .finish()
    }
}

/// Immutable compiled function.
///
/// Boxed register layout: slot 0 is the return slot, slots `1..const_count` hold the
/// constant table, parameters follow the constants, then the optional rest array, then
/// temporaries up to `local_count`. Out-argument slots sit after `local_count`.
#[derive(Debug)]
pub struct FunctionBody {
    pub id: FunctionId,
    pub name: Arc<str>,
    pub kind: FunctionKind,
    pub code: Vec<u8>,
    /// `constants[0]` initializes the return slot.
    pub constants: Vec<Val>,
    pub names: Vec<Arc<str>>,
    pub local_count: u32,
    pub param_count: u32,
    pub has_rest: bool,
    pub uses_arguments: bool,
    pub max_out_param_depth: u32,
    pub loops: Vec<LoopHeader>,
    pub for_in_count: u32,
    pub nested: Vec<Arc<FunctionBody>>,
    pub closure: ClosureShape,
    pub numeric: Option<NumericLayout>,
    /// Sorted statement-boundary offsets.
    pub statements: Vec<u32>,
    pub profile: DynamicProfileInfo,
    call_count: AtomicU32,
}

impl FunctionBody {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        name: Arc<str>,
        kind: FunctionKind,
        code: Vec<u8>,
        constants: Vec<Val>,
        names: Vec<Arc<str>>,
        local_count: u32,
        param_count: u32,
        has_rest: bool,
        uses_arguments: bool,
        max_out_param_depth: u32,
        loops: Vec<LoopHeader>,
        for_in_count: u32,
        nested: Vec<Arc<FunctionBody>>,
        closure: ClosureShape,
        numeric: Option<NumericLayout>,
        statements: Vec<u32>,
    ) -> Self {
        let loop_count = loops.len();
        Self {
            id: FunctionId::fresh(),
            name,
            kind,
            code,
            constants,
            names,
            local_count,
            param_count,
            has_rest,
            uses_arguments,
            max_out_param_depth,
            loops,
            for_in_count,
            nested,
            closure,
            numeric,
            statements,
            profile: DynamicProfileInfo::new(loop_count),
            call_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn const_count(&self) -> u32 {
        self.constants.len() as u32
    }

    /// First parameter register.
    #[inline]
    pub fn param_base(&self) -> u32 {
        self.const_count()
    }

    #[inline]
    pub fn rest_reg(&self) -> Option<u32> {
        self.has_rest.then(|| self.param_base() + self.param_count)
    }

    pub fn is_generator(&self) -> bool {
        self.kind == FunctionKind::Generator
    }

    pub fn loop_header(&self, loop_num: u32) -> Option<&LoopHeader> {
        self.loops.get(loop_num as usize)
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Count one call and return the new total.
    pub(crate) fn record_call(&self) -> u32 {
        self.call_count.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// First statement boundary strictly after `offset`.
    pub fn next_statement(&self, offset: u32) -> Option<u32> {
        let idx = self.statements.partition_point(|&s| s <= offset);
        self.statements.get(idx).copied()
    }

    pub fn is_statement_boundary(&self, offset: u32) -> bool {
        self.statements.binary_search(&offset).is_ok()
    }

    pub fn name_at(&self, idx: u32) -> Option<&Arc<str>> {
        self.names.get(idx as usize)
    }
}
