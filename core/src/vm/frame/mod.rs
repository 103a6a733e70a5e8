//! Activation records.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::alloc::FrameStorage;
use super::context::ImplicitCallFlags;
use super::function::FunctionBody;
use super::interp::SuspendedRegion;
use super::numeric::NumericSlots;
use super::scope::{FrameDisplay, LocalScope, ScopeSlots};
use crate::val::{ScriptClosure, Val};

mod layout;
mod setup;
mod slots;

pub use layout::{FrameLayout, HEADER_SLOTS};
pub(crate) use setup::{ActivationInit, new_activation};
pub(crate) use slots::OutSpMark;

/// Execution flags of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const NONE: Self = Self(0);
    pub const WITHIN_TRY: Self = Self(1 << 0);
    pub const WITHIN_CATCH: Self = Self(1 << 1);
    pub const WITHIN_FINALLY: Self = Self(1 << 2);
    /// Frame was rebuilt from a native-code bailout.
    pub const FROM_BAIL_OUT: Self = Self(1 << 3);
    /// Handler regions are being replayed from a bailout descriptor.
    pub const PROCESSING_BAIL_OUT_FROM_EH: Self = Self(1 << 4);
    /// Switched to the profiling loop by a loop boundary rather than at call entry.
    pub const AUTO_PROFILED: Self = Self(1 << 5);

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & 0b11_1111)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn set(&mut self, other: Self, on: bool) {
        if on { self.insert(other) } else { self.remove(other) }
    }
}

/// Dispatch-loop variant an activation currently runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Unprofiled,
    Profiling,
    Debugging,
}

/// Property-name iteration state of one `for-in` loop.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForInEnumerator {
    pub keys: Vec<Arc<str>>,
    pub pos: usize,
}

impl ForInEnumerator {
    pub fn new(keys: Vec<Arc<str>>) -> Self {
        Self { keys, pos: 0 }
    }

    pub fn next_key(&mut self) -> Option<Arc<str>> {
        let key = self.keys.get(self.pos).cloned()?;
        self.pos += 1;
        Some(key)
    }
}

/// Per-call state. Mutated only by the dispatch loop; owned by the call or by a generator.
#[derive(Debug)]
pub struct Activation {
    pub(crate) body: Arc<FunctionBody>,
    pub(crate) function: Option<Arc<ScriptClosure>>,
    pub(crate) layout: FrameLayout,
    pub(crate) storage: FrameStorage,
    pub(crate) numeric: Option<NumericSlots>,
    pub(crate) out_sp: u32,
    /// Base of every open `StartCall` reservation, innermost last.
    pub(crate) out_marks: Vec<(u32, u32)>,
    /// Chain captured by the callee closure.
    pub(crate) env: FrameDisplay,
    /// `env` with this frame's scopes prepended, once built.
    pub(crate) display: Option<FrameDisplay>,
    pub(crate) local_scope: LocalScope,
    pub(crate) param_scope: Option<Arc<ScopeSlots>>,
    pub(crate) inner_scopes: Vec<Option<Arc<ScopeSlots>>>,
    pub(crate) stack_closures: Vec<Option<Arc<ScriptClosure>>>,
    pub(crate) for_in: Vec<Option<ForInEnumerator>>,
    pub(crate) arguments: Vec<Val>,
    /// Implicit-call flags saved at each loop's entry.
    pub(crate) loop_flags: Vec<ImplicitCallFlags>,
    pub(crate) flags: FrameFlags,
    pub(crate) mode: ExecutionMode,
    pub(crate) try_depth: u32,
    pub(crate) catch_depth: u32,
    pub(crate) finally_depth: u32,
    pub(crate) ip: u32,
    /// Exception waiting to be bound by the `Catch` at the top of a catch body.
    pub(crate) pending_exception: Option<Val>,
    pub(crate) yielded: Val,
    pub(crate) resume_dst: Option<u32>,
    /// Handler regions open at the last yield, innermost first.
    pub(crate) suspended_eh: Vec<SuspendedRegion>,
}

impl Activation {
    #[inline]
    pub fn body(&self) -> &Arc<FunctionBody> {
        &self.body
    }

    #[inline]
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    #[inline]
    pub fn ip(&self) -> u32 {
        self.ip
    }

    #[inline]
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn region(&self) -> super::alloc::AllocationRegion {
        self.storage.region()
    }

    #[inline]
    pub fn try_depth(&self) -> u32 {
        self.try_depth
    }

    #[inline]
    pub fn catch_depth(&self) -> u32 {
        self.catch_depth
    }

    #[inline]
    pub fn finally_depth(&self) -> u32 {
        self.finally_depth
    }

    /// Number of handler-region markers currently established.
    #[inline]
    pub fn eh_depth(&self) -> u32 {
        self.try_depth + self.catch_depth + self.finally_depth
    }

    pub(crate) fn sync_eh_flags(&mut self) {
        self.flags.set(FrameFlags::WITHIN_TRY, self.try_depth > 0);
        self.flags.set(FrameFlags::WITHIN_CATCH, self.catch_depth > 0);
        self.flags.set(FrameFlags::WITHIN_FINALLY, self.finally_depth > 0);
    }

    pub fn return_value(&self) -> Val {
        self.storage.slots().first().cloned().unwrap_or_default()
    }

    pub fn arguments(&self) -> &[Val] {
        &self.arguments
    }

    pub fn display(&self) -> Option<&FrameDisplay> {
        self.display.as_ref()
    }
}
