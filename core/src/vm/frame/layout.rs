use std::mem::size_of;

use serde::Serialize;

use super::Activation;
use crate::val::Val;
use crate::vm::function::{FunctionBody, ScopeKind};

/// Value-sized slots taken by the fixed activation header.
pub const HEADER_SLOTS: u32 = size_of::<Activation>().div_ceil(size_of::<Val>()) as u32;

/// Slot budget of one activation, computed before anything executes.
///
/// Regions are laid out in field order. Only `locals` and `out_params` are addressed as boxed
/// registers; the other regions back the activation's typed side tables and are charged
/// against the allocator so frame size limits see the whole footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FrameLayout {
    pub header: u32,
    pub locals: u32,
    pub out_params: u32,
    /// One implicit-call tracking cell per loop.
    pub loop_slots: u32,
    pub for_in_slots: u32,
    /// Caller-supplied arguments kept for `LdArguments`.
    pub argument_slots: u32,
    pub nested_closure_slots: u32,
    pub display_slots: u32,
    pub scope_slots: u32,
    pub numeric_slots: u32,
}

impl FrameLayout {
    pub fn plan(body: &FunctionBody, arg_count: u32, resuming_after_bailout: bool) -> Self {
        let shape = &body.closure;
        let stack_scope = shape.stack_scope && shape.scope == ScopeKind::Slots;
        Self {
            header: HEADER_SLOTS,
            locals: body.local_count,
            out_params: body.max_out_param_depth,
            loop_slots: body.loops.len() as u32,
            // a bailout record carries its own enumerators
            for_in_slots: if resuming_after_bailout { 0 } else { body.for_in_count },
            argument_slots: if body.uses_arguments { arg_count } else { 0 },
            nested_closure_slots: if shape.stack_nested { body.nested.len() as u32 } else { 0 },
            display_slots: if stack_scope && shape.needs_display { 1 } else { 0 },
            scope_slots: if stack_scope { shape.scope_slots } else { 0 },
            numeric_slots: body.numeric.as_ref().map_or(0, |n| n.total_slots()),
        }
    }

    #[inline]
    pub fn locals_offset(&self) -> u32 {
        self.header
    }

    #[inline]
    pub fn out_params_offset(&self) -> u32 {
        self.locals_offset() + self.locals
    }

    #[inline]
    pub fn loop_slots_offset(&self) -> u32 {
        self.out_params_offset() + self.out_params
    }

    #[inline]
    pub fn for_in_offset(&self) -> u32 {
        self.loop_slots_offset() + self.loop_slots
    }

    #[inline]
    pub fn arguments_offset(&self) -> u32 {
        self.for_in_offset() + self.for_in_slots
    }

    #[inline]
    pub fn nested_closures_offset(&self) -> u32 {
        self.arguments_offset() + self.argument_slots
    }

    #[inline]
    pub fn display_offset(&self) -> u32 {
        self.nested_closures_offset() + self.nested_closure_slots
    }

    #[inline]
    pub fn scope_slots_offset(&self) -> u32 {
        self.display_offset() + self.display_slots
    }

    #[inline]
    pub fn numeric_offset(&self) -> u32 {
        self.scope_slots_offset() + self.scope_slots
    }

    /// Boxed registers: locals followed by the out-argument area.
    #[inline]
    pub fn value_slots(&self) -> u32 {
        self.locals + self.out_params
    }

    #[inline]
    pub fn total_slots(&self) -> u32 {
        self.numeric_offset() + self.numeric_slots
    }
}
