//! Debugger/profiler hook points of the debugging dispatch loop.

use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use super::frame::{Activation, FrameFlags};
use super::function::FunctionId;
use crate::val::Val;

/// Machine state visible to a hook before an instruction executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepInfo {
    pub function: Arc<str>,
    pub function_id: FunctionId,
    pub offset: u32,
    pub opcode: &'static str,
    pub try_depth: u32,
    pub catch_depth: u32,
    pub finally_depth: u32,
    pub flags: FrameFlags,
}

impl StepInfo {
    pub(crate) fn capture(frame: &Activation, offset: u32, opcode: &'static str) -> Self {
        Self {
            function: Arc::clone(&frame.body.name),
            function_id: frame.body.id,
            offset,
            opcode,
            try_depth: frame.try_depth,
            catch_depth: frame.catch_depth,
            finally_depth: frame.finally_depth,
            flags: frame.flags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    /// Move execution to a statement boundary of the current function.
    SetNextStatement(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    Propagate,
    /// Resume at the statement after the throwing one instead of unwinding.
    SkipToNextStatement,
}

/// Receives callbacks from frames running in the debugging loop.
pub trait DebugHook: Send + Sync {
    fn on_step(&self, _info: &StepInfo) -> StepAction {
        StepAction::Continue
    }

    fn on_breakpoint(&self, _info: &StepInfo) -> StepAction {
        StepAction::Continue
    }

    /// Called once per exception, at the frame that raised it, before any unwinding.
    fn on_exception(&self, _info: &StepInfo, _value: &Val) -> ExceptionAction {
        ExceptionAction::Propagate
    }
}

/// Hook that logs every step under `tern::vm::debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl DebugHook for TracingHook {
    fn on_step(&self, info: &StepInfo) -> StepAction {
        trace!(
            target: "tern::vm::debug",
            function = %info.function,
            offset = info.offset,
            opcode = info.opcode,
            try_depth = info.try_depth,
            catch_depth = info.catch_depth,
            finally_depth = info.finally_depth,
            "debug.step"
        );
        StepAction::Continue
    }

    fn on_exception(&self, info: &StepInfo, value: &Val) -> ExceptionAction {
        trace!(
            target: "tern::vm::debug",
            function = %info.function,
            offset = info.offset,
            value = %value,
            "debug.exception"
        );
        ExceptionAction::Propagate
    }
}
