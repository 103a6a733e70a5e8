//! Call entry: the interpreter thunk every script function is entered through.

use std::sync::Arc;

use tracing::trace;

use super::{BodyEntry, finish_call, numeric_loop, process};
use crate::error::VmResult;
use crate::val::{ScriptClosure, Val};
use crate::vm::engine::Engine;
use crate::vm::frame::{ActivationInit, ExecutionMode, new_activation};
use crate::vm::function::FunctionKind;
use crate::vm::generator;
use crate::vm::guards::DepthGuard;

/// Call any callable value.
pub(crate) fn call_value(engine: &mut Engine, callee: &Val, args: &[Val]) -> VmResult<Val> {
    match callee {
        Val::Closure(closure) => interpreter_thunk(engine, closure, args),
        Val::Native(native) => (native.func)(engine, args),
        _ => Err(engine.ctx.throw_static(&engine.ctx.library.not_callable)),
    }
}

/// Dispatch loop a new activation starts in.
pub(crate) fn select_mode(engine: &Engine, call_count: u32) -> ExecutionMode {
    if engine.config.debug_mode && engine.debug_hook.is_some() {
        ExecutionMode::Debugging
    } else if call_count <= engine.config.profile_calls {
        ExecutionMode::Profiling
    } else {
        ExecutionMode::Unprofiled
    }
}

/// Set up an activation for `closure`, run it, and tear it down.
pub(crate) fn interpreter_thunk(engine: &mut Engine, closure: &Arc<ScriptClosure>, args: &[Val]) -> VmResult<Val> {
    let body = &closure.body;
    let call_count = body.record_call();
    match body.kind {
        FunctionKind::Generator => return generator::create(engine, closure, args),
        FunctionKind::Numeric => return numeric_loop::call(engine, closure, args),
        FunctionKind::Normal => {}
    }

    let mut engine = DepthGuard::call(engine, &body.name)?;
    let mut frame = new_activation(&engine, ActivationInit::for_closure(closure), args)?;
    frame.mode = select_mode(&engine, call_count);
    trace!(
        target: "tern::vm::alloc",
        function = %body.name,
        region = ?frame.region(),
        slots = frame.layout().total_slots(),
        mode = ?frame.mode,
        "frame.enter"
    );
    let completion = process(&mut engine, &mut frame, BodyEntry::Dispatch)?;
    finish_call(&frame, completion)
}
