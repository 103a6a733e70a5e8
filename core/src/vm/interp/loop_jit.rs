//! Loop-boundary instructions: iteration counting, native loop-body entry, and per-loop
//! implicit-call bookkeeping.

use tracing::debug;

use super::mode::ExecMode;
use super::{Completion, Step};
use crate::error::{VmResult, ensure_fatal, fatal};
use crate::vm::context::ImplicitCallFlags;
use crate::vm::engine::Engine;
use crate::vm::frame::{Activation, ExecutionMode, FrameFlags};
use crate::vm::function::{FunctionBody, LoopHeader};
use crate::vm::jit::{ClosureRegisters, LoopBodyFrame, NativeLoopBody};

fn header<'b>(body: &'b FunctionBody, loop_num: u32) -> VmResult<&'b LoopHeader> {
    body.loop_header(loop_num)
        .ok_or_else(|| fatal(format!("loop {loop_num} out of range in '{}'", body.name)))
}

fn loop_flags_slot(frame: &mut Activation, loop_num: u32) -> VmResult<&mut ImplicitCallFlags> {
    let name = &frame.body.name;
    frame
        .loop_flags
        .get_mut(loop_num as usize)
        .ok_or_else(|| fatal(format!("loop {loop_num} has no flag slot in '{name}'")))
}

/// Whether this loop entry may run native code.
fn jit_eligible<M: ExecMode>(engine: &Engine, frame: &Activation, header: &LoopHeader) -> bool {
    engine.config.loop_jit_enabled && !M::DEBUG && (frame.eh_depth() == 0 || header.allow_jit)
}

/// Top of one loop iteration.
///
/// With a native entry installed the iteration (and usually the rest of the loop) runs
/// natively. Otherwise the iteration is counted; once the count passes the threshold the
/// backend is asked for code, which later entries pick up.
pub(crate) fn loop_body_start<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    loop_num: u32,
) -> VmResult<Step> {
    let header = header(body, loop_num)?;
    let eligible = jit_eligible::<M>(engine, frame, header);

    if eligible && let Some(native) = header.native_entry() {
        return enter_native(engine, frame, body, header, loop_num, native.as_ref());
    }

    let count = header.record_iteration();
    if eligible && count > engine.config.loop_jit_threshold {
        engine.jit.request_loop_body(body, loop_num);
    }

    let min = engine.config.min_profile_iterations;
    if !M::PROFILE && !M::DEBUG && min > 0 && count == min && frame.eh_depth() == 0 {
        // `ProfiledLoopStart` ran unprofiled; the loop is isolated from here on
        *loop_flags_slot(frame, loop_num)? = engine.ctx.implicit_flags;
        engine.ctx.implicit_flags = ImplicitCallFlags::NONE;
        frame.mode = ExecutionMode::Profiling;
        frame.flags.insert(FrameFlags::AUTO_PROFILED);
        return Ok(Step::Exit(Completion::SwitchMode));
    }
    Ok(Step::Next)
}

/// `LoopBodyStart` of the numeric dialect.
///
/// Same count, compile-request, and native-entry protocol as script loops. Numeric code has no
/// handler regions and no profiling or debugging variant.
pub(crate) fn numeric_loop_body_start(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    loop_num: u32,
) -> VmResult<()> {
    let header = header(body, loop_num)?;
    let eligible = engine.config.loop_jit_enabled;

    if eligible && let Some(native) = header.native_entry() {
        enter_native(engine, frame, body, header, loop_num, native.as_ref())?;
        return Ok(());
    }

    let count = header.record_iteration();
    if eligible && count > engine.config.loop_jit_threshold {
        engine.jit.request_loop_body(body, loop_num);
    }
    Ok(())
}

fn enter_native(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    header: &LoopHeader,
    loop_num: u32,
    native: &dyn NativeLoopBody,
) -> VmResult<Step> {
    let entry_flags = engine.ctx.implicit_flags;
    let closure = ClosureRegisters::project(frame);
    let const_count = body.const_count();
    debug!(
        target: "tern::vm::jit",
        function = %body.name,
        loop_num,
        "jit.enter_loop_body"
    );
    let resume = {
        let (regs, numeric) = frame.native_view();
        let mut native_frame = LoopBodyFrame::new(regs, const_count, loop_num, closure).with_numeric(numeric);
        native.execute(&mut native_frame, engine)?
    };
    if resume == 0 {
        frame.ip = header.end;
        return Ok(Step::Next);
    }
    ensure_fatal!(
        (resume as usize) < body.code.len(),
        "native loop {loop_num} of '{}' resumed at {resume}, past the end",
        body.name
    );
    debug!(
        target: "tern::vm::jit",
        function = %body.name,
        loop_num,
        resume,
        "jit.loop_bailout"
    );
    frame.ip = resume;
    engine.ctx.implicit_flags = entry_flags;
    Ok(Step::Next)
}

/// Entry of a profiled loop: start observing implicit calls for this loop only.
pub(crate) fn profiled_loop_start<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    loop_num: u32,
) -> VmResult<Step> {
    if M::PROFILE {
        *loop_flags_slot(frame, loop_num)? = engine.ctx.implicit_flags;
        engine.ctx.implicit_flags = ImplicitCallFlags::NONE;
    }
    Ok(Step::Next)
}

/// Exit of a profiled loop: record what the loop caused and merge it back.
///
/// A frame that switched to profiling at a loop boundary returns to the unprofiled loop here.
pub(crate) fn profiled_loop_end<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    loop_num: u32,
) -> VmResult<Step> {
    if !M::PROFILE {
        return Ok(Step::Next);
    }
    let observed = engine.ctx.implicit_flags;
    body.profile.record_loop_implicit_calls(loop_num, observed);
    let saved = *loop_flags_slot(frame, loop_num)?;
    engine.ctx.implicit_flags = saved.union(observed);

    if frame.flags.contains(FrameFlags::AUTO_PROFILED) && frame.eh_depth() == 0 {
        frame.flags.remove(FrameFlags::AUTO_PROFILED);
        frame.mode = ExecutionMode::Unprofiled;
        return Ok(Step::Exit(Completion::SwitchMode));
    }
    Ok(Step::Next)
}
