//! The interpreter: mode-specialized dispatch loops, handler regions, and their re-entry paths.

use tracing::debug;

use super::engine::Engine;
use super::frame::{Activation, ExecutionMode};
use crate::error::{VmResult, fatal};
use crate::val::Val;

mod bailout;
mod call;
mod dispatch;
mod eh;
mod loop_jit;
mod mode;
mod numeric_loop;

pub use bailout::{BailOutRecord, EhBailoutData, EhBailoutNode, HandlerKind};
pub(crate) use bailout::{SuspendedRegion, bail_out};
pub(crate) use call::{call_value, interpreter_thunk, select_mode};
pub(crate) use eh::Pending;

use mode::{Debugging, Profiling, Unprofiled};

/// How a dispatch loop (or one nested handler loop) finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// Slot 0 holds the return value.
    Return,
    /// Generator suspended; `Activation::yielded` holds the value.
    Yield,
    /// `Leave` closed the innermost handler region.
    Leave(u32),
    /// A finally body reached its end without a transfer.
    LeaveNull,
    /// A loop boundary changed `Activation::mode`; resume in the other loop.
    SwitchMode,
}

/// Outcome of one instruction.
#[derive(Debug)]
pub(crate) enum Step {
    Next,
    Exit(Completion),
}

/// Where a dispatch loop starts.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BodyEntry<'d> {
    /// At `Activation::ip`.
    Dispatch,
    /// Re-establish handler region `idx` of a bailout descriptor (and everything inside it)
    /// before dispatching.
    Replay(&'d EhBailoutData, usize),
}

/// Run a script-dialect activation to completion or suspension, switching loops on request.
pub(crate) fn process(engine: &mut Engine, frame: &mut Activation, entry: BodyEntry<'_>) -> VmResult<Completion> {
    let mut entry = entry;
    loop {
        let completion = match frame.mode {
            ExecutionMode::Unprofiled => dispatch::run::<Unprofiled>(engine, frame, entry)?,
            ExecutionMode::Profiling => dispatch::run::<Profiling>(engine, frame, entry)?,
            ExecutionMode::Debugging => dispatch::run::<Debugging>(engine, frame, entry)?,
        };
        entry = BodyEntry::Dispatch;
        match completion {
            Completion::SwitchMode => {
                debug!(
                    target: "tern::vm::mode",
                    function = %frame.body.name,
                    mode = ?frame.mode,
                    ip = frame.ip,
                    "mode.switch"
                );
            }
            Completion::Leave(_) | Completion::LeaveNull => {
                return Err(fatal(format!(
                    "handler exit outside any handler region in '{}'",
                    frame.body.name
                )));
            }
            done => return Ok(done),
        }
    }
}

/// Value of a finished call.
pub(crate) fn finish_call(frame: &Activation, completion: Completion) -> VmResult<Val> {
    match completion {
        Completion::Return => Ok(frame.return_value()),
        other => Err(fatal(format!(
            "'{}' finished with {other:?} instead of returning",
            frame.body.name
        ))),
    }
}
