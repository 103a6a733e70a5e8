//! try/catch/finally as nested dispatch loops.
//!
//! Entering a region runs its protected body in a nested loop one native level deeper; the
//! nested loop returns when the body leaves the region (`Leave`), returns, yields, or fails.
//! Each open region contributes exactly one marker to the frame's depth counters: the try
//! marker is dropped before the catch or finally body gets its own.

use tracing::debug;

use super::bailout::SuspendedRegion;
use super::mode::ExecMode;
use super::{BodyEntry, Completion, Step, dispatch};
use crate::error::{VmError, VmResult, fatal};
use crate::val::Val;
use crate::vm::engine::Engine;
use crate::vm::frame::Activation;
use crate::vm::guards::{DepthGuard, ExhaustionGuard};

/// Control transfer a finally body resumes once it completes normally.
#[derive(Debug, Clone, Default)]
pub(crate) enum Pending {
    /// Fell into the finally body without a transfer.
    #[default]
    None,
    Jump(u32),
    Return(Val),
    Throw(VmError),
}

impl Pending {
    fn exhaustion(&self) -> Option<&VmError> {
        match self {
            Pending::Throw(err) if err.is_resource_exhaustion() => Some(err),
            _ => None,
        }
    }
}

fn nested<M: ExecMode>(engine: &mut Engine, frame: &mut Activation, entry: BodyEntry<'_>) -> VmResult<Completion> {
    let mut engine = DepthGuard::nested(engine)?;
    dispatch::run::<M>(&mut engine, frame, entry)
}

fn unexpected(frame: &Activation, what: &str, completion: Completion) -> VmError {
    fatal(format!(
        "{completion:?} ended the {what} of '{}' at {}",
        frame.body.name, frame.ip
    ))
}

pub(crate) fn enter_try_catch<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    catch_target: u32,
) -> VmResult<Step> {
    run_try_catch::<M>(engine, frame, catch_target, BodyEntry::Dispatch)
}

pub(crate) fn enter_try_finally<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    finally_target: u32,
) -> VmResult<Step> {
    run_try_finally::<M>(engine, frame, finally_target, BodyEntry::Dispatch)
}

pub(crate) fn run_try_catch<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    catch_target: u32,
    entry: BodyEntry<'_>,
) -> VmResult<Step> {
    let mark = frame.cache_sp();
    frame.try_depth += 1;
    frame.sync_eh_flags();
    let result = nested::<M>(engine, frame, entry);
    frame.try_depth -= 1;
    frame.sync_eh_flags();

    match result {
        Ok(Completion::Leave(target)) => {
            frame.ip = target;
            Ok(Step::Next)
        }
        Ok(Completion::Return) => Ok(Step::Exit(Completion::Return)),
        Ok(Completion::Yield) => {
            frame.suspended_eh.push(SuspendedRegion::try_catch(catch_target));
            Ok(Step::Exit(Completion::Yield))
        }
        Ok(other) => Err(unexpected(frame, "try body", other)),
        Err(VmError::Exception(exc)) => {
            debug!(
                target: "tern::vm::eh",
                function = %frame.body.name,
                catch_target,
                "eh.catch"
            );
            frame.restore_sp(mark);
            frame.pending_exception = Some(exc.value);
            frame.ip = catch_target;
            run_catch_body::<M>(engine, frame, catch_target, BodyEntry::Dispatch)
        }
        Err(err) => Err(err),
    }
}

pub(crate) fn run_catch_body<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    catch_offset: u32,
    entry: BodyEntry<'_>,
) -> VmResult<Step> {
    frame.catch_depth += 1;
    frame.sync_eh_flags();
    let result = nested::<M>(engine, frame, entry);
    frame.catch_depth -= 1;
    frame.sync_eh_flags();

    match result {
        Ok(Completion::Leave(target)) => {
            frame.ip = target;
            Ok(Step::Next)
        }
        Ok(Completion::Return) => Ok(Step::Exit(Completion::Return)),
        Ok(Completion::Yield) => {
            frame.suspended_eh.push(SuspendedRegion::catch_body(catch_offset));
            Ok(Step::Exit(Completion::Yield))
        }
        Ok(other) => Err(unexpected(frame, "catch body", other)),
        Err(err) => Err(err),
    }
}

pub(crate) fn run_try_finally<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    finally_target: u32,
    entry: BodyEntry<'_>,
) -> VmResult<Step> {
    let mark = frame.cache_sp();
    frame.try_depth += 1;
    frame.sync_eh_flags();
    let result = nested::<M>(engine, frame, entry);
    frame.try_depth -= 1;
    frame.sync_eh_flags();

    let pending = match result {
        Ok(Completion::Leave(target)) => Pending::Jump(target),
        Ok(Completion::Return) => Pending::Return(frame.return_value()),
        Ok(Completion::Yield) => {
            frame.suspended_eh.push(SuspendedRegion::try_finally(finally_target));
            return Ok(Step::Exit(Completion::Yield));
        }
        Ok(other) => return Err(unexpected(frame, "try body", other)),
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => Pending::Throw(err),
    };
    frame.restore_sp(mark);
    frame.ip = finally_target;
    run_finally_body::<M>(engine, frame, finally_target, pending, BodyEntry::Dispatch)
}

/// Run a finally body on behalf of `pending`.
///
/// `LeaveNull` resumes the pending transfer. A `Leave` or `Return` inside the body discards
/// it, and an error raised by the body replaces it, except that a pending resource-exhaustion
/// error is never discarded. While one is pending the body runs under a bounded instruction
/// budget.
pub(crate) fn run_finally_body<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    finally_offset: u32,
    pending: Pending,
    entry: BodyEntry<'_>,
) -> VmResult<Step> {
    frame.finally_depth += 1;
    frame.sync_eh_flags();
    let result = match pending.exhaustion() {
        Some(err) => {
            let mut engine = ExhaustionGuard::new(engine, err.clone());
            nested::<M>(&mut engine, frame, entry)
        }
        None => nested::<M>(engine, frame, entry),
    };
    frame.finally_depth -= 1;
    frame.sync_eh_flags();

    let exhaustion = pending.exhaustion().cloned();
    match result {
        Ok(Completion::LeaveNull) => resume_pending(frame, pending),
        Ok(Completion::Yield) => {
            frame.suspended_eh.push(SuspendedRegion::finally_body(finally_offset, pending));
            Ok(Step::Exit(Completion::Yield))
        }
        Ok(completion @ (Completion::Leave(_) | Completion::Return)) => {
            if let Some(err) = exhaustion {
                return Err(err);
            }
            if !matches!(pending, Pending::None) {
                debug!(
                    target: "tern::vm::eh",
                    function = %frame.body.name,
                    discarded = ?pending,
                    "eh.finally_overrides"
                );
            }
            match completion {
                Completion::Leave(target) => {
                    frame.ip = target;
                    Ok(Step::Next)
                }
                _ => Ok(Step::Exit(Completion::Return)),
            }
        }
        Ok(other) => Err(unexpected(frame, "finally body", other)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => Err(exhaustion.unwrap_or(err)),
    }
}

fn resume_pending(frame: &mut Activation, pending: Pending) -> VmResult<Step> {
    match pending {
        Pending::None => Ok(Step::Next),
        Pending::Jump(target) => {
            frame.ip = target;
            Ok(Step::Next)
        }
        Pending::Return(value) => {
            frame.set_reg_allow_stack_var(0, value)?;
            Ok(Step::Exit(Completion::Return))
        }
        Pending::Throw(err) => Err(err),
    }
}
