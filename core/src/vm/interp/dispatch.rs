//! The script-dialect dispatch loop.

use std::sync::Arc;

use super::mode::ExecMode;
use super::{BodyEntry, Completion, Step, bailout, call, eh, loop_jit};
use crate::error::{VmError, VmResult, ensure_fatal, fatal};
use crate::val::ops::{self, ArithOp, CompareOp};
use crate::val::{PlainObject, Property, Val};
use crate::vm::bytecode::Op;
use crate::vm::debug::{ExceptionAction, StepAction, StepInfo};
use crate::vm::encoding::decode_at;
use crate::vm::engine::Engine;
use crate::vm::frame::{Activation, ForInEnumerator};
use crate::vm::function::FunctionBody;
use crate::vm::generator;
use crate::vm::guards::ImplicitCallGuard;

/// Execute instructions from `frame.ip` until the function (or the current handler region)
/// completes.
pub(crate) fn run<M: ExecMode>(engine: &mut Engine, frame: &mut Activation, entry: BodyEntry<'_>) -> VmResult<Completion> {
    if let BodyEntry::Replay(data, idx) = entry {
        match bailout::replay_region::<M>(engine, frame, data, idx)? {
            Step::Next => {}
            Step::Exit(completion) => return Ok(completion),
        }
    }

    let body = Arc::clone(&frame.body);
    let code = body.code.as_slice();
    loop {
        if let Some(budget) = engine.ctx.exhaustion.as_mut() {
            if budget.remaining == 0 {
                return Err(budget.error.clone());
            }
            budget.remaining -= 1;
        }

        let offset = frame.ip;
        ensure_fatal!(
            (offset as usize) < code.len(),
            "execution ran off the end of '{}' at {offset}",
            body.name
        );
        let op: Op = decode_at(code, &mut frame.ip)?;

        if M::DEBUG
            && let Some(target) = debug_step(engine, frame, offset, op)?
        {
            frame.ip = target;
            frame.reset_out();
            continue;
        }

        match execute::<M>(engine, frame, &body, op, offset) {
            Ok(Step::Next) => {}
            Ok(Step::Exit(completion)) => return Ok(completion),
            Err(mut err) => {
                if M::DEBUG
                    && let Some(target) = intercept_exception(engine, frame, offset, op, &mut err)
                {
                    frame.ip = target;
                    frame.reset_out();
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// Offer the instruction to the debug hook; a returned offset replaces it.
fn debug_step(engine: &Engine, frame: &Activation, offset: u32, op: Op) -> VmResult<Option<u32>> {
    let Some(hook) = engine.debug_hook.as_ref() else {
        return Ok(None);
    };
    let info = StepInfo::capture(frame, offset, op.code().name());
    match hook.on_step(&info) {
        StepAction::Continue => Ok(None),
        StepAction::SetNextStatement(target) => next_statement_target(frame, target).map(Some),
    }
}

fn next_statement_target(frame: &Activation, target: u32) -> VmResult<u32> {
    ensure_fatal!(
        frame.body.is_statement_boundary(target),
        "set-next-statement target {target} is not a statement boundary of '{}'",
        frame.body.name
    );
    Ok(target)
}

/// Report a first-seen exception to the hook at the raising frame.
fn intercept_exception(engine: &Engine, frame: &Activation, offset: u32, op: Op, err: &mut VmError) -> Option<u32> {
    let VmError::Exception(exc) = err else {
        return None;
    };
    if exc.reported {
        return None;
    }
    exc.reported = true;
    let hook = engine.debug_hook.as_ref()?;
    let info = StepInfo::capture(frame, offset, op.code().name());
    match hook.on_exception(&info, &exc.value) {
        ExceptionAction::Propagate => None,
        ExceptionAction::SkipToNextStatement => frame.body.next_statement(offset),
    }
}

/// Run a conversion or property access inside an implicit-call scope.
#[inline]
fn implicit<R>(engine: &mut Engine, f: impl FnOnce(&mut Engine) -> VmResult<R>) -> VmResult<R> {
    let mut scope = ImplicitCallGuard::new(engine);
    f(&mut *scope)
}

#[inline]
fn profile_value<M: ExecMode>(body: &FunctionBody, offset: u32, value: &Val) {
    if M::PROFILE {
        body.profile.record_value(offset, value);
    }
}

fn name_of(body: &FunctionBody, idx: u32) -> VmResult<Arc<str>> {
    body.name_at(idx)
        .cloned()
        .ok_or_else(|| fatal(format!("name index {idx} out of range in '{}'", body.name)))
}

fn binary<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    offset: u32,
    (dst, lhs, rhs): (u32, u32, u32),
    f: impl FnOnce(&mut Engine, &Val, &Val) -> VmResult<Val>,
) -> VmResult<Step> {
    let a = frame.reg(lhs)?;
    let b = frame.reg(rhs)?;
    let value = implicit(engine, |e| f(e, &a, &b))?;
    profile_value::<M>(body, offset, &value);
    frame.set_reg(dst, value)?;
    Ok(Step::Next)
}

fn unary<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    offset: u32,
    (dst, src): (u32, u32),
    f: impl FnOnce(&mut Engine, &Val) -> VmResult<Val>,
) -> VmResult<Step> {
    let v = frame.reg(src)?;
    let value = implicit(engine, |e| f(e, &v))?;
    profile_value::<M>(body, offset, &value);
    frame.set_reg(dst, value)?;
    Ok(Step::Next)
}

fn execute<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    op: Op,
    offset: u32,
) -> VmResult<Step> {
    match op {
        Op::Ret {} => {
            let value = frame.return_value().box_escaping();
            frame.set_reg(0, value)?;
            return Ok(Step::Exit(Completion::Return));
        }
        Op::Yield { dst, src } => {
            ensure_fatal!(body.is_generator(), "Yield outside a generator in '{}'", body.name);
            frame.yielded = frame.reg(src)?.box_escaping();
            frame.resume_dst = Some(dst);
            return Ok(Step::Exit(Completion::Yield));
        }
        Op::Ld { dst, src } => {
            let v = frame.reg(src)?;
            frame.set_reg_allow_stack_var(dst, v)?;
        }
        Op::LdUndef { dst } => frame.set_reg(dst, Val::Undefined)?,
        Op::LdNull { dst } => frame.set_reg(dst, Val::Null)?,
        Op::LdTrue { dst } => frame.set_reg(dst, Val::Bool(true))?,
        Op::LdFalse { dst } => frame.set_reg(dst, Val::Bool(false))?,
        Op::LdInt { dst, value } => frame.set_reg(dst, Val::Int(value))?,

        Op::Add { dst, lhs, rhs } => {
            return binary::<M>(engine, frame, body, offset, (dst, lhs, rhs), ops::add);
        }
        Op::Sub { dst, lhs, rhs } => {
            return binary::<M>(engine, frame, body, offset, (dst, lhs, rhs), |e, a, b| {
                ops::arith(e, ArithOp::Sub, a, b)
            });
        }
        Op::Mul { dst, lhs, rhs } => {
            return binary::<M>(engine, frame, body, offset, (dst, lhs, rhs), |e, a, b| {
                ops::arith(e, ArithOp::Mul, a, b)
            });
        }
        Op::Div { dst, lhs, rhs } => {
            return binary::<M>(engine, frame, body, offset, (dst, lhs, rhs), |e, a, b| {
                ops::arith(e, ArithOp::Div, a, b)
            });
        }
        Op::Rem { dst, lhs, rhs } => {
            return binary::<M>(engine, frame, body, offset, (dst, lhs, rhs), |e, a, b| {
                ops::arith(e, ArithOp::Rem, a, b)
            });
        }
        Op::Incr { dst, src } => {
            return unary::<M>(engine, frame, body, offset, (dst, src), |e, v| ops::increment(e, v, 1));
        }
        Op::Decr { dst, src } => {
            return unary::<M>(engine, frame, body, offset, (dst, src), |e, v| ops::increment(e, v, -1));
        }
        Op::Neg { dst, src } => {
            return unary::<M>(engine, frame, body, offset, (dst, src), ops::negate);
        }
        Op::Not { dst, src } => {
            let v = frame.reg(src)?;
            frame.set_reg(dst, Val::Bool(!ops::to_boolean(&v)))?;
        }
        Op::TypeOf { dst, src } => {
            let v = frame.reg(src)?;
            frame.set_reg(dst, Val::str(ops::type_of(&v)))?;
        }
        Op::Eq { dst, lhs, rhs } => {
            return binary::<M>(engine, frame, body, offset, (dst, lhs, rhs), |e, a, b| {
                ops::loose_equals(e, a, b).map(Val::Bool)
            });
        }
        Op::NotEq { dst, lhs, rhs } => {
            return binary::<M>(engine, frame, body, offset, (dst, lhs, rhs), |e, a, b| {
                ops::loose_equals(e, a, b).map(|eq| Val::Bool(!eq))
            });
        }
        Op::StrictEq { dst, lhs, rhs } => {
            let eq = ops::strict_equals(&frame.reg(lhs)?, &frame.reg(rhs)?);
            frame.set_reg(dst, Val::Bool(eq))?;
        }
        Op::StrictNotEq { dst, lhs, rhs } => {
            let eq = ops::strict_equals(&frame.reg(lhs)?, &frame.reg(rhs)?);
            frame.set_reg(dst, Val::Bool(!eq))?;
        }
        Op::Lt { dst, lhs, rhs } => return compare::<M>(engine, frame, body, offset, (dst, lhs, rhs), CompareOp::Lt),
        Op::Le { dst, lhs, rhs } => return compare::<M>(engine, frame, body, offset, (dst, lhs, rhs), CompareOp::Le),
        Op::Gt { dst, lhs, rhs } => return compare::<M>(engine, frame, body, offset, (dst, lhs, rhs), CompareOp::Gt),
        Op::Ge { dst, lhs, rhs } => return compare::<M>(engine, frame, body, offset, (dst, lhs, rhs), CompareOp::Ge),

        Op::Br { target } => frame.ip = target,
        Op::BrTrue { src, target } => {
            if ops::to_boolean(&frame.reg(src)?) {
                frame.ip = target;
            }
        }
        Op::BrFalse { src, target } => {
            if !ops::to_boolean(&frame.reg(src)?) {
                frame.ip = target;
            }
        }
        Op::LoopBodyStart { loop_num } => return loop_jit::loop_body_start::<M>(engine, frame, body, loop_num),
        Op::ProfiledLoopStart { loop_num } => {
            return loop_jit::profiled_loop_start::<M>(engine, frame, loop_num);
        }
        Op::ProfiledLoopEnd { loop_num } => {
            return loop_jit::profiled_loop_end::<M>(engine, frame, body, loop_num);
        }

        Op::StartCall { argc } => frame.start_call(argc)?,
        Op::ArgOut { index, src } => {
            let v = frame.reg(src)?.box_escaping();
            frame.set_out(index, v)?;
        }
        Op::Call { dst, callee, argc } => {
            let target = frame.reg(callee)?;
            let args = frame.out_args(argc)?.to_vec();
            frame.pop_out(argc)?;
            if M::PROFILE {
                body.profile.record_call(offset, &target, argc);
            }
            let result = call::call_value(engine, &target, &args)?;
            profile_value::<M>(body, offset, &result);
            frame.set_reg(dst, result)?;
        }

        Op::NewObject { dst } => frame.set_reg(dst, Val::Object(PlainObject::new()))?,
        Op::NewArray { dst, len } => {
            if len as usize > engine.config.max_array_length {
                return Err(engine.ctx.throw_static(&engine.ctx.library.invalid_array_length));
            }
            frame.set_reg(dst, Val::array(vec![Val::Undefined; len as usize]))?;
        }
        Op::LdFld { dst, obj, name } => {
            let name = name_of(body, name)?;
            let target = frame.reg(obj)?;
            let value = implicit(engine, |e| ops::get_property(e, &target, &name))?;
            profile_value::<M>(body, offset, &value);
            frame.set_reg(dst, value)?;
        }
        Op::StFld { obj, name, src } => {
            let name = name_of(body, name)?;
            let target = frame.reg(obj)?;
            let value = frame.reg(src)?.box_escaping();
            implicit(engine, |e| ops::set_property(e, &target, &name, value))?;
        }
        Op::LdElem { dst, obj, index } => {
            let target = frame.reg(obj)?;
            let key = frame.reg(index)?;
            let value = implicit(engine, |e| ops::get_element(e, &target, &key))?;
            profile_value::<M>(body, offset, &value);
            frame.set_reg(dst, value)?;
        }
        Op::StElem { obj, index, src } => {
            let target = frame.reg(obj)?;
            let key = frame.reg(index)?;
            let value = frame.reg(src)?.box_escaping();
            implicit(engine, |e| ops::set_element(e, &target, &key, value))?;
        }
        Op::LdLen { dst, src } => {
            return unary::<M>(engine, frame, body, offset, (dst, src), ops::length_of);
        }
        Op::LdRoot { dst, name } => {
            let name = name_of(body, name)?;
            let globals = Arc::clone(&engine.ctx.globals);
            let value = match globals.get_own(&name) {
                Some(Property::Data(v)) => v,
                Some(Property::Accessor { .. }) => {
                    let root = Val::Object(globals);
                    implicit(engine, |e| ops::get_property(e, &root, &name))?
                }
                None => return Err(engine.ctx.reference_error(&format!("{name} is not defined"))),
            };
            frame.set_reg(dst, value)?;
        }
        Op::StRoot { name, src } => {
            let name = name_of(body, name)?;
            let value = frame.reg(src)?.box_escaping();
            let root = Val::Object(Arc::clone(&engine.ctx.globals));
            implicit(engine, |e| ops::set_property(e, &root, &name, value))?;
        }
        Op::LdArguments { dst } => {
            ensure_fatal!(
                body.uses_arguments,
                "'{}' reads arguments without declaring it",
                body.name
            );
            let args = Val::array(frame.arguments.clone());
            frame.set_reg(dst, args)?;
        }

        Op::NewClosure { dst, func } => {
            let closure = frame.new_closure(func, false)?;
            frame.set_reg(dst, closure)?;
        }
        Op::NewStackClosure { dst, func } => {
            let closure = frame.new_closure(func, true)?;
            frame.set_reg_allow_stack_var(dst, closure)?;
        }
        Op::LdEnvSlot { dst, depth, slot } => {
            let v = frame.env_scope(depth)?.slots()?.get(slot)?;
            frame.set_reg(dst, v)?;
        }
        Op::StEnvSlot { depth, slot, src } => {
            let v = frame.reg(src)?.box_escaping();
            frame.env_scope(depth)?.slots()?.set(slot, v)?;
        }
        Op::LdEnvFld { dst, depth, name } => {
            let name = name_of(body, name)?;
            let scope = Val::Object(Arc::clone(frame.env_scope(depth)?.object()?));
            let value = implicit(engine, |e| ops::get_property(e, &scope, &name))?;
            frame.set_reg(dst, value)?;
        }
        Op::StEnvFld { depth, name, src } => {
            let name = name_of(body, name)?;
            let scope = Val::Object(Arc::clone(frame.env_scope(depth)?.object()?));
            let value = frame.reg(src)?.box_escaping();
            implicit(engine, |e| ops::set_property(e, &scope, &name, value))?;
        }
        Op::LdLocalSlot { dst, slot } => {
            let v = frame.local_slot(slot)?;
            frame.set_reg(dst, v)?;
        }
        Op::StLocalSlot { slot, src } => {
            let v = frame.reg(src)?.box_escaping();
            frame.set_local_slot(slot, v)?;
        }
        Op::LdLocalFld { dst, name } => {
            let name = name_of(body, name)?;
            let scope = Val::Object(frame.local_object()?);
            let value = implicit(engine, |e| ops::get_property(e, &scope, &name))?;
            frame.set_reg(dst, value)?;
        }
        Op::StLocalFld { name, src } => {
            let name = name_of(body, name)?;
            let scope = Val::Object(frame.local_object()?);
            let value = frame.reg(src)?.box_escaping();
            implicit(engine, |e| ops::set_property(e, &scope, &name, value))?;
        }
        Op::LdParamSlot { dst, slot } => {
            let v = frame.param_slots()?.get(slot)?;
            frame.set_reg(dst, v)?;
        }
        Op::StParamSlot { slot, src } => {
            let v = frame.reg(src)?.box_escaping();
            frame.param_slots()?.set(slot, v)?;
        }
        Op::ParamScopeDone {} => frame.param_scope_done()?,
        Op::NewInnerScope { index, size } => frame.new_inner_scope(index, size)?,
        Op::LdInnerSlot { dst, index, slot } => {
            let v = frame.inner_scope(index)?.get(slot)?;
            frame.set_reg(dst, v)?;
        }
        Op::StInnerSlot { index, slot, src } => {
            let v = frame.reg(src)?.box_escaping();
            frame.inner_scope(index)?.set(slot, v)?;
        }

        Op::InitForIn { enumerator, src } => {
            let keys = ops::for_in_keys(&frame.reg(src)?);
            let slot = frame
                .for_in
                .get_mut(enumerator as usize)
                .ok_or_else(|| fatal(format!("for-in enumerator {enumerator} out of range")))?;
            *slot = Some(ForInEnumerator::new(keys));
        }
        Op::ForInNext { dst, enumerator, target } => {
            let slot = frame
                .for_in
                .get_mut(enumerator as usize)
                .ok_or_else(|| fatal(format!("for-in enumerator {enumerator} out of range")))?;
            let state = slot
                .as_mut()
                .ok_or_else(|| fatal(format!("for-in enumerator {enumerator} used before InitForIn")))?;
            match state.next_key() {
                Some(key) => frame.set_reg(dst, Val::Str(key))?,
                None => {
                    frame.for_in[enumerator as usize] = None;
                    frame.ip = target;
                }
            }
        }

        Op::Throw { src } => {
            let value = frame.reg(src)?.box_escaping();
            return Err(engine.ctx.exception(value));
        }
        Op::TryCatch { catch_target } => return eh::enter_try_catch::<M>(engine, frame, catch_target),
        Op::TryFinally { finally_target } => return eh::enter_try_finally::<M>(engine, frame, finally_target),
        Op::Catch { dst } => {
            let value = frame
                .pending_exception
                .take()
                .ok_or_else(|| fatal(format!("Catch without a pending exception in '{}'", body.name)))?;
            frame.set_reg(dst, value.clone_for_catch())?;
        }
        Op::Leave { target } => {
            ensure_fatal!(
                frame.eh_depth() > 0,
                "Leave outside any handler region in '{}' at {offset}",
                body.name
            );
            return Ok(Step::Exit(Completion::Leave(target)));
        }
        Op::LeaveNull {} => {
            ensure_fatal!(
                frame.finally_depth > 0,
                "LeaveNull outside a finally body in '{}' at {offset}",
                body.name
            );
            return Ok(Step::Exit(Completion::LeaveNull));
        }

        Op::ResumeGenerator { dst, generator, value } => {
            let target = frame.reg(generator)?;
            let sent = frame.reg(value)?.box_escaping();
            let Val::Generator(gen_obj) = &target else {
                return Err(engine.ctx.type_error(&format!("{} is not a generator", target.type_name())));
            };
            let step = generator::resume(engine, gen_obj, sent)?;
            frame.set_reg(dst, step.into_result_object())?;
        }

        Op::Break {} => {
            if M::DEBUG
                && let Some(hook) = engine.debug_hook.as_ref()
            {
                let info = StepInfo::capture(frame, offset, "Break");
                if let StepAction::SetNextStatement(target) = hook.on_breakpoint(&info) {
                    frame.ip = next_statement_target(frame, target)?;
                    frame.reset_out();
                }
            }
        }
        Op::EndOfBlock {} => {
            if M::DEBUG {
                // a debugger moved execution past the final return
                frame.set_reg(0, Val::Undefined)?;
                return Ok(Step::Exit(Completion::Return));
            }
            return Err(fatal(format!("execution reached the end of '{}'", body.name)));
        }
    }
    Ok(Step::Next)
}

fn compare<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    body: &FunctionBody,
    offset: u32,
    regs: (u32, u32, u32),
    op: CompareOp,
) -> VmResult<Step> {
    binary::<M>(engine, frame, body, offset, regs, |e, a, b| {
        ops::compare(e, op, a, b).map(Val::Bool)
    })
}
