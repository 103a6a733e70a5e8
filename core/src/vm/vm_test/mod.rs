pub(super) use std::sync::{Arc, Mutex};

pub(super) use crate::{
    config::EngineConfig,
    error::{VmError, VmResult},
    val::{ErrorKind, PlainObject, Property, Val},
    vm::{
        BailOutRecord, ClosureShape, DebugHook, EhBailoutData, Engine, ExceptionAction, FrameFlags, FunctionBody,
        FunctionBuilder, FunctionKind, HandlerKind, ImplicitCallFlags, LoopBodyFrame, NativeLoopBody, NumOp, NumType,
        NumericConsts, NumericLayout, Op, OptimizingBackend, ScopeKind, StepAction, StepInfo,
    },
};

pub(super) fn exec(body: &Arc<FunctionBody>, args: &[Val]) -> Val {
    let mut engine = Engine::new();
    engine.call_function(body, args).unwrap()
}

pub(super) fn engine_with(configure: impl FnOnce(&mut EngineConfig)) -> Engine {
    let mut config = EngineConfig::default();
    configure(&mut config);
    Engine::with_config(config).unwrap()
}

/// Engine error behind a host-level failure.
pub(super) fn vm_error(err: &anyhow::Error) -> &VmError {
    err.downcast_ref::<VmError>().unwrap()
}

/// Read a global counter, treating a missing one as zero.
pub(super) fn counter(engine: &Engine, name: &str) -> i32 {
    engine.global(name).and_then(|v| v.as_int()).unwrap_or(0)
}

/// `name = name + 1` on a global, using temp register `tmp`.
pub(super) fn bump_global(b: &mut FunctionBuilder, name: &str, tmp: u32) {
    let name = b.name(name);
    b.emit(Op::LdRoot { dst: tmp, name });
    b.emit(Op::Incr { dst: tmp, src: tmp });
    b.emit(Op::StRoot { name, src: tmp });
}

/// Debug hook that records every step it sees.
#[derive(Default)]
pub(super) struct RecordingHook {
    pub(super) steps: Mutex<Vec<StepInfo>>,
    pub(super) exceptions: Mutex<Vec<(u32, Val)>>,
    pub(super) skip_exceptions: bool,
}

impl RecordingHook {
    pub(super) fn steps(&self) -> Vec<StepInfo> {
        self.steps.lock().unwrap().clone()
    }

    pub(super) fn step_at(&self, offset: u32) -> Option<StepInfo> {
        self.steps().into_iter().find(|s| s.offset == offset)
    }
}

impl DebugHook for RecordingHook {
    fn on_step(&self, info: &StepInfo) -> StepAction {
        self.steps.lock().unwrap().push(info.clone());
        StepAction::Continue
    }

    fn on_exception(&self, info: &StepInfo, value: &Val) -> ExceptionAction {
        self.exceptions.lock().unwrap().push((info.offset, value.clone()));
        if self.skip_exceptions {
            ExceptionAction::SkipToNextStatement
        } else {
            ExceptionAction::Propagate
        }
    }
}

pub(super) fn debug_engine(hook: Arc<dyn DebugHook>) -> Engine {
    let mut engine = engine_with(|c| c.debug_mode = true);
    engine.set_debug_hook(Some(hook));
    engine
}

mod calls;
mod debugging;
mod exceptions;
mod generators;
mod numeric;
mod profiling;
