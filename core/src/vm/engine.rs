use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use super::alloc::{AllocatorStats, FrameAllocator};
use super::bytecode::init_opcode_tables;
use super::context::ExecutionContext;
use super::debug::DebugHook;
use super::function::FunctionBody;
use super::generator::{self, GeneratorSnapshot, IteratorStep};
use super::interp::{self, BailOutRecord};
use super::jit::{JitHandle, OptimizingBackend};
use super::module::Program;
use super::scope::FrameDisplay;
use crate::config::EngineConfig;
use crate::error::{VmError, VmResult};
use crate::val::{NativeFn, ScriptClosure, Val};

/// Host handle on the frame engine: configuration, execution context, frame allocator, the
/// optional optimizing backend and the optional debug hook.
///
/// Activations are not stored here; each call owns its frame and borrows the engine.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) ctx: ExecutionContext,
    pub(crate) allocator: FrameAllocator,
    pub(crate) jit: JitHandle,
    pub(crate) debug_hook: Option<Arc<dyn DebugHook>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("depth", &self.ctx.depth)
            .field("allocator", &self.allocator.stats())
            .field("jit", &self.jit)
            .field("debug_hook", &self.debug_hook.is_some())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-facing form of an engine error; uncaught exceptions carry the chain they escaped from.
fn host_error(err: VmError) -> anyhow::Error {
    let report = match &err {
        VmError::Exception(exc) if !exc.trace.is_empty() => {
            let mut report = String::from("Call stack:");
            for (depth, name) in exc.trace.iter().enumerate().rev() {
                report.push_str(&format!("\n  #{depth} {name}"));
            }
            Some(report)
        }
        _ => None,
    };
    let err = anyhow::Error::new(err);
    match report {
        Some(report) => err.context(report),
        None => err,
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::build(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        init_opcode_tables();
        Self {
            allocator: FrameAllocator::new(&config),
            config,
            ctx: ExecutionContext::new(),
            jit: JitHandle::default(),
            debug_hook: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    pub fn set_backend(&mut self, backend: Option<Arc<dyn OptimizingBackend>>) {
        self.jit.set_backend(backend);
    }

    pub fn has_backend(&self) -> bool {
        self.jit.has_backend()
    }

    pub fn set_debug_hook(&mut self, hook: Option<Arc<dyn DebugHook>>) {
        self.debug_hook = hook;
    }

    pub fn define_global(&mut self, name: &str, value: Val) {
        self.ctx.globals.set_own(name, value.box_escaping());
    }

    pub fn define_native(&mut self, name: &str, func: NativeFn) {
        self.define_global(name, Val::native(name, func));
    }

    /// Data value of a global, if defined.
    pub fn global(&self, name: &str) -> Option<Val> {
        match self.ctx.globals.get_own(name)? {
            crate::val::Property::Data(value) => Some(value),
            crate::val::Property::Accessor { .. } => None,
        }
    }

    /// Closure over a top-level function (empty scope chain).
    pub fn instantiate(&self, body: Arc<FunctionBody>) -> Val {
        Val::Closure(ScriptClosure::new(body, FrameDisplay::empty()))
    }

    /// Call from inside the engine: native functions, accessors, and loop bodies use this.
    pub fn invoke(&mut self, callee: &Val, args: &[Val]) -> VmResult<Val> {
        interp::call_value(self, callee, args)
    }

    /// Call from the host. Uncaught exceptions come back with the call chain attached.
    pub fn call(&mut self, callee: &Val, args: &[Val]) -> Result<Val> {
        interp::call_value(self, callee, args).map_err(host_error)
    }

    pub fn call_function(&mut self, body: &Arc<FunctionBody>, args: &[Val]) -> Result<Val> {
        let closure = self.instantiate(Arc::clone(body));
        self.call(&closure, args)
            .with_context(|| format!("while calling '{}'", body.name))
    }

    /// Continue `function` in the interpreter from the state native code abandoned.
    pub fn bail_out(&mut self, function: &Val, record: BailOutRecord) -> Result<Val> {
        let Val::Closure(closure) = function else {
            bail!("bailout target is a {}, not a script function", function.type_name());
        };
        interp::bail_out(self, closure, record).map_err(host_error)
    }

    pub fn resume_generator(&mut self, generator: &Val, sent: Val) -> Result<IteratorStep> {
        let Val::Generator(gen_obj) = generator else {
            bail!("cannot resume a {}", generator.type_name());
        };
        generator::resume(self, gen_obj, sent).map_err(host_error)
    }

    pub fn snapshot_generator(&self, generator: &Val) -> Result<GeneratorSnapshot> {
        let Val::Generator(gen_obj) = generator else {
            bail!("cannot snapshot a {}", generator.type_name());
        };
        generator::snapshot(gen_obj)
    }

    /// Rebuild a suspended generator of `function` from a snapshot taken earlier.
    pub fn restore_generator(&mut self, function: &Val, snapshot: &GeneratorSnapshot) -> Result<Val> {
        let Val::Closure(closure) = function else {
            bail!("cannot restore a generator into a {}", function.type_name());
        };
        generator::restore(self, closure, snapshot)
            .with_context(|| format!("while restoring a generator of '{}'", closure.body.name))
    }

    /// Call the entry function of an assembled module.
    pub fn run_program(&mut self, program: &Program, args: &[Val]) -> Result<Val> {
        self.call_function(program.entry(), args)
    }
}
