//! Boundary to the optimizing backend: loop-body compilation requests and native entry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::engine::Engine;
use super::frame::Activation;
use super::function::{FunctionBody, FunctionId};
use super::numeric::NumericSlots;
use super::scope::{FrameDisplay, Scope, ScopeSlots};
use crate::error::{VmResult, ensure_fatal, fatal};
use crate::val::Val;

/// Produces native loop bodies. Implementations may compile synchronously or decline.
pub trait OptimizingBackend: Send + Sync {
    fn compile_loop_body(&self, body: &FunctionBody, loop_num: u32) -> Option<Arc<dyn NativeLoopBody>>;
}

/// Natively compiled loop body.
///
/// Returns the byte offset to resume interpreting at: `0` when the loop finished, any other
/// value when the native code bailed out mid-loop.
pub trait NativeLoopBody: Send + Sync {
    fn execute(&self, frame: &mut LoopBodyFrame<'_>, engine: &mut Engine) -> VmResult<u32>;
}

/// Closure registers projected for native code.
#[derive(Debug, Clone)]
pub struct ClosureRegisters {
    /// Boxed local scope, if the function has one.
    pub local_scope: Option<Scope>,
    pub param_scope: Option<Arc<ScopeSlots>>,
    /// Chain captured by the running closure.
    pub env: FrameDisplay,
    pub inner_scopes: Vec<Option<Arc<ScopeSlots>>>,
}

impl ClosureRegisters {
    pub(crate) fn project(frame: &mut Activation) -> Self {
        Self {
            local_scope: frame.local_scope_handle(),
            param_scope: frame.param_scope.clone(),
            env: frame.env.clone(),
            inner_scopes: frame.inner_scopes.clone(),
        }
    }
}

/// Register view handed to a native loop body.
///
/// Numeric-dialect frames also expose their typed slots; script frames have none.
pub struct LoopBodyFrame<'a> {
    pub loop_num: u32,
    pub closure: ClosureRegisters,
    regs: &'a mut [Val],
    numeric: Option<&'a mut NumericSlots>,
    const_count: u32,
}

impl<'a> LoopBodyFrame<'a> {
    pub(crate) fn new(regs: &'a mut [Val], const_count: u32, loop_num: u32, closure: ClosureRegisters) -> Self {
        Self {
            loop_num,
            closure,
            regs,
            numeric: None,
            const_count,
        }
    }

    pub(crate) fn with_numeric(mut self, slots: Option<&'a mut NumericSlots>) -> Self {
        self.numeric = slots;
        self
    }

    /// Typed slots of a numeric-dialect activation.
    pub fn numeric(&mut self) -> VmResult<&mut NumericSlots> {
        self.numeric
            .as_deref_mut()
            .ok_or_else(|| fatal(format!("loop {} has no numeric slots", self.loop_num)))
    }

    pub fn reg(&self, r: u32) -> VmResult<Val> {
        ensure_fatal!((r as usize) < self.regs.len(), "native loop read of r{r} out of range");
        Ok(self.regs[r as usize].clone())
    }

    pub fn set_reg(&mut self, r: u32, value: Val) -> VmResult<()> {
        ensure_fatal!(
            r == 0 || r >= self.const_count,
            "native loop write to constant slot r{r}"
        );
        ensure_fatal!((r as usize) < self.regs.len(), "native loop write of r{r} out of range");
        self.regs[r as usize] = value.box_escaping();
        Ok(())
    }

    pub fn reg_count(&self) -> u32 {
        self.regs.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompileState {
    Requested,
    Compiled,
    Declined,
}

/// Engine-side handle on the backend, de-duplicating compile requests.
#[derive(Clone, Default)]
pub(crate) struct JitHandle {
    backend: Option<Arc<dyn OptimizingBackend>>,
    requests: Arc<DashMap<(FunctionId, u32), CompileState>>,
}

impl JitHandle {
    pub(crate) fn set_backend(&mut self, backend: Option<Arc<dyn OptimizingBackend>>) {
        self.backend = backend;
    }

    pub(crate) fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Ask for native code for one loop, at most once per loop.
    pub(crate) fn request_loop_body(&self, body: &FunctionBody, loop_num: u32) {
        let Some(backend) = &self.backend else {
            return;
        };
        match self.requests.entry((body.id, loop_num)) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(CompileState::Requested);
            }
        }
        debug!(
            target: "tern::vm::jit",
            function = %body.name,
            loop_num,
            "jit.compile_request"
        );
        let state = match (backend.compile_loop_body(body, loop_num), body.loop_header(loop_num)) {
            (Some(native), Some(header)) => {
                header.install_native(native);
                CompileState::Compiled
            }
            _ => CompileState::Declined,
        };
        debug!(
            target: "tern::vm::jit",
            function = %body.name,
            loop_num,
            state = ?state,
            "jit.compile_done"
        );
        self.requests.insert((body.id, loop_num), state);
    }

    pub(crate) fn state(&self, id: FunctionId, loop_num: u32) -> Option<CompileState> {
        self.requests.get(&(id, loop_num)).map(|s| *s)
    }
}

impl std::fmt::Debug for JitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitHandle")
            .field("backend", &self.backend.is_some())
            .field("requests", &self.requests.len())
            .finish()
    }
}
