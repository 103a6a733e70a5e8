//! RAII guards over engine state. Each guard borrows the engine mutably, derefs to it, and
//! restores what it changed when dropped, including on early returns through `?`.

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use super::context::{ExhaustionBudget, ImplicitCallFlags};
use super::engine::Engine;
use crate::error::{VmError, VmResult};

/// Implicit-call tracking scope around a call into the conversion/property subsystems.
///
/// Flags are cleared on entry so [`ImplicitCallGuard::observed`] reports only what this scope
/// caused; on exit the context holds the saved flags merged with the observed ones.
pub(crate) struct ImplicitCallGuard<'a> {
    engine: &'a mut Engine,
    saved: ImplicitCallFlags,
}

impl<'a> ImplicitCallGuard<'a> {
    pub(crate) fn new(engine: &'a mut Engine) -> Self {
        let saved = engine.ctx.implicit_flags;
        engine.ctx.implicit_flags = ImplicitCallFlags::NONE;
        Self { engine, saved }
    }

    pub(crate) fn observed(&self) -> ImplicitCallFlags {
        self.engine.ctx.implicit_flags
    }
}

impl Drop for ImplicitCallGuard<'_> {
    fn drop(&mut self) {
        let observed = self.engine.ctx.implicit_flags;
        self.engine.ctx.implicit_flags = self.saved.union(observed);
    }
}

impl Deref for ImplicitCallGuard<'_> {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        self.engine
    }
}

impl DerefMut for ImplicitCallGuard<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        self.engine
    }
}

/// One level of native recursion: an interpreted call or a nested handler loop.
pub(crate) struct DepthGuard<'a> {
    engine: &'a mut Engine,
    pushed_frame: bool,
}

impl<'a> DepthGuard<'a> {
    fn enter(engine: &'a mut Engine) -> VmResult<Self> {
        if engine.ctx.depth >= engine.config.max_call_depth {
            return Err(VmError::StackOverflow);
        }
        engine.ctx.depth += 1;
        Ok(Self {
            engine,
            pushed_frame: false,
        })
    }

    /// Enter an interpreted call, recording it on the call stack.
    pub(crate) fn call(engine: &'a mut Engine, name: &Arc<str>) -> VmResult<Self> {
        let mut guard = Self::enter(engine)?;
        guard.engine.ctx.push_call_frame(Arc::clone(name));
        guard.pushed_frame = true;
        Ok(guard)
    }

    /// Enter the nested dispatch loop of a handler region.
    pub(crate) fn nested(engine: &'a mut Engine) -> VmResult<Self> {
        Self::enter(engine)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.engine.ctx.depth = self.engine.ctx.depth.saturating_sub(1);
        if self.pushed_frame {
            self.engine.ctx.pop_call_frame();
        }
    }
}

impl Deref for DepthGuard<'_> {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        self.engine
    }
}

impl DerefMut for DepthGuard<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        self.engine
    }
}

/// Bounded instruction budget for a finally body run while a resource-exhaustion error unwinds.
pub(crate) struct ExhaustionGuard<'a> {
    engine: &'a mut Engine,
    saved: Option<ExhaustionBudget>,
}

impl<'a> ExhaustionGuard<'a> {
    pub(crate) fn new(engine: &'a mut Engine, error: VmError) -> Self {
        let remaining = engine.config.exhaustion_finally_budget;
        let saved = engine.ctx.exhaustion.replace(ExhaustionBudget { error, remaining });
        Self { engine, saved }
    }
}

impl Drop for ExhaustionGuard<'_> {
    fn drop(&mut self) {
        self.engine.ctx.exhaustion = self.saved.take();
    }
}

impl Deref for ExhaustionGuard<'_> {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        self.engine
    }
}

impl DerefMut for ExhaustionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        self.engine
    }
}
