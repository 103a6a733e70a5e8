//! Closure/scope chain materialization.
//!
//! A function that exposes locals to nested functions gets a local scope: a flat slot array or
//! a property-keyed object. The frame display is the local scope prepended to the chain the
//! callee closure captured. Stack-resident slot arrays are moved to the heap before anything
//! captures the display.

use std::sync::{Arc, RwLock};

use tracing::trace;

use super::frame::Activation;
use super::function::ScopeKind;
use crate::error::{VmResult, ensure_fatal, fatal};
use crate::val::{PlainObject, ScriptClosure, Val, read_lock, write_lock};

/// Heap-resident scope slot array.
#[derive(Debug, Default)]
pub struct ScopeSlots {
    slots: RwLock<Vec<Val>>,
}

impl ScopeSlots {
    pub fn new(len: u32) -> Arc<Self> {
        Self::from_vec(vec![Val::Undefined; len as usize])
    }

    pub fn from_vec(slots: Vec<Val>) -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new(slots),
        })
    }

    pub fn len(&self) -> usize {
        read_lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: u32) -> VmResult<Val> {
        read_lock(&self.slots)
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| fatal(format!("scope slot {idx} out of range")))
    }

    pub fn set(&self, idx: u32, value: Val) -> VmResult<()> {
        let mut slots = write_lock(&self.slots);
        let slot = slots
            .get_mut(idx as usize)
            .ok_or_else(|| fatal(format!("scope slot {idx} out of range")))?;
        *slot = value;
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<Val> {
        read_lock(&self.slots).clone()
    }
}

/// One enclosing scope.
#[derive(Debug, Clone)]
pub enum Scope {
    Slots(Arc<ScopeSlots>),
    Object(Arc<PlainObject>),
}

impl Scope {
    pub fn slots(&self) -> VmResult<&Arc<ScopeSlots>> {
        match self {
            Scope::Slots(s) => Ok(s),
            Scope::Object(_) => Err(fatal("slot access on an object scope")),
        }
    }

    pub fn object(&self) -> VmResult<&Arc<PlainObject>> {
        match self {
            Scope::Object(o) => Ok(o),
            Scope::Slots(_) => Err(fatal("property access on a slot scope")),
        }
    }
}

/// Ordered enclosing scopes, innermost first. Immutable once built.
#[derive(Debug, Clone)]
pub struct FrameDisplay(Arc<[Scope]>);

impl Default for FrameDisplay {
    fn default() -> Self {
        Self::empty()
    }
}

impl FrameDisplay {
    pub fn empty() -> Self {
        FrameDisplay(Arc::from(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, depth: u32) -> Option<&Scope> {
        self.0.get(depth as usize)
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.0
    }

    /// New chain with `scope` as the innermost entry; `self` is left untouched.
    pub fn prepend(&self, scope: Scope) -> Self {
        let mut scopes = Vec::with_capacity(self.0.len() + 1);
        scopes.push(scope);
        scopes.extend(self.0.iter().cloned());
        FrameDisplay(Arc::from(scopes))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Storage state of an activation's own scope.
#[derive(Debug)]
pub(crate) enum LocalScope {
    None,
    /// Slots still owned by the frame.
    Stack(Vec<Val>),
    Heap(Scope),
}

impl Activation {
    /// Scope setup at function entry.
    pub(crate) fn init_scopes(&mut self) {
        let shape = self.body.closure.clone();
        self.param_scope = (shape.param_scope_slots > 0).then(|| ScopeSlots::new(shape.param_scope_slots));
        self.inner_scopes = vec![None; shape.inner_scopes as usize];
        if self.param_scope.is_none() {
            self.local_scope = new_local_scope(self);
        }
        let needs_chain = shape.needs_display || shape.scope != ScopeKind::None || self.param_scope.is_some();
        if shape.eager_chain && needs_chain {
            self.ensure_display();
        }
    }

    /// Parameter initialization finished; the body scope becomes the innermost scope.
    pub(crate) fn param_scope_done(&mut self) -> VmResult<()> {
        ensure_fatal!(
            self.param_scope.is_some(),
            "ParamScopeDone in '{}' without a parameter scope",
            self.body.name
        );
        ensure_fatal!(
            matches!(self.local_scope, LocalScope::None),
            "ParamScopeDone executed twice in '{}'",
            self.body.name
        );
        self.local_scope = new_local_scope(self);
        let had_display = self.display.take().is_some();
        if had_display || self.body.closure.eager_chain {
            self.ensure_display();
        }
        Ok(())
    }

    /// Move stack-resident local slots to the heap.
    pub(crate) fn box_local_scope(&mut self) {
        if let LocalScope::Stack(slots) = &mut self.local_scope {
            let slots = std::mem::take(slots);
            trace!(
                target: "tern::vm::alloc",
                function = %self.body.name,
                slots = slots.len(),
                "scope.box_local"
            );
            self.local_scope = LocalScope::Heap(Scope::Slots(ScopeSlots::from_vec(slots)));
        }
    }

    /// The chain nested functions capture, built on first use.
    pub(crate) fn ensure_display(&mut self) -> FrameDisplay {
        if let Some(display) = &self.display {
            return display.clone();
        }
        self.box_local_scope();
        let mut display = self.env.clone();
        if let Some(param) = &self.param_scope {
            display = display.prepend(Scope::Slots(Arc::clone(param)));
        }
        if let LocalScope::Heap(scope) = &self.local_scope {
            display = display.prepend(scope.clone());
        }
        self.display = Some(display.clone());
        display
    }

    pub(crate) fn local_slot(&self, idx: u32) -> VmResult<Val> {
        match &self.local_scope {
            LocalScope::Stack(slots) => slots
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| fatal(format!("local scope slot {idx} out of range"))),
            LocalScope::Heap(scope) => scope.slots()?.get(idx),
            LocalScope::None => Err(fatal(format!("'{}' has no local scope", self.body.name))),
        }
    }

    pub(crate) fn set_local_slot(&mut self, idx: u32, value: Val) -> VmResult<()> {
        match &mut self.local_scope {
            LocalScope::Stack(slots) => {
                let slot = slots
                    .get_mut(idx as usize)
                    .ok_or_else(|| fatal(format!("local scope slot {idx} out of range")))?;
                *slot = value;
                Ok(())
            }
            LocalScope::Heap(scope) => scope.slots()?.set(idx, value),
            LocalScope::None => Err(fatal(format!("'{}' has no local scope", self.body.name))),
        }
    }

    pub(crate) fn local_object(&self) -> VmResult<Arc<PlainObject>> {
        match &self.local_scope {
            LocalScope::Heap(scope) => scope.object().cloned(),
            _ => Err(fatal(format!("'{}' has no object scope", self.body.name))),
        }
    }

    /// Boxed form of the local scope, if any.
    pub(crate) fn local_scope_handle(&mut self) -> Option<Scope> {
        self.box_local_scope();
        match &self.local_scope {
            LocalScope::Heap(scope) => Some(scope.clone()),
            _ => None,
        }
    }

    pub(crate) fn env_scope(&self, depth: u32) -> VmResult<&Scope> {
        self.env
            .get(depth)
            .ok_or_else(|| fatal(format!("scope depth {depth} exceeds chain length {}", self.env.len())))
    }

    pub(crate) fn param_slots(&self) -> VmResult<&Arc<ScopeSlots>> {
        self.param_scope
            .as_ref()
            .ok_or_else(|| fatal(format!("'{}' has no parameter scope", self.body.name)))
    }

    pub(crate) fn new_inner_scope(&mut self, index: u32, size: u32) -> VmResult<()> {
        let slot = self
            .inner_scopes
            .get_mut(index as usize)
            .ok_or_else(|| fatal(format!("inner scope {index} out of range")))?;
        *slot = Some(ScopeSlots::new(size));
        Ok(())
    }

    pub(crate) fn inner_scope(&self, index: u32) -> VmResult<&Arc<ScopeSlots>> {
        self.inner_scopes
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| fatal(format!("inner scope {index} is not initialized")))
    }

    /// Create a closure over nested function `func_idx`, capturing the frame display.
    pub(crate) fn new_closure(&mut self, func_idx: u32, stack: bool) -> VmResult<Val> {
        let body = self
            .body
            .nested
            .get(func_idx as usize)
            .cloned()
            .ok_or_else(|| fatal(format!("nested function {func_idx} out of range")))?;
        let env = self.ensure_display();
        if !stack {
            return Ok(Val::Closure(ScriptClosure::new(body, env)));
        }
        let closure = ScriptClosure::new_stack(body, env);
        if let Some(slot) = self.stack_closures.get_mut(func_idx as usize) {
            *slot = Some(Arc::clone(&closure));
        }
        Ok(Val::Closure(closure))
    }
}

fn new_local_scope(frame: &Activation) -> LocalScope {
    let shape = &frame.body.closure;
    match shape.scope {
        ScopeKind::None => LocalScope::None,
        ScopeKind::Slots if shape.stack_scope => {
            LocalScope::Stack(vec![Val::Undefined; shape.scope_slots as usize])
        }
        ScopeKind::Slots => LocalScope::Heap(Scope::Slots(ScopeSlots::new(shape.scope_slots))),
        ScopeKind::Object => LocalScope::Heap(Scope::Object(PlainObject::new())),
    }
}
