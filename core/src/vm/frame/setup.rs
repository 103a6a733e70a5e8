use std::sync::Arc;

use super::{Activation, ExecutionMode, FrameFlags, FrameLayout};
use crate::error::{VmResult, ensure_fatal};
use crate::val::{ScriptClosure, Val};
use crate::vm::alloc::AllocationRegion;
use crate::vm::context::ImplicitCallFlags;
use crate::vm::engine::Engine;
use crate::vm::function::{FunctionBody, FunctionKind};
use crate::vm::numeric::NumericSlots;
use crate::vm::scope::{FrameDisplay, LocalScope};

/// What a new activation is built for.
pub(crate) struct ActivationInit {
    pub(crate) body: Arc<FunctionBody>,
    pub(crate) function: Option<Arc<ScriptClosure>>,
    pub(crate) env: FrameDisplay,
    pub(crate) region: Option<AllocationRegion>,
    pub(crate) resuming_after_bailout: bool,
}

impl ActivationInit {
    pub(crate) fn call(body: Arc<FunctionBody>, function: Option<Arc<ScriptClosure>>, env: FrameDisplay) -> Self {
        Self {
            body,
            function,
            env,
            region: None,
            resuming_after_bailout: false,
        }
    }

    pub(crate) fn for_closure(closure: &Arc<ScriptClosure>) -> Self {
        Self::call(
            Arc::clone(&closure.body),
            Some(Arc::clone(closure)),
            closure.env.clone(),
        )
    }

    pub(crate) fn in_region(mut self, region: AllocationRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub(crate) fn resuming_after_bailout(mut self) -> Self {
        self.resuming_after_bailout = true;
        self
    }
}

/// Plan, allocate, and initialize an activation.
///
/// Slots `[0, |C|)` receive the constant table, parameters follow, missing trailing
/// parameters read as `undefined`, and the rest parameter collects the surplus.
pub(crate) fn new_activation(engine: &Engine, init: ActivationInit, args: &[Val]) -> VmResult<Activation> {
    let ActivationInit {
        body,
        function,
        env,
        region,
        resuming_after_bailout,
    } = init;
    let param_count = body.param_count as usize;
    let required = body.param_base() + body.param_count + u32::from(body.has_rest);
    ensure_fatal!(
        body.local_count >= required,
        "'{}' declares {} locals but constants and parameters need {required}",
        body.name,
        body.local_count
    );

    let layout = FrameLayout::plan(&body, args.len() as u32, resuming_after_bailout);
    let region = region.unwrap_or_else(|| engine.allocator.region_for(&layout, body.kind));
    let mut storage = engine.allocator.allocate(&layout, region)?;

    let slots = storage.slots_mut();
    slots[..body.constants.len()].clone_from_slice(&body.constants);
    let base = body.param_base() as usize;
    for (idx, slot) in slots[base..base + param_count].iter_mut().enumerate() {
        *slot = args.get(idx).cloned().unwrap_or_default();
    }
    if let Some(rest) = body.rest_reg() {
        let surplus = args.get(param_count..).map(<[Val]>::to_vec).unwrap_or_default();
        slots[rest as usize] = Val::array(surplus);
    }

    let numeric = match (&body.kind, &body.numeric) {
        (FunctionKind::Numeric, Some(layout)) => Some(NumericSlots::new(layout)?),
        _ => None,
    };

    let mut frame = Activation {
        layout,
        storage,
        numeric,
        out_sp: body.local_count,
        out_marks: Vec::new(),
        env,
        display: None,
        local_scope: LocalScope::None,
        param_scope: None,
        inner_scopes: Vec::new(),
        stack_closures: vec![None; layout.nested_closure_slots as usize],
        for_in: vec![None; layout.for_in_slots as usize],
        arguments: if body.uses_arguments { args.to_vec() } else { Vec::new() },
        loop_flags: vec![ImplicitCallFlags::NONE; body.loops.len()],
        flags: if resuming_after_bailout {
            FrameFlags::FROM_BAIL_OUT
        } else {
            FrameFlags::NONE
        },
        mode: ExecutionMode::Unprofiled,
        try_depth: 0,
        catch_depth: 0,
        finally_depth: 0,
        ip: 0,
        pending_exception: None,
        yielded: Val::Undefined,
        resume_dst: None,
        suspended_eh: Vec::new(),
        body,
        function,
    };
    frame.init_scopes();
    Ok(frame)
}
