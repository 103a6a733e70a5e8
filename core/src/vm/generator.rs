//! Generator objects: heap-resident activations that suspend at `Yield` and resume later,
//! possibly inside open handler regions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::alloc::AllocationRegion;
use super::context::ImplicitCallFlags;
use super::engine::Engine;
use super::frame::{Activation, ActivationInit, ForInEnumerator, FrameFlags, new_activation};
use super::guards::DepthGuard;
use super::interp::{
    BodyEntry, Completion, EhBailoutData, HandlerKind, Pending, SuspendedRegion, process, select_mode,
};
use super::scope::{LocalScope, Scope, ScopeSlots};
use crate::error::{VmError, VmResult, fatal};
use crate::val::{PlainObject, ScriptClosure, SnapshotValue, Val};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorStatus {
    /// Created, body not entered yet.
    SuspendedStart,
    SuspendedYield,
    Running,
    Completed,
}

#[derive(Debug)]
struct GeneratorState {
    status: GeneratorStatus,
    frame: Option<Box<Activation>>,
}

/// A generator instance. Owns its activation between resumptions.
#[derive(Debug)]
pub struct GeneratorObject {
    state: Mutex<GeneratorState>,
}

impl GeneratorObject {
    fn new(status: GeneratorStatus, frame: Option<Activation>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GeneratorState {
                status,
                frame: frame.map(Box::new),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GeneratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> GeneratorStatus {
        self.lock().status
    }

    /// Name of the generator function, while the generator still owns a frame.
    pub fn function_name(&self) -> Option<Arc<str>> {
        self.lock().frame.as_ref().map(|f| Arc::clone(&f.body.name))
    }
}

/// Result of one resumption.
#[derive(Debug, Clone, PartialEq)]
pub struct IteratorStep {
    pub value: Val,
    pub done: bool,
}

impl IteratorStep {
    /// `{ value, done }` as a script object.
    pub fn into_result_object(self) -> Val {
        let obj = PlainObject::new();
        obj.set_own("value", self.value);
        obj.set_own("done", Val::Bool(self.done));
        Val::Object(obj)
    }
}

/// Calling a generator function builds its frame on the heap and returns the generator.
pub(crate) fn create(engine: &mut Engine, closure: &Arc<ScriptClosure>, args: &[Val]) -> VmResult<Val> {
    let init = ActivationInit::for_closure(closure).in_region(AllocationRegion::Heap);
    let frame = new_activation(engine, init, args)?;
    debug!(
        target: "tern::vm::alloc",
        function = %closure.body.name,
        slots = frame.layout().total_slots(),
        "generator.create"
    );
    Ok(Val::Generator(GeneratorObject::new(GeneratorStatus::SuspendedStart, Some(frame))))
}

/// Run the generator until its next yield or its end.
///
/// `sent` becomes the value of the `Yield` the generator is suspended at.
pub(crate) fn resume(engine: &mut Engine, generator: &Arc<GeneratorObject>, sent: Val) -> VmResult<IteratorStep> {
    let mut frame = {
        let mut state = generator.lock();
        match state.status {
            GeneratorStatus::Running => return Err(engine.ctx.throw_static(&engine.ctx.library.generator_running)),
            GeneratorStatus::Completed => {
                return Ok(IteratorStep {
                    value: Val::Undefined,
                    done: true,
                });
            }
            GeneratorStatus::SuspendedStart | GeneratorStatus::SuspendedYield => {}
        }
        let frame = state
            .frame
            .take()
            .ok_or_else(|| fatal("suspended generator without a frame"))?;
        state.status = GeneratorStatus::Running;
        frame
    };

    let outcome = run_to_suspension(engine, &mut frame, sent);

    let mut state = generator.lock();
    match outcome {
        Ok(Completion::Yield) => {
            let value = std::mem::take(&mut frame.yielded);
            state.status = GeneratorStatus::SuspendedYield;
            state.frame = Some(frame);
            Ok(IteratorStep { value, done: false })
        }
        Ok(Completion::Return) => {
            state.status = GeneratorStatus::Completed;
            Ok(IteratorStep {
                value: frame.return_value(),
                done: true,
            })
        }
        Ok(other) => {
            state.status = GeneratorStatus::Completed;
            Err(fatal(format!("generator '{}' stopped with {other:?}", frame.body.name)))
        }
        Err(err) => {
            state.status = GeneratorStatus::Completed;
            Err(err)
        }
    }
}

fn run_to_suspension(engine: &mut Engine, frame: &mut Activation, sent: Val) -> VmResult<Completion> {
    let call_count = frame.body.record_call();
    let mut engine = DepthGuard::call(engine, &frame.body.name)?;
    if let Some(dst) = frame.resume_dst.take() {
        frame.set_reg(dst, sent.box_escaping())?;
    }
    frame.mode = select_mode(&engine, call_count);

    let regions = std::mem::take(&mut frame.suspended_eh);
    debug!(
        target: "tern::vm::eh",
        function = %frame.body.name,
        ip = frame.ip,
        regions = regions.len(),
        "generator.resume"
    );
    if regions.is_empty() {
        return process(&mut engine, frame, BodyEntry::Dispatch);
    }
    let data = EhBailoutData::from_suspended(regions);
    data.validate()?;
    frame.flags.insert(FrameFlags::PROCESSING_BAIL_OUT_FROM_EH);
    process(&mut engine, frame, BodyEntry::Replay(&data, 0))
}

/// Storage image of the local scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeSnapshot {
    Slots(Vec<SnapshotValue>),
    Object(Vec<(String, SnapshotValue)>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PendingSnapshot {
    None,
    Jump(u32),
    Return(SnapshotValue),
    Throw(SnapshotValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub kind: HandlerKind,
    pub catch_offset: Option<u32>,
    pub finally_offset: Option<u32>,
    pub pending: PendingSnapshot,
}

/// Serializable image of a suspended generator.
///
/// Restoring against the same function yields a generator whose snapshot is equal to this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSnapshot {
    pub function: String,
    pub status: GeneratorStatus,
    pub ip: u32,
    /// Slots `[0, local_count)`.
    pub registers: Vec<SnapshotValue>,
    pub arguments: Vec<SnapshotValue>,
    pub local_scope: Option<ScopeSnapshot>,
    pub param_scope: Option<Vec<SnapshotValue>>,
    pub inner_scopes: Vec<Option<Vec<SnapshotValue>>>,
    pub display_built: bool,
    pub for_in: Vec<Option<ForInEnumerator>>,
    pub loop_counts: Vec<u32>,
    pub loop_flags: Vec<u8>,
    pub frame_flags: u16,
    pub resume_dst: Option<u32>,
    /// Handler regions open at the yield, innermost first.
    pub regions: Vec<RegionSnapshot>,
}

fn capture_all(values: &[Val]) -> Result<Vec<SnapshotValue>> {
    values.iter().map(SnapshotValue::capture).collect()
}

fn restore_all(values: &[SnapshotValue]) -> Vec<Val> {
    values.iter().map(SnapshotValue::restore).collect()
}

fn capture_pending(pending: &Pending) -> Result<PendingSnapshot> {
    Ok(match pending {
        Pending::None => PendingSnapshot::None,
        Pending::Jump(target) => PendingSnapshot::Jump(*target),
        Pending::Return(value) => PendingSnapshot::Return(SnapshotValue::capture(value)?),
        Pending::Throw(VmError::Exception(exc)) => PendingSnapshot::Throw(SnapshotValue::capture(&exc.value)?),
        Pending::Throw(other) => bail!("pending '{other}' cannot be snapshotted"),
    })
}

fn restore_pending(engine: &Engine, pending: &PendingSnapshot) -> Pending {
    match pending {
        PendingSnapshot::None => Pending::None,
        PendingSnapshot::Jump(target) => Pending::Jump(*target),
        PendingSnapshot::Return(value) => Pending::Return(value.restore()),
        PendingSnapshot::Throw(value) => Pending::Throw(engine.ctx.exception(value.restore())),
    }
}

fn capture_local_scope(scope: &LocalScope) -> Result<Option<ScopeSnapshot>> {
    Ok(match scope {
        LocalScope::None => None,
        LocalScope::Stack(slots) => Some(ScopeSnapshot::Slots(capture_all(slots)?)),
        LocalScope::Heap(Scope::Slots(slots)) => Some(ScopeSnapshot::Slots(capture_all(&slots.to_vec())?)),
        LocalScope::Heap(Scope::Object(obj)) => {
            match SnapshotValue::capture(&Val::Object(Arc::clone(obj)))? {
                SnapshotValue::Object(entries) => Some(ScopeSnapshot::Object(entries)),
                _ => bail!("object scope captured as a non-object"),
            }
        }
    })
}

pub(crate) fn snapshot(generator: &GeneratorObject) -> Result<GeneratorSnapshot> {
    let state = generator.lock();
    ensure!(
        state.status != GeneratorStatus::Running,
        "a running generator cannot be snapshotted"
    );
    let Some(frame) = state.frame.as_deref() else {
        bail!("a completed generator has no frame to snapshot");
    };
    let body = &frame.body;
    ensure!(
        frame.out_marks.is_empty(),
        "generator '{}' suspended with open call arguments",
        body.name
    );

    let locals = frame
        .storage
        .slots()
        .get(..body.local_count as usize)
        .ok_or_else(|| anyhow!("frame of '{}' is smaller than its locals", body.name))?;
    Ok(GeneratorSnapshot {
        function: body.name.to_string(),
        status: state.status,
        ip: frame.ip,
        registers: capture_all(locals).with_context(|| format!("registers of '{}'", body.name))?,
        arguments: capture_all(&frame.arguments)?,
        local_scope: capture_local_scope(&frame.local_scope)?,
        param_scope: frame
            .param_scope
            .as_ref()
            .map(|slots| capture_all(&slots.to_vec()))
            .transpose()?,
        inner_scopes: frame
            .inner_scopes
            .iter()
            .map(|scope| scope.as_ref().map(|slots| capture_all(&slots.to_vec())).transpose())
            .collect::<Result<_>>()?,
        display_built: frame.display.is_some(),
        for_in: frame.for_in.clone(),
        loop_counts: body.loops.iter().map(|header| header.interpret_count()).collect(),
        loop_flags: frame.loop_flags.iter().map(|flags| flags.bits()).collect(),
        frame_flags: frame.flags.bits(),
        resume_dst: frame.resume_dst,
        regions: frame
            .suspended_eh
            .iter()
            .map(|region| {
                Ok(RegionSnapshot {
                    kind: region.kind,
                    catch_offset: region.catch_offset,
                    finally_offset: region.finally_offset,
                    pending: capture_pending(&region.pending)?,
                })
            })
            .collect::<Result<_>>()?,
    })
}

/// Rebuild a suspended generator of `closure` from a snapshot.
pub(crate) fn restore(engine: &Engine, closure: &Arc<ScriptClosure>, snap: &GeneratorSnapshot) -> Result<Val> {
    let body = &closure.body;
    ensure!(body.is_generator(), "'{}' is not a generator function", body.name);
    ensure!(
        *body.name == *snap.function,
        "snapshot of '{}' cannot restore into '{}'",
        snap.function,
        body.name
    );
    ensure!(
        matches!(snap.status, GeneratorStatus::SuspendedStart | GeneratorStatus::SuspendedYield),
        "snapshot status {:?} is not resumable",
        snap.status
    );
    ensure!(
        snap.registers.len() == body.local_count as usize,
        "snapshot carries {} registers, '{}' has {}",
        snap.registers.len(),
        body.name,
        body.local_count
    );
    ensure!(
        snap.loop_counts.len() == body.loops.len() && snap.loop_flags.len() == body.loops.len(),
        "snapshot loop tables do not match '{}'",
        body.name
    );
    ensure!(
        snap.for_in.len() == body.for_in_count as usize,
        "snapshot carries {} enumerators, '{}' declares {}",
        snap.for_in.len(),
        body.name,
        body.for_in_count
    );
    ensure!(
        snap.inner_scopes.len() == body.closure.inner_scopes as usize,
        "snapshot inner scope count does not match '{}'",
        body.name
    );
    ensure!((snap.ip as usize) < body.code.len(), "snapshot ip {} outside '{}'", snap.ip, body.name);

    let init = ActivationInit::for_closure(closure).in_region(AllocationRegion::Heap);
    let arguments = restore_all(&snap.arguments);
    let mut frame = new_activation(engine, init, &arguments)?;

    for (slot, value) in frame.storage.slots_mut().iter_mut().zip(&snap.registers) {
        *slot = value.restore();
    }
    frame.arguments = arguments;
    frame.local_scope = match &snap.local_scope {
        None => LocalScope::None,
        Some(ScopeSnapshot::Slots(values)) => LocalScope::Heap(Scope::Slots(ScopeSlots::from_vec(restore_all(values)))),
        Some(ScopeSnapshot::Object(entries)) => {
            let obj = PlainObject::new();
            for (name, value) in entries {
                obj.set_own(name, value.restore());
            }
            LocalScope::Heap(Scope::Object(obj))
        }
    };
    frame.param_scope = snap.param_scope.as_deref().map(|v| ScopeSlots::from_vec(restore_all(v)));
    frame.inner_scopes = snap
        .inner_scopes
        .iter()
        .map(|scope| scope.as_deref().map(|v| ScopeSlots::from_vec(restore_all(v))))
        .collect();
    frame.display = None;
    if snap.display_built {
        frame.ensure_display();
    }
    frame.for_in = snap.for_in.clone();
    frame.loop_flags = snap.loop_flags.iter().map(|bits| ImplicitCallFlags::from_bits(*bits)).collect();
    frame.flags = FrameFlags::from_bits(snap.frame_flags);
    frame.ip = snap.ip;
    frame.resume_dst = snap.resume_dst;
    frame.suspended_eh = snap
        .regions
        .iter()
        .map(|region| SuspendedRegion {
            kind: region.kind,
            catch_offset: region.catch_offset,
            finally_offset: region.finally_offset,
            pending: restore_pending(engine, &region.pending),
        })
        .collect();
    for (header, count) in body.loops.iter().zip(&snap.loop_counts) {
        header.restore_count(*count);
    }

    debug!(
        target: "tern::vm::alloc",
        function = %body.name,
        ip = snap.ip,
        regions = snap.regions.len(),
        "generator.restore"
    );
    Ok(Val::Generator(GeneratorObject::new(snap.status, Some(frame))))
}
