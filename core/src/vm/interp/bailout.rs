//! Re-entering an activation mid-function: bailouts from native code and generator resumption.
//!
//! Both paths describe the handler regions that were open at the resume offset as a chain of
//! [`EhBailoutNode`]s, outermost first. Replay walks the chain, establishing each region
//! through the same nested handler loops that normal execution uses, so the frame ends up
//! with identical depth counters, flags, and unwinding behavior.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::mode::ExecMode;
use super::{BodyEntry, Pending, Step, eh, finish_call, process, select_mode};
use crate::error::{VmResult, ensure_fatal, fatal};
use crate::val::{ScriptClosure, Val};
use crate::vm::engine::Engine;
use crate::vm::frame::{Activation, ActivationInit, ForInEnumerator, FrameFlags, new_activation};
use crate::vm::function::FunctionKind;
use crate::vm::guards::DepthGuard;

/// Which part of a handler region execution was in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// The protected body.
    #[default]
    None,
    Catch,
    Finally,
}

/// One open handler region.
#[derive(Debug, Clone)]
pub struct EhBailoutNode {
    /// Zero for the outermost region.
    pub nesting_depth: u32,
    pub catch_offset: Option<u32>,
    pub finally_offset: Option<u32>,
    pub kind: HandlerKind,
    pub parent: Option<usize>,
    pub child: Option<usize>,
    /// Transfer a suspended finally body resumes when it completes.
    pub(crate) pending: Pending,
}

/// Handler regions open at a resume offset, outermost first.
#[derive(Debug, Clone, Default)]
pub struct EhBailoutData {
    nodes: Vec<EhBailoutNode>,
}

impl EhBailoutData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a region nested inside the most recently pushed one; returns its index.
    pub fn push(&mut self, kind: HandlerKind, catch_offset: Option<u32>, finally_offset: Option<u32>) -> usize {
        self.push_region(kind, catch_offset, finally_offset, Pending::None)
    }

    pub(crate) fn push_region(
        &mut self,
        kind: HandlerKind,
        catch_offset: Option<u32>,
        finally_offset: Option<u32>,
        pending: Pending,
    ) -> usize {
        let idx = self.nodes.len();
        let parent = idx.checked_sub(1);
        if let Some(p) = parent {
            self.nodes[p].child = Some(idx);
        }
        self.nodes.push(EhBailoutNode {
            nesting_depth: idx as u32,
            catch_offset,
            finally_offset,
            kind,
            parent,
            child: None,
            pending,
        });
        idx
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> Option<&EhBailoutNode> {
        self.nodes.get(idx)
    }

    pub fn nodes(&self) -> &[EhBailoutNode] {
        &self.nodes
    }

    /// Every region names the handler it needs, and links form one chain.
    pub fn validate(&self) -> VmResult<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            ensure_fatal!(
                node.parent == idx.checked_sub(1),
                "bailout region {idx} has parent {:?}",
                node.parent
            );
            let expected_child = (idx + 1 < self.nodes.len()).then_some(idx + 1);
            ensure_fatal!(
                node.child == expected_child,
                "bailout region {idx} has child {:?}",
                node.child
            );
            match node.kind {
                HandlerKind::None => ensure_fatal!(
                    node.catch_offset.is_some() != node.finally_offset.is_some(),
                    "bailout try region {idx} needs exactly one handler offset"
                ),
                HandlerKind::Catch => ensure_fatal!(
                    node.catch_offset.is_some(),
                    "bailout catch region {idx} without catch offset"
                ),
                HandlerKind::Finally => ensure_fatal!(
                    node.finally_offset.is_some(),
                    "bailout finally region {idx} without finally offset"
                ),
            }
        }
        Ok(())
    }

    /// Rebuild from the regions a generator recorded at its last yield, innermost first.
    pub(crate) fn from_suspended(regions: Vec<SuspendedRegion>) -> Self {
        let mut data = Self::new();
        for region in regions.into_iter().rev() {
            data.push_region(region.kind, region.catch_offset, region.finally_offset, region.pending);
        }
        data
    }
}

/// A handler region a generator was inside when it yielded.
#[derive(Debug, Clone)]
pub(crate) struct SuspendedRegion {
    pub(crate) kind: HandlerKind,
    pub(crate) catch_offset: Option<u32>,
    pub(crate) finally_offset: Option<u32>,
    pub(crate) pending: Pending,
}

impl SuspendedRegion {
    pub(crate) fn try_catch(catch_offset: u32) -> Self {
        Self {
            kind: HandlerKind::None,
            catch_offset: Some(catch_offset),
            finally_offset: None,
            pending: Pending::None,
        }
    }

    pub(crate) fn try_finally(finally_offset: u32) -> Self {
        Self {
            kind: HandlerKind::None,
            catch_offset: None,
            finally_offset: Some(finally_offset),
            pending: Pending::None,
        }
    }

    pub(crate) fn catch_body(catch_offset: u32) -> Self {
        Self {
            kind: HandlerKind::Catch,
            catch_offset: Some(catch_offset),
            finally_offset: None,
            pending: Pending::None,
        }
    }

    pub(crate) fn finally_body(finally_offset: u32, pending: Pending) -> Self {
        Self {
            kind: HandlerKind::Finally,
            catch_offset: None,
            finally_offset: Some(finally_offset),
            pending,
        }
    }
}

/// Machine state native code hands back when it abandons a function mid-way.
#[derive(Debug, Clone, Default)]
pub struct BailOutRecord {
    /// Byte offset interpretation resumes at.
    pub resume_offset: u32,
    /// Register values to restore, by register number.
    pub registers: Vec<(u32, Val)>,
    /// Handler regions open at `resume_offset`.
    pub eh: Option<EhBailoutData>,
    pub for_in: Vec<Option<ForInEnumerator>>,
}

/// Re-establish region `idx` of `data` around the remainder of the function.
pub(crate) fn replay_region<M: ExecMode>(
    engine: &mut Engine,
    frame: &mut Activation,
    data: &EhBailoutData,
    idx: usize,
) -> VmResult<Step> {
    let node = data
        .node(idx)
        .ok_or_else(|| fatal(format!("bailout region {idx} out of range")))?;
    debug!(
        target: "tern::vm::eh",
        function = %frame.body.name,
        depth = node.nesting_depth,
        kind = ?node.kind,
        "eh.replay_region"
    );
    let inner = match node.child {
        Some(child) => BodyEntry::Replay(data, child),
        None => {
            frame.flags.remove(FrameFlags::PROCESSING_BAIL_OUT_FROM_EH);
            BodyEntry::Dispatch
        }
    };
    match node.kind {
        HandlerKind::None => match (node.catch_offset, node.finally_offset) {
            (Some(catch), _) => eh::run_try_catch::<M>(engine, frame, catch, inner),
            (None, Some(finally)) => eh::run_try_finally::<M>(engine, frame, finally, inner),
            (None, None) => Err(fatal(format!("bailout try region {idx} has no handler"))),
        },
        HandlerKind::Catch => {
            let catch = node
                .catch_offset
                .ok_or_else(|| fatal(format!("bailout catch region {idx} without offset")))?;
            eh::run_catch_body::<M>(engine, frame, catch, inner)
        }
        HandlerKind::Finally => {
            let finally = node
                .finally_offset
                .ok_or_else(|| fatal(format!("bailout finally region {idx} without offset")))?;
            eh::run_finally_body::<M>(engine, frame, finally, node.pending.clone(), inner)
        }
    }
}

/// Rebuild an interpreter frame from a bailout record and run it to completion.
pub(crate) fn bail_out(engine: &mut Engine, closure: &Arc<ScriptClosure>, record: BailOutRecord) -> VmResult<Val> {
    let BailOutRecord {
        resume_offset,
        registers,
        eh,
        for_in,
    } = record;
    let body = Arc::clone(&closure.body);
    ensure_fatal!(
        body.kind == FunctionKind::Normal,
        "bailout into {:?} function '{}'",
        body.kind,
        body.name
    );
    ensure_fatal!(
        (resume_offset as usize) < body.code.len(),
        "bailout offset {resume_offset} outside '{}'",
        body.name
    );
    ensure_fatal!(
        for_in.len() <= body.for_in_count as usize,
        "bailout carries {} enumerators, '{}' declares {}",
        for_in.len(),
        body.name,
        body.for_in_count
    );

    let call_count = body.record_call();
    let mut engine = DepthGuard::call(engine, &body.name)?;
    let init = ActivationInit::for_closure(closure).resuming_after_bailout();
    let mut frame = new_activation(&engine, init, &[])?;
    for (reg, value) in registers {
        frame.set_reg(reg, value.box_escaping())?;
    }
    // enumerators come from the record, not from the planned frame
    frame.for_in = for_in;
    frame.for_in.resize(body.for_in_count as usize, None);
    frame.ip = resume_offset;
    frame.mode = select_mode(&engine, call_count);

    let eh = eh.filter(|data| !data.is_empty());
    debug!(
        target: "tern::vm::eh",
        function = %body.name,
        resume_offset,
        regions = eh.as_ref().map_or(0, EhBailoutData::depth),
        "eh.bailout"
    );
    let completion = match &eh {
        Some(data) => {
            data.validate()?;
            frame.flags.insert(FrameFlags::PROCESSING_BAIL_OUT_FROM_EH);
            process(&mut engine, &mut frame, BodyEntry::Replay(data, 0))?
        }
        None => process(&mut engine, &mut frame, BodyEntry::Dispatch)?,
    };
    finish_call(&frame, completion)
}
