use std::sync::Arc;

use anyhow::{Result, anyhow, bail, ensure};
use rustc_hash::FxHashMap;

use super::bytecode::{NumOp, Op};
use super::encoding::{Instruction, encode_into, patch_target};
use super::function::{ClosureShape, FunctionBody, FunctionKind, LoopHeader, ScopeKind};
use super::numeric::NumericLayout;
use crate::val::Val;

/// Forward-referencable branch target. Its id is written into target operands until `build`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

struct LoopDraft {
    start: u32,
    end: Option<u32>,
    in_try: bool,
    allow_jit: bool,
}

/// Assembles a [`FunctionBody`] from instructions.
///
/// Register convention: slot 0 is the return slot, user constants start at slot 1, then the
/// parameters, the optional rest array, and temporaries. Declare every constant before asking
/// for parameter or temporary registers.
pub struct FunctionBuilder {
    name: Arc<str>,
    kind: FunctionKind,
    constants: Vec<Val>,
    names: Vec<Arc<str>>,
    name_index: FxHashMap<Arc<str>, u32>,
    param_count: u32,
    has_rest: bool,
    uses_arguments: bool,
    temps: u32,
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, u32)>,
    loops: Vec<LoopDraft>,
    for_in_count: u32,
    nested: Vec<Arc<FunctionBody>>,
    closure: ClosureShape,
    numeric: Option<NumericLayout>,
    statements: Vec<u32>,
    out_depth: u32,
    max_out_depth: u32,
    registers_handed_out: bool,
    error: Option<String>,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            kind: FunctionKind::Normal,
            constants: vec![Val::Undefined],
            names: Vec::new(),
            name_index: FxHashMap::default(),
            param_count: 0,
            has_rest: false,
            uses_arguments: false,
            temps: 0,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            loops: Vec::new(),
            for_in_count: 0,
            nested: Vec::new(),
            closure: ClosureShape::default(),
            numeric: None,
            statements: Vec::new(),
            out_depth: 0,
            max_out_depth: 0,
            registers_handed_out: false,
            error: None,
        }
    }

    pub fn kind(&mut self, kind: FunctionKind) -> &mut Self {
        self.kind = kind;
        self
    }

    pub fn params(&mut self, count: u32) -> &mut Self {
        self.param_count = count;
        self
    }

    pub fn rest(&mut self) -> &mut Self {
        self.has_rest = true;
        self
    }

    pub fn uses_arguments(&mut self) -> &mut Self {
        self.uses_arguments = true;
        self
    }

    pub fn temps(&mut self, count: u32) -> &mut Self {
        self.temps = self.temps.max(count);
        self
    }

    pub fn for_in(&mut self, count: u32) -> &mut Self {
        self.for_in_count = count;
        self
    }

    pub fn closure_shape(&mut self, shape: ClosureShape) -> &mut Self {
        self.closure = shape;
        self
    }

    pub fn scope(&mut self, kind: ScopeKind, slots: u32) -> &mut Self {
        self.closure.scope = kind;
        self.closure.scope_slots = slots;
        self
    }

    pub fn numeric(&mut self, layout: NumericLayout) -> &mut Self {
        self.kind = FunctionKind::Numeric;
        self.numeric = Some(layout);
        self
    }

    /// Register holding a new constant.
    pub fn constant(&mut self, value: impl Into<Val>) -> u32 {
        if self.registers_handed_out && self.error.is_none() {
            self.error = Some(format!(
                "function '{}': constant declared after parameter/temporary registers were assigned",
                self.name
            ));
        }
        self.constants.push(value.into());
        (self.constants.len() - 1) as u32
    }

    pub fn param_reg(&mut self, idx: u32) -> u32 {
        self.registers_handed_out = true;
        self.constants.len() as u32 + idx
    }

    pub fn rest_reg(&mut self) -> u32 {
        self.registers_handed_out = true;
        self.constants.len() as u32 + self.param_count
    }

    /// Temporary register `idx`; the temporary area grows to cover it.
    pub fn temp(&mut self, idx: u32) -> u32 {
        self.registers_handed_out = true;
        self.temps = self.temps.max(idx + 1);
        self.constants.len() as u32 + self.param_count + u32::from(self.has_rest) + idx
    }

    pub fn name(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.name_index.get(name) {
            return idx;
        }
        let key: Arc<str> = Arc::from(name);
        let idx = self.names.len() as u32;
        self.names.push(Arc::clone(&key));
        self.name_index.insert(key, idx);
        idx
    }

    pub fn nested(&mut self, body: Arc<FunctionBody>) -> u32 {
        self.nested.push(body);
        (self.nested.len() - 1) as u32
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        let offset = self.offset();
        match self.labels.get_mut(label.0 as usize) {
            Some(slot @ None) => *slot = Some(offset),
            Some(Some(_)) => self.fail(format!("label {} bound twice", label.0)),
            None => self.fail(format!("unknown label {}", label.0)),
        }
        self
    }

    /// Byte offset the next instruction will be encoded at.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Mark the next instruction as a statement boundary.
    pub fn statement(&mut self) -> &mut Self {
        let offset = self.offset();
        if self.statements.last() != Some(&offset) {
            self.statements.push(offset);
        }
        self
    }

    pub fn begin_loop(&mut self, in_try: bool, allow_jit: bool) -> u32 {
        self.loops.push(LoopDraft {
            start: self.offset(),
            end: None,
            in_try,
            allow_jit,
        });
        (self.loops.len() - 1) as u32
    }

    /// Close the loop; the current offset is where a finished native loop body resumes.
    pub fn end_loop(&mut self, loop_num: u32) -> &mut Self {
        let offset = self.offset();
        match self.loops.get_mut(loop_num as usize) {
            Some(draft) => draft.end = Some(offset),
            None => self.fail(format!("unknown loop {loop_num}")),
        }
        self
    }

    /// Encode a script instruction. Target operands carry label ids.
    pub fn emit(&mut self, op: Op) -> u32 {
        match op {
            Op::StartCall { argc } => {
                self.out_depth += argc;
                self.max_out_depth = self.max_out_depth.max(self.out_depth);
            }
            Op::Call { argc, .. } => self.out_depth = self.out_depth.saturating_sub(argc),
            _ => {}
        }
        self.encode(op)
    }

    /// Encode a numeric-dialect instruction. Target operands carry label ids.
    pub fn emit_num(&mut self, op: NumOp) -> u32 {
        self.encode(op)
    }

    fn encode<I: Instruction>(&mut self, instr: I) -> u32 {
        let offset = self.offset();
        let mut copy = instr;
        let label_ids: Vec<u32> = copy.targets_mut().into_iter().map(|t| *t).collect();
        let positions = encode_into(&mut self.code, &instr);
        self.fixups.extend(positions.into_iter().zip(label_ids));
        offset
    }

    fn fail(&mut self, msg: String) {
        if self.error.is_none() {
            self.error = Some(msg);
        }
    }

    pub fn build(&mut self) -> Result<Arc<FunctionBody>> {
        if let Some(err) = self.error.take() {
            bail!("function '{}': {err}", self.name);
        }
        let mut code = std::mem::take(&mut self.code);
        for &(pos, label) in &self.fixups {
            let target = self
                .labels
                .get(label as usize)
                .copied()
                .flatten()
                .ok_or_else(|| anyhow!("function '{}': label {label} is never bound", self.name))?;
            patch_target(&mut code, pos, target).map_err(|e| anyhow!("function '{}': {e}", self.name))?;
        }

        let mut loops = Vec::with_capacity(self.loops.len());
        for (idx, draft) in self.loops.iter().enumerate() {
            let end = draft
                .end
                .ok_or_else(|| anyhow!("function '{}': loop {idx} is never closed", self.name))?;
            ensure!(end >= draft.start, "function '{}': loop {idx} ends before it starts", self.name);
            loops.push(LoopHeader::new(draft.start, end, draft.in_try, draft.allow_jit));
        }

        if self.kind == FunctionKind::Numeric {
            ensure!(
                self.numeric.is_some(),
                "function '{}': numeric functions need a numeric layout",
                self.name
            );
        }

        let const_count = self.constants.len() as u32;
        let local_count = const_count + self.param_count + u32::from(self.has_rest) + self.temps;
        let mut statements = std::mem::take(&mut self.statements);
        statements.sort_unstable();
        statements.dedup();

        Ok(Arc::new(FunctionBody::assemble(
            Arc::clone(&self.name),
            self.kind,
            code,
            std::mem::take(&mut self.constants),
            std::mem::take(&mut self.names),
            local_count,
            self.param_count,
            self.has_rest,
            self.uses_arguments,
            self.max_out_depth,
            loops,
            self.for_in_count,
            std::mem::take(&mut self.nested),
            self.closure.clone(),
            self.numeric.take(),
            statements,
        )))
    }
}
