//! Assembly modules: a serde description of function bodies, assembled through
//! [`FunctionBuilder`]. This is the on-disk format the CLI and the benches load.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail, ensure};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::builder::{FunctionBuilder, Label};
use super::bytecode::{NumOp, Op};
use super::function::{ClosureShape, FunctionBody, FunctionKind};
use super::numeric::NumericLayout;
use crate::val::Val;

/// Constant-table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstValue {
    Null(()),
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
}

impl ConstValue {
    pub fn to_val(&self) -> Val {
        match self {
            ConstValue::Null(()) => Val::Null,
            ConstValue::Bool(b) => Val::Bool(*b),
            ConstValue::Int(i) => Val::Int(*i),
            ConstValue::Float(x) => Val::Float(*x),
            ConstValue::Str(s) => Val::str(s),
        }
    }
}

/// One line of a function's body listing.
///
/// Target operands of `op`/`num` items name labels, which `label` items bind to the offset of
/// the next instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsmItem {
    Label(u32),
    /// The next instruction starts a statement.
    Statement,
    LoopStart {
        #[serde(default)]
        in_try: bool,
        #[serde(default = "default_true")]
        allow_jit: bool,
    },
    /// Close loop `n`; the next instruction is where a finished native body resumes.
    LoopEnd(u32),
    Op(Op),
    Num(NumOp),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyFunction {
    pub name: String,
    #[serde(default)]
    pub kind: FunctionKind,
    #[serde(default)]
    pub params: u32,
    #[serde(default)]
    pub rest: bool,
    #[serde(default)]
    pub uses_arguments: bool,
    #[serde(default)]
    pub temps: u32,
    #[serde(default)]
    pub for_in: u32,
    #[serde(default)]
    pub constants: Vec<ConstValue>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub closure: ClosureShape,
    #[serde(default)]
    pub numeric: Option<NumericLayout>,
    /// Module functions this one may instantiate with `NewClosure`, by index.
    #[serde(default)]
    pub nested: Vec<String>,
    pub body: Vec<AsmItem>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssemblyModule {
    /// Function `run` calls; defaults to the first one.
    #[serde(default)]
    pub entry: Option<String>,
    pub functions: Vec<AssemblyFunction>,
}

impl AssemblyModule {
    pub fn from_json(src: &str) -> Result<Self> {
        serde_json::from_str(src).context("invalid JSON assembly module")
    }

    pub fn from_yaml(src: &str) -> Result<Self> {
        serde_yaml::from_str(src).context("invalid YAML assembly module")
    }

    /// Load by extension: `.json`, or `.yaml`/`.yml`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let src =
            std::fs::read_to_string(path).with_context(|| format!("failed to read module '{}'", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&src),
            Some("yaml" | "yml") => Self::from_yaml(&src),
            _ => bail!("unknown module format '{}' (expected .json, .yaml or .yml)", path.display()),
        }
        .with_context(|| format!("while loading '{}'", path.display()))
    }

    /// Assemble every function, nested ones before the functions that reference them.
    pub fn assemble(&self) -> Result<Program> {
        ensure!(!self.functions.is_empty(), "module declares no functions");
        let mut index = FxHashMap::default();
        for (idx, func) in self.functions.iter().enumerate() {
            ensure!(
                index.insert(func.name.as_str(), idx).is_none(),
                "function '{}' declared twice",
                func.name
            );
        }
        let mut assembler = Assembler {
            module: self,
            index,
            done: vec![None; self.functions.len()],
            in_progress: vec![false; self.functions.len()],
        };
        let mut functions = Vec::with_capacity(self.functions.len());
        for idx in 0..self.functions.len() {
            functions.push(assembler.function(idx)?);
        }
        let entry = match &self.entry {
            Some(name) => *assembler
                .index
                .get(name.as_str())
                .ok_or_else(|| anyhow!("entry function '{name}' is not declared"))?,
            None => 0,
        };
        Ok(Program { functions, entry })
    }
}

struct Assembler<'m> {
    module: &'m AssemblyModule,
    index: FxHashMap<&'m str, usize>,
    done: Vec<Option<Arc<FunctionBody>>>,
    in_progress: Vec<bool>,
}

impl Assembler<'_> {
    fn function(&mut self, idx: usize) -> Result<Arc<FunctionBody>> {
        if let Some(body) = &self.done[idx] {
            return Ok(Arc::clone(body));
        }
        let func = &self.module.functions[idx];
        ensure!(!self.in_progress[idx], "function '{}' nests itself", func.name);
        self.in_progress[idx] = true;

        let mut nested = Vec::with_capacity(func.nested.len());
        for name in &func.nested {
            let child = *self
                .index
                .get(name.as_str())
                .ok_or_else(|| anyhow!("'{}' nests unknown function '{name}'", func.name))?;
            nested.push(self.function(child)?);
        }
        let body = assemble_function(func, nested).with_context(|| format!("in function '{}'", func.name))?;
        self.in_progress[idx] = false;
        self.done[idx] = Some(Arc::clone(&body));
        Ok(body)
    }
}

fn assemble_function(func: &AssemblyFunction, nested: Vec<Arc<FunctionBody>>) -> Result<Arc<FunctionBody>> {
    let mut b = FunctionBuilder::new(&func.name);
    b.kind(func.kind)
        .params(func.params)
        .temps(func.temps)
        .for_in(func.for_in)
        .closure_shape(func.closure.clone());
    if func.rest {
        b.rest();
    }
    if func.uses_arguments {
        b.uses_arguments();
    }
    if let Some(layout) = &func.numeric {
        b.numeric(layout.clone());
    }
    for constant in &func.constants {
        b.constant(constant.to_val());
    }
    for name in &func.names {
        b.name(name);
    }
    for body in nested {
        b.nested(body);
    }

    let label_count = func
        .body
        .iter()
        .filter_map(|item| match item {
            AsmItem::Label(id) => Some(id + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    let labels: Vec<Label> = (0..label_count).map(|_| b.label()).collect();

    let mut loops = 0u32;
    for item in &func.body {
        match item {
            AsmItem::Label(id) => {
                b.bind(labels[*id as usize]);
            }
            AsmItem::Statement => {
                b.statement();
            }
            AsmItem::LoopStart { in_try, allow_jit } => {
                b.begin_loop(*in_try, *allow_jit);
                loops += 1;
            }
            AsmItem::LoopEnd(n) => {
                ensure!(*n < loops, "loop_end {n} before its loop_start");
                b.end_loop(*n);
            }
            AsmItem::Op(op) => {
                b.emit(*op);
            }
            AsmItem::Num(op) => {
                b.emit_num(*op);
            }
        }
    }
    b.build()
}

/// Assembled module.
#[derive(Debug, Clone)]
pub struct Program {
    functions: Vec<Arc<FunctionBody>>,
    entry: usize,
}

impl Program {
    pub fn entry(&self) -> &Arc<FunctionBody> {
        &self.functions[self.entry]
    }

    pub fn function(&self, name: &str) -> Option<&Arc<FunctionBody>> {
        self.functions.iter().find(|f| &*f.name == name)
    }

    pub fn functions(&self) -> &[Arc<FunctionBody>] {
        &self.functions
    }
}
