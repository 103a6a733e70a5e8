use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Once};

static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str =
    "tern::vm::alloc=info,tern::vm::jit=debug,tern::vm::eh=debug,tern::vm::mode=debug,tern_core=info,tern_cli=info";

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tern_core::{
    Engine, EngineConfig,
    val::Val,
    vm::{
        AssemblyModule, ConstValue, DebugHook, ExceptionAction, FunctionBody, FunctionKind, NumOp, Op, Program,
        StepAction, StepInfo, disassemble,
    },
};


#[derive(Debug, Parser)]
#[command(
    name = "tern",
    author,
    version,
    about = "Run and inspect tern assembly modules",
    long_about = None
)]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Assembly module (.json, .yaml or .yml)
    #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
    file: PathBuf,
    /// Engine configuration (TOML)
    #[arg(long, value_name = "PATH", value_parser = parse_sanitized_path)]
    config: Option<PathBuf>,
    /// Argument passed to the called function, as a JSON scalar; repeatable
    #[arg(long = "arg", value_name = "JSON")]
    args: Vec<String>,
    /// Call this function instead of the module entry
    #[arg(long)]
    function: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Assemble a module and call its entry function, printing the result.
    Run(RunArgs),
    /// Run under the debugging loop, printing every executed instruction as a JSON line.
    Trace(RunArgs),
    /// Print the decoded instruction stream of each function.
    Disasm {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
        /// Only this function
        #[arg(long)]
        function: Option<String>,
    },
}

fn sanitize_path(raw: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(raw);

    for comp in p.components() {
        if matches!(comp, Component::ParentDir) {
            return Err(anyhow::anyhow!(
                "Parent directory components ('..') are not allowed in file paths."
            ));
        }
    }

    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    !(trimmed.eq_ignore_ascii_case("0") || trimmed.eq_ignore_ascii_case("false") || trimmed.eq_ignore_ascii_case("off"))
}

fn filter_expr_from(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("1")
        || trimmed.eq_ignore_ascii_case("true")
        || trimmed.eq_ignore_ascii_case("on")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn maybe_init_tracing() {
    let raw = match std::env::var("TERN_TRACE") {
        Ok(value) => value,
        Err(_) => return,
    };

    if !env_toggle_enabled(&raw) {
        return;
    }

    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter_expr = filter_expr_from(&raw).or_else(|| std::env::var("RUST_LOG").ok());

        let builder = fmt().with_writer(std::io::stderr);

        let builder = match filter_expr.and_then(|expr| EnvFilter::try_new(expr).ok()) {
            Some(filter) => builder.with_env_filter(filter),
            None => builder.with_env_filter(DEFAULT_TRACE_FILTER),
        };

        let _ = builder.try_init();
    });
}

/// A JSON scalar becomes the matching value; anything else is passed as a string.
pub(crate) fn parse_arg(raw: &str) -> Val {
    serde_json::from_str::<ConstValue>(raw)
        .map(|value| value.to_val())
        .unwrap_or_else(|_| Val::str(raw))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

fn load_program(path: &Path) -> anyhow::Result<Program> {
    AssemblyModule::from_path(path)?
        .assemble()
        .with_context(|| format!("failed to assemble '{}'", path.display()))
}

pub(crate) fn select_function<'p>(program: &'p Program, name: Option<&str>) -> anyhow::Result<&'p Arc<FunctionBody>> {
    match name {
        Some(name) => program
            .function(name)
            .ok_or_else(|| anyhow::anyhow!("no function named '{name}' in module")),
        None => Ok(program.entry()),
    }
}

/// Every module function is reachable by name through `LdRoot`.
fn define_module_globals(engine: &mut Engine, program: &Program) {
    for body in program.functions() {
        let function = engine.instantiate(Arc::clone(body));
        engine.define_global(&body.name, function);
    }
}

/// Prints each step as one JSON line on stdout and each exception on stderr.
struct JsonStepHook;

impl DebugHook for JsonStepHook {
    fn on_step(&self, info: &StepInfo) -> StepAction {
        if let Ok(line) = serde_json::to_string(info) {
            println!("{line}");
        }
        StepAction::Continue
    }

    fn on_exception(&self, info: &StepInfo, value: &Val) -> ExceptionAction {
        eprintln!("exception in {} at {}: {value}", info.function, info.offset);
        ExceptionAction::Propagate
    }
}

fn run(args: RunArgs, trace: bool) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if trace {
        config.debug_mode = true;
    }
    let program = load_program(&args.file)?;
    let body = select_function(&program, args.function.as_deref())?;
    let call_args: Vec<Val> = args.args.iter().map(|raw| parse_arg(raw)).collect();

    tracing::debug!(target: "tern_cli", function = %body.name, args = call_args.len(), trace, "cli.run");
    let mut engine = Engine::with_config(config)?;
    define_module_globals(&mut engine, &program);
    if trace {
        engine.set_debug_hook(Some(Arc::new(JsonStepHook)));
    }
    let result = engine.call_function(body, &call_args)?;
    if trace {
        eprintln!("result: {result}");
    } else {
        println!("{result}");
    }
    Ok(())
}

pub(crate) fn render_disasm(body: &FunctionBody) -> anyhow::Result<String> {
    let lines = match body.kind {
        FunctionKind::Numeric => disassemble::<NumOp>(&body.code)?,
        _ => disassemble::<Op>(&body.code)?,
    };
    let mut out = format!(
        "== {} ({:?}, {} locals, {} bytes) ==\n",
        body.name,
        body.kind,
        body.local_count,
        body.code.len()
    );
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    Ok(out)
}

fn disasm(file: &Path, function: Option<&str>) -> anyhow::Result<()> {
    let program = load_program(file)?;
    let bodies: Vec<&Arc<FunctionBody>> = match function {
        Some(_) => vec![select_function(&program, function)?],
        None => program.functions().iter().collect(),
    };
    for body in bodies {
        let text = render_disasm(body).with_context(|| format!("while disassembling '{}'", body.name))?;
        print!("{text}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    maybe_init_tracing();

    let CliArgs { command } = CliArgs::parse();
    match command {
        Commands::Run(args) => run(args, false),
        Commands::Trace(args) => run(args, true),
        Commands::Disasm { file, function } => disasm(&file, function.as_deref()),
    }
}
