//! # cil-vm
//!
//! The execution core of a CIL virtual machine: a stack-type analyzer, an interpreter with
//! structured exception handling, and call sites that rewrite themselves into cached calls.
//!
//! Symbols, strings and objects come from the host through the traits in [`resolve`] and
//! [`value`]. An in-memory host ([`resolve::Assemblies`] and [`value::heap::Heap`]) backs
//! the tests and the command-line interface.
//!
//! ## Feature Flags
//!
//! - `multithreading`: Uses `parking_lot` for the engine's locks instead of the standard
//!   library's. Enabled by default.
use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use tracing_subscriber::{fmt, EnvFilter};

pub mod resolve;
pub mod types;
pub mod utils;
pub mod value;
#[macro_use]
pub mod vm;

use resolve::Assemblies;
use types::{MethodSignature, MethodSymbol};
use value::{heap::Heap, StackType, StackValue, ValueKind};
use vm::{tracer::Tracer, Engine, EngineConfig, ExecutionError};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run and inspect CIL method bodies"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Assemble a method body and execute it
    Run {
        #[arg(value_name = "FILE")]
        source: PathBuf,
        /// An argument as `kind:value`, e.g. `i4:5` or `r8:1.5`. Repeat for more.
        #[arg(long = "arg", value_name = "KIND:VALUE")]
        args: Vec<String>,
        /// Local kinds, e.g. `i4,i8`. Overrides a `.locals` directive.
        #[arg(long, value_name = "KINDS", value_delimiter = ',')]
        locals: Option<Vec<String>>,
        /// Kind of the return value; omit for a void method
        #[arg(long, value_name = "KIND")]
        returns: Option<String>,
        #[arg(long, value_name = "N")]
        osr_threshold: Option<u64>,
        #[arg(long, value_name = "N")]
        max_call_depth: Option<usize>,
        /// Trace every executed instruction
        #[arg(long)]
        trace: bool,
    },
    /// Print the operand type the analyzer assigns to each instruction
    Analyze {
        #[arg(value_name = "FILE")]
        source: PathBuf,
        /// Parameter kinds of the method
        #[arg(long = "arg", value_name = "KIND")]
        args: Vec<String>,
        #[arg(long, value_name = "KIND")]
        returns: Option<String>,
    },
}

/// Exit code for an exception no handler caught.
const EXIT_UNHANDLED: u8 = 1;
/// Exit code for everything that is not the guest's fault.
const EXIT_ENGINE: u8 = 2;

/// Routes `tracing` output to stderr. `RUST_LOG` overrides the default `warn` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed when running inside tests.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_kind(name: &str) -> Result<ValueKind, String> {
    ValueKind::from_name(name).ok_or_else(|| format!("unknown kind {:?}", name))
}

/// Parses a `kind:value` command-line argument.
pub fn parse_argument(text: &str) -> Result<(ValueKind, StackValue), String> {
    let (kind, value) = text
        .split_once(':')
        .ok_or_else(|| format!("argument {:?} is not of the form kind:value", text))?;
    let kind = parse_kind(kind)?;
    let invalid = || format!("invalid {:?} value {:?}", kind, value);
    let parsed = match kind.stack_type() {
        StackType::Int32 => StackValue::Int32(value.parse::<i64>().map_err(|_| invalid())? as i32),
        StackType::Int64 => StackValue::Int64(value.parse().map_err(|_| invalid())?),
        StackType::NativeInt => StackValue::NativeInt(value.parse().map_err(|_| invalid())?),
        StackType::NativeFloat => StackValue::NativeFloat(value.parse().map_err(|_| invalid())?),
        StackType::ObjectRef if value == "null" => StackValue::null(),
        _ => return Err(format!("{:?} arguments are not supported", kind)),
    };
    let coerced = kind
        .coerce(parsed)
        .ok_or_else(|| format!("{:?} cannot hold {}", kind, value))?;
    Ok((kind, coerced))
}

/// A freshly assembled entry method in its own in-memory host.
struct Program {
    assemblies: Arc<Assemblies>,
    heap: Arc<Heap>,
    method: Arc<MethodSymbol>,
}

fn load_program(
    source: &Path,
    params: Vec<ValueKind>,
    returns: Option<ValueKind>,
    locals: Option<Vec<ValueKind>>,
) -> Result<Program, String> {
    let text = std::fs::read_to_string(source).map_err(|e| format!("cannot read {}: {}", source.display(), e))?;
    let assemblies = Arc::new(Assemblies::new());
    // Declared before assembling so the body can call itself as `main`.
    let token = assemblies.declare_method(
        assemblies.core().object,
        "main",
        MethodSignature::new_static(params, returns),
        false,
    );
    let mut assembly = vm::assemble(&text, &assemblies).map_err(|e| format!("{}: {}", source.display(), e))?;
    if let Some(locals) = locals {
        assembly.locals = locals;
    }
    assemblies
        .define_body(token, assembly.into_body())
        .map_err(|e| e.to_string())?;
    let method = assemblies.method(token).map_err(|e| e.to_string())?;
    let heap = Arc::new(Heap::new(assemblies.clone()));
    Ok(Program {
        assemblies,
        heap,
        method,
    })
}

fn format_value(heap: &Heap, value: &StackValue) -> String {
    match value {
        StackValue::Int32(i) => i.to_string(),
        StackValue::Int64(i) => i.to_string(),
        StackValue::NativeInt(i) => i.to_string(),
        StackValue::NativeFloat(f) => f.to_string(),
        StackValue::ObjectRef(o) if o.is_null() => "null".to_string(),
        StackValue::ObjectRef(o) => heap.string_value(o).unwrap_or_else(|| format!("{:?}", o)),
        StackValue::ManagedPtr(p) => format!("{:?}", p),
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    source: PathBuf,
    args: Vec<String>,
    locals: Option<Vec<String>>,
    returns: Option<String>,
    osr_threshold: Option<u64>,
    max_call_depth: Option<usize>,
    trace: bool,
) -> Result<ExitCode, String> {
    let (params, values): (Vec<_>, Vec<_>) = args
        .iter()
        .map(|a| parse_argument(a))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .unzip();
    let returns = returns.as_deref().map(parse_kind).transpose()?;
    let locals = locals
        .map(|l| l.iter().map(|k| parse_kind(k.trim())).collect::<Result<Vec<_>, _>>())
        .transpose()?;
    let program = load_program(&source, params, returns, locals)?;

    let mut config = EngineConfig::from_env().with_instruction_trace(trace);
    if let Some(threshold) = osr_threshold {
        config = config.with_osr_threshold(threshold);
    }
    if let Some(depth) = max_call_depth {
        config = config.with_max_call_depth(depth);
    }
    let mut engine = Engine::new(
        program.assemblies.clone(),
        program.assemblies.clone(),
        program.heap.clone(),
        config,
    );
    if trace {
        engine = engine.with_tracer(Tracer::to_writer(Box::new(std::io::stderr())));
    }

    match engine.execute(&program.method, values) {
        Ok(value) => {
            if let Some(value) = value {
                println!("{}", format_value(&program.heap, &value));
            }
            tracing::debug!(metrics = ?engine.metrics().snapshot(), "finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(ExecutionError::Guest(exception)) => {
            eprintln!("Unhandled exception. {}", exception);
            Ok(ExitCode::from(EXIT_UNHANDLED))
        }
        Err(ExecutionError::Engine(e)) => {
            eprintln!("Internal VM error: {}", e);
            Ok(ExitCode::from(EXIT_ENGINE))
        }
    }
}

fn print_analysis(source: PathBuf, args: Vec<String>, returns: Option<String>) -> Result<ExitCode, String> {
    let params = args.iter().map(|k| parse_kind(k)).collect::<Result<Vec<_>, _>>()?;
    let returns = returns.as_deref().map(parse_kind).transpose()?;
    let program = load_program(&source, params, returns, None)?;
    let analysis = vm::analyze(&program.method, program.assemblies.as_ref()).map_err(|e| e.to_string())?;
    for (offset, ty) in analysis.annotations() {
        println!("{:?}\t{:?}", utils::il_label(offset), ty);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_cli() -> ExitCode {
    init_logging();
    let args = Args::parse();
    let result = match args.command {
        Command::Run {
            source,
            args,
            locals,
            returns,
            osr_threshold,
            max_call_depth,
            trace,
        } => run(source, args, locals, returns, osr_threshold, max_call_depth, trace),
        Command::Analyze { source, args, returns } => print_analysis(source, args, returns),
    };
    match result {
        Ok(code) => code,
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::from(EXIT_ENGINE)
        }
    }
}
