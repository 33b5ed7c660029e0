//! The execution engine.
//!
//! A method is *prepared* once: its body is analyzed for stack types, its exception
//! regions are resolved and its bytecode is copied into a patchable buffer. Activations of
//! the method then run the interpreter loop over that shared state. Call sites rewrite
//! themselves into cached calls on first execution.
#[macro_use]
mod macros;

pub mod analysis;
mod arithmetic;
pub mod assembler;
pub mod bytecode;
pub mod config;
pub mod engine;
pub mod error;
pub mod exceptions;
mod instructions;
mod interpreter;
pub mod metrics;
mod nodes;
pub mod opcodes;
pub mod stack;
pub mod tracer;

pub use analysis::{analyze, MethodAnalysis, OpCodeType};
pub use assembler::{assemble, AssembleError, Assembly, IlBuilder, Label};
pub use config::EngineConfig;
pub use engine::{Engine, PreparedMethod};
pub use error::{EngineError, ExecutionError, FaultKind, GuestException, ResolutionError};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use opcodes::Opcode;
