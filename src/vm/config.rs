use crate::utils::{env_flag, env_number};

pub const DEFAULT_OSR_THRESHOLD: u64 = 10_000;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// Tunables for an [`Engine`](crate::vm::Engine).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Backward branches taken by one activation before the OSR hook fires.
    pub osr_threshold: u64,
    /// Nested activations allowed on one thread before the call fails.
    pub max_call_depth: usize,
    /// Write every executed instruction to the tracer.
    pub trace_instructions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            osr_threshold: DEFAULT_OSR_THRESHOLD,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            trace_instructions: false,
        }
    }
}

impl EngineConfig {
    /// Reads `CIL_VM_OSR_THRESHOLD`, `CIL_VM_MAX_CALL_DEPTH` and `CIL_VM_TRACE_INSTRUCTIONS`.
    pub fn from_env() -> Self {
        Self {
            osr_threshold: env_number("CIL_VM_OSR_THRESHOLD", DEFAULT_OSR_THRESHOLD),
            max_call_depth: env_number("CIL_VM_MAX_CALL_DEPTH", DEFAULT_MAX_CALL_DEPTH),
            trace_instructions: env_flag("CIL_VM_TRACE_INSTRUCTIONS"),
        }
    }

    pub fn with_osr_threshold(mut self, threshold: u64) -> Self {
        self.osr_threshold = threshold;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_instruction_trace(mut self, enabled: bool) -> Self {
        self.trace_instructions = enabled;
        self
    }
}
