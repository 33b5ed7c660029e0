use crate::{
    types::{Token, TypeHandle},
    value::ObjectRef,
};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Implicit faults raised by instruction semantics. These become guest exceptions and can
/// be caught by the program's own handlers.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq, Hash)]
pub enum FaultKind {
    #[error("System.NullReferenceException")]
    NullReference,
    #[error("System.DivideByZeroException")]
    DivideByZero,
    #[error("System.OverflowException")]
    Overflow,
    #[error("System.IndexOutOfRangeException")]
    IndexOutOfRange,
    #[error("System.ArrayTypeMismatchException")]
    ArrayTypeMismatch,
    #[error("System.InvalidCastException")]
    InvalidCast,
    #[error("System.OutOfMemoryException")]
    OutOfMemory,
    #[error("System.ExecutionEngineException")]
    ExecutionEngine,
}

impl FaultKind {
    pub const ALL: [FaultKind; 8] = [
        FaultKind::NullReference,
        FaultKind::DivideByZero,
        FaultKind::Overflow,
        FaultKind::IndexOutOfRange,
        FaultKind::ArrayTypeMismatch,
        FaultKind::InvalidCast,
        FaultKind::OutOfMemory,
        FaultKind::ExecutionEngine,
    ];

    pub fn default_message(self) -> &'static str {
        match self {
            FaultKind::NullReference => "Object reference not set to an instance of an object.",
            FaultKind::DivideByZero => "Attempted to divide by zero.",
            FaultKind::Overflow => "Arithmetic operation resulted in an overflow.",
            FaultKind::IndexOutOfRange => "Index was outside the bounds of the array.",
            FaultKind::ArrayTypeMismatch => {
                "Attempted to access an element as a type incompatible with the array."
            }
            FaultKind::InvalidCast => "Specified cast is not valid.",
            FaultKind::OutOfMemory => "Insufficient memory to continue the execution of the program.",
            FaultKind::ExecutionEngine => "Internal error in the runtime.",
        }
    }
}

/// A guest exception in flight: the exception object plus what is known about its origin.
#[derive(Clone, Debug, PartialEq)]
pub struct GuestException {
    pub object: ObjectRef,
    /// Set when the engine raised it implicitly; `None` for objects passed to `throw`.
    pub kind: Option<FaultKind>,
    pub message: String,
}

impl Display for GuestException {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}: {}", kind, self.message),
            None => write!(f, "{:?}: {}", self.object, self.message),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("token {0} not found")]
    NotFound(Token),
    #[error("token {token} is not a {expected}")]
    WrongTable { token: Token, expected: &'static str },
    #[error("no implementation of {method} for type {type_name}")]
    NoVirtualTarget { method: String, type_name: String },
    #[error("user string {0} not found")]
    MissingString(Token),
    #[error("type {0:?} is not loaded")]
    UnknownType(TypeHandle),
}

/// Host-side failures. These are never visible to guest exception handlers.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid program at IL_{offset:04x}: {message}")]
    InvalidProgram { offset: usize, message: String },

    #[error("unsupported opcode {opcode:#x} at IL_{offset:04x}")]
    UnsupportedOpcode { opcode: u16, offset: usize },

    #[error("truncated instruction at IL_{0:04x}")]
    Truncated(usize),

    #[error("invalid analyzer state at IL_{offset:04x}: {message}")]
    InvalidAnalyzerState { offset: usize, message: String },

    #[error("slot {slot} holds {actual}, expected {expected}")]
    SlotType {
        slot: usize,
        expected: &'static str,
        actual: String,
    },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("symbol resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("rethrow at IL_{0:04x} with no exception being handled")]
    RethrowWithoutException(usize),

    #[error("call depth exceeded {0}")]
    StackOverflow(usize),

    #[error("{method} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },
}

impl EngineError {
    pub fn invalid_program(offset: usize, message: impl Into<String>) -> Self {
        EngineError::InvalidProgram {
            offset,
            message: message.into(),
        }
    }

    pub fn invalid_state(offset: usize, message: impl Into<String>) -> Self {
        EngineError::InvalidAnalyzerState {
            offset,
            message: message.into(),
        }
    }
}

/// The failure result of executing a method.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("unhandled exception: {0}")]
    Guest(GuestException),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<ResolutionError> for ExecutionError {
    fn from(e: ResolutionError) -> Self {
        ExecutionError::Engine(e.into())
    }
}

impl ExecutionError {
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            ExecutionError::Guest(g) => g.kind,
            ExecutionError::Engine(_) => None,
        }
    }
}

/// Anything that interrupts an instruction: a guest fault to dispatch, or a fatal engine error.
#[derive(Debug, Clone)]
pub(crate) enum Trap {
    Fault(FaultKind, String),
    Thrown(GuestException),
    Engine(EngineError),
}

impl From<FaultKind> for Trap {
    fn from(kind: FaultKind) -> Self {
        Trap::Fault(kind, kind.default_message().to_string())
    }
}

impl From<EngineError> for Trap {
    fn from(e: EngineError) -> Self {
        Trap::Engine(e)
    }
}

impl From<ResolutionError> for Trap {
    fn from(e: ResolutionError) -> Self {
        Trap::Engine(e.into())
    }
}

impl From<ExecutionError> for Trap {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Guest(g) => Trap::Thrown(g),
            ExecutionError::Engine(e) => Trap::Engine(e),
        }
    }
}
