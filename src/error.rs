use crate::vm::exceptions::ExceptionKind;
use thiserror::Error;

/// Host-level failures: bad configuration or metadata the engine cannot start with.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Required class {0} is missing from the catalog")]
    MissingBootstrapClass(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Layout failed: {0}")]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("value type {0} contains itself")]
    RecursiveValueType(String),

    #[error("parent of {0} failed layout: {1}")]
    ParentFailed(String, Box<LayoutError>),

    #[error("layout of {0} did not complete")]
    Incomplete(String),
}

/// Internal failure of a call or allocation step. Each one becomes exactly one
/// VM exception on the calling thread when it reaches a public entry point.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Fault {
    #[error("Stack overflow")]
    StackOverflow,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Null reference")]
    NullReference,

    #[error("Missing method: {0}")]
    MissingMethod(String),

    #[error("Type initialization failed: {0}")]
    TypeInitialization(String),

    #[error("Type load failed: {0}")]
    TypeLoad(String),

    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    /// The exception is already set on the thread.
    #[error("Exception pending on thread")]
    Thrown,
}

impl Fault {
    pub fn kind(&self) -> Option<ExceptionKind> {
        Some(match self {
            Fault::StackOverflow => ExceptionKind::StackOverflow,
            Fault::OutOfMemory => ExceptionKind::OutOfMemory,
            Fault::NullReference => ExceptionKind::NullReference,
            Fault::MissingMethod(_) => ExceptionKind::MissingMethod,
            Fault::TypeInitialization(_) => ExceptionKind::TypeInitialization,
            Fault::TypeLoad(_) => ExceptionKind::TypeLoad,
            Fault::InvalidProgram(_) => ExceptionKind::InvalidProgram,
            Fault::Thrown => return None,
        })
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Fault::MissingMethod(m)
            | Fault::TypeInitialization(m)
            | Fault::TypeLoad(m)
            | Fault::InvalidProgram(m) => Some(m.clone()),
            _ => None,
        }
    }
}

/// Returned by public entry points: a managed exception is pending on the
/// thread and can be read with `ExecThread::exception`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("managed exception pending on thread")]
pub struct Thrown;
