use crate::value::ObjectRef;
use std::fmt;

/// Exception categories the engine raises itself, plus `Managed` for anything
/// thrown by managed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    StackOverflow,
    OutOfMemory,
    NullReference,
    MissingMethod,
    TypeInitialization,
    TypeLoad,
    InvalidProgram,
    ExecutionEngine,
    Managed,
}

impl ExceptionKind {
    /// Name of the `System` class instantiated for this kind.
    pub fn class_name(self) -> Option<&'static str> {
        Some(match self {
            ExceptionKind::StackOverflow => "StackOverflowException",
            ExceptionKind::OutOfMemory => "OutOfMemoryException",
            ExceptionKind::NullReference => "NullReferenceException",
            ExceptionKind::MissingMethod => "MissingMethodException",
            ExceptionKind::TypeInitialization => "TypeInitializationException",
            ExceptionKind::TypeLoad => "TypeLoadException",
            ExceptionKind::InvalidProgram => "InvalidProgramException",
            ExceptionKind::ExecutionEngine => "ExecutionEngineException",
            ExceptionKind::Managed => return None,
        })
    }

    /// Classifies an exception object by the name of its class.
    pub fn from_class_name(namespace: &str, name: &str) -> Self {
        if namespace != "System" {
            return ExceptionKind::Managed;
        }
        [
            ExceptionKind::StackOverflow,
            ExceptionKind::OutOfMemory,
            ExceptionKind::NullReference,
            ExceptionKind::MissingMethod,
            ExceptionKind::TypeInitialization,
            ExceptionKind::TypeLoad,
            ExceptionKind::InvalidProgram,
            ExceptionKind::ExecutionEngine,
        ]
        .into_iter()
        .find(|k| k.class_name() == Some(name))
        .unwrap_or(ExceptionKind::Managed)
    }
}

/// The exception currently set on an engine thread.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingException {
    pub kind: ExceptionKind,
    /// The exception instance, when one could be allocated.
    pub object: Option<ObjectRef>,
    pub message: Option<String>,
}

impl fmt::Display for PendingException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind.class_name(), &self.message) {
            (Some(name), Some(msg)) => write!(f, "System.{name}: {msg}"),
            (Some(name), None) => write!(f, "System.{name}"),
            (None, _) => write!(f, "managed exception {:?}", self.object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_class_name() {
        assert_eq!(
            ExceptionKind::from_class_name("System", "NullReferenceException"),
            ExceptionKind::NullReference
        );
        assert_eq!(
            ExceptionKind::from_class_name("Demo", "NullReferenceException"),
            ExceptionKind::Managed
        );
        assert_eq!(
            ExceptionKind::from_class_name("System", "ArgumentException"),
            ExceptionKind::Managed
        );
    }
}
