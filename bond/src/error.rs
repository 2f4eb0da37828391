use std::fmt;

use thiserror::Error;

/// Closed set of failure categories a native function or the interpreter can
/// report. Scripts see the kind through the `kind` attribute of an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// wrong number of arguments
    Argument,
    /// argument or operand of the wrong type
    Type,
    /// unknown attribute or read-only attribute
    Attribute,
    Arithmetic,
    /// operation not valid in the current state of an object
    State,
    /// native thread could not be spawned, or an isolate panicked
    Thread,
    /// unknown global name
    Name,
    Config,
    /// raised explicitly by script code
    Raised,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type NativeResult = Result<crate::Value, RuntimeError>;

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Arithmetic => "ArithmeticError",
            ErrorKind::State => "StateError",
            ErrorKind::Thread => "ThreadError",
            ErrorKind::Name => "NameError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Raised => "Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn attribute(type_name: &str, name: &str) -> Self {
        Self::new(
            ErrorKind::Attribute,
            format!("'{type_name}' object has no attribute '{name}'"),
        )
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message)
    }
}
