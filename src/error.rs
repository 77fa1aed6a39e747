//! Error types for the Quicksilver JIT pipeline and its host VM
//!
//! Compile-time failures (unsupported constructs, exhausted executable memory,
//! abandoned work items) are local to one work item and never escape the
//! pipeline as fatal errors. Runtime errors carry the bytecode location they
//! were raised at, recovered through the throw map when they come from
//! compiled code.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bytecode location inside a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeLocation {
    /// Function number
    pub function: u32,
    /// Bytecode offset
    pub offset: u32,
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}@{:04}", self.function, self.offset)
    }
}

fn format_location(location: &Option<CodeLocation>) -> String {
    match location {
        Some(loc) => format!(" (at {})", loc),
        None => String::new(),
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// A bytecode pattern the requested tier cannot compile
    #[error("unsupported construct in {function}: {construct}")]
    UnsupportedConstruct { function: String, construct: String },

    /// No executable memory left for the code allocator
    #[error("out of executable memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// Compilation was abandoned before it could finish
    #[error("compilation abandoned: {0}")]
    Abandoned(String),

    /// Malformed bytecode
    #[error("invalid bytecode at offset {offset}: {message}")]
    InvalidBytecode { offset: usize, message: String },

    /// Runtime error raised by the interpreter or by compiled code
    #[error("{kind}: {message}{}", format_location(.location))]
    RuntimeError {
        kind: ErrorKind,
        message: String,
        location: Option<CodeLocation>,
    },

    /// Value thrown by a `Throw` instruction and never caught
    #[error("Uncaught {0}")]
    Thrown(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Wire encoding error (out-of-process compilation)
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// Runtime error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TypeError,
    RangeError,
    ReferenceError,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::RangeError => write!(f, "RangeError"),
            ErrorKind::ReferenceError => write!(f, "ReferenceError"),
            ErrorKind::InternalError => write!(f, "InternalError"),
        }
    }
}

/// Failure codes carried by out-of-process compile responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    UnsupportedConstruct,
    OutOfMemory,
    Abandoned,
    InvalidBytecode,
    Internal,
    Serialization,
}

impl Error {
    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::TypeError,
            message: message.into(),
            location: None,
        }
    }

    /// Create a range error
    pub fn range_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::RangeError,
            message: message.into(),
            location: None,
        }
    }

    /// Create a reference error
    pub fn reference_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::ReferenceError,
            message: message.into(),
            location: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    pub fn unsupported(function: impl Into<String>, construct: impl Into<String>) -> Self {
        Error::UnsupportedConstruct {
            function: function.into(),
            construct: construct.into(),
        }
    }

    pub fn invalid_bytecode(offset: usize, message: impl Into<String>) -> Self {
        Error::InvalidBytecode {
            offset,
            message: message.into(),
        }
    }

    /// Attach a bytecode location to a runtime error that has none yet
    pub fn with_location(self, loc: CodeLocation) -> Self {
        match self {
            Error::RuntimeError {
                kind,
                message,
                location: None,
            } => Error::RuntimeError {
                kind,
                message,
                location: Some(loc),
            },
            other => other,
        }
    }

    /// Location recorded on a runtime error
    pub fn location(&self) -> Option<CodeLocation> {
        match self {
            Error::RuntimeError { location, .. } => *location,
            _ => None,
        }
    }

    /// Whether this error means "the work item failed to compile" rather
    /// than a failure of the program being run
    pub fn is_compile_failure(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedConstruct { .. }
                | Error::OutOfMemory { .. }
                | Error::Abandoned(_)
                | Error::InvalidBytecode { .. }
                | Error::InternalError(_)
                | Error::SerializationError(_)
        )
    }

    /// Wire code for a compile failure
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Error::UnsupportedConstruct { .. } => FailureCode::UnsupportedConstruct,
            Error::OutOfMemory { .. } => FailureCode::OutOfMemory,
            Error::Abandoned(_) => FailureCode::Abandoned,
            Error::InvalidBytecode { .. } => FailureCode::InvalidBytecode,
            Error::SerializationError(_) => FailureCode::Serialization,
            _ => FailureCode::Internal,
        }
    }

    /// Rebuild a compile failure received from a compile server
    pub fn from_failure(code: FailureCode, message: String) -> Self {
        match code {
            FailureCode::UnsupportedConstruct => Error::UnsupportedConstruct {
                function: String::from("<remote>"),
                construct: message,
            },
            FailureCode::OutOfMemory => Error::OutOfMemory { requested: 0 },
            FailureCode::Abandoned => Error::Abandoned(message),
            FailureCode::InvalidBytecode => Error::InvalidBytecode { offset: 0, message },
            FailureCode::Internal => Error::InternalError(message),
            FailureCode::Serialization => Error::SerializationError(message),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
