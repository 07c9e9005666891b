//! Error types for the quickjit engine
//!
//! Host-facing failures are reported through [`Error`]. Language-level
//! exceptions travel inside the engine as [`crate::runtime::Abrupt`] and are
//! only converted into an [`Error`] when they escape to the embedder.

use std::fmt;
use thiserror::Error;

/// Source location in script code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
    /// Byte offset in source
    pub offset: usize,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32, offset: usize) -> Self {
        Self { line, column, offset }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Format a source context with caret pointer for errors
pub fn format_error_context(source: &str, location: &SourceLocation) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let line_idx = (location.line.saturating_sub(1)) as usize;

    if line_idx >= lines.len() {
        return String::new();
    }

    let mut result = String::new();
    let width = format!("{}", location.line + 1).len().max(3);

    if line_idx > 0 {
        result.push_str(&format!(
            "{:>width$} | {}\n",
            location.line - 1,
            lines[line_idx - 1],
            width = width
        ));
    }

    result.push_str(&format!(
        "{:>width$} | {}\n",
        location.line,
        lines[line_idx],
        width = width
    ));

    let pointer_offset = (location.column.saturating_sub(1)) as usize;
    result.push_str(&format!(
        "{:>width$} | {}^\n",
        "",
        " ".repeat(pointer_offset),
        width = width
    ));

    result
}

/// Main error type for quickjit
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Lexer error - invalid token or character
    #[error("SyntaxError: {message} at {location}{}", if source_context.is_empty() { String::new() } else { format!("\n{}", source_context) })]
    LexerError {
        message: String,
        location: SourceLocation,
        source_context: String,
    },

    /// Parser or bytecode compiler error - invalid or unsupported syntax
    #[error("SyntaxError: {message} at {location}{}", if source_context.is_empty() { String::new() } else { format!("\n{}", source_context) })]
    ParseError {
        message: String,
        location: SourceLocation,
        source_context: String,
    },

    /// An uncaught error object (TypeError, RangeError, ...)
    #[error("{kind}: {message}")]
    RuntimeError { kind: ErrorKind, message: String },

    /// An uncaught exception whose value is not an error object
    #[error("Uncaught {0}")]
    Uncaught(String),

    /// Internal engine error
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Invalid engine configuration
    #[error("ConfigError: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// Resource limit exceeded without a language-level recovery path
    #[error("ResourceLimitError: {kind}: {message}")]
    ResourceLimitError {
        kind: ResourceLimitKind,
        message: String,
    },
}

/// Resource limit kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimitKind {
    /// Call stack depth limit exceeded
    StackDepthLimit,
    /// Worker thread could not be spawned or joined
    WorkerLimit,
}

impl fmt::Display for ResourceLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLimitKind::StackDepthLimit => write!(f, "StackDepthLimit"),
            ResourceLimitKind::WorkerLimit => write!(f, "WorkerLimit"),
        }
    }
}

/// Language error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// TypeError - wrong type for operation
    TypeError,
    /// ReferenceError - undefined variable
    ReferenceError,
    /// RangeError - value out of range, stack overflow
    RangeError,
    /// SyntaxError raised at runtime
    SyntaxError,
    /// Generic Error - user-constructed Error objects
    GenericError,
}

impl ErrorKind {
    /// The `name` property carried by error objects of this kind
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::GenericError => "Error",
        }
    }

    /// Map an error object's `name` back to a kind
    pub fn from_name(name: &str) -> Self {
        match name {
            "TypeError" => ErrorKind::TypeError,
            "ReferenceError" => ErrorKind::ReferenceError,
            "RangeError" => ErrorKind::RangeError,
            "SyntaxError" => ErrorKind::SyntaxError,
            _ => ErrorKind::GenericError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Error {
    /// Create a new lexer error
    pub fn lexer_error(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::LexerError {
            message: message.into(),
            location,
            source_context: String::new(),
        }
    }

    /// Create a new parse error
    pub fn parse_error(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::ParseError {
            message: message.into(),
            location,
            source_context: String::new(),
        }
    }

    /// Add source context to an existing error
    pub fn with_source_context(self, source: &str) -> Self {
        match self {
            Error::LexerError { message, location, .. } => Error::LexerError {
                message,
                source_context: format_error_context(source, &location),
                location,
            },
            Error::ParseError { message, location, .. } => Error::ParseError {
                message,
                source_context: format_error_context(source, &location),
                location,
            },
            other => other,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// The language error kind, if this error came from an uncaught error object
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::RuntimeError { kind, .. } => Some(*kind),
            Error::LexerError { .. } | Error::ParseError { .. } => Some(ErrorKind::SyntaxError),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ConfigError(err.to_string())
    }
}

/// Result type for quickjit operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display_includes_context() {
        let err = Error::parse_error("Unexpected token", SourceLocation::new(2, 5, 10))
            .with_source_context("let a = 1;\nlet = 2;\n");
        let text = err.to_string();
        assert!(text.starts_with("SyntaxError: Unexpected token at 2:5"));
        assert!(text.contains("let = 2;"));
        assert!(text.contains('^'));
    }

    #[test]
    fn test_runtime_error_display() {
        let err = Error::RuntimeError {
            kind: ErrorKind::TypeError,
            message: "x is not a function".into(),
        };
        assert_eq!(err.to_string(), "TypeError: x is not a function");
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
    }

    #[test]
    fn test_error_kind_round_trips_through_name() {
        for kind in [
            ErrorKind::TypeError,
            ErrorKind::ReferenceError,
            ErrorKind::RangeError,
            ErrorKind::SyntaxError,
            ErrorKind::GenericError,
        ] {
            assert_eq!(ErrorKind::from_name(kind.name()), kind);
        }
    }
}
