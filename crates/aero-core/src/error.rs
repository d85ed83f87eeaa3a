//! Error kinds surfaced to script code and the embedder

use serde::Serialize;

/// The error taxonomy visible to user code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Reference,
    Type,
    Range,
    Syntax,
    Security,
    ExecutionLimit,
    Internal,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Security => "SecurityError",
            ErrorKind::ExecutionLimit => "ExecutionLimitExceeded",
            ErrorKind::Internal => "InternalError",
        }
    }

    /// Whether the error can be caught by script-level try/catch.
    /// Execution-limit aborts are non-recoverable inside the offending
    /// call chain.
    pub fn is_catchable(self) -> bool {
        !matches!(self, ErrorKind::ExecutionLimit)
    }
}

/// A script-visible error: kind plus message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {message}", kind.name())]
pub struct JsError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        JsError {
            kind,
            message: message.into(),
        }
    }

    pub fn reference(message: impl Into<String>) -> Self {
        JsError::new(ErrorKind::Reference, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        JsError::new(ErrorKind::Type, message)
    }

    pub fn range(message: impl Into<String>) -> Self {
        JsError::new(ErrorKind::Range, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        JsError::new(ErrorKind::Syntax, message)
    }

    pub fn security(message: impl Into<String>) -> Self {
        JsError::new(ErrorKind::Security, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        JsError::new(ErrorKind::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let e = JsError::reference("x is not defined");
        assert_eq!(e.to_string(), "ReferenceError: x is not defined");
    }

    #[test]
    fn test_catchability() {
        assert!(ErrorKind::Type.is_catchable());
        assert!(ErrorKind::Reference.is_catchable());
        assert!(!ErrorKind::ExecutionLimit.is_catchable());
    }
}
