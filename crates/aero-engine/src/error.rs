//! Engine-level error surface

use aero_core::{ErrorKind, JsError};

/// What `Engine::evaluate` and friends return on failure. Script errors
/// belong to user code (CLI exit code 1); internal errors mean the engine
/// itself broke (exit code 2).
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Script(JsError),
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Script(e) => e.kind,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code for the CLI collaborator: 0 success is implied
    /// by the absence of an error; 1 is a user-script failure; 2 an
    /// engine-internal one.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Script(_) => 1,
            EngineError::Internal(_) => 2,
        }
    }
}

impl From<JsError> for EngineError {
    fn from(e: JsError) -> Self {
        if e.kind == ErrorKind::Internal {
            EngineError::Internal(e.message)
        } else {
            EngineError::Script(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let script: EngineError = JsError::type_error("boom").into();
        assert_eq!(script.exit_code(), 1);
        let internal: EngineError = JsError::internal("bad").into();
        assert_eq!(internal.exit_code(), 2);
    }

    #[test]
    fn test_kind_mapping() {
        let e: EngineError = JsError::reference("x").into();
        assert_eq!(e.kind(), ErrorKind::Reference);
    }
}
