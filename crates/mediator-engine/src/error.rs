//! Error types for mediator-engine

use serde_json::Value;
use thiserror::Error;

use crate::compiler::CompileError;

/// Errors that can occur while compiling or running a job expression
#[derive(Error, Debug)]
pub enum EngineError {
    /// Verification or parsing rejected the expression; nothing was executed
    #[error("Compilation failed: {}", render_compile_errors(.errors))]
    CompileRejected { errors: Vec<CompileError> },

    /// Execution exceeded its wall-clock limit
    #[error("Job execution timed out after {0}ms")]
    Timeout(u64),

    /// A collaborator call failed
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Script code threw an exception
    #[error("{message}")]
    Script {
        message: String,
        /// Enumerable properties of the thrown value, serialized
        detail: Option<Value>,
    },

    /// A state value did not have the expected shape
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The compiled unit did not evaluate to a pipeline
    #[error("Invalid pipeline: {0}")]
    InvalidPlan(String),

    /// An adaptor was asked to build an operation it does not export
    #[error("Unknown operation '{operation}' for adaptor '{adaptor}'")]
    UnknownOperation { adaptor: String, operation: String },

    /// An operation builder received unusable arguments
    #[error("Invalid argument for {operation}: {message}")]
    InvalidArgument { operation: String, message: String },

    /// The script engine itself failed (context creation, memory limit)
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script {
            message: message.into(),
            detail: None,
        }
    }

    pub fn invalid_argument(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Structured payload carried by the error, if any.
    ///
    /// For collaborator errors this is the parsed response body; for script
    /// exceptions it is the serialized thrown value.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Collaborator(err) => err.body.as_ref(),
            Self::Script { detail, .. } => detail.as_ref(),
            _ => None,
        }
    }
}

/// Error surfaced by a collaborator call, e.g. a non-2xx HTTP response.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub status: Option<u16>,
    pub body: Option<Value>,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            body: None,
        }
    }

    /// Error for an HTTP response outside the accepted status range.
    ///
    /// The serialized body is appended after `responded with:` so the
    /// payload survives even when only the message is kept.
    pub fn from_response(method: &str, url: &str, status: u16, body: Value) -> Self {
        let rendered = serde_json::to_string(&body).unwrap_or_default();
        Self {
            message: format!("{method} {url} ({status}) responded with: {rendered}"),
            status: Some(status),
            body: Some(body),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

fn render_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
