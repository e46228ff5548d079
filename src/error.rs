//! Error taxonomy and boundary-safe failure descriptors.
//!
//! Everything that can go wrong while driving the engine is classified into
//! one of five kinds. Inside the crate errors travel as [`Error`]; once they
//! reach a completion they are flattened into a [`Failure`], which only holds
//! plain text and can be handed to any host.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The engine could not be brought up.
    EngineInitializationError,
    /// A script file could not be loaded (empty name, syntax error, ...).
    ScriptLoadError,
    /// Evaluated script code threw.
    ScriptEvaluationError,
    /// Operation called in the wrong lifecycle state.
    InvalidStateError,
    /// Anything else, including panics caught on the dispatcher thread.
    InternalError,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EngineInitializationError => "EngineInitializationError",
            Self::ScriptLoadError => "ScriptLoadError",
            Self::ScriptEvaluationError => "ScriptEvaluationError",
            Self::InvalidStateError => "InvalidStateError",
            Self::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised inside the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Engine initialization failed: {message}")]
    EngineInitialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to load script '{file}': {message}")]
    ScriptLoad { file: String, message: String },

    #[error("{message}")]
    ScriptEvaluation {
        message: String,
        stack: Option<String>,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn engine_init(message: impl Into<String>) -> Self {
        Self::EngineInitialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn engine_init_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::EngineInitialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn script_load(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptLoad {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn script_evaluation(message: impl Into<String>, stack: Option<String>) -> Self {
        Self::ScriptEvaluation {
            message: message.into(),
            stack,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EngineInitialization { .. } => ErrorKind::EngineInitializationError,
            Self::ScriptLoad { .. } => ErrorKind::ScriptLoadError,
            Self::ScriptEvaluation { .. } => ErrorKind::ScriptEvaluationError,
            Self::InvalidState(_) => ErrorKind::InvalidStateError,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Flatten into a descriptor that only carries text.
    #[must_use]
    pub fn into_failure(self) -> Failure {
        let kind = self.kind();
        let message = self.to_string();
        match self {
            Self::EngineInitialization { source, .. } => Failure {
                kind,
                message,
                cause: source.map(|err| format!("{err:?}")),
                stack: None,
            },
            Self::ScriptEvaluation { stack, .. } => Failure {
                kind,
                message,
                cause: None,
                stack,
            },
            _ => Failure::new(kind, message),
        }
    }
}

/// Boundary-safe failure descriptor delivered through a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            stack: None,
        }
    }

    /// Build an `InternalError` from a `catch_unwind` payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(ErrorKind::InternalError, format!("panic: {detail}"))
    }

    /// JSON form handed to hosts that marshal errors as text.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"kind\":\"{}\",\"message\":\"<unserializable>\"}}", self.kind)
        })
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        err.into_failure()
    }
}
