use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("rule error in {origin}: {message}")]
    Rule { origin: String, message: String },

    #[error("circular dependency: {chain}")]
    CircularDependency { chain: String },

    #[error("unresolvable group reference '{reference}' in {origin}")]
    UnresolvedGroup { origin: String, reference: String },

    #[error("modifiers in {origin} did not converge after {iterations} iterations")]
    NonConvergent { origin: String, iterations: usize },

    #[error("illegal group name '{name}' in {origin} (expected [\\w-]+)")]
    InvalidName { origin: String, name: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("audit error: {0}")]
    Audit(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("group {0} has no members and does not allow that")]
    EmptyGroup(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ReconcileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum ErrorKind {
    PolicyAuthoring,
    Configuration,
    Provider,
    Audit,
    Internal,
}

impl ReconcileError {
    pub fn rule(origin: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Rule {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Rule { .. }
            | ReconcileError::CircularDependency { .. }
            | ReconcileError::UnresolvedGroup { .. }
            | ReconcileError::NonConvergent { .. }
            | ReconcileError::InvalidName { .. }
            | ReconcileError::EmptyGroup(_)
            | ReconcileError::InvalidFormat(_) => ErrorKind::PolicyAuthoring,
            ReconcileError::Configuration(_) | ReconcileError::Io(_) => ErrorKind::Configuration,
            ReconcileError::Provider(_) | ReconcileError::NotFound(_) => ErrorKind::Provider,
            ReconcileError::Audit(_) => ErrorKind::Audit,
            ReconcileError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_yaml::Error> for ReconcileError {
    fn from(err: serde_yaml::Error) -> Self {
        ReconcileError::InvalidFormat(err.to_string())
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::InvalidFormat(err.to_string())
    }
}

impl From<chrono::ParseError> for ReconcileError {
    fn from(err: chrono::ParseError) -> Self {
        ReconcileError::InvalidFormat(err.to_string())
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        ReconcileError::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for ReconcileError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ReconcileError::Internal(format!("poisoned lock: {err}"))
    }
}
