//! Typed error hierarchy for the Weaver orchestrator.
//!
//! - `ErrorCode`: the stable failure taxonomy recorded on every attempt
//! - `ChainError`: a logical backend call that could not be satisfied
//! - `StoreError`: session persistence failures
//! - `OrchestratorError`: control-surface and session failures

use crate::backend::{BackendFailure, ChainReport};
use crate::state::AgentRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by usage records, events and error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AdapterUnavailable,
    RateLimit,
    ContextExceeded,
    Timeout,
    ApiError,
    SyntaxInvalid,
    IncompleteCode,
    RecoveryExhausted,
    Cancelled,
    FatalChainExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AdapterUnavailable => "ADAPTER_UNAVAILABLE",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::ContextExceeded => "CONTEXT_EXCEEDED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::SyntaxInvalid => "SYNTAX_INVALID",
            ErrorCode::IncompleteCode => "INCOMPLETE_CODE",
            ErrorCode::RecoveryExhausted => "RECOVERY_EXHAUSTED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::FatalChainExhausted => "FATAL_CHAIN_EXHAUSTED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from one logical call through a fallback chain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("FATAL_CHAIN_EXHAUSTED for {role}: {}", summarize_failures(.failures))]
    Exhausted {
        role: AgentRole,
        failures: Vec<BackendFailure>,
        report: ChainReport,
    },

    #[error("Call for {role} cancelled")]
    Cancelled { role: AgentRole, report: ChainReport },

    #[error("No backends configured for {role}")]
    NoBackends { role: AgentRole },
}

impl ChainError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChainError::Exhausted { .. } => ErrorCode::FatalChainExhausted,
            ChainError::Cancelled { .. } => ErrorCode::Cancelled,
            ChainError::NoBackends { .. } => ErrorCode::AdapterUnavailable,
        }
    }

    /// Attempts and fallbacks made before the call gave up.
    pub fn report(&self) -> Option<&ChainReport> {
        match self {
            ChainError::Exhausted { report, .. } | ChainError::Cancelled { report, .. } => {
                Some(report)
            }
            ChainError::NoBackends { .. } => None,
        }
    }
}

fn summarize_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} [{}]: {}", f.backend, f.code, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the durable session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode session data: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Session {id} not found")]
    NotFound { id: String },

    #[error("Invalid session id '{id}'")]
    InvalidId { id: String },

    #[error("Session writer has shut down")]
    WriterClosed,

    #[error("Session store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the orchestrator control surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("A session is already running; call reset() before starting another")]
    AlreadyStarted,

    #[error("No plan is awaiting approval")]
    NoPendingApproval,

    #[error("Session {id} cannot be resumed")]
    NotResumable { id: String },

    #[error("Backend '{name}' configured for {role} is not registered")]
    UnknownBackend { role: AgentRole, name: String },

    #[error("Invalid phase transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No work item for {path}")]
    UnknownItem { path: String },

    #[error("Workspace error on {path}: {message}")]
    Workspace { path: String, message: String },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::FatalChainExhausted).unwrap();
        assert_eq!(json, "\"FATAL_CHAIN_EXHAUSTED\"");
        let back: ErrorCode = serde_json::from_str("\"RATE_LIMIT\"").unwrap();
        assert_eq!(back, ErrorCode::RateLimit);
    }

    #[test]
    fn error_code_display_matches_wire_name() {
        assert_eq!(ErrorCode::ContextExceeded.to_string(), "CONTEXT_EXCEEDED");
        assert_eq!(ErrorCode::Cancelled.as_str(), "CANCELLED");
    }

    #[test]
    fn chain_error_exhausted_carries_failures() {
        let err = ChainError::Exhausted {
            role: AgentRole::Executor,
            failures: vec![BackendFailure {
                backend: "alpha".into(),
                code: ErrorCode::RateLimit,
                message: "429".into(),
            }],
            report: ChainReport::default(),
        };
        assert_eq!(err.code(), ErrorCode::FatalChainExhausted);
        let text = err.to_string();
        assert!(text.contains("alpha"));
        assert!(text.contains("RATE_LIMIT"));
    }

    #[test]
    fn orchestrator_error_converts_from_store_error() {
        let inner = StoreError::NotFound { id: "abc".into() };
        let err: OrchestratorError = inner.into();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::NotFound { .. })
        ));
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::WriterClosed);
        assert_std_error(&OrchestratorError::AlreadyStarted);
        assert_std_error(&ChainError::NoBackends {
            role: AgentRole::Auditor,
        });
    }
}
