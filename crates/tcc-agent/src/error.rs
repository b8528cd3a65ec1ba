// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent-side error types.

use std::fmt;

#[cfg(feature = "quic")]
use tcc_protocol::ClientError;
use tcc_protocol::FrameError;
use thiserror::Error;

/// Error returned by resource handlers and local calls.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Step of a protected local call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    BeforeRequire,
    Call,
    AfterRequire,
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallPhase::BeforeRequire => write!(f, "before require"),
            CallPhase::Call => write!(f, "call"),
            CallPhase::AfterRequire => write!(f, "after require"),
        }
    }
}

/// Errors that can occur in the agent SDK.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to tcc-engine failed
    #[cfg(feature = "quic")]
    #[error("connection error: {0}")]
    Connection(#[from] ClientError),

    /// Attach stream could not be read
    #[error("stream error: {0}")]
    Stream(#[from] FrameError),

    /// A handler is already registered for this resource
    #[error("resource already registered: {0}")]
    AlreadyRegistered(String),

    /// Engine returned an error response
    #[error("server error: {code} - {message}")]
    Server { code: String, message: String },

    /// A protected local call failed
    #[error("{resource}: {phase} failed: {source}")]
    LocalCall {
        resource: String,
        phase: CallPhase,
        #[source]
        source: BoxError,
    },

    /// Unexpected response from the engine
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Internal agent error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub(crate) fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Server {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error code reported by the engine, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            AgentError::Server { code, .. } => Some(code),
            AgentError::LocalCall { source, .. } => source
                .downcast_ref::<AgentError>()
                .and_then(|inner| inner.code()),
            _ => None,
        }
    }

    /// True when the engine rejected a duplicate (for example a lock that
    /// was already taken), or the resource was registered twice locally.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AgentError::AlreadyRegistered(_)) || self.code() == Some("ALREADY_EXISTS")
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some("NOT_FOUND")
    }
}

#[cfg(feature = "embedded")]
impl From<tcc_engine::EngineError> for AgentError {
    fn from(err: tcc_engine::EngineError) -> Self {
        AgentError::server(err.error_code(), err.to_string())
    }
}
