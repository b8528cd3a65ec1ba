// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tcc-engine.
//!
//! A single error type shared by storage, scheduler and notifier that maps
//! onto the `RpcError` codes carried on the wire.

use std::fmt;

use tcc_protocol::engine_proto::RpcError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Uniqueness violation on insert (duplicate transaction id or lock tuple).
    /// Callers retrying a call may treat this as success.
    AlreadyExists {
        entity: &'static str,
        id: String,
    },

    NotFound {
        entity: &'static str,
        id: String,
    },

    /// Commit of a canceled transaction, or cancel of a confirmed one.
    InvalidTransition {
        tx_id: String,
        from: String,
        to: String,
    },

    ValidationError {
        field: &'static str,
        message: String,
    },

    StorageError {
        operation: String,
        details: String,
    },

    /// Agent stream send/receive failure.
    TransportError {
        agent: String,
        details: String,
    },
}

impl EngineError {
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::StorageError { .. } => "STORAGE_ERROR",
            Self::TransportError { .. } => "TRANSPORT_ERROR",
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn storage(operation: &str, err: impl fmt::Display) -> Self {
        Self::StorageError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists { entity, id } => write!(f, "{} '{}' already exists", entity, id),
            Self::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            Self::InvalidTransition { tx_id, from, to } => write!(
                f,
                "Transaction '{}' cannot move from '{}' to '{}'",
                tx_id, from, to
            ),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::StorageError { operation, details } => {
                write!(f, "Storage error during '{}': {}", operation, details)
            }
            Self::TransportError { agent, details } => {
                write!(f, "Transport error for agent '{}': {}", agent, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::storage("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::storage("migrate", err)
    }
}
