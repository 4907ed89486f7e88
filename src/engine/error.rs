// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the storage engines
//!
//! Every driver-specific failure (sqlx, mongodb) is mapped onto
//! [`EngineError`] so the pool and its callers can reason about failures
//! without knowing which backend produced them. The pool then attaches the
//! backend identity through [`EngineFailure`].

use thiserror::Error;

use crate::engine::types::EngineIdentity;

/// Unified error type for all storage engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    #[error("Record not found in {table} where {key} = {value}")]
    NotFound {
        table: String,
        key: String,
        value: String,
    },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Query execution error: {message}")]
    Execution { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection { message: msg.into() }
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::ConstraintViolation { message: msg.into() }
    }

    pub fn not_found(table: &str, key: &str, value: impl ToString) -> Self {
        Self::NotFound {
            table: table.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode { message: msg.into() }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Error returned by any operation issued after `close()`.
    pub fn closed(name: &str) -> Self {
        Self::connection(format!("engine '{}' is closed", name))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// An adapter failure attributed to the engine that produced it.
#[derive(Debug, Error)]
#[error(
    "dbName={}, dbEngine={}, dbType={}, err: {source}",
    .identity.name,
    .identity.engine,
    .identity.database_type
)]
pub struct EngineFailure {
    pub identity: EngineIdentity,
    #[source]
    pub source: EngineError,
}

impl EngineFailure {
    pub fn new(identity: EngineIdentity, source: EngineError) -> Self {
        Self { identity, source }
    }
}

/// Error surfaced by [`EnginePool`](crate::engine::EnginePool) operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Engine(#[from] EngineFailure),

    #[error("failed to close {} engine(s): {}", .0.len(), join_failures(.0))]
    Close(Vec<EngineFailure>),

    /// Rejected before any engine was called.
    #[error("invalid record: {0}")]
    InvalidRecord(#[source] EngineError),
}

impl PoolError {
    /// The engine failures carried by this error, in the order observed.
    pub fn failures(&self) -> Vec<&EngineFailure> {
        match self {
            Self::Engine(failure) => vec![failure],
            Self::Close(failures) => failures.iter().collect(),
            Self::InvalidRecord(_) => Vec::new(),
        }
    }
}

fn join_failures(failures: &[EngineFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
