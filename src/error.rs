//! Error types for tenant store operations

use thiserror::Error;

/// Errors that can occur while talking to tenant storage
#[derive(Debug, Error)]
pub enum PersistError {
    /// Missing or unreadable connection configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An entity could not be turned into (or read back from) JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQL execution failed
    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    /// A statement of a script failed while running with stop-on-error
    #[error("Script statement failed: {0}")]
    ScriptStatement(String),

    /// Commit or rollback failed; the connection state is unknown
    #[error("Transaction state error: {0}")]
    TransactionState(String),

    /// Lifecycle request does not fit the current tenant state
    #[error("Tenant conflict: {0}")]
    TenantConflict(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PersistError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transaction_state(msg: impl Into<String>) -> Self {
        Self::TransactionState(msg.into())
    }

    pub fn tenant_conflict(msg: impl Into<String>) -> Self {
        Self::TenantConflict(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;
