//! Error types for the intake service.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("No LLM provider configured")]
    NotConfigured,
}

/// Webhook delivery errors. Logged and swallowed by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Webhook request failed: {0}")]
    Request(String),

    #[error("Webhook returned HTTP {status}")]
    HttpStatus { status: u16 },
}

/// Business outcomes of the intake orchestrator.
///
/// `LinkNotFound` and `SessionNotFound` are recoverable conditions the routing
/// layer maps to client-visible responses. `Persistence` is an infrastructure
/// fault surfaced as a generic internal error.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Link not found or expired")]
    LinkNotFound,

    #[error("Session not found or already finalized")]
    SessionNotFound,

    #[error("Persistence failure: {0}")]
    Persistence(#[from] DatabaseError),
}
