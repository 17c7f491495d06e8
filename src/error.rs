//! Error types for the context agent core

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Classification service error: {0}")]
    Llm(String),

    #[error("Embedding service error: {0}")]
    Embedding(String),

    #[error("Graph store unavailable: {0}")]
    GraphUnavailable(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Read-only violation: {0}")]
    ReadOnlyViolation(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
