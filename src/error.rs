//! Error types for the voice banking orchestrator
//!
//! Every variant here is an infrastructure or programming failure. Business
//! conditions a user can recover from (wrong code, insufficient funds, no
//! matching account) are not errors: they travel through the dialogue as
//! renderer situations and leave the turn pipeline on the happy path.

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {

    // =============================
    // Turn Pipeline Errors
    // =============================

    #[error("Session store error: {0}")]
    SessionStore(String),

    #[error("Account store error: {0}")]
    AccountStore(String),

    #[error("Renderer error: {0}")]
    Renderer(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Timed out waiting on {0}")]
    Timeout(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup error: {0}")]
    Startup(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
