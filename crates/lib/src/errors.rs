use std::time::Duration;
use thiserror::Error;

/// Custom error types for the extraction engine.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Failed to parse document: {0}")]
    Parse(String),
    #[error("Failed to build Reqwest client: {0}")]
    ReqwestClientBuild(reqwest::Error),
    #[error("Failed to send request to the AI provider: {0}")]
    AiRequest(reqwest::Error),
    #[error("AI provider returned an error: {0}")]
    AiApi(String),
    #[error("Failed to decode the AI provider response: {0}")]
    AiResponse(String),
    #[error("{0} call timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Database error: {0}")]
    Database(#[from] turso::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}
