//! Error types for AgentDesk.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Run refused: previous run for {0} has not completed")]
    RunRefused(String),

    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Project already exists: {0}")]
    ProjectExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RunRefused(_) | Self::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
