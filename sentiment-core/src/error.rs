//! Error types for the sentiment-core crate.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the tracking backend, object storage, registry and configuration.

use thiserror::Error;

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Top-level error type for the lifecycle core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Tracking backend error: {0}")]
    Tracking(String),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Model registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CoreError {
    pub fn tracking(msg: impl Into<String>) -> Self {
        Self::Tracking(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error means "the thing does not exist" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors from cron scheduling and background job bookkeeping.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCronExpression { expression: String, message: String },

    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    #[error("Maximum concurrent jobs exceeded (max: {max})")]
    MaxJobsExceeded { max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::registry("no version for run abc");
        assert_eq!(err.to_string(), "Model registry error: no version for run abc");
    }

    #[test]
    fn test_scheduler_error_converts() {
        let err: CoreError = SchedulerError::MaxJobsExceeded { max: 1 }.into();
        assert!(err.to_string().contains("max: 1"));
        assert!(!err.is_not_found());
        assert!(CoreError::not_found("x").is_not_found());
    }
}
