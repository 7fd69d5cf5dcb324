//! Error types for the orchestration engine.

pub mod unified;

pub use unified::ErrorCategory;

use thiserror::Error;

/// Primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing session identifier")]
    MissingSession,

    #[error("Attachment {file_id} could not be resolved")]
    InvalidAttachment { file_id: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Provider stream for turn {turn} did not supply a message id")]
    MissingMessageId { turn: usize },

    #[error("Unrecognised stop reason: {0}")]
    UnknownStopReason(String),

    #[error("Tool execution error: {tool_name} - {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Approval error: {0}")]
    Approval(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

impl EngineError {
    /// Create an API error from a status code and response body.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::MissingSession | Self::InvalidAttachment { .. } => {
                ErrorCategory::Validation
            }
            Self::Provider(_)
            | Self::Stream(_)
            | Self::MissingMessageId { .. }
            | Self::UnknownStopReason(_) => ErrorCategory::Provider,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                _ => ErrorCategory::Provider,
            },
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::ToolExecution { .. } => ErrorCategory::Tool,
            Self::Approval(_) => ErrorCategory::Approval,
            Self::Persistence(_) => ErrorCategory::Persistence,
            Self::Configuration(_) | Self::ConfigFile(_) => ErrorCategory::Configuration,
            Self::Network(_) => ErrorCategory::Network,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// Whether this error aborts the request it occurred in.
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, EngineError>;
