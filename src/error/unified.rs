//! Error classification used to route failures through the turn loop.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Broad error category.
///
/// Categories map onto how the engine reacts: validation and provider
/// failures end the run, everything else is logged and absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Provider,
    Network,
    Authentication,
    RateLimit,
    Tool,
    Approval,
    Persistence,
    Protocol,
    Configuration,
    Serialization,
    Io,
}

impl ErrorCategory {
    /// Whether an error of this category aborts the whole request.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::Validation
                | Self::Provider
                | Self::Network
                | Self::Authentication
                | Self::RateLimit
                | Self::Configuration
        )
    }
}
