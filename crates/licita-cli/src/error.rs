use std::collections::BTreeMap;

use licita_core::ConsolidationError;
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] licita_core::ValidationError),

    #[error(transparent)]
    Config(#[from] licita_core::ConfigError),

    #[error("all sources failed")]
    AllSourcesFailed {
        source_errors: BTreeMap<String, String>,
    },

    #[error("strict mode failed: {reason}")]
    StrictModeViolation { reason: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ConsolidationError> for CliError {
    fn from(error: ConsolidationError) -> Self {
        match error {
            ConsolidationError::AllSourcesFailed { source_errors } => {
                Self::AllSourcesFailed { source_errors }
            }
            ConsolidationError::Validation(error) => Self::Validation(error),
        }
    }
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Config(_) => 2,
            Self::AllSourcesFailed { .. } => 3,
            Self::Serialization(_) => 4,
            Self::StrictModeViolation { .. } => 5,
            Self::Io(_) => 10,
        }
    }

    /// Extra lines printed under the error message.
    pub fn details(&self) -> Vec<String> {
        match self {
            Self::AllSourcesFailed { source_errors } => source_errors
                .iter()
                .map(|(source, message)| format!("  {source}: {message}"))
                .collect(),
            _ => Vec::new(),
        }
    }
}
