use std::collections::BTreeMap;

use thiserror::Error;

/// Validation and contract errors exposed by `licita-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source code cannot be empty")]
    EmptySourceCode,
    #[error("source code contains invalid character '{ch}' at index {index}")]
    SourceCodeInvalidChar { ch: char, index: usize },

    #[error("record source_id cannot be empty")]
    EmptySourceId,

    #[error("UF must be a 2-letter state code: '{value}'")]
    InvalidStateCode { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("invalid date '{value}', expected YYYY-MM-DD")]
    InvalidDate { value: String },
    #[error("date range is inverted: {from} is after {to}")]
    InvertedDateRange { from: String, to: String },
}

/// Errors raised while loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("fallback source '{0}' is also enabled as a primary source")]
    FallbackIsPrimary(String),

    #[error("unknown source '{0}' in configuration")]
    UnknownSource(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        reason: &'static str,
    },
}

/// Terminal failure of a consolidation run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsolidationError {
    /// Every attempted source, including the fallback, produced zero records.
    #[error("all sources failed: {}", format_source_errors(.source_errors))]
    AllSourcesFailed {
        source_errors: BTreeMap<String, String>,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ConsolidationError {
    pub fn source_errors(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::AllSourcesFailed { source_errors } => Some(source_errors),
            Self::Validation(_) => None,
        }
    }
}

fn format_source_errors(source_errors: &BTreeMap<String, String>) -> String {
    source_errors
        .iter()
        .map(|(code, message)| format!("{code}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_sources_failed_lists_every_source_in_message() {
        let mut source_errors = BTreeMap::new();
        source_errors.insert(String::from("pncp"), String::from("timed out"));
        source_errors.insert(String::from("compras_gov"), String::from("status 503"));

        let error = ConsolidationError::AllSourcesFailed { source_errors };

        assert_eq!(
            error.to_string(),
            "all sources failed: compras_gov: status 503; pncp: timed out"
        );
        assert_eq!(error.source_errors().map(BTreeMap::len), Some(2));
    }
}
