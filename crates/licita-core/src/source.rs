use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Stable key identifying a procurement source (`pncp`, `compras_gov`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceCode(String);

impl SourceCode {
    pub const PNCP: &'static str = "pncp";
    pub const COMPRAS_GOV: &'static str = "compras_gov";
    pub const TRANSPARENCIA: &'static str = "transparencia";

    /// Parse and normalize a source code to lowercase.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let normalized = input.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(ValidationError::EmptySourceCode);
        }

        for (index, ch) in normalized.chars().enumerate() {
            let valid = ch.is_ascii_alphanumeric() || ch == '_' || ch == '-';
            if !valid {
                return Err(ValidationError::SourceCodeInvalidChar { ch, index });
            }
        }

        Ok(Self(normalized))
    }

    /// Built-in codes are lowercase identifiers already.
    pub(crate) fn builtin(code: &'static str) -> Self {
        Self(code.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SourceCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceCode {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for SourceCode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SourceCode> for String {
    fn from(value: SourceCode) -> Self {
        value.0
    }
}

impl AsRef<str> for SourceCode {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_lowercase() {
        let code = SourceCode::parse("  PNCP ").expect("valid code");
        assert_eq!(code.as_str(), "pncp");
    }

    #[test]
    fn rejects_empty_and_invalid_codes() {
        assert_eq!(SourceCode::parse("   "), Err(ValidationError::EmptySourceCode));
        assert!(matches!(
            SourceCode::parse("compras gov"),
            Err(ValidationError::SourceCodeInvalidChar { ch: ' ', index: 7 })
        ));
    }
}
