use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a failure.
///
/// Only [`ErrorCategory::Availability`] failures are worth retrying on a
/// different protocol or intermediary; everything else signals either a
/// policy answer or a problem that another attempt would only repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller input the engine cannot route (unknown payer, unsupported provider)
    Validation,
    /// Credentials rejected or missing
    Authentication,
    /// Payer answered "not eligible"; not a system fault
    Policy,
    /// Payer answered with something we cannot interpret
    Integration,
    /// Payer or transport could not be reached
    Availability,
    /// Configuration, signing and other local faults
    Internal,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Availability)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Policy => "policy",
            Self::Integration => "integration",
            Self::Availability => "availability",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every workspace error so callers can build structured,
/// auditable failure records without matching on concrete enums.
pub trait Categorized {
    fn category(&self) -> ErrorCategory;

    /// Stable failure code from [`crate::codes`]
    fn code(&self) -> &'static str;
}

/// Error raised when a category name read from configuration is unknown
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown error category: {0}")]
pub struct UnknownCategory(pub String);

impl std::str::FromStr for ErrorCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "authentication" => Ok(Self::Authentication),
            "policy" => Ok(Self::Policy),
            "integration" => Ok(Self::Integration),
            "availability" => Ok(Self::Availability),
            "internal" => Ok(Self::Internal),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_availability_is_retryable() {
        let all = [
            ErrorCategory::Validation,
            ErrorCategory::Authentication,
            ErrorCategory::Policy,
            ErrorCategory::Integration,
            ErrorCategory::Availability,
            ErrorCategory::Internal,
        ];
        let retryable: Vec<_> = all.iter().filter(|c| c.is_retryable()).collect();
        assert_eq!(retryable, vec![&ErrorCategory::Availability]);
    }

    #[test]
    fn test_category_round_trips_through_str() {
        let parsed: ErrorCategory = "integration".parse().unwrap();
        assert_eq!(parsed, ErrorCategory::Integration);
        assert_eq!(parsed.to_string(), "integration");
        assert!("bogus".parse::<ErrorCategory>().is_err());
    }
}
