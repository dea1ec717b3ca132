use error_common::codes::{authentication, availability, integration, internal, policy, validation};
use error_common::{Categorized, ErrorCategory};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EligibilityError {
    #[error("Unsupported insurance provider: {0}")]
    UnsupportedProvider(String),

    #[error("Provider not found in directory: {0}")]
    ProviderNotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Patient not found")]
    PatientNotFound,

    #[error("No active coverage found")]
    NoActiveCoverage,

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("EDI structural validation failed: {}", .0.join("; "))]
    StructuralParseFailure(Vec<String>),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Provider rejected request with HTTP {status}")]
    ProviderRejected { status: u16 },

    #[error("Eligibility service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Signing error: {0}")]
    Signing(#[from] crypto::CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EligibilityError {
    /// Map a non-success HTTP status to the failure it represents.
    ///
    /// 401 is classified as an authentication failure here; callers that
    /// can re-acquire credentials handle it before reaching this point.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => Self::AuthenticationFailure(format!("provider returned HTTP {status}")),
            404 | 408 | 429 | 502 | 503 | 504 => {
                Self::TransportUnavailable(format!("provider returned HTTP {status}"))
            }
            code if status.is_server_error() => {
                Self::TransportUnavailable(format!("provider returned HTTP {code}"))
            }
            code => Self::ProviderRejected { status: code },
        }
    }

    /// Policy outcomes are authoritative answers about the patient, not
    /// failures of the channel, so they never trigger a fallback.
    pub fn is_policy_outcome(&self) -> bool {
        matches!(self, Self::PatientNotFound | Self::NoActiveCoverage)
    }

    /// Whether the orchestrator may move on to the next channel.
    pub fn is_transient(&self) -> bool {
        self.category().is_retryable()
    }
}

impl Categorized for EligibilityError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedProvider(_) | Self::ProviderNotFound(_) => ErrorCategory::Validation,
            Self::AuthenticationFailure(_) => ErrorCategory::Authentication,
            Self::PatientNotFound | Self::NoActiveCoverage => ErrorCategory::Policy,
            Self::MalformedResponse(_)
            | Self::StructuralParseFailure(_)
            | Self::ProviderRejected { .. } => ErrorCategory::Integration,
            Self::TransportUnavailable(_) | Self::ServiceUnavailable(_) => {
                ErrorCategory::Availability
            }
            Self::Configuration(_) | Self::Signing(_) | Self::Serialization(_) => {
                ErrorCategory::Internal
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedProvider(_) => validation::UNSUPPORTED_PROVIDER,
            Self::ProviderNotFound(_) => validation::PROVIDER_NOT_FOUND,
            Self::AuthenticationFailure(_) => authentication::AUTHENTICATION_FAILURE,
            Self::PatientNotFound => policy::PATIENT_NOT_FOUND,
            Self::NoActiveCoverage => policy::NO_ACTIVE_COVERAGE,
            Self::MalformedResponse(_) => integration::MALFORMED_RESPONSE,
            Self::StructuralParseFailure(_) => integration::STRUCTURAL_PARSE_FAILURE,
            Self::ProviderRejected { .. } => integration::PROVIDER_REJECTED,
            Self::TransportUnavailable(_) => availability::TRANSPORT_UNAVAILABLE,
            Self::ServiceUnavailable(_) => availability::SERVICE_UNAVAILABLE,
            Self::Configuration(_) => internal::CONFIGURATION,
            Self::Signing(_) => internal::SIGNING,
            Self::Serialization(_) => internal::SERIALIZATION,
        }
    }
}

impl From<reqwest::Error> for EligibilityError {
    fn from(err: reqwest::Error) -> Self {
        // Search URLs carry demographics in the query string.
        let err = err.without_url();
        if let Some(status) = err.status() {
            return Self::from_status(status);
        }
        if err.is_decode() {
            return Self::MalformedResponse(err.to_string());
        }
        if err.is_builder() {
            return Self::Configuration(err.to_string());
        }
        Self::TransportUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for EligibilityError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_yaml::Error> for EligibilityError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EligibilityError>;
