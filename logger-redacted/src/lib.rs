//! PHI-safe logging for the eligibility verification engine
//!
//! Eligibility requests carry member identifiers, names and dates of birth.
//! None of that may reach a log sink. This crate provides:
//!
//! - **Subscriber setup**: [`init`] installs a `tracing_subscriber` registry
//!   with an `EnvFilter` and either JSON or pretty output
//! - **Redaction**: [`PiiRedactor`] scrubs SSNs, dates, phone numbers and
//!   e-mail addresses out of free text such as vendor error bodies
//! - **Correlation**: [`hash_identifier`] turns a member id into a short,
//!   stable token so log lines can be joined without exposing the id
//! - **Audit**: [`audit::AuditEvent`] records one PHI-free line per
//!   verification attempt on the `audit` target
//!
//! # Example
//!
//! ```rust,no_run
//! use logger_redacted::{hash_identifier, init, LoggerConfig};
//!
//! init(&LoggerConfig::default()).expect("logger");
//! tracing::info!(member = %hash_identifier("W123456789"), "eligibility requested");
//! ```

pub mod audit;
pub mod config;
pub mod redactor;

pub use config::*;
pub use redactor::*;

use thiserror::Error;
use tracing_subscriber::{
    filter::{Directive, ParseError},
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over [`LoggerConfig::log_level`] when it is set. Audit
/// events stay enabled at `info` unless compliance logging is switched off.
pub fn init(config: &LoggerConfig) -> Result<(), LoggerError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| LoggerError::InvalidFilter(e.to_string()))?,
    };
    let audit_level = if config.compliance_logging { "info" } else { "off" };
    let audit_directive: Directive = format!("{}={audit_level}", audit::AUDIT_TARGET)
        .parse()
        .map_err(|e: ParseError| LoggerError::InvalidFilter(e.to_string()))?;
    let env_filter = env_filter.add_directive(audit_directive);

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .pretty(),
            )
            .try_init(),
    };

    result.map_err(|e| LoggerError::AlreadyInitialized(e.to_string()))
}
