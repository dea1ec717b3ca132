// Engine configuration
use std::path::{Path, PathBuf};
use std::time::Duration;

use logger_redacted::LoggerConfig;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// Prefix for environment overrides, e.g. `ELIGIBILITY_CALL_TIMEOUT_SECS`
pub const ENV_PREFIX: &str = "ELIGIBILITY";

const MAX_TOKEN_SAFETY_MARGIN_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound on any single outbound provider call
    pub call_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_sweep_interval_secs: u64,
    /// Tokens are treated as expired this long before the provider says so
    pub token_safety_margin_secs: u64,
    /// Clearinghouse tried when a payer has no alternate protocol
    pub clearinghouse: Option<String>,
    /// YAML provider directory; the built-in catalog is used when unset
    pub directory_path: Option<PathBuf>,
    /// Environment variable holding the integrity signing secret
    pub signing_secret_env: String,
    /// Interchange sender id used on outbound EDI and clearinghouse requests
    pub submitter_id: String,
    pub submitter_npi: String,
    pub logging: LoggerConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            cache_ttl_secs: 3600,
            cache_sweep_interval_secs: 60,
            token_safety_margin_secs: 60,
            clearinghouse: None,
            directory_path: None,
            signing_secret_env: "ELIGIBILITY_SIGNING_SECRET".to_string(),
            submitter_id: "CLEARVERIFY".to_string(),
            submitter_npi: "1234567890".to_string(),
            logging: LoggerConfig::default(),
        }
    }
}

impl EngineSettings {
    /// Load settings from an optional file, then apply environment overrides.
    ///
    /// Nested keys use a double underscore, e.g. `ELIGIBILITY_LOGGING__FORMAT=pretty`.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs.max(1))
    }

    /// Capped at one day so the margin can never overflow token expiry arithmetic.
    pub fn token_safety_margin(&self) -> chrono::Duration {
        let secs = self.token_safety_margin_secs.min(MAX_TOKEN_SAFETY_MARGIN_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or_default())
    }
}
