use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EligibilityError, EngineResult};

/// Wire protocol an adapter speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    Fhir,
    X12,
    Soap,
    RestJson,
}

impl ProtocolVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fhir => "fhir",
            Self::X12 => "x12",
            Self::Soap => "soap",
            Self::RestJson => "rest_json",
        }
    }
}

impl std::fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Oauth2,
    ApiKey,
    /// Static API key presented as a bearer token
    BearerKey,
    Basic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCategory {
    National,
    Regional,
}

/// Relative service paths under the provider's base endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceEndpoints {
    pub eligibility: Option<String>,
    pub coverage: Option<String>,
    pub patient: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub fhir: bool,
    pub x12: bool,
    pub soap: bool,
    pub rest_json: bool,
    /// Intermediary that can verify on behalf of other payers
    pub clearinghouse: bool,
}

/// Static description of one insurance provider or clearinghouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProfile {
    pub id: String,
    pub display_name: String,
    pub category: ProviderCategory,
    pub protocol: ProtocolVariant,
    #[serde(default)]
    pub alternate_protocol: Option<ProtocolVariant>,
    pub auth_scheme: AuthScheme,
    pub base_endpoint: String,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub soap_action: Option<String>,
    #[serde(default)]
    pub endpoints: ServiceEndpoints,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub fhir_version: Option<String>,
    #[serde(default)]
    pub sandbox_available: bool,
    #[serde(default)]
    pub production_requirements: Vec<String>,
}

impl ProviderProfile {
    /// Create a profile that speaks a single protocol.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        protocol: ProtocolVariant,
        auth_scheme: AuthScheme,
        base_endpoint: impl Into<String>,
    ) -> Self {
        let mut capabilities = Capabilities::default();
        capabilities.set(protocol);
        Self {
            id: id.into(),
            display_name: display_name.into(),
            category: ProviderCategory::National,
            protocol,
            alternate_protocol: None,
            auth_scheme,
            base_endpoint: base_endpoint.into(),
            token_endpoint: None,
            scope: None,
            soap_action: None,
            endpoints: ServiceEndpoints::default(),
            capabilities,
            fhir_version: None,
            sandbox_available: false,
            production_requirements: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: ProviderCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_alternate(mut self, protocol: ProtocolVariant) -> Self {
        self.alternate_protocol = Some(protocol);
        self.capabilities.set(protocol);
        self
    }

    pub fn with_token_endpoint(mut self, url: impl Into<String>) -> Self {
        self.token_endpoint = Some(url.into());
        self
    }

    pub fn with_endpoints(mut self, endpoints: ServiceEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn as_clearinghouse(mut self) -> Self {
        self.capabilities.clearinghouse = true;
        self
    }

    pub fn supports(&self, protocol: ProtocolVariant) -> bool {
        self.capabilities.supports(protocol)
    }

    /// FHIR when supported, otherwise EDI, otherwise the declared protocol.
    pub fn preferred_protocol(&self) -> ProtocolVariant {
        if self.capabilities.fhir {
            ProtocolVariant::Fhir
        } else if self.capabilities.x12 {
            ProtocolVariant::X12
        } else {
            self.protocol
        }
    }

    /// A second channel to the same provider, if one is declared.
    pub fn secondary_protocol(&self) -> Option<ProtocolVariant> {
        let preferred = self.preferred_protocol();
        self.alternate_protocol
            .filter(|alt| *alt != preferred && self.supports(*alt))
    }

    /// Join a relative path onto the base endpoint.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EligibilityError::Configuration(
                "provider profile with empty id".into(),
            ));
        }
        if self.auth_scheme == AuthScheme::Oauth2 && self.token_endpoint.is_none() {
            return Err(EligibilityError::Configuration(format!(
                "provider {} uses OAuth2 but declares no token endpoint",
                self.id
            )));
        }
        if !self.supports(self.protocol) {
            return Err(EligibilityError::Configuration(format!(
                "provider {} declares protocol {} without the matching capability",
                self.id, self.protocol
            )));
        }
        Ok(())
    }
}

impl Capabilities {
    pub fn supports(&self, protocol: ProtocolVariant) -> bool {
        match protocol {
            ProtocolVariant::Fhir => self.fhir,
            ProtocolVariant::X12 => self.x12,
            ProtocolVariant::Soap => self.soap,
            ProtocolVariant::RestJson => self.rest_json,
        }
    }

    fn set(&mut self, protocol: ProtocolVariant) {
        match protocol {
            ProtocolVariant::Fhir => self.fhir = true,
            ProtocolVariant::X12 => self.x12 = true,
            ProtocolVariant::Soap => self.soap = true,
            ProtocolVariant::RestJson => self.rest_json = true,
        }
    }
}

/// What an integrator must arrange before going live with a provider
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequirements {
    pub provider_id: String,
    pub display_name: String,
    pub auth_scheme: AuthScheme,
    pub sandbox_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    pub production_requirements: Vec<String>,
}

/// Registry of known providers, keyed by id
#[derive(Debug, Clone, Default)]
pub struct ProviderDirectory {
    profiles: BTreeMap<String, ProviderProfile>,
}

impl ProviderDirectory {
    pub fn from_profiles(profiles: impl IntoIterator<Item = ProviderProfile>) -> EngineResult<Self> {
        let mut map = BTreeMap::new();
        for profile in profiles {
            profile.validate()?;
            let id = profile.id.clone();
            if map.insert(id.clone(), profile).is_some() {
                return Err(EligibilityError::Configuration(format!(
                    "duplicate provider id {id}"
                )));
            }
        }
        Ok(Self { profiles: map })
    }

    pub fn from_yaml_str(yaml: &str) -> EngineResult<Self> {
        let profiles: Vec<ProviderProfile> = serde_yaml::from_str(yaml)?;
        Self::from_profiles(profiles)
    }

    pub fn from_yaml_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EligibilityError::Configuration(format!(
                "cannot read provider directory {}: {e}",
                path.display()
            ))
        })?;
        let directory = Self::from_yaml_str(&raw)?;
        debug!(path = %path.display(), providers = directory.len(), "Loaded provider directory");
        Ok(directory)
    }

    /// Built-in catalog of supported payers and clearinghouses
    pub fn builtin() -> Self {
        let profiles = builtin_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self { profiles }
    }

    pub fn lookup(&self, provider_id: &str) -> EngineResult<&ProviderProfile> {
        self.profiles
            .get(provider_id)
            .ok_or_else(|| EligibilityError::ProviderNotFound(provider_id.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &ProviderProfile> {
        self.profiles.values()
    }

    pub fn by_category(&self, category: ProviderCategory) -> Vec<&ProviderProfile> {
        self.profiles
            .values()
            .filter(|p| p.category == category)
            .collect()
    }

    pub fn clearinghouses(&self) -> Vec<&ProviderProfile> {
        self.profiles
            .values()
            .filter(|p| p.capabilities.clearinghouse)
            .collect()
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn requirements(&self, provider_id: &str) -> EngineResult<ProviderRequirements> {
        let profile = self.lookup(provider_id)?;
        Ok(ProviderRequirements {
            provider_id: profile.id.clone(),
            display_name: profile.display_name.clone(),
            auth_scheme: profile.auth_scheme,
            sandbox_available: profile.sandbox_available,
            sandbox_url: profile
                .sandbox_available
                .then(|| profile.url("sandbox")),
            production_requirements: profile.production_requirements.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn fhir_payer(
    id: &str,
    name: &str,
    category: ProviderCategory,
    base: &str,
    token_path: &str,
    requirements: &[&str],
) -> ProviderProfile {
    let mut profile = ProviderProfile::new(id, name, ProtocolVariant::Fhir, AuthScheme::Oauth2, base)
        .with_category(category)
        .with_alternate(ProtocolVariant::X12)
        .with_token_endpoint(format!("{base}{token_path}"))
        .with_endpoints(ServiceEndpoints {
            eligibility: Some("/fhir/R4/Coverage".into()),
            coverage: None,
            patient: Some("/fhir/R4/Patient".into()),
        });
    profile.fhir_version = Some("R4".into());
    profile.sandbox_available = true;
    profile.production_requirements = requirements.iter().map(|r| (*r).to_string()).collect();
    profile
}

fn builtin_profiles() -> Vec<ProviderProfile> {
    use ProviderCategory::{National, Regional};

    let standard = [
        "Developer portal registration",
        "Application review",
        "Production attestation",
    ];

    let bcbs_florida = fhir_payer(
        "bcbs_florida",
        "Florida Blue",
        Regional,
        "https://api.floridablue.com",
        "/oauth/token",
        &[
            "Developer portal registration",
            "Application review",
            "Production attestation",
            "Security assessment",
        ],
    );

    let mut united_optum = fhir_payer(
        "united_optum",
        "UnitedHealth Optum",
        National,
        "https://api.optum.com",
        "/oauth/token",
        &["Optum developer account", "Trading partner agreement", "Production attestation"],
    );
    united_optum.endpoints.eligibility = Some("/eligibility/v1/check".into());
    united_optum.endpoints.coverage = Some("/fhir/R4/Coverage".into());

    let legacy_bcbs = ProviderProfile::new(
        "bcbs",
        "Blue Cross Blue Shield",
        ProtocolVariant::RestJson,
        AuthScheme::Oauth2,
        "https://api.bcbs.com/v2",
    )
    .with_token_endpoint("https://api.bcbs.com/oauth/token");

    let legacy_united = ProviderProfile::new(
        "united",
        "UnitedHealthcare",
        ProtocolVariant::RestJson,
        AuthScheme::ApiKey,
        "https://api.uhc.com/v1",
    );

    let mut delta_dental = ProviderProfile::new(
        "delta_dental",
        "Delta Dental",
        ProtocolVariant::X12,
        AuthScheme::ApiKey,
        "https://edi.deltadental.com",
    );
    delta_dental.production_requirements = vec!["EDI enrollment".into(), "Trading partner agreement".into()];

    let mut metlife = ProviderProfile::new(
        "metlife",
        "MetLife Dental",
        ProtocolVariant::X12,
        AuthScheme::ApiKey,
        "https://edi.metlife.com",
    );
    metlife.production_requirements = vec!["EDI enrollment".into()];

    let mut change_healthcare = ProviderProfile::new(
        "change_healthcare",
        "Change Healthcare",
        ProtocolVariant::RestJson,
        AuthScheme::Oauth2,
        "https://apigw.changehealthcare.com",
    )
    .with_token_endpoint("https://apigw.changehealthcare.com/apip/auth/v2/token")
    .with_endpoints(ServiceEndpoints {
        eligibility: Some("/medicalnetwork/eligibility/v3".into()),
        ..ServiceEndpoints::default()
    })
    .as_clearinghouse();
    change_healthcare.sandbox_available = true;

    let waystar = ProviderProfile::new(
        "waystar",
        "Waystar",
        ProtocolVariant::RestJson,
        AuthScheme::ApiKey,
        "https://api.waystar.com",
    )
    .with_endpoints(ServiceEndpoints {
        eligibility: Some("/api/v1/eligibility".into()),
        ..ServiceEndpoints::default()
    })
    .as_clearinghouse();

    let mut eligible = ProviderProfile::new(
        "eligible",
        "Eligible",
        ProtocolVariant::RestJson,
        AuthScheme::BearerKey,
        "https://gds.eligibleapi.com/v1.5",
    )
    .with_endpoints(ServiceEndpoints {
        eligibility: Some("/coverage.json".into()),
        ..ServiceEndpoints::default()
    })
    .as_clearinghouse();
    eligible.production_requirements = vec!["Eligible account".into(), "Payer enrollment".into()];

    let mut availity = ProviderProfile::new(
        "availity",
        "Availity",
        ProtocolVariant::Soap,
        AuthScheme::Basic,
        "https://api.availity.com",
    )
    .with_endpoints(ServiceEndpoints {
        eligibility: Some("/rtx/eligibility".into()),
        ..ServiceEndpoints::default()
    })
    .as_clearinghouse();
    availity.soap_action = Some("http://availity.com/rtx/RealTimeTransaction".into());

    vec![
        bcbs_florida,
        fhir_payer(
            "bcbs_ca",
            "Blue Shield of California",
            Regional,
            "https://api.blueshieldca.com",
            "/oauth/token",
            &standard,
        ),
        united_optum,
        fhir_payer("cigna", "Cigna Healthcare", National, "https://api.cigna.com", "/oauth/token", &standard),
        fhir_payer("aetna", "Aetna", National, "https://api.aetna.com", "/oauth2/token", &standard),
        fhir_payer("humana", "Humana", National, "https://api.humana.com", "/oauth2/token", &standard),
        fhir_payer("anthem", "Anthem Blue Cross", National, "https://api.anthem.com", "/oauth2/token", &standard),
        fhir_payer(
            "kaiser",
            "Kaiser Permanente",
            Regional,
            "https://api.kaiserpermanente.org",
            "/oauth2/token",
            &standard,
        ),
        legacy_bcbs,
        legacy_united,
        delta_dental,
        metlife,
        change_healthcare,
        waystar,
        eligible,
        availity,
    ]
}
