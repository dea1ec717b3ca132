//! Protocol adapters.
//!
//! Each adapter turns an [`EligibilityQuery`] into one provider-specific
//! exchange and returns the provider's answer as a [`RawProviderResponse`].
//! Normalization into the canonical model happens later, in one place.

pub mod fhir;
pub mod rest;
pub mod soap;
pub mod x12;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

use crate::credentials::{AuthMaterial, CredentialBroker};
use crate::directory::{ProtocolVariant, ProviderProfile};
use crate::error::{EligibilityError, EngineResult};
use crate::models::EligibilityQuery;

pub use fhir::{FhirAdapter, FhirEligibility};
pub use rest::{RestJsonAdapter, RestPayload, RestShape};
pub use soap::{SoapAdapter, SoapEligibility};
pub use x12::{EdiTransport, UnroutedTransport, X12Adapter, X12Eligibility};

/// Provider answer before normalization
#[derive(Debug, Clone)]
pub enum RawProviderResponse {
    Fhir(FhirEligibility),
    X12(X12Eligibility),
    Soap(SoapEligibility),
    RestJson(RestPayload),
}

impl RawProviderResponse {
    pub fn protocol(&self) -> ProtocolVariant {
        match self {
            Self::Fhir(_) => ProtocolVariant::Fhir,
            Self::X12(_) => ProtocolVariant::X12,
            Self::Soap(_) => ProtocolVariant::Soap,
            Self::RestJson(_) => ProtocolVariant::RestJson,
        }
    }
}

/// One wire protocol for eligibility queries
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> ProtocolVariant;

    async fn query_eligibility(
        &self,
        provider: &ProviderProfile,
        query: &EligibilityQuery,
    ) -> EngineResult<RawProviderResponse>;
}

/// Adapters available to the orchestrator, one per protocol
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<ProtocolVariant, Arc<dyn ProtocolAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same protocol.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.protocol(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn contains(&self, protocol: ProtocolVariant) -> bool {
        self.adapters.contains_key(&protocol)
    }

    pub fn get(&self, protocol: ProtocolVariant) -> EngineResult<Arc<dyn ProtocolAdapter>> {
        self.adapters
            .get(&protocol)
            .cloned()
            .ok_or_else(|| EligibilityError::Configuration(format!("no adapter registered for {protocol}")))
    }
}

/// Send an authenticated request, re-acquiring credentials once on 401.
///
/// `build` is called once per attempt so the request can be rebuilt with the
/// fresh credential. A second 401 means the credentials are wrong, not stale.
pub(crate) async fn send_authenticated<F>(
    broker: &CredentialBroker,
    provider: &ProviderProfile,
    build: F,
) -> EngineResult<Response>
where
    F: Fn(&AuthMaterial) -> RequestBuilder,
{
    let auth = require_credentials(broker, provider).await?;
    let response = build(&auth).send().await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return ensure_success(response);
    }

    warn!(provider_id = %provider.id, "Provider rejected credential, re-acquiring once");
    broker.invalidate(&provider.id);
    let auth = require_credentials(broker, provider).await?;
    let response = build(&auth).send().await?;
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(EligibilityError::AuthenticationFailure(format!(
            "{} rejected freshly acquired credentials",
            provider.id
        )));
    }
    ensure_success(response)
}

async fn require_credentials(broker: &CredentialBroker, provider: &ProviderProfile) -> EngineResult<AuthMaterial> {
    broker.acquire(provider).await?.ok_or_else(|| {
        EligibilityError::AuthenticationFailure(format!("no credentials configured for {}", provider.id))
    })
}

fn ensure_success(response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(EligibilityError::from_status(status))
    }
}
