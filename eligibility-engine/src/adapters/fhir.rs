use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{send_authenticated, ProtocolAdapter, RawProviderResponse};
use crate::credentials::CredentialBroker;
use crate::directory::{ProtocolVariant, ProviderProfile};
use crate::error::{EligibilityError, EngineResult};
use crate::models::EligibilityQuery;

const FHIR_JSON: &str = "application/fhir+json";

/// Matched patient and their first active coverage
#[derive(Debug, Clone)]
pub struct FhirEligibility {
    pub patient_id: String,
    pub coverage: Value,
}

/// FHIR R4 Patient search followed by Coverage search
pub struct FhirAdapter {
    http: Client,
    broker: Arc<CredentialBroker>,
}

impl FhirAdapter {
    pub fn new(http: Client, broker: Arc<CredentialBroker>) -> Self {
        Self { http, broker }
    }

    async fn search(
        &self,
        provider: &ProviderProfile,
        path: &str,
        params: &[(&str, String)],
    ) -> EngineResult<Value> {
        let url = provider.url(path);
        let response = send_authenticated(&self.broker, provider, |auth| {
            auth.apply(self.http.get(&url))
                .header(reqwest::header::ACCEPT, FHIR_JSON)
                .query(params)
        })
        .await?;
        Ok(response.json().await?)
    }

    async fn find_patient(&self, provider: &ProviderProfile, query: &EligibilityQuery) -> EngineResult<String> {
        let path = provider
            .endpoints
            .patient
            .as_deref()
            .ok_or_else(|| EligibilityError::UnsupportedProvider(format!("{} has no Patient endpoint", provider.id)))?;
        let params = [
            ("identifier", query.member_id.clone()),
            ("family", query.patient.last_name.clone()),
            ("given", query.patient.first_name.clone()),
            ("birthdate", query.patient.dob.format("%Y-%m-%d").to_string()),
        ];
        let bundle = self.search(provider, path, &params).await?;

        let patient = bundle_resources(&bundle, "Patient")
            .find(|patient| patient_matches(patient, query))
            .ok_or(EligibilityError::PatientNotFound)?;
        patient
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EligibilityError::MalformedResponse("matched Patient has no id".into()))
    }

    async fn find_active_coverage(&self, provider: &ProviderProfile, patient_id: &str) -> EngineResult<Value> {
        let path = provider
            .endpoints
            .coverage
            .as_deref()
            .or(provider.endpoints.eligibility.as_deref())
            .ok_or_else(|| EligibilityError::UnsupportedProvider(format!("{} has no Coverage endpoint", provider.id)))?;
        let params = [
            ("beneficiary", format!("Patient/{patient_id}")),
            ("status", "active".to_string()),
        ];
        let bundle = self.search(provider, path, &params).await?;

        let active = bundle_resources(&bundle, "Coverage")
            .find(|coverage| coverage.get("status").and_then(Value::as_str) == Some("active"))
            .cloned();
        active.ok_or(EligibilityError::NoActiveCoverage)
    }
}

#[async_trait]
impl ProtocolAdapter for FhirAdapter {
    fn protocol(&self) -> ProtocolVariant {
        ProtocolVariant::Fhir
    }

    #[instrument(skip_all, fields(provider_id = %provider.id))]
    async fn query_eligibility(
        &self,
        provider: &ProviderProfile,
        query: &EligibilityQuery,
    ) -> EngineResult<RawProviderResponse> {
        let patient_id = self.find_patient(provider, query).await?;
        debug!("Matched FHIR patient");
        let coverage = self.find_active_coverage(provider, &patient_id).await?;
        Ok(RawProviderResponse::Fhir(FhirEligibility { patient_id, coverage }))
    }
}

/// Resources of the given type in a search Bundle, in server order.
fn bundle_resources<'a>(bundle: &'a Value, resource_type: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("resource"))
        .filter(move |resource| resource.get("resourceType").and_then(Value::as_str) == Some(resource_type))
}

/// Servers may return fuzzy matches; only an exact demographic match counts.
/// Names compare case-insensitively, birth date and identifier exactly.
fn patient_matches(patient: &Value, query: &EligibilityQuery) -> bool {
    let dob = query.patient.dob.format("%Y-%m-%d").to_string();
    if patient.get("birthDate").and_then(Value::as_str) != Some(dob.as_str()) {
        return false;
    }

    let identifier_matches = patient
        .get("identifier")
        .and_then(Value::as_array)
        .is_some_and(|ids| {
            ids.iter()
                .any(|id| id.get("value").and_then(Value::as_str) == Some(query.member_id.as_str()))
        });
    if !identifier_matches {
        return false;
    }

    patient
        .get("name")
        .and_then(Value::as_array)
        .is_some_and(|names| {
            names.iter().any(|name| {
                let family = name
                    .get("family")
                    .and_then(Value::as_str)
                    .is_some_and(|f| f.eq_ignore_ascii_case(&query.patient.last_name));
                let given = name
                    .get("given")
                    .and_then(Value::as_array)
                    .is_some_and(|given| {
                        given
                            .iter()
                            .filter_map(Value::as_str)
                            .any(|g| g.eq_ignore_ascii_case(&query.patient.first_name))
                    });
                family && given
            })
        })
}
