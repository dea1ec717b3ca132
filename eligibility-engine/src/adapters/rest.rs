use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use super::{send_authenticated, ProtocolAdapter, RawProviderResponse};
use crate::credentials::CredentialBroker;
use crate::directory::{ProtocolVariant, ProviderProfile};
use crate::error::{EligibilityError, EngineResult};
use crate::models::EligibilityQuery;
use crate::procedures::service_type_code;

/// General dentist taxonomy sent on clearinghouse requests
const DENTIST_TAXONOMY: &str = "1223G0001X";
const GENERAL_HEALTH_SERVICE_TYPE: &str = "30";

/// Request and response layout of a proprietary JSON API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestShape {
    Bcbs,
    United,
    ChangeHealthcare,
    Waystar,
    Eligible,
}

impl RestShape {
    pub fn for_provider(provider_id: &str) -> Option<Self> {
        match provider_id {
            "bcbs" => Some(Self::Bcbs),
            "united" => Some(Self::United),
            "change_healthcare" => Some(Self::ChangeHealthcare),
            "waystar" => Some(Self::Waystar),
            "eligible" => Some(Self::Eligible),
            _ => None,
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            Self::Bcbs => "/eligibility/verify",
            Self::United => "/coverage/check",
            Self::ChangeHealthcare => "/medicalnetwork/eligibility/v3",
            Self::Waystar => "/api/v1/eligibility",
            Self::Eligible => "/coverage.json",
        }
    }

    pub fn request_body(&self, query: &EligibilityQuery, submitter_id: &str, control_number: &str) -> Value {
        let dob = query.patient.dob.format("%Y-%m-%d").to_string();
        let service_type = service_type_code(&query.procedure_code);
        match self {
            Self::Bcbs => json!({
                "memberIdentifier": query.member_id,
                "serviceCode": query.procedure_code,
                "patientInfo": {
                    "firstName": query.patient.first_name,
                    "lastName": query.patient.last_name,
                    "dateOfBirth": dob,
                },
            }),
            Self::United => json!({
                "subscriberId": query.member_id,
                "cptCode": query.procedure_code,
                "member": {
                    "first": query.patient.first_name,
                    "last": query.patient.last_name,
                    "dob": dob,
                },
            }),
            Self::ChangeHealthcare => json!({
                "controlNumber": control_number,
                "tradingPartnerServiceId": query.payer_id,
                "provider": {
                    "organizationName": submitter_id,
                    "npi": query.requesting_provider_id,
                },
                "subscriber": {
                    "memberId": query.member_id,
                    "firstName": query.patient.first_name,
                    "lastName": query.patient.last_name,
                    "birthDate": query.patient.dob.format("%Y%m%d").to_string(),
                },
                "encounter": { "serviceTypeCodes": [service_type] },
            }),
            Self::Waystar => json!({
                "transaction": {
                    "controlNumber": control_number,
                    "submitterId": submitter_id,
                    "receiverId": query.payer_id,
                    "transactionType": "270",
                },
                "provider": {
                    "npi": query.requesting_provider_id,
                    "taxonomy": DENTIST_TAXONOMY,
                },
                "subscriber": {
                    "memberNumber": query.member_id,
                    "firstName": query.patient.first_name,
                    "lastName": query.patient.last_name,
                    "dateOfBirth": dob,
                },
                "benefitInquiry": {
                    "serviceTypes": [service_type],
                    "dateOfService": Utc::now().date_naive().format("%Y-%m-%d").to_string(),
                },
            }),
            Self::Eligible => json!({
                "service_types": [GENERAL_HEALTH_SERVICE_TYPE, service_type],
                "member": {
                    "id": query.member_id,
                    "first_name": query.patient.first_name,
                    "last_name": query.patient.last_name,
                    "dob": dob,
                },
                "provider": {
                    "npi": query.requesting_provider_id,
                    "organization_name": submitter_id,
                },
                "trading_partner_id": trading_partner(&query.payer_id),
            }),
        }
    }
}

/// Eligible.com trading partner for a payer; unmapped payers pass through as-is.
pub fn trading_partner(payer_id: &str) -> &str {
    match payer_id {
        "bcbs_florida" => "florida_blue",
        "bcbs_ca" => "blue_shield_ca",
        "united_optum" => "united_healthcare",
        other => other,
    }
}

/// Response body tagged with the layout it follows
#[derive(Debug, Clone)]
pub struct RestPayload {
    pub shape: RestShape,
    pub body: Value,
}

pub struct RestJsonAdapter {
    http: Client,
    broker: Arc<CredentialBroker>,
    submitter_id: String,
}

impl RestJsonAdapter {
    pub fn new(http: Client, broker: Arc<CredentialBroker>, submitter_id: impl Into<String>) -> Self {
        Self {
            http,
            broker,
            submitter_id: submitter_id.into(),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for RestJsonAdapter {
    fn protocol(&self) -> ProtocolVariant {
        ProtocolVariant::RestJson
    }

    #[instrument(skip_all, fields(provider_id = %provider.id))]
    async fn query_eligibility(
        &self,
        provider: &ProviderProfile,
        query: &EligibilityQuery,
    ) -> EngineResult<RawProviderResponse> {
        let shape = RestShape::for_provider(&provider.id)
            .ok_or_else(|| EligibilityError::UnsupportedProvider(provider.id.clone()))?;
        let path = provider.endpoints.eligibility.as_deref().unwrap_or(shape.default_path());
        let url = provider.url(path);
        let control_number = format!("CLV{:09}", Utc::now().timestamp_millis().rem_euclid(1_000_000_000));
        let body = shape.request_body(query, &self.submitter_id, &control_number);

        let response = send_authenticated(&self.broker, provider, |auth| {
            auth.apply(self.http.post(&url))
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&body)
        })
        .await?;
        let body: Value = response.json().await?;
        Ok(RawProviderResponse::RestJson(RestPayload { shape, body }))
    }
}
