use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use crypto::HmacSigner;
use error_common::codes::{authentication, availability, integration, policy, validation};
use serde_json::json;

use eligibility_engine::adapters::fhir::FhirEligibility;
use eligibility_engine::adapters::x12::{ServiceBenefit, X12Eligibility};
use eligibility_engine::adapters::{ProtocolAdapter, RawProviderResponse};
use eligibility_engine::{
    AuthScheme, EligibilityEngine, EligibilityError, EligibilityQuery, EngineResult, EngineSettings,
    PatientDemographics, ProtocolVariant, ProviderDirectory, ProviderProfile, StaticCredentialStore,
    VerificationStage, VerificationStatus,
};

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

/// Adapter that replays a fixed script and records which providers it was asked about.
struct ScriptedAdapter {
    protocol: ProtocolVariant,
    script: Mutex<VecDeque<EngineResult<RawProviderResponse>>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    fn new(protocol: ProtocolVariant, script: Vec<EngineResult<RawProviderResponse>>) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            script: Mutex::new(script.into()),
            delay: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn slow(protocol: ProtocolVariant, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            script: Mutex::new(VecDeque::new()),
            delay: Some(delay),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolAdapter for ScriptedAdapter {
    fn protocol(&self) -> ProtocolVariant {
        self.protocol
    }

    async fn query_eligibility(
        &self,
        provider: &ProviderProfile,
        _query: &EligibilityQuery,
    ) -> EngineResult<RawProviderResponse> {
        self.calls.lock().unwrap().push(provider.id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(EligibilityError::TransportUnavailable("script exhausted".into())))
    }
}

fn unavailable() -> EngineResult<RawProviderResponse> {
    Err(EligibilityError::TransportUnavailable("connection refused".into()))
}

fn fhir_active() -> EngineResult<RawProviderResponse> {
    Ok(RawProviderResponse::Fhir(FhirEligibility {
        patient_id: "pat-1".into(),
        coverage: json!({
            "resourceType": "Coverage",
            "status": "active",
            "period": { "start": "2024-01-01" }
        }),
    }))
}

fn x12_active() -> EngineResult<RawProviderResponse> {
    Ok(RawProviderResponse::X12(X12Eligibility {
        active: true,
        effective_date: NaiveDate::from_ymd_opt(2024, 1, 1),
        deductible_annual: Some(1000.0),
        deductible_remaining: Some(0.0),
        out_of_pocket_annual: Some(3000.0),
        out_of_pocket_remaining: Some(2500.0),
        service_benefits: vec![ServiceBenefit {
            service_type: "23".into(),
            coverage_percentage: Some(100.0),
            copay: Some(0.0),
        }],
        ..X12Eligibility::default()
    }))
}

fn query(payer: &str, member: &str) -> EligibilityQuery {
    EligibilityQuery {
        payer_id: payer.into(),
        member_id: member.into(),
        procedure_code: "D0120".into(),
        patient: PatientDemographics {
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            dob: NaiveDate::from_ymd_opt(1985, 4, 12).unwrap(),
        },
        requesting_provider_id: "1234567890".into(),
    }
}

fn directory() -> ProviderDirectory {
    ProviderDirectory::from_profiles([
        ProviderProfile::new("cigna", "Cigna", ProtocolVariant::Fhir, AuthScheme::ApiKey, "https://fhir.cigna.test")
            .with_alternate(ProtocolVariant::X12),
        ProviderProfile::new("regional", "Regional Dental", ProtocolVariant::Fhir, AuthScheme::ApiKey, "https://fhir.regional.test"),
        ProviderProfile::new("clearhub", "ClearHub", ProtocolVariant::X12, AuthScheme::ApiKey, "https://edi.clearhub.test")
            .as_clearinghouse(),
    ])
    .unwrap()
}

fn engine(
    settings: EngineSettings,
    fhir: &Arc<ScriptedAdapter>,
    x12: &Arc<ScriptedAdapter>,
) -> EligibilityEngine {
    EligibilityEngine::builder(settings)
        .directory(directory())
        .credentials(Arc::new(StaticCredentialStore::new()))
        .signer(Arc::new(HmacSigner::new(SECRET).unwrap()))
        .adapter(fhir.clone())
        .adapter(x12.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_primary_success_is_signed_and_cached() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![fhir_active()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("cigna", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Completed);
    assert_eq!(outcome.final_stage, VerificationStage::Done);
    assert_eq!(outcome.hops, 1);
    assert!(outcome.eligibility.as_ref().unwrap().active);
    assert!(outcome.coverage.as_ref().unwrap().is_procedure_covered);
    assert!(outcome.signature.is_some());
    assert_eq!(engine.cache().len(), 1);
    assert!(x12.calls().is_empty());
}

#[tokio::test]
async fn test_primary_unavailable_falls_back_to_alternate_protocol() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![unavailable()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![x12_active()]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("cigna", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Completed);
    assert_eq!(outcome.hops, 2);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.attempts[0].protocol, ProtocolVariant::Fhir);
    assert_eq!(outcome.attempts[0].failure_code.as_deref(), Some(availability::TRANSPORT_UNAVAILABLE));
    assert_eq!(outcome.attempts[1].protocol, ProtocolVariant::X12);
    assert_eq!(x12.calls(), vec!["cigna".to_string()]);

    let coverage = outcome.coverage.unwrap();
    assert_eq!(coverage.coverage_percentage, 100.0);
    assert_eq!(coverage.estimated_patient_cost, 0.0);
}

#[tokio::test]
async fn test_every_channel_down_degrades_after_three_hops() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![unavailable()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![unavailable()]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("cigna", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Degraded);
    assert!(outcome.degraded);
    assert_eq!(outcome.hops, 3);
    assert!(outcome.eligibility.is_none());
    assert!(outcome.coverage.is_some());
    assert_eq!(outcome.failure_code(), Some(availability::SERVICE_UNAVAILABLE));
    assert!(engine.cache().is_empty());

    let opened = HmacSigner::new(SECRET)
        .unwrap()
        .open(outcome.signature.as_deref().unwrap())
        .unwrap();
    let signed: serde_json::Value = serde_json::from_slice(&opened).unwrap();
    assert_eq!(signed["degraded"], true);
    assert_eq!(signed["reasonCode"], availability::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_no_secondary_channel_goes_straight_to_degraded() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![unavailable()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("regional", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Degraded);
    assert_eq!(outcome.hops, 2);
    assert!(x12.calls().is_empty());
}

#[tokio::test]
async fn test_clearinghouse_is_the_secondary_channel() {
    let settings = EngineSettings {
        clearinghouse: Some("clearhub".into()),
        ..EngineSettings::default()
    };
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![unavailable()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![x12_active()]);
    let engine = engine(settings, &fhir, &x12);

    let outcome = engine.verify(&query("regional", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Completed);
    assert_eq!(x12.calls(), vec!["clearhub".to_string()]);
    assert_eq!(outcome.attempts[1].provider_id, "clearhub");
}

#[tokio::test]
async fn test_unknown_clearinghouse_is_rejected_at_build() {
    let settings = EngineSettings {
        clearinghouse: Some("nowhere".into()),
        ..EngineSettings::default()
    };
    let result = EligibilityEngine::builder(settings)
        .directory(directory())
        .signer(Arc::new(HmacSigner::new(SECRET).unwrap()))
        .build();
    assert!(matches!(result, Err(EligibilityError::Configuration(_))));
}

#[tokio::test]
async fn test_authentication_failure_does_not_fall_back() {
    let fhir = ScriptedAdapter::new(
        ProtocolVariant::Fhir,
        vec![Err(EligibilityError::AuthenticationFailure("token rejected".into()))],
    );
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![x12_active()]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("cigna", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Failed);
    assert_eq!(outcome.final_stage, VerificationStage::Failed);
    assert_eq!(outcome.failure_code(), Some(authentication::AUTHENTICATION_FAILURE));
    assert!(outcome.signature.is_none());
    assert!(x12.calls().is_empty());
}

#[tokio::test]
async fn test_structural_parse_failure_is_not_retried() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![unavailable()]);
    let x12 = ScriptedAdapter::new(
        ProtocolVariant::X12,
        vec![Err(EligibilityError::StructuralParseFailure(vec!["missing IEA trailer".into()]))],
    );
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("cigna", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Failed);
    assert_eq!(outcome.failure_code(), Some(integration::STRUCTURAL_PARSE_FAILURE));
    assert_eq!(outcome.hops, 2);
    assert_eq!(x12.calls().len(), 1);
}

#[tokio::test]
async fn test_patient_not_found_is_a_definitive_answer() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![Err(EligibilityError::PatientNotFound)]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![x12_active()]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("cigna", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::NotEligible);
    assert_eq!(outcome.failure_code(), Some(policy::PATIENT_NOT_FOUND));
    let coverage = outcome.coverage.unwrap();
    assert!(!coverage.is_procedure_covered);
    assert_eq!(coverage.estimated_patient_cost, coverage.procedure_cost);
    assert!(outcome.signature.is_some());
    assert!(x12.calls().is_empty());
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn test_unknown_payer_fails_without_calls() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![fhir_active()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let outcome = engine.verify(&query("acme", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Failed);
    assert_eq!(outcome.failure_code(), Some(validation::PROVIDER_NOT_FOUND));
    assert_eq!(outcome.hops, 0);
    assert!(fhir.calls().is_empty());
}

#[tokio::test]
async fn test_second_identical_query_is_served_from_cache() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![fhir_active()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let first = engine.verify(&query("cigna", "W1")).await;
    let second = engine.verify(&query("cigna", "W1")).await;

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(second.status, VerificationStatus::Completed);
    assert_eq!(second.hops, 0);
    assert_eq!(first.coverage, second.coverage);
    assert_ne!(first.verification_id, second.verification_id);
    assert!(second.signature.is_some());
    assert_eq!(fhir.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_primary_times_out_and_falls_back() {
    let settings = EngineSettings {
        call_timeout_secs: 5,
        ..EngineSettings::default()
    };
    let fhir = ScriptedAdapter::slow(ProtocolVariant::Fhir, Duration::from_secs(60));
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![x12_active()]);
    let engine = engine(settings, &fhir, &x12);

    let outcome = engine.verify(&query("cigna", "W1")).await;

    assert_eq!(outcome.status, VerificationStatus::Completed);
    assert_eq!(outcome.attempts[0].failure_code.as_deref(), Some(availability::TRANSPORT_UNAVAILABLE));
    assert_eq!(fhir.calls().len(), 1);
    assert_eq!(x12.calls().len(), 1);
}

#[tokio::test]
async fn test_batch_preserves_query_order() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![fhir_active(), fhir_active()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    let queries = vec![query("cigna", "W1"), query("acme", "W2"), query("cigna", "W3")];
    let outcomes = engine.verify_batch(&queries).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].status, VerificationStatus::Completed);
    assert_eq!(outcomes[1].status, VerificationStatus::Failed);
    assert_eq!(outcomes[1].payer_id, "acme");
    assert_eq!(outcomes[2].status, VerificationStatus::Completed);
}

#[tokio::test]
async fn test_shutdown_clears_cached_results() {
    let fhir = ScriptedAdapter::new(ProtocolVariant::Fhir, vec![fhir_active()]);
    let x12 = ScriptedAdapter::new(ProtocolVariant::X12, vec![]);
    let engine = engine(EngineSettings::default(), &fhir, &x12);

    engine.start_maintenance();
    engine.verify(&query("cigna", "W1")).await;
    assert_eq!(engine.cache().len(), 1);

    engine.shutdown();
    assert!(engine.cache().is_empty());
}
