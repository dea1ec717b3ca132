//! Fallback orchestration.
//!
//! A verification walks an explicit state machine:
//!
//! ```text
//! CacheCheck ──hit──────────────────────────────────────────────▶ Done
//!     │ miss
//!     ▼
//! PrimaryAttempt ──ok / not eligible──▶ Done
//!     │ unavailable          └─auth / parse / other──▶ Failed
//!     ▼
//! SecondaryAttempt ──ok / not eligible──▶ Done
//!     │ unavailable or no secondary channel
//!     ▼
//! Degraded ──────────────────────────────────────────────────────▶ Done
//! ```
//!
//! Calls along the chain are strictly sequential and each one is bounded by
//! the configured call timeout. At most three hops are taken.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use error_common::Categorized;
use futures::future::join_all;
use logger_redacted::audit::AuditEvent;
use logger_redacted::{hash_identifier, PiiRedactor};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::adapters::x12::InterchangeSender;
use crate::adapters::{
    AdapterSet, EdiTransport, FhirAdapter, ProtocolAdapter, RestJsonAdapter, SoapAdapter, UnroutedTransport,
    X12Adapter,
};
use crate::cache::{CachedVerification, Fingerprint, ResultCache};
use crate::calculator;
use crate::config::EngineSettings;
use crate::credentials::{CredentialBroker, CredentialStore, EnvCredentialStore};
use crate::directory::{ProtocolVariant, ProviderDirectory, ProviderProfile};
use crate::error::{EligibilityError, EngineResult};
use crate::models::{
    AttemptOutcome, AttemptRecord, EligibilityQuery, EligibilityResult, OutcomeReason, VerificationOutcome,
    VerificationStage, VerificationStatus,
};
use crate::normalizer;
use crate::procedures::{ProcedureCostSource, StaticCostTable};
use crate::signer::{IntegritySigner, SignedPayload};

const USER_AGENT: &str = "ClearVerify/1.0";

/// Builder for [`EligibilityEngine`]; every collaborator has a default.
pub struct EngineBuilder {
    settings: EngineSettings,
    directory: Option<ProviderDirectory>,
    credentials: Option<Arc<dyn CredentialStore>>,
    signer: Option<Arc<dyn IntegritySigner>>,
    costs: Option<Arc<dyn ProcedureCostSource>>,
    edi_transport: Option<Arc<dyn EdiTransport>>,
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
}

impl EngineBuilder {
    pub fn directory(mut self, directory: ProviderDirectory) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn IntegritySigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn cost_source(mut self, costs: Arc<dyn ProcedureCostSource>) -> Self {
        self.costs = Some(costs);
        self
    }

    pub fn edi_transport(mut self, transport: Arc<dyn EdiTransport>) -> Self {
        self.edi_transport = Some(transport);
        self
    }

    /// Replace the built-in adapter for the adapter's protocol.
    pub fn adapter(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn build(self) -> EngineResult<EligibilityEngine> {
        let settings = self.settings;
        let http = Client::builder()
            .timeout(settings.call_timeout())
            .user_agent(USER_AGENT)
            .build()?;

        let directory = match self.directory {
            Some(directory) => directory,
            None => match settings.directory_path.as_deref() {
                Some(path) => ProviderDirectory::from_yaml_file(path)?,
                None => ProviderDirectory::builtin(),
            },
        };
        if let Some(clearinghouse) = settings.clearinghouse.as_deref() {
            directory.lookup(clearinghouse).map_err(|_| {
                EligibilityError::Configuration(format!("clearinghouse {clearinghouse} is not in the provider directory"))
            })?;
        }

        let credentials: Arc<dyn CredentialStore> = match self.credentials {
            Some(store) => store,
            None => Arc::new(EnvCredentialStore),
        };
        let broker = Arc::new(CredentialBroker::new(
            http.clone(),
            credentials,
            settings.token_safety_margin(),
        ));

        let transport: Arc<dyn EdiTransport> = match self.edi_transport {
            Some(transport) => transport,
            None => Arc::new(UnroutedTransport),
        };
        let sender = InterchangeSender {
            sender_id: settings.submitter_id.clone(),
            submitter_npi: settings.submitter_npi.clone(),
        };
        let mut adapters = AdapterSet::new()
            .with(Arc::new(FhirAdapter::new(http.clone(), Arc::clone(&broker))))
            .with(Arc::new(X12Adapter::new(transport, sender)))
            .with(Arc::new(SoapAdapter::new(http.clone(), Arc::clone(&broker))))
            .with(Arc::new(RestJsonAdapter::new(http, Arc::clone(&broker), settings.submitter_id.clone())));
        for adapter in self.adapters {
            adapters.register(adapter);
        }

        let signer: Arc<dyn IntegritySigner> = match self.signer {
            Some(signer) => signer,
            None => Arc::new(crypto::HmacSigner::from_env(&settings.signing_secret_env)?),
        };
        let costs: Arc<dyn ProcedureCostSource> = match self.costs {
            Some(costs) => costs,
            None => Arc::new(StaticCostTable::default()),
        };

        info!(
            providers = directory.len(),
            clearinghouse = settings.clearinghouse.as_deref().unwrap_or("none"),
            "Eligibility engine initialized"
        );

        Ok(EligibilityEngine {
            cache: Arc::new(ResultCache::new(settings.cache_ttl())),
            directory: Arc::new(directory),
            broker,
            adapters,
            signer,
            costs,
            settings,
            sweeper: Mutex::new(None),
        })
    }
}

/// Multi-protocol eligibility verification with a bounded fallback chain
pub struct EligibilityEngine {
    settings: EngineSettings,
    directory: Arc<ProviderDirectory>,
    broker: Arc<CredentialBroker>,
    adapters: AdapterSet,
    cache: Arc<ResultCache>,
    signer: Arc<dyn IntegritySigner>,
    costs: Arc<dyn ProcedureCostSource>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Per-verification working state
struct Run<'a> {
    query: &'a EligibilityQuery,
    verification_id: Uuid,
    fingerprint: Fingerprint,
    provider: Option<&'a ProviderProfile>,
    attempts: Vec<AttemptRecord>,
    hops: usize,
    last_error: Option<EligibilityError>,
    redactor: PiiRedactor,
}

enum Transition {
    Next(VerificationStage),
    Finish(VerificationOutcome),
}

impl EligibilityEngine {
    pub fn builder(settings: EngineSettings) -> EngineBuilder {
        EngineBuilder {
            settings,
            directory: None,
            credentials: None,
            signer: None,
            costs: None,
            edi_transport: None,
            adapters: Vec::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn directory(&self) -> &ProviderDirectory {
        &self.directory
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    /// Start the periodic cache sweep. Calling it again is a no-op.
    pub fn start_maintenance(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(self.cache.spawn_sweeper(self.settings.cache_sweep_interval()));
            debug!("Started cache sweeper");
        }
    }

    /// Stop background work and drop every cached token and result.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.broker.clear();
        self.cache.clear();
        info!("Eligibility engine shut down");
    }

    /// Verify a batch concurrently. Outcomes are returned in query order.
    pub async fn verify_batch(&self, queries: &[EligibilityQuery]) -> Vec<VerificationOutcome> {
        join_all(queries.iter().map(|query| self.verify(query))).await
    }

    /// Run one verification through the fallback chain.
    ///
    /// Never returns an error: every attempt ends in an auditable outcome.
    #[instrument(
        skip_all,
        fields(
            payer_id = %query.payer_id,
            procedure_code = %query.procedure_code,
            member = %hash_identifier(&query.member_id),
            verification_id = tracing::field::Empty,
        )
    )]
    pub async fn verify(&self, query: &EligibilityQuery) -> VerificationOutcome {
        let verification_id = Uuid::new_v4();
        Span::current().record("verification_id", tracing::field::display(verification_id));
        let mut run = Run {
            query,
            verification_id,
            fingerprint: Fingerprint::of(query),
            provider: None,
            attempts: Vec::new(),
            hops: 0,
            last_error: None,
            redactor: PiiRedactor::for_values([
                query.member_id.as_str(),
                query.patient.first_name.as_str(),
                query.patient.last_name.as_str(),
            ]),
        };

        let mut stage = VerificationStage::CacheCheck;
        let outcome = loop {
            let transition = match stage {
                VerificationStage::CacheCheck => self.check_cache(&mut run),
                VerificationStage::PrimaryAttempt => self.primary_attempt(&mut run).await,
                VerificationStage::SecondaryAttempt => self.secondary_attempt(&mut run).await,
                VerificationStage::Degraded => self.degrade(&mut run),
                VerificationStage::Done | VerificationStage::Failed => Transition::Finish(self.failed(
                    &mut run,
                    EligibilityError::ServiceUnavailable("verification ended without an outcome".into()),
                )),
            };
            match transition {
                Transition::Next(next) => {
                    debug!(from = ?stage, to = ?next, "Stage transition");
                    stage = next;
                }
                Transition::Finish(outcome) => break outcome,
            }
        };

        self.audit(query, &outcome);
        outcome
    }

    fn check_cache<'a>(&'a self, run: &mut Run<'a>) -> Transition {
        if let Some(hit) = self.cache.get(&run.fingerprint) {
            debug!("Cache hit");
            return Transition::Finish(self.cached(run, hit));
        }
        match self.directory.lookup(&run.query.payer_id) {
            Ok(provider) => {
                run.provider = Some(provider);
                Transition::Next(VerificationStage::PrimaryAttempt)
            }
            Err(err) => Transition::Finish(self.failed(run, err)),
        }
    }

    async fn primary_attempt<'a>(&'a self, run: &mut Run<'a>) -> Transition {
        let Some(provider) = run.provider else {
            let err = EligibilityError::ProviderNotFound(run.query.payer_id.clone());
            return Transition::Finish(self.failed(run, err));
        };
        let protocol = provider.preferred_protocol();
        let result = self
            .attempt(VerificationStage::PrimaryAttempt, provider, protocol, run)
            .await;
        self.after_attempt(run, result, VerificationStage::SecondaryAttempt)
    }

    async fn secondary_attempt<'a>(&'a self, run: &mut Run<'a>) -> Transition {
        let Some((target, protocol)) = run.provider.and_then(|p| self.secondary_target(p)) else {
            debug!("No secondary channel available");
            return Transition::Next(VerificationStage::Degraded);
        };
        let result = self
            .attempt(VerificationStage::SecondaryAttempt, target, protocol, run)
            .await;
        self.after_attempt(run, result, VerificationStage::Degraded)
    }

    fn after_attempt(
        &self,
        run: &mut Run<'_>,
        result: EngineResult<EligibilityResult>,
        on_unavailable: VerificationStage,
    ) -> Transition {
        match result {
            Ok(eligibility) => Transition::Finish(self.completed(run, eligibility)),
            Err(err) if err.is_policy_outcome() => Transition::Finish(self.not_eligible(run, err)),
            Err(err) if err.is_transient() => {
                warn!(error = %run.redactor.redact(&err.to_string()), "Channel unavailable, falling back");
                run.last_error = Some(err);
                Transition::Next(on_unavailable)
            }
            Err(err) => Transition::Finish(self.failed(run, err)),
        }
    }

    fn degrade(&self, run: &mut Run<'_>) -> Transition {
        run.hops += 1;
        let reason = run
            .last_error
            .take()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no provider channel reachable".to_string());
        let err = EligibilityError::ServiceUnavailable(reason);
        warn!(error = %run.redactor.redact(&err.to_string()), "Returning degraded estimate");

        let today = Utc::now().date_naive();
        let estimate = normalizer::estimated_defaults(&run.query.procedure_code, today);
        let cost = self.procedure_cost(&estimate, &run.query.procedure_code);
        let coverage = calculator::estimate(&estimate, &run.query.procedure_code, cost);

        let mut outcome = self.outcome(run, VerificationStatus::Degraded, VerificationStage::Done);
        outcome.degraded = true;
        outcome.coverage = Some(coverage);
        outcome.reason = Some(reason_of(&err, &run.redactor));
        Transition::Finish(self.signed_or_failed(run, outcome))
    }

    /// Alternate protocol on the same provider, else the configured clearinghouse.
    fn secondary_target<'a>(&'a self, provider: &'a ProviderProfile) -> Option<(&'a ProviderProfile, ProtocolVariant)> {
        if let Some(protocol) = provider.secondary_protocol() {
            return Some((provider, protocol));
        }
        let clearinghouse_id = self.settings.clearinghouse.as_deref()?;
        if clearinghouse_id == provider.id {
            return None;
        }
        match self.directory.lookup(clearinghouse_id) {
            Ok(clearinghouse) => Some((clearinghouse, clearinghouse.preferred_protocol())),
            Err(err) => {
                error!(%err, "Configured clearinghouse missing from directory");
                None
            }
        }
    }

    async fn attempt(
        &self,
        stage: VerificationStage,
        provider: &ProviderProfile,
        protocol: ProtocolVariant,
        run: &mut Run<'_>,
    ) -> EngineResult<EligibilityResult> {
        run.hops += 1;
        let started = Instant::now();
        let result = self.call_adapter(provider, protocol, run.query).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (outcome, failure_code) = match &result {
            Ok(_) => (AttemptOutcome::Succeeded, None),
            Err(err) if err.is_policy_outcome() => (AttemptOutcome::NotEligible, Some(err.code().to_string())),
            Err(err) => (AttemptOutcome::Failed, Some(err.code().to_string())),
        };
        debug!(provider_id = %provider.id, %protocol, ?outcome, elapsed_ms, "Attempt finished");
        run.attempts.push(AttemptRecord {
            stage,
            provider_id: provider.id.clone(),
            protocol,
            outcome,
            failure_code,
            elapsed_ms,
        });
        result
    }

    async fn call_adapter(
        &self,
        provider: &ProviderProfile,
        protocol: ProtocolVariant,
        query: &EligibilityQuery,
    ) -> EngineResult<EligibilityResult> {
        let adapter = self.adapters.get(protocol)?;
        let timeout = self.settings.call_timeout();
        let raw = tokio::time::timeout(timeout, adapter.query_eligibility(provider, query))
            .await
            .map_err(|_| {
                EligibilityError::TransportUnavailable(format!(
                    "{} via {protocol} timed out after {}s",
                    provider.id,
                    timeout.as_secs()
                ))
            })??;
        normalizer::normalize(&raw, &query.procedure_code, Utc::now().date_naive())
    }

    fn procedure_cost(&self, eligibility: &EligibilityResult, procedure_code: &str) -> f64 {
        eligibility
            .benefit_for(procedure_code)
            .map(|b| b.allowed_amount)
            .filter(|amount| *amount > 0.0)
            .unwrap_or_else(|| self.costs.cost_of(procedure_code))
    }

    fn completed(&self, run: &mut Run<'_>, eligibility: EligibilityResult) -> VerificationOutcome {
        let procedure_code = &run.query.procedure_code;
        let cost = self.procedure_cost(&eligibility, procedure_code);
        let coverage = calculator::estimate(&eligibility, procedure_code, cost);

        let mut outcome = self.outcome(run, VerificationStatus::Completed, VerificationStage::Done);
        outcome.eligibility = Some(eligibility);
        outcome.coverage = Some(coverage);
        let outcome = self.signed_or_failed(run, outcome);

        if let (VerificationStatus::Completed, Some(eligibility), Some(coverage)) =
            (outcome.status, &outcome.eligibility, &outcome.coverage)
        {
            self.cache.set(
                run.fingerprint.clone(),
                CachedVerification {
                    eligibility: eligibility.clone(),
                    coverage: coverage.clone(),
                    verified_at: outcome.verified_at,
                },
            );
        }
        outcome
    }

    fn cached(&self, run: &mut Run<'_>, hit: CachedVerification) -> VerificationOutcome {
        let mut outcome = self.outcome(run, VerificationStatus::Completed, VerificationStage::Done);
        outcome.from_cache = true;
        outcome.eligibility = Some(hit.eligibility);
        outcome.coverage = Some(hit.coverage);
        self.signed_or_failed(run, outcome)
    }

    fn not_eligible(&self, run: &mut Run<'_>, err: EligibilityError) -> VerificationOutcome {
        info!(code = err.code(), "Patient not eligible");
        let cost = self.costs.cost_of(&run.query.procedure_code);
        let mut outcome = self.outcome(run, VerificationStatus::NotEligible, VerificationStage::Done);
        outcome.coverage = Some(calculator::full_cost(cost));
        outcome.reason = Some(reason_of(&err, &run.redactor));
        self.signed_or_failed(run, outcome)
    }

    fn failed(&self, run: &mut Run<'_>, err: EligibilityError) -> VerificationOutcome {
        error!(code = err.code(), error = %run.redactor.redact(&err.to_string()), "Verification failed");
        let mut outcome = self.outcome(run, VerificationStatus::Failed, VerificationStage::Failed);
        outcome.reason = Some(reason_of(&err, &run.redactor));
        outcome
    }

    fn outcome(&self, run: &mut Run<'_>, status: VerificationStatus, final_stage: VerificationStage) -> VerificationOutcome {
        VerificationOutcome {
            verification_id: run.verification_id,
            status,
            final_stage,
            degraded: false,
            from_cache: false,
            payer_id: run.query.payer_id.clone(),
            procedure_code: run.query.procedure_code.clone(),
            eligibility: None,
            coverage: None,
            reason: None,
            attempts: std::mem::take(&mut run.attempts),
            hops: run.hops,
            signature: None,
            verified_at: Utc::now(),
        }
    }

    /// Attach a signature, or turn the outcome into a failure if signing fails.
    fn signed_or_failed(&self, run: &mut Run<'_>, mut outcome: VerificationOutcome) -> VerificationOutcome {
        match self.sign(&outcome) {
            Ok(signature) => {
                outcome.signature = Some(signature);
                outcome
            }
            Err(err) => {
                run.attempts = std::mem::take(&mut outcome.attempts);
                self.failed(run, err)
            }
        }
    }

    fn sign(&self, outcome: &VerificationOutcome) -> EngineResult<String> {
        SignedPayload {
            verification_id: outcome.verification_id,
            timestamp: outcome.verified_at,
            payer_id: &outcome.payer_id,
            procedure_code: &outcome.procedure_code,
            status: outcome.status,
            degraded: outcome.degraded,
            reason_code: outcome.failure_code(),
            eligibility: outcome.eligibility.as_ref(),
            coverage: outcome.coverage.as_ref(),
            nonce: self.signer.nonce()?,
        }
        .sign(self.signer.as_ref())
    }

    fn audit(&self, query: &EligibilityQuery, outcome: &VerificationOutcome) {
        AuditEvent {
            verification_id: outcome.verification_id.to_string(),
            payer_id: query.payer_id.clone(),
            subject_hash: hash_identifier(&format!("{}:{}", query.payer_id, query.member_id)),
            status: outcome.status.as_str().to_string(),
            degraded: outcome.degraded,
            from_cache: outcome.from_cache,
            hops: outcome.hops,
            failure_code: outcome.failure_code().map(str::to_string),
            timestamp: outcome.verified_at,
        }
        .record();
    }
}

fn reason_of(err: &EligibilityError, redactor: &PiiRedactor) -> OutcomeReason {
    OutcomeReason {
        code: err.code().to_string(),
        category: err.category(),
        message: redactor.redact(&err.to_string()),
    }
}
