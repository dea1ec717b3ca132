use chrono::{DateTime, NaiveDate, Utc};
use error_common::ErrorCategory;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::ProtocolVariant;

/// Patient demographics used for matching on the provider side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientDemographics {
    pub first_name: String,
    pub last_name: String,
    pub dob: NaiveDate,
}

/// One eligibility question: is this member covered for this procedure?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityQuery {
    pub payer_id: String,
    pub member_id: String,
    pub procedure_code: String,
    pub patient: PatientDemographics,
    pub requesting_provider_id: String,
}

/// An annual amount and what is left of it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmountWindow {
    pub annual: f64,
    pub remaining: f64,
}

impl AmountWindow {
    /// Build a window, clamping to `0 <= remaining <= annual`.
    pub fn new(annual: f64, remaining: f64) -> Self {
        let annual = annual.max(0.0);
        Self {
            annual,
            remaining: remaining.clamp(0.0, annual),
        }
    }
}

/// Plan benefit for a single procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Benefit {
    pub procedure_code: String,
    /// Share of the allowed amount the plan pays, 0..=100
    pub coverage_percentage: f64,
    pub copay: f64,
    /// Provider-reported allowed amount, 0 when not reported
    pub allowed_amount: f64,
}

/// Fields the normalizer had to fill in because the provider omitted them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultApplied {
    EffectiveDate,
    Deductible,
    OutOfPocketMax,
    ProcedureBenefit,
}

/// Canonical eligibility model every provider response is normalized into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityResult {
    pub active: bool,
    pub effective_date: NaiveDate,
    pub termination_date: Option<NaiveDate>,
    pub benefits: Vec<Benefit>,
    pub deductible: AmountWindow,
    pub out_of_pocket_max: AmountWindow,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defaults_applied: Vec<DefaultApplied>,
}

impl EligibilityResult {
    pub fn benefit_for(&self, procedure_code: &str) -> Option<&Benefit> {
        self.benefits
            .iter()
            .find(|b| b.procedure_code == procedure_code)
    }

    pub fn used_defaults(&self) -> bool {
        !self.defaults_applied.is_empty()
    }
}

/// Coverage and estimated patient responsibility for one procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageDecision {
    pub is_procedure_covered: bool,
    pub coverage_percentage: f64,
    pub copay: f64,
    pub procedure_cost: f64,
    pub estimated_patient_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Completed,
    NotEligible,
    Degraded,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NotEligible => "not_eligible",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

/// States of the fallback state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    CacheCheck,
    PrimaryAttempt,
    SecondaryAttempt,
    Degraded,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    NotEligible,
    Failed,
}

/// One hop of the fallback chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub stage: VerificationStage,
    pub provider_id: String,
    pub protocol: ProtocolVariant,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    pub elapsed_ms: u64,
}

/// Why a verification did not complete normally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeReason {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// Result of one end-to-end verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub verification_id: Uuid,
    pub status: VerificationStatus,
    /// Terminal state of the fallback state machine
    pub final_stage: VerificationStage,
    pub degraded: bool,
    pub from_cache: bool,
    pub payer_id: String,
    pub procedure_code: String,
    pub eligibility: Option<EligibilityResult>,
    pub coverage: Option<CoverageDecision>,
    pub reason: Option<OutcomeReason>,
    pub attempts: Vec<AttemptRecord>,
    /// Hops taken through the fallback chain, degraded estimation included
    pub hops: usize,
    pub signature: Option<String>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            VerificationStatus::Completed | VerificationStatus::Degraded
        )
    }

    pub fn failure_code(&self) -> Option<&str> {
        self.reason.as_ref().map(|r| r.code.as_str())
    }
}
