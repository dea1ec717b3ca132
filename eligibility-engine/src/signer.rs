use chrono::{DateTime, Utc};
use crypto::HmacSigner;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{CoverageDecision, EligibilityResult, VerificationStatus};

/// Produces the tamper-evident signature attached to verification outcomes
pub trait IntegritySigner: Send + Sync {
    /// Signature envelope over `payload`
    fn sign_payload(&self, payload: &[u8]) -> EngineResult<String>;

    fn nonce(&self) -> EngineResult<String>;
}

impl IntegritySigner for HmacSigner {
    fn sign_payload(&self, payload: &[u8]) -> EngineResult<String> {
        Ok(self.seal(payload))
    }

    fn nonce(&self) -> EngineResult<String> {
        Ok(HmacSigner::nonce(self)?)
    }
}

/// Fields covered by an outcome signature
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPayload<'a> {
    pub verification_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payer_id: &'a str,
    pub procedure_code: &'a str,
    pub status: VerificationStatus,
    pub degraded: bool,
    /// Code of the failure that forced a degraded estimate
    pub reason_code: Option<&'a str>,
    pub eligibility: Option<&'a EligibilityResult>,
    pub coverage: Option<&'a CoverageDecision>,
    pub nonce: String,
}

impl SignedPayload<'_> {
    pub fn sign(&self, signer: &dyn IntegritySigner) -> EngineResult<String> {
        let bytes = serde_json::to_vec(self)?;
        signer.sign_payload(&bytes)
    }
}
