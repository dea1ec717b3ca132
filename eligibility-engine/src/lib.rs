//! Insurance Eligibility Verification Engine
//!
//! Verifies a patient's coverage with their payer and estimates what the
//! patient will owe for a procedure:
//! - Provider directory with per-payer protocol, auth and endpoint profiles
//! - FHIR, X12 270/271, SOAP and REST/JSON protocol adapters
//! - OAuth2 token caching with proactive refresh
//! - Normalization of every payer answer into one canonical model
//! - Deductible, coinsurance, copay and out-of-pocket cost estimation
//! - Bounded fallback chain with degraded estimates when no payer answers
//! - TTL result cache and signed, auditable verification outcomes

pub mod adapters;
pub mod cache;
pub mod calculator;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod procedures;
pub mod signer;

pub use config::EngineSettings;
pub use credentials::{CredentialStore, EnvCredentialStore, SecretKind, StaticCredentialStore};
pub use directory::{AuthScheme, ProtocolVariant, ProviderDirectory, ProviderProfile};
pub use error::*;
pub use models::*;
pub use orchestrator::{EligibilityEngine, EngineBuilder};
pub use procedures::{ProcedureCostSource, StaticCostTable};
pub use signer::IntegritySigner;
