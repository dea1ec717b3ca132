// Stable failure codes for eligibility verification outcomes.
// Codes are part of the outcome contract; never renumber an existing one.

pub mod validation {
    pub const UNSUPPORTED_PROVIDER: &str = "ELIG_1001";
    pub const PROVIDER_NOT_FOUND: &str = "ELIG_1002";
}

pub mod authentication {
    pub const AUTHENTICATION_FAILURE: &str = "ELIG_2001";
}

pub mod policy {
    pub const PATIENT_NOT_FOUND: &str = "ELIG_3001";
    pub const NO_ACTIVE_COVERAGE: &str = "ELIG_3002";
}

pub mod integration {
    pub const MALFORMED_RESPONSE: &str = "ELIG_4001";
    pub const STRUCTURAL_PARSE_FAILURE: &str = "ELIG_4002";
    pub const PROVIDER_REJECTED: &str = "ELIG_4003";
}

pub mod availability {
    pub const TRANSPORT_UNAVAILABLE: &str = "ELIG_5001";
    pub const SERVICE_UNAVAILABLE: &str = "ELIG_5002";
}

pub mod internal {
    pub const CONFIGURATION: &str = "ELIG_9001";
    pub const SIGNING: &str = "ELIG_9002";
    pub const SERIALIZATION: &str = "ELIG_9003";
}
