//! Common error handling utilities shared by the eligibility workspace
//!
//! Every crate in the workspace owns its own `thiserror` enum. This crate
//! supplies the two things those enums have in common:
//!
//! - **Error categories**: a coarse classification that decides whether a
//!   failure may be retried on another protocol or provider
//! - **Failure codes**: stable, PHI-free strings that are safe to return to
//!   callers and to write into audit records
//!
//! # Example
//!
//! ```rust
//! use error_common::{codes, ErrorCategory};
//!
//! let category = ErrorCategory::Availability;
//! assert!(category.is_retryable());
//! assert_eq!(codes::availability::TRANSPORT_UNAVAILABLE, "ELIG_5001");
//! ```

pub mod codes;
pub mod types;

pub use types::*;
