//! Integrity primitives for eligibility verification results
//!
//! Verification outcomes leave the engine carrying a tamper-evident field.
//! The secret behind it is supplied from outside the core (environment or a
//! secrets manager) and never serialized.
//!
//! - HMAC-SHA256 over the canonical outcome payload (`ring::hmac`)
//! - `base64(payload).hex(mac)` envelope so the signed payload travels with
//!   its signature
//! - Constant-time verification
//! - Secret bytes zeroized after the key schedule is built
//!
//! # Example
//!
//! ```rust
//! use crypto::HmacSigner;
//!
//! let signer = HmacSigner::new(b"0123456789abcdef0123456789abcdef").unwrap();
//! let envelope = signer.seal(br#"{"verificationId":"v-1"}"#);
//! let payload = signer.open(&envelope).unwrap();
//! assert_eq!(payload, br#"{"verificationId":"v-1"}"#.to_vec());
//! ```

pub mod error;
pub mod signing;

pub use error::*;
pub use signing::*;

/// Shortest accepted HMAC secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;
