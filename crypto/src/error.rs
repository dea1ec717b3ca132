use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length: expected at least {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Signing secret not configured: {0}")]
    MissingSecret(String),

    #[error("Invalid signed envelope format: {0}")]
    InvalidFormat(String),

    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Random generation failed")]
    RandomFailed,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
