use crate::error::{CryptoError, CryptoResult};
use crate::MIN_SECRET_LEN;
use base64::{engine::general_purpose, Engine as _};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

/// HMAC-SHA256 signer.
///
/// Holds only the derived key schedule; the raw secret is wiped as soon as
/// the key is built.
pub struct HmacSigner {
    key: hmac::Key,
    rng: SystemRandom,
}

impl HmacSigner {
    pub fn new(secret: &[u8]) -> CryptoResult<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: MIN_SECRET_LEN,
                got: secret.len(),
            });
        }

        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            rng: SystemRandom::new(),
        })
    }

    /// Build a signer from the secret held in environment variable `var`
    pub fn from_env(var: &str) -> CryptoResult<Self> {
        let secret = Zeroizing::new(
            std::env::var(var).map_err(|_| CryptoError::MissingSecret(var.to_string()))?,
        );
        Self::new(secret.as_bytes())
    }

    /// Hex-encoded MAC over `payload`
    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(hmac::sign(&self.key, payload).as_ref())
    }

    /// Constant-time check of a hex MAC produced by [`HmacSigner::sign`]
    pub fn verify(&self, payload: &[u8], signature_hex: &str) -> CryptoResult<()> {
        let tag = hex::decode(signature_hex)
            .map_err(|e| CryptoError::InvalidFormat(format!("signature is not hex: {}", e)))?;
        hmac::verify(&self.key, payload, &tag).map_err(|_| CryptoError::SignatureVerificationFailed)
    }

    /// `base64(payload).hex(mac)`
    pub fn seal(&self, payload: &[u8]) -> String {
        format!("{}.{}", general_purpose::STANDARD.encode(payload), self.sign(payload))
    }

    /// Verify a sealed envelope and return the payload it carries
    pub fn open(&self, envelope: &str) -> CryptoResult<Vec<u8>> {
        let (encoded, signature) = envelope
            .split_once('.')
            .ok_or_else(|| CryptoError::InvalidFormat("missing '.' separator".to_string()))?;

        let payload = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidFormat(format!("payload is not base64: {}", e)))?;

        self.verify(&payload, signature)?;
        Ok(payload)
    }

    /// 16 random bytes, hex encoded, for payload nonces
    pub fn nonce(&self) -> CryptoResult<String> {
        let mut bytes = [0u8; 16];
        self.rng.fill(&mut bytes).map_err(|_| CryptoError::RandomFailed)?;
        Ok(hex::encode(bytes))
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").field("algorithm", &"HMAC-SHA256").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-test-secret-test-secret!";

    #[test]
    fn test_short_secret_rejected() {
        let result = HmacSigner::new(b"too-short");
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { expected: 32, got: 9 })
        ));
    }

    #[test]
    fn test_sign_is_deterministic_and_verifies() {
        let signer = HmacSigner::new(SECRET).unwrap();

        let a = signer.sign(b"payload");
        let b = signer.sign(b"payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(signer.verify(b"payload", &a).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let signer = HmacSigner::new(SECRET).unwrap();

        let sig = signer.sign(b"estimatedPatientCost=180.00");
        let result = signer.verify(b"estimatedPatientCost=18.00", &sig);
        assert!(matches!(result, Err(CryptoError::SignatureVerificationFailed)));
    }

    #[test]
    fn test_envelope_from_other_key_rejected() {
        let signer = HmacSigner::new(SECRET).unwrap();
        let other = HmacSigner::new(b"another-secret-another-secret-0000").unwrap();

        let envelope = signer.seal(b"{\"status\":\"completed\"}");
        assert_eq!(signer.open(&envelope).unwrap(), b"{\"status\":\"completed\"}".to_vec());
        assert!(other.open(&envelope).is_err());
    }

    #[test]
    fn test_malformed_envelope() {
        let signer = HmacSigner::new(SECRET).unwrap();

        assert!(matches!(signer.open("no-separator"), Err(CryptoError::InvalidFormat(_))));
        assert!(matches!(signer.open("!!!.abcd"), Err(CryptoError::InvalidFormat(_))));
        assert!(matches!(signer.open("e30=.zz"), Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_nonce_is_random_hex() {
        let signer = HmacSigner::new(SECRET).unwrap();

        let a = signer.nonce().unwrap();
        let b = signer.nonce().unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
