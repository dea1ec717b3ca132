use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref SSN_REGEX: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();
    static ref DATE_REGEX: Regex = Regex::new(r"\b(?:19|20)\d{2}-?(?:0[1-9]|1[0-2])-?(?:0[1-9]|[12]\d|3[01])\b").unwrap();
    static ref PHONE_REGEX: Regex = Regex::new(r"\b(?:\+1[-.\s]?)?\(?([0-9]{3})\)?[-.\s]?([0-9]{3})[-.\s]?([0-9]{4})\b").unwrap();
    static ref EMAIL_REGEX: Regex = Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
}

/// Stable, non-reversible correlation token for an identifier.
///
/// First 8 bytes of SHA-256, hex encoded. Long enough to join log lines for
/// one member, far too short to be useful as a lookup key.
pub fn hash_identifier(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

/// PHI redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_ssn: bool,
    pub redact_dates: bool,
    pub redact_phones: bool,
    pub redact_emails: bool,
    /// Replace matches with a correlation hash instead of a fixed mask
    pub hash_for_correlation: bool,
    /// Exact values known to be PHI for the current request (names, member ids)
    pub known_values: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_ssn: true,
            redact_dates: true,
            redact_phones: true,
            redact_emails: true,
            hash_for_correlation: false,
            known_values: Vec::new(),
        }
    }
}

/// PHI redactor for free text headed to a log sink
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    /// Redactor that additionally masks the given request values wherever
    /// they appear verbatim.
    pub fn for_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(RedactionConfig {
            known_values: values
                .into_iter()
                .map(Into::into)
                .filter(|v: &String| !v.trim().is_empty())
                .collect(),
            ..Default::default()
        })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        for value in &self.config.known_values {
            if result.contains(value.as_str()) {
                let replacement = self.mask("PHI", value);
                result = result.replace(value.as_str(), &replacement);
            }
        }

        if self.config.redact_ssn {
            result = self.replace_pattern(&SSN_REGEX, "SSN", &result);
        }

        if self.config.redact_dates {
            result = self.replace_pattern(&DATE_REGEX, "DATE", &result);
        }

        if self.config.redact_phones {
            result = self.replace_pattern(&PHONE_REGEX, "PHONE", &result);
        }

        if self.config.redact_emails {
            result = self.replace_pattern(&EMAIL_REGEX, "EMAIL", &result);
        }

        result
    }

    fn replace_pattern(&self, pattern: &Regex, label: &str, text: &str) -> String {
        pattern
            .replace_all(text, |caps: &regex::Captures| self.mask(label, &caps[0]))
            .to_string()
    }

    fn mask(&self, label: &str, value: &str) -> String {
        if self.config.hash_for_correlation {
            format!("{}[{}]", label, hash_identifier(value))
        } else {
            format!("[{} REDACTED]", label)
        }
    }
}

impl Default for PiiRedactor {
    fn default() -> Self {
        Self::new(RedactionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_of_birth_redaction() {
        let redactor = PiiRedactor::default();

        let redacted = redactor.redact("DMG*D8*19800115 rejected, dob 1980-01-15");
        assert!(!redacted.contains("19800115"));
        assert!(!redacted.contains("1980-01-15"));
        assert!(redacted.contains("[DATE REDACTED]"));
    }

    #[test]
    fn test_ssn_and_email_redaction() {
        let redactor = PiiRedactor::default();

        let redacted = redactor.redact("subscriber 123-45-6789 contact jane.doe@example.com");
        assert!(redacted.contains("[SSN REDACTED]"));
        assert!(redacted.contains("[EMAIL REDACTED]"));
    }

    #[test]
    fn test_known_values_are_masked() {
        let redactor = PiiRedactor::for_values(["Doe", "W123456789", " "]);

        let redacted = redactor.redact("Member W123456789 (Doe) not found");
        assert_eq!(redacted, "Member [PHI REDACTED] ([PHI REDACTED]) not found");
    }

    #[test]
    fn test_hash_for_correlation_is_stable() {
        let redactor = PiiRedactor::new(RedactionConfig {
            hash_for_correlation: true,
            ..Default::default()
        });

        let first = redactor.redact("call 555-123-4567");
        let second = redactor.redact("call 555-123-4567");
        assert_eq!(first, second);
        assert!(first.starts_with("call PHONE["));
    }

    #[test]
    fn test_hash_identifier_is_short_and_deterministic() {
        let a = hash_identifier("W123456789");
        assert_eq!(a.len(), 16);
        assert_eq!(a, hash_identifier("W123456789"));
        assert_ne!(a, hash_identifier("W123456780"));
    }
}
