//! Compliance audit events
//!
//! Every eligibility verification produces exactly one audit line, success or
//! failure. Fields are restricted to identifiers that carry no PHI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const AUDIT_TARGET: &str = "audit";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub verification_id: String,
    pub payer_id: String,
    /// Output of [`crate::hash_identifier`] over the request fingerprint
    pub subject_hash: String,
    pub status: String,
    pub degraded: bool,
    pub from_cache: bool,
    pub hops: usize,
    pub failure_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Emit the event on the `audit` target
    pub fn record(&self) {
        tracing::info!(
            target: AUDIT_TARGET,
            verification_id = %self.verification_id,
            payer_id = %self.payer_id,
            subject = %self.subject_hash,
            status = %self.status,
            degraded = self.degraded,
            from_cache = self.from_cache,
            hops = self.hops,
            failure_code = self.failure_code.as_deref().unwrap_or("-"),
            timestamp = %self.timestamp.to_rfc3339(),
            "eligibility verification recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_record_writes_one_json_line_on_audit_target() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(buffer.clone())
            .finish();
        let event = AuditEvent {
            verification_id: "0b7c".into(),
            payer_id: "cigna".into(),
            subject_hash: crate::hash_identifier("cigna:W123"),
            status: "degraded".into(),
            degraded: true,
            from_cache: false,
            hops: 3,
            failure_code: Some("ELIG_5002".into()),
            timestamp: Utc::now(),
        };
        tracing::subscriber::with_default(subscriber, || event.record());

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.lines().count(), 1);
        assert!(output.contains(r#""target":"audit""#));
        assert!(output.contains(r#""failure_code":"ELIG_5002""#));
        assert!(!output.contains("W123"));
    }
}
