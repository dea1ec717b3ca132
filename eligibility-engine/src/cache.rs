use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::models::{CoverageDecision, EligibilityQuery, EligibilityResult};

/// Cache key derived from payer, member and procedure.
///
/// Hashed so raw member identifiers never sit in the key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(query: &EligibilityQuery) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(query.payer_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(query.member_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(query.procedure_code.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A completed verification kept for reuse
#[derive(Debug, Clone, PartialEq)]
pub struct CachedVerification {
    pub eligibility: EligibilityResult,
    pub coverage: CoverageDecision,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    value: CachedVerification,
    expires_at: Instant,
}

/// TTL cache of completed verifications.
///
/// Expired entries are never returned; they are dropped lazily on read and
/// by the periodic sweep.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<Fingerprint, Entry>,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<CachedVerification> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn set(&self, key: Fingerprint, value: CachedVerification) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: Fingerprint, value: CachedVerification, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(key, Entry { value, expires_at });
    }

    pub fn has(&self, key: &Fingerprint) -> bool {
        self.get(key).is_some()
    }

    pub fn delete(&self, key: &Fingerprint) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Run [`ResultCache::sweep`] on a fixed interval until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "Swept expired verification results");
                }
            }
        })
    }
}
