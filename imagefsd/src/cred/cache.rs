//! Per-registry credential cache.
//!
//! Provider binaries can take hundreds of milliseconds (cloud IAM round
//! trips), so their results are cached per registry domain with a TTL.  The
//! cache is keyed by registry domain, not full reference — credentials are
//! registry-scoped.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::AuthCandidate;

/// TTL applied when a provider does not supply its own cache duration.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    candidates: Vec<AuthCandidate>,
    expires_at: Instant,
}

/// TTL cache of provider results, keyed by registry domain.
#[derive(Default)]
pub struct CredentialCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch unexpired candidates for `domain`.
    pub fn get(&self, domain: &str) -> Option<Vec<AuthCandidate>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(domain)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.candidates.clone())
    }

    /// Store candidates for `domain`, valid for `ttl`.
    pub fn put(&self, domain: &str, candidates: Vec<AuthCandidate>, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            domain.to_owned(),
            CacheEntry {
                candidates,
                expires_at: Instant::now() + ttl,
            },
        );
        // Drop whatever has expired while we hold the write lock anyway.
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
    }
}
