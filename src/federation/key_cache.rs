//! In-memory cache of remote actor keys
//!
//! Sits in front of [`ActorDirectory`]: a hit never touches the database
//! or the network. Entries expire after a fixed TTL and are pruned by a
//! background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::actors::ActorDirectory;
use crate::error::AppError;
use crate::metrics::KEY_CACHE_TOTAL;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CachedKey {
    pem: String,
    expires_at: Instant,
}

impl CachedKey {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Result of a key lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLookup {
    pub pem: String,
    /// Whether the key came from local state (memory or database) rather
    /// than a fetch from its owner
    pub from_cache: bool,
}

/// Public keys keyed by `keyId`
pub struct PublicKeyCache {
    entries: RwLock<HashMap<String, CachedKey>>,
    directory: Arc<ActorDirectory>,
    ttl: Duration,
}

impl PublicKeyCache {
    /// `ttl` defaults to one hour.
    pub fn new(directory: Arc<ActorDirectory>, ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            directory,
            ttl: ttl.unwrap_or(DEFAULT_TTL),
        }
    }

    /// Key for `key_id`, resolved through the actor directory on a miss.
    pub async fn get(&self, key_id: &str) -> Result<KeyLookup, AppError> {
        if let Some(pem) = self.live_entry(key_id).await {
            tracing::debug!(key_id = %key_id, "Public key cache hit");
            KEY_CACHE_TOTAL.with_label_values(&["hit"]).inc();
            return Ok(KeyLookup {
                pem,
                from_cache: true,
            });
        }

        KEY_CACHE_TOTAL.with_label_values(&["miss"]).inc();
        let material = self.directory.public_key(key_id, false).await?;
        self.store(key_id, &material.pem).await;

        Ok(KeyLookup {
            pem: material.pem,
            from_cache: !material.fetched,
        })
    }

    /// Drop the cached key and re-fetch it from its owner.
    pub async fn refresh(&self, key_id: &str) -> Result<String, AppError> {
        self.invalidate(key_id).await;
        KEY_CACHE_TOTAL.with_label_values(&["refresh"]).inc();

        let material = self.directory.public_key(key_id, true).await?;
        self.store(key_id, &material.pem).await;
        Ok(material.pem)
    }

    async fn live_entry(&self, key_id: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key_id)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.pem.clone())
    }

    async fn store(&self, key_id: &str, pem: &str) {
        let entry = CachedKey {
            pem: pem.to_string(),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(key_id.to_string(), entry);
    }

    pub async fn invalidate(&self, key_id: &str) {
        if self.entries.write().await.remove(key_id).is_some() {
            tracing::debug!(key_id = %key_id, "Invalidated public key cache entry");
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let live = entries.values().filter(|e| e.is_live(now)).count();

        CacheStats {
            entries: entries.len(),
            expired: entries.len() - live,
        }
    }

    /// Remove expired entries, returning how many were dropped.
    pub async fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let removed = before - entries.len();

        if removed > 0 {
            tracing::info!(removed, "Pruned expired public keys");
        }
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    /// Entries past their TTL that pruning has not removed yet
    pub expired: usize,
}
