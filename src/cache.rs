//! Two-tier result cache.
//!
//! The local tier is a [moka](https://crates.io/crates/moka) cache private to the coordinator; the persistent tier
//! is a [`PersistentStore`] shared with other execution contexts of the same client. Both tiers store the value
//! together with the moment it was written, and both treat an entry older than the TTL as a miss without deleting
//! it.
//!
//! A hit is `Some(value)`; `Some(0.0)` is a perfectly valid hit and is never confused with `None`.

use crate::normalize::QuerySignature;
use crate::traits::PersistentStore;
use chrono::Utc;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

pub const VERSION_MARKER: &str = "__version__";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    pub value:      f64,
    pub written_at: Instant,
}

/// Persisted form of a cache entry: `{"v": value, "t": unix-ms}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    #[serde(rename = "v")]
    pub value:     f64,
    #[serde(rename = "t")]
    pub timestamp: i64,
}

impl PersistedEntry {
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis().saturating_sub(self.timestamp);
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

pub struct ResultCache {
    namespace:  String,
    version:    String,
    ttl:        Duration,
    local:      Cache<QuerySignature, CacheEntry>,
    store:      Arc<dyn PersistentStore>,
    generation: AtomicU64,
    // Shared by writers for the whole check-and-write, taken exclusively by `clear`.
    write_gate: RwLock<()>,
}

impl ResultCache {
    pub fn new(
        namespace: &str,
        schema_version: u32,
        ttl: Duration,
        max_capacity: u64,
        store: Arc<dyn PersistentStore>,
    ) -> Self {
        let local = Cache::builder()
            .max_capacity(max_capacity)
            .name(namespace)
            .eviction_policy(EvictionPolicy::tiny_lfu())
            .build();
        Self {
            namespace: namespace.to_string(),
            version: schema_version.to_string(),
            ttl,
            local,
            store,
            generation: AtomicU64::new(0),
            write_gate: RwLock::new(()),
        }
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `{namespace}:{signature}`, i.e. `{namespace}:{entities}:{filterHash}:{period}`.
    pub fn persistent_key(&self, signature: &QuerySignature) -> String {
        format!("{}:{}", self.namespace, signature)
    }

    fn marker_key(&self) -> String {
        format!("{}:{}", self.namespace, VERSION_MARKER)
    }

    fn fresh(&self, written_at: Instant) -> bool {
        written_at.elapsed() <= self.ttl
    }

    /// Local tier only. Never suspends, so it is safe to call inside the registry's critical section.
    pub fn lookup_local(&self, signature: &QuerySignature) -> Option<f64> {
        self.local
            .get(signature)
            .filter(|entry| self.fresh(entry.written_at))
            .map(|entry| entry.value)
    }

    /// Local tier first, then the persistent tier. A persistent hit is promoted into the local tier keeping its
    /// original age so that promotion never extends an entry's life.
    pub fn lookup(&self, signature: &QuerySignature) -> Option<f64> {
        if let Some(value) = self.lookup_local(signature) {
            return Some(value);
        }

        let _gate = self.write_gate.read();
        if !self.version_matches() {
            return None;
        }

        let raw = self.store.get(&self.persistent_key(signature))?;
        let entry = match serde_json::from_str::<PersistedEntry>(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%signature, %err, "unreadable persistent cache entry");
                return None;
            }
        };

        let age = entry.age();
        if age > self.ttl {
            return None;
        }

        let now = Instant::now();
        let written_at = now.checked_sub(age).unwrap_or(now);
        self.local.insert(
            signature.clone(),
            CacheEntry {
                value: entry.value,
                written_at,
            },
        );
        debug!(%signature, value = entry.value, "promoted persistent cache entry");
        Some(entry.value)
    }

    /// Write one value through both tiers.
    pub fn write(&self, signature: QuerySignature, value: f64) {
        self.write_many(vec![(signature, value)]);
    }

    /// Bumped by every [`clear`](Self::clear).
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Write values through both tiers, overwriting previous entries with a fresh timestamp. Persistent tier
    /// failures are logged and otherwise ignored: the local tier alone still satisfies the cache contract.
    pub fn write_many(&self, entries: Vec<(QuerySignature, f64)>) {
        self.write_many_at(self.generation(), entries);
    }

    /// Like [`write_many`](Self::write_many), but only if the cache hasn't been cleared since `generation` was
    /// taken. Returns `false` if the entries were dropped.
    pub fn write_many_at(&self, generation: u64, entries: Vec<(QuerySignature, f64)>) -> bool {
        let _gate = self.write_gate.read();
        if generation != self.generation() {
            debug!(namespace = %self.namespace, entries = entries.len(), "dropping results of a cleared generation");
            return false;
        }
        if entries.is_empty() {
            return true;
        }

        let now = Instant::now();
        let mut persisted = Vec::with_capacity(entries.len() + 1);
        for (signature, value) in entries {
            match serde_json::to_string(&PersistedEntry::now(value)) {
                Ok(raw) => persisted.push((self.persistent_key(&signature), raw)),
                Err(err) => warn!(%signature, %err, "cannot encode cache entry"),
            }
            self.local.insert(signature, CacheEntry { value, written_at: now });
        }

        if !self.version_matches() {
            // Entries written under another key scheme are unusable; start the tier over.
            self.reset_persistent();
        }

        if let Err(err) = self.store.set_many(persisted) {
            warn!(namespace = %self.namespace, %err, "persistent cache write failed");
        }
        true
    }

    pub fn version_matches(&self) -> bool {
        self.store.get(&self.marker_key()).as_deref() == Some(self.version.as_str())
    }

    fn reset_persistent(&self) {
        let prefix = format!("{}:", self.namespace);
        if let Err(err) = self.store.remove_prefix(&prefix) {
            warn!(namespace = %self.namespace, %err, "cannot reset persistent cache");
        }
        if let Err(err) = self.store.set(&self.marker_key(), self.version.clone()) {
            warn!(namespace = %self.namespace, %err, "cannot write persistent cache version marker");
        }
    }

    /// Empty both tiers.
    pub fn clear(&self) {
        let _gate = self.write_gate.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.local.invalidate_all();
        self.reset_persistent();
    }

    pub fn local_entry(&self, signature: &QuerySignature) -> Option<CacheEntry> {
        self.local.get(signature)
    }
}

impl Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("ttl", &self.ttl)
            .field("generation", &self.generation())
            .field("local_entries", &self.local.entry_count())
            .finish()
    }
}
