//! In-memory, per-canonical-index TTL cache of info artifacts (spec.md §4.2).
//!
//! Modeled as a flat slot array with free-slot reuse — the shape the
//! original C implementation used for this kind of small, rarely-evicted
//! cache — rather than a hash map, so `add`'s "reuse any free slot before
//! extending" behavior has something concrete to reuse.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// What an info-cache entry holds, matching spec.md §3's artifact-kind
/// enumeration. The payload types here are placeholders for data whose
/// precise shape is an external (LWPS/storage-engine) concern — only the
/// fields the gateway core itself consumes are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoKind {
    ServerInfo,
    ServerIndexInfo,
    IndexInfo,
    FieldInfo,
    TermInfo,
    DocumentInfo,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub description: String,
}

/// Document-count and freshness data used by total-results estimation
/// (spec.md §4.7 "Total-results estimation").
#[derive(Debug, Clone, Copy)]
pub struct IndexInfo {
    pub document_count: u64,
    pub last_update_time: u64,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct TermInfo {
    pub term: String,
    pub document_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DocumentInfo {
    pub document_count: u64,
    pub term_count: u64,
}

#[derive(Debug, Clone)]
pub enum InfoPayload {
    ServerInfo(ServerInfo),
    ServerIndexInfo(crate::lwps::ServerIndexInfo),
    IndexInfo(IndexInfo),
    FieldInfo(Vec<FieldInfo>),
    TermInfo(Vec<TermInfo>),
    DocumentInfo(DocumentInfo),
}

struct Entry {
    key: String,
    kind: InfoKind,
    expires_at: SystemTime,
    payload: Arc<InfoPayload>,
}

/// The gateway's only mutable structure touched by multiple workers
/// (spec.md §5 "Shared-resource policy") — a single mutex is sufficient
/// given the expected hit rate.
pub struct InfoCache {
    entries: Mutex<Vec<Option<Entry>>>,
}

impl InfoCache {
    pub fn new() -> Self {
        InfoCache {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Idempotent by `(key, kind)`: a pre-existing live entry short-circuits
    /// to success without touching the payload; otherwise reuses a free slot
    /// (an expired or never-used one) before extending the array.
    pub fn add(&self, key: &str, kind: InfoKind, payload: InfoPayload, ttl: Duration) {
        let now = SystemTime::now();
        let mut slots = self.entries.lock();

        if let Some(slot) = slots.iter().find(|s| {
            s.as_ref()
                .map(|e| e.key == key && e.kind == kind && e.expires_at > now)
                .unwrap_or(false)
        }) {
            let _ = slot;
            return;
        }

        let entry = Entry {
            key: key.to_string(),
            kind,
            expires_at: now + ttl,
            payload: Arc::new(payload),
        };

        if let Some(free) = slots.iter_mut().find(|s| s.is_none()) {
            *free = Some(entry);
        } else {
            slots.push(Some(entry));
        }
    }

    /// Linear scan matching `(key, kind)`. An expired match frees its
    /// payload and reports a miss; a live match returns a shared,
    /// read-only handle to the payload.
    pub fn get(&self, key: &str, kind: InfoKind) -> Option<Arc<InfoPayload>> {
        let now = SystemTime::now();
        let mut slots = self.entries.lock();

        let idx = slots
            .iter()
            .position(|s| s.as_ref().map(|e| e.key == key && e.kind == kind).unwrap_or(false))?;

        let expired = slots[idx].as_ref().map(|e| e.expires_at <= now).unwrap_or(true);
        if expired {
            slots[idx] = None;
            return None;
        }

        slots[idx].as_ref().map(|e| Arc::clone(&e.payload))
    }

    /// Releases every payload and clears every slot (gateway teardown,
    /// spec.md §5 "Reinitialization").
    pub fn free_cache(&self) {
        let mut slots = self.entries.lock();
        slots.clear();
    }
}

impl Default for InfoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_for_live_entry() {
        let cache = InfoCache::new();
        cache.add(
            "idx",
            InfoKind::IndexInfo,
            InfoPayload::IndexInfo(IndexInfo {
                document_count: 100,
                last_update_time: 1,
            }),
            Duration::from_secs(60),
        );
        cache.add(
            "idx",
            InfoKind::IndexInfo,
            InfoPayload::IndexInfo(IndexInfo {
                document_count: 999,
                last_update_time: 2,
            }),
            Duration::from_secs(60),
        );

        let got = cache.get("idx", InfoKind::IndexInfo).unwrap();
        match &*got {
            InfoPayload::IndexInfo(info) => assert_eq!(info.document_count, 100),
            _ => panic!("wrong payload kind"),
        }
    }

    #[test]
    fn expired_entry_is_freed_and_reports_miss() {
        let cache = InfoCache::new();
        cache.add(
            "idx",
            InfoKind::IndexInfo,
            InfoPayload::IndexInfo(IndexInfo {
                document_count: 1,
                last_update_time: 1,
            }),
            Duration::from_secs(0),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("idx", InfoKind::IndexInfo).is_none());

        // the freed slot is reusable
        cache.add(
            "idx2",
            InfoKind::IndexInfo,
            InfoPayload::IndexInfo(IndexInfo {
                document_count: 2,
                last_update_time: 2,
            }),
            Duration::from_secs(60),
        );
        assert!(cache.get("idx2", InfoKind::IndexInfo).is_some());
    }

    #[test]
    fn distinct_kinds_for_same_key_are_independent() {
        let cache = InfoCache::new();
        cache.add(
            "idx",
            InfoKind::IndexInfo,
            InfoPayload::IndexInfo(IndexInfo {
                document_count: 1,
                last_update_time: 1,
            }),
            Duration::from_secs(60),
        );
        assert!(cache.get("idx", InfoKind::ServerInfo).is_none());
        assert!(cache.get("idx", InfoKind::IndexInfo).is_some());
    }

    #[test]
    fn free_cache_clears_everything() {
        let cache = InfoCache::new();
        cache.add(
            "idx",
            InfoKind::IndexInfo,
            InfoPayload::IndexInfo(IndexInfo {
                document_count: 1,
                last_update_time: 1,
            }),
            Duration::from_secs(60),
        );
        cache.free_cache();
        assert!(cache.get("idx", InfoKind::IndexInfo).is_none());
    }
}
