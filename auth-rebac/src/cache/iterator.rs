//! Iterator cache: stable, cursor-addressed list_objects snapshots.
//!
//! A snapshot is the full ordered result of one list_objects query at one zone
//! revision. Pages are cut from it by resource-int, so writes made while a
//! caller paginates never reorder or duplicate results. Once the zone has moved
//! too far past the snapshot, its cursors expire. A cursor is bound to the
//! query that produced it and is rejected for any other query.

use crate::config::IteratorCacheConfig;
use crate::error::RebacError;
use crate::models::Object;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Ordered `(resource-int, object)` pairs.
#[derive(Debug)]
pub struct Snapshot {
    pub zone_id: String,
    /// [`IteratorCache::query_hash`] of the query the snapshot answers.
    pub query: String,
    pub revision: u64,
    pub items: Vec<(u64, Object)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorState {
    snapshot: String,
    query: String,
    zone: String,
    last: u64,
    revision: u64,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub objects: Vec<Object>,
    pub next_cursor: Option<String>,
    pub revision: u64,
}

pub struct IteratorCache {
    snapshots: Cache<String, Arc<Snapshot>>,
    staleness_revisions: u64,
}

impl IteratorCache {
    pub fn new(config: &IteratorCacheConfig) -> Self {
        let snapshots = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();

        Self {
            snapshots,
            staleness_revisions: config.staleness_revisions,
        }
    }

    /// Fingerprint of a list query (zone, subject, permission, type, prefix).
    pub fn query_hash(query: &str) -> String {
        hex::encode(Sha256::digest(query.as_bytes()))
    }

    /// Stable id for a query at a revision.
    pub fn snapshot_id(query_hash: &str, revision: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query_hash.as_bytes());
        hasher.update(b"@");
        hasher.update(revision.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// Store a snapshot and return its first page.
    pub async fn start(&self, snapshot_id: String, snapshot: Snapshot, limit: usize) -> Page {
        let snapshot = Arc::new(snapshot);
        self.snapshots
            .insert(snapshot_id.clone(), Arc::clone(&snapshot))
            .await;
        Self::cut(&snapshot_id, &snapshot, None, limit)
    }

    /// Continue from a cursor issued for the same query.
    pub async fn resume(
        &self,
        cursor: &str,
        query_hash: &str,
        zone_id: &str,
        current_revision: u64,
        limit: usize,
    ) -> Result<Page, RebacError> {
        let expired = |cursor_revision: u64| RebacError::CursorExpired {
            cursor_revision,
            current_revision,
        };

        let state = Self::decode(cursor)
            .ok_or_else(|| RebacError::InvalidCursor("malformed cursor".to_string()))?;
        if state.zone != zone_id || state.query != query_hash {
            return Err(RebacError::InvalidCursor(
                "cursor was issued for a different query".to_string(),
            ));
        }
        if current_revision.saturating_sub(state.revision) > self.staleness_revisions {
            return Err(expired(state.revision));
        }
        let snapshot = self
            .snapshots
            .get(&state.snapshot)
            .await
            .ok_or_else(|| expired(state.revision))?;

        Ok(Self::cut(&state.snapshot, &snapshot, Some(state.last), limit))
    }

    fn cut(snapshot_id: &str, snapshot: &Snapshot, after: Option<u64>, limit: usize) -> Page {
        let start = match after {
            Some(last) => snapshot.items.partition_point(|(id, _)| *id <= last),
            None => 0,
        };
        let end = start.saturating_add(limit.max(1)).min(snapshot.items.len());
        let slice = snapshot.items.get(start..end).unwrap_or_default();

        let next_cursor = match slice.last() {
            Some((last, _)) if end < snapshot.items.len() => Some(Self::encode(&CursorState {
                snapshot: snapshot_id.to_string(),
                query: snapshot.query.clone(),
                zone: snapshot.zone_id.clone(),
                last: *last,
                revision: snapshot.revision,
            })),
            _ => None,
        };

        Page {
            objects: slice.iter().map(|(_, o)| o.clone()).collect(),
            next_cursor,
            revision: snapshot.revision,
        }
    }

    fn encode(state: &CursorState) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(state).unwrap_or_default())
    }

    fn decode(cursor: &str) -> Option<CursorState> {
        let raw = URL_SAFE_NO_PAD.decode(cursor).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(revision: u64, n: u64) -> Snapshot {
        Snapshot {
            zone_id: "z1".to_string(),
            query: IteratorCache::query_hash("q"),
            revision,
            items: (0..n)
                .map(|i| (i * 10, Object::file(&format!("/f{}", i))))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_pages_cover_snapshot_without_duplicates() {
        let cache = IteratorCache::new(&IteratorCacheConfig::default());
        let query = IteratorCache::query_hash("q");
        let mut page = cache.start(IteratorCache::snapshot_id(&query, 5), snapshot(5, 7), 3).await;
        let mut seen = page.objects.clone();

        while let Some(cursor) = page.next_cursor.clone() {
            page = cache.resume(&cursor, &query, "z1", 6, 3).await.unwrap();
            seen.extend(page.objects.clone());
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.first(), Some(&Object::file("/f0")));
        assert_eq!(seen.last(), Some(&Object::file("/f6")));
    }

    #[tokio::test]
    async fn test_cursor_expires_past_staleness_bound() {
        let config = IteratorCacheConfig {
            staleness_revisions: 2,
            ..IteratorCacheConfig::default()
        };
        let cache = IteratorCache::new(&config);
        let query = IteratorCache::query_hash("q");
        let page = cache
            .start(IteratorCache::snapshot_id(&query, 1), snapshot(1, 4), 2)
            .await;
        let cursor = page.next_cursor.unwrap();

        assert!(cache.resume(&cursor, &query, "z1", 3, 2).await.is_ok());
        assert!(matches!(
            cache.resume(&cursor, &query, "z1", 4, 2).await,
            Err(RebacError::CursorExpired { cursor_revision: 1, current_revision: 4 })
        ));
        assert!(matches!(
            cache.resume("garbage", &query, "z1", 1, 2).await,
            Err(RebacError::InvalidCursor(_))
        ));
        assert!(cache.resume(&cursor, &query, "z2", 1, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_bound_to_its_query() {
        let cache = IteratorCache::new(&IteratorCacheConfig::default());
        let query = IteratorCache::query_hash("z1|user:alice|viewer|file|");
        assert_eq!(query.len(), 64);
        let page = cache
            .start(IteratorCache::snapshot_id(&query, 1), snapshot(1, 4), 2)
            .await;
        let cursor = page.next_cursor.unwrap();

        let other = IteratorCache::query_hash("z1|user:bob|viewer|file|");
        assert!(matches!(
            cache.resume(&cursor, &other, "z1", 1, 2).await,
            Err(RebacError::InvalidCursor(_))
        ));
    }
}
