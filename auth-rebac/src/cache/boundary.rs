//! Boundary cache: where hierarchical inheritance resolved.
//!
//! For (subject, permission, path object) it remembers the nearest ancestor at
//! which the permission was granted, so a deep path does not re-walk every
//! ancestor. Only monotonic permissions are recorded.

use crate::cache::CacheInvalidator;
use crate::error::RebacError;
use crate::models::*;
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BoundaryKey {
    zone_id: String,
    subject: Subject,
    permission: String,
    object: Object,
}

#[derive(Default)]
pub struct BoundaryCache {
    entries: DashMap<BoundaryKey, Object>,
}

impl BoundaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, zone_id: &str, subject: &Subject, permission: &str, object: &Object) -> Option<Object> {
        let key = BoundaryKey {
            zone_id: zone_id.to_string(),
            subject: subject.clone(),
            permission: permission.to_string(),
            object: object.clone(),
        };
        self.entries.get(&key).map(|b| b.clone())
    }

    pub fn record(&self, zone_id: &str, subject: &Subject, permission: &str, object: &Object, boundary: Object) {
        if boundary == *object || !boundary.is_path() {
            return;
        }
        self.entries.insert(
            BoundaryKey {
                zone_id: zone_id.to_string(),
                subject: subject.clone(),
                permission: permission.to_string(),
                object: object.clone(),
            },
            boundary,
        );
    }

    pub fn forget(&self, zone_id: &str, subject: &Subject, permission: &str, object: &Object) {
        self.entries.remove(&BoundaryKey {
            zone_id: zone_id.to_string(),
            subject: subject.clone(),
            permission: permission.to_string(),
            object: object.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheInvalidator for BoundaryCache {
    fn name(&self) -> &'static str {
        "boundary"
    }

    async fn invalidate(&self, change: &ChangeEntry) -> Result<(), RebacError> {
        let changed = &change.tuple.object;
        if !changed.is_path() {
            self.invalidate_zone(&change.zone_id).await;
            return Ok(());
        }
        // A grant or revoke at or above an entry's path can move its boundary.
        self.entries.retain(|key, _| {
            key.zone_id != change.zone_id || !key.object.is_under(&changed.object_id)
        });
        Ok(())
    }

    async fn invalidate_zone(&self, zone_id: &str) {
        self.entries.retain(|key, _| key.zone_id != zone_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn change(object: Object) -> ChangeEntry {
        ChangeEntry {
            sequence: 2,
            zone_id: "z1".to_string(),
            kind: ChangeKind::Delete,
            tuple: RelationshipTuple::new(Subject::user("alice"), "viewer", object, "z1"),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_invalidates_at_or_below_change() {
        let cache = BoundaryCache::new();
        let alice = Subject::user("alice");
        cache.record("z1", &alice, "viewer", &Object::file("/a/b/c.txt"), Object::dir("/a"));
        cache.record("z1", &alice, "viewer", &Object::file("/x/y.txt"), Object::dir("/x"));
        assert_eq!(cache.len(), 2);

        cache.invalidate(&change(Object::dir("/a"))).await.unwrap();
        assert!(cache.get("z1", &alice, "viewer", &Object::file("/a/b/c.txt")).is_none());
        assert_eq!(
            cache.get("z1", &alice, "viewer", &Object::file("/x/y.txt")),
            Some(Object::dir("/x"))
        );

        cache.invalidate(&change(Object::new("group", "eng"))).await.unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_self_boundary_not_recorded() {
        let cache = BoundaryCache::new();
        let file = Object::file("/a.txt");
        cache.record("z1", &Subject::user("alice"), "viewer", &file, file.clone());
        assert!(cache.is_empty());
    }
}
