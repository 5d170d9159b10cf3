use crate::models::Subject;
use dashmap::DashMap;
use roaring::RoaringTreemap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitmapKey {
    pub zone_id: String,
    pub subject: Subject,
    pub object_type: String,
    pub permission: String,
}

impl BitmapKey {
    pub fn new(zone_id: &str, subject: &Subject, object_type: &str, permission: &str) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            subject: subject.clone(),
            object_type: object_type.to_string(),
            permission: permission.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BitmapEntry {
    pub bits: RoaringTreemap,
    /// Zone revision every change up to which has been applied to `bits`.
    pub revision: u64,
    /// Holds every accessible object, not just the ones seen so far.
    pub complete: bool,
}

/// Per (zone, subject, object type, permission) bitmaps of accessible resource-ints.
#[derive(Default)]
pub struct BitmapCache {
    entries: DashMap<BitmapKey, BitmapEntry>,
}

impl BitmapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A positive bit from an entry at least as fresh as `min_revision`.
    pub fn contains(&self, key: &BitmapKey, resource: u64, min_revision: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.revision >= min_revision && e.bits.contains(resource))
    }

    /// Every resource-int, when the entry is complete and fresh enough.
    pub fn complete_bits(&self, key: &BitmapKey, min_revision: u64) -> Option<RoaringTreemap> {
        self.entries
            .get(key)
            .filter(|e| e.complete && e.revision >= min_revision)
            .map(|e| e.bits.clone())
    }

    pub fn insert(&self, key: BitmapKey, entry: BitmapEntry) {
        self.entries.insert(key, entry);
    }

    /// Set one bit, creating a partial entry at `revision` when none exists.
    pub fn set_bit(&self, key: BitmapKey, resource: u64, revision: u64) {
        self.entries
            .entry(key)
            .or_insert_with(|| BitmapEntry {
                revision,
                ..BitmapEntry::default()
            })
            .bits
            .insert(resource);
    }

    pub fn update_bit(&self, key: &BitmapKey, resource: u64, allowed: bool) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if allowed {
                entry.bits.insert(resource);
            } else {
                entry.bits.remove(resource);
            }
        }
    }

    pub fn keys_for_subject(&self, zone_id: &str, subject: &Subject) -> Vec<BitmapKey> {
        self.entries
            .iter()
            .filter(|e| e.key().zone_id == zone_id && e.key().subject == *subject)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn drop_subject(&self, zone_id: &str, subject: &Subject) {
        self.entries
            .retain(|key, _| key.zone_id != zone_id || key.subject != *subject);
    }

    pub fn drop_zone(&self, zone_id: &str) {
        self.entries.retain(|key, _| key.zone_id != zone_id);
    }

    /// Record that every change in the zone up to `revision` has been applied.
    pub fn advance(&self, zone_id: &str, revision: u64) {
        for mut entry in self.entries.iter_mut() {
            if entry.key().zone_id == zone_id && entry.revision < revision {
                entry.revision = revision;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_gate() {
        let cache = BitmapCache::new();
        let key = BitmapKey::new("z1", &Subject::user("alice"), "file", "viewer");
        cache.set_bit(key.clone(), 7, 3);

        assert!(cache.contains(&key, 7, 3));
        assert!(!cache.contains(&key, 7, 4));
        assert!(!cache.contains(&key, 8, 0));
        assert!(cache.complete_bits(&key, 0).is_none());

        cache.advance("z1", 5);
        assert!(cache.contains(&key, 7, 5));
        cache.update_bit(&key, 7, false);
        assert!(!cache.contains(&key, 7, 0));
    }

    #[test]
    fn test_drop_scopes() {
        let cache = BitmapCache::new();
        cache.set_bit(BitmapKey::new("z1", &Subject::user("alice"), "file", "viewer"), 1, 1);
        cache.set_bit(BitmapKey::new("z1", &Subject::user("bob"), "file", "viewer"), 1, 1);
        cache.set_bit(BitmapKey::new("z2", &Subject::user("alice"), "file", "viewer"), 1, 1);

        cache.drop_subject("z1", &Subject::user("alice"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys_for_subject("z1", &Subject::user("bob")).len(), 1);
        cache.drop_zone("z1");
        assert_eq!(cache.len(), 1);
    }
}
