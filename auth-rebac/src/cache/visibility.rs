//! Directory visibility cache.

use crate::cache::CacheInvalidator;
use crate::error::RebacError;
use crate::models::*;
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VisibilityKey {
    zone_id: String,
    subject: Subject,
    permission: String,
    directory: String,
}

/// Whether a directory has a direct grant or any visible descendant, per subject.
#[derive(Default)]
pub struct VisibilityCache {
    entries: DashMap<VisibilityKey, bool>,
}

impl VisibilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(zone_id: &str, subject: &Subject, permission: &str, directory: &str) -> VisibilityKey {
        VisibilityKey {
            zone_id: zone_id.to_string(),
            subject: subject.clone(),
            permission: permission.to_string(),
            directory: directory.to_string(),
        }
    }

    pub fn get(&self, zone_id: &str, subject: &Subject, permission: &str, directory: &str) -> Option<bool> {
        self.entries
            .get(&Self::key(zone_id, subject, permission, directory))
            .map(|v| *v)
    }

    pub fn insert(&self, zone_id: &str, subject: &Subject, permission: &str, directory: &str, visible: bool) {
        self.entries
            .insert(Self::key(zone_id, subject, permission, directory), visible);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheInvalidator for VisibilityCache {
    fn name(&self) -> &'static str {
        "visibility"
    }

    async fn invalidate(&self, change: &ChangeEntry) -> Result<(), RebacError> {
        let changed = &change.tuple.object;
        if !changed.is_path() {
            self.invalidate_zone(&change.zone_id).await;
            return Ok(());
        }
        // Ancestors may gain or lose a visible descendant; descendants inherit.
        self.entries.retain(|key, _| {
            key.zone_id != change.zone_id
                || !(changed.is_under(&key.directory) || path_is_under(&key.directory, &changed.object_id))
        });
        Ok(())
    }

    async fn invalidate_zone(&self, zone_id: &str) {
        self.entries.retain(|key, _| key.zone_id != zone_id);
    }
}
