//! Tiger cache: precomputed per-subject permission bitmaps.
//!
//! Objects are mapped to dense resource-ints; for each (zone, subject, object
//! type, permission) a roaring bitmap holds the ints the subject may access.
//! Bitmaps are maintained by replaying the per-zone changelog in order, and
//! each entry records the zone revision it reflects so readers can reject
//! entries that are older than their consistency requirement.

pub mod bitmap;
pub mod directory;
pub mod resource_map;
pub mod updater;

pub use bitmap::{BitmapCache, BitmapEntry, BitmapKey};
pub use directory::DirectoryGrantExpander;
pub use resource_map::ResourceMap;
pub use updater::TigerCacheUpdater;

use crate::check::PermissionComputer;
use crate::config::{LeopardConfig, TigerConfig};
use crate::consistency::RevisionTracker;
use crate::limits::GraphLimits;
use crate::models::*;
use crate::repository::TupleRepository;
use roaring::RoaringTreemap;
use std::sync::Arc;
use tracing::debug;

pub struct TigerCache {
    resources: Arc<ResourceMap>,
    bitmaps: Arc<BitmapCache>,
    updater: Arc<TigerCacheUpdater>,
    tracker: Arc<RevisionTracker>,
}

impl TigerCache {
    pub fn new(
        repository: Arc<dyn TupleRepository>,
        computer: Arc<PermissionComputer>,
        resources: Arc<ResourceMap>,
        tracker: Arc<RevisionTracker>,
        limits: GraphLimits,
        config: &TigerConfig,
        leopard: LeopardConfig,
    ) -> Self {
        let bitmaps = Arc::new(BitmapCache::new());
        let updater = Arc::new(TigerCacheUpdater::new(
            repository,
            computer,
            Arc::clone(&bitmaps),
            Arc::clone(&resources),
            Arc::clone(&tracker),
            limits,
            config,
            leopard,
        ));
        Self {
            resources,
            bitmaps,
            updater,
            tracker,
        }
    }

    pub fn updater(&self) -> &Arc<TigerCacheUpdater> {
        &self.updater
    }

    pub fn resources(&self) -> &Arc<ResourceMap> {
        &self.resources
    }

    /// Positive answer from a bitmap at least as fresh as `min_revision`.
    pub fn check_bit(
        &self,
        zone_id: &str,
        subject: &Subject,
        permission: &str,
        object: &Object,
        min_revision: u64,
    ) -> bool {
        let Some(resource) = self.resources.id_of(object) else {
            return false;
        };
        let key = BitmapKey::new(zone_id, subject, &object.object_type, permission);
        self.bitmaps.contains(&key, resource, min_revision)
    }

    /// Every accessible object of a type, ordered by resource-int, when a
    /// complete bitmap at least as fresh as `min_revision` exists.
    pub fn complete_objects(
        &self,
        zone_id: &str,
        subject: &Subject,
        object_type: &str,
        permission: &str,
        min_revision: u64,
    ) -> Option<Vec<(u64, Object)>> {
        let key = BitmapKey::new(zone_id, subject, object_type, permission);
        let bits = self.bitmaps.complete_bits(&key, min_revision)?;
        Some(
            bits.iter()
                .filter_map(|id| self.resources.object_of(id).map(|o| (id, o)))
                .collect(),
        )
    }

    /// Record a positive check computed against the store at `revision`.
    ///
    /// Skipped when the updater has already applied changes past `revision`:
    /// the answer could predate one of them and would never be revisited.
    pub async fn warm_bit(&self, zone_id: &str, subject: &Subject, permission: &str, object: &Object, revision: u64) {
        let lock = self.updater.zone_lock(zone_id);
        let _zone = lock.lock().await;
        if self.tracker.applied(zone_id) > revision {
            return;
        }
        let key = BitmapKey::new(zone_id, subject, &object.object_type, permission);
        self.bitmaps
            .set_bit(key, self.resources.get_or_assign(object), revision);
    }

    /// Store the full result of a list computed at `revision` as a complete bitmap.
    pub async fn warm_complete(
        &self,
        zone_id: &str,
        subject: &Subject,
        object_type: &str,
        permission: &str,
        resources: &[u64],
        revision: u64,
    ) {
        let lock = self.updater.zone_lock(zone_id);
        let _zone = lock.lock().await;
        if self.tracker.applied(zone_id) > revision {
            return;
        }
        let bits: RoaringTreemap = resources.iter().copied().collect();
        debug!(zone = zone_id, subject = %subject, permission, objects = bits.len(), revision, "Tiger bitmap warmed");
        self.bitmaps.insert(
            BitmapKey::new(zone_id, subject, object_type, permission),
            BitmapEntry {
                bits,
                revision,
                complete: true,
            },
        );
    }
}
