//! Fans tuple changes out to every derived cache.

use crate::cache::CacheInvalidator;
use crate::consistency::RevisionTracker;
use crate::models::{ChangeEntry, ChangeKind};
use crate::tiger::TigerCache;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs on every committed write or delete, before the caller gets its token.
///
/// Synchronous invalidators (result, boundary, visibility, leopard) are applied
/// inline; the Tiger updater is only woken, and catches up from the changelog.
pub struct CacheCoordinator {
    tracker: Arc<RevisionTracker>,
    invalidators: Vec<Arc<dyn CacheInvalidator>>,
    tiger: Option<Arc<TigerCache>>,
    restrictive_relations: HashSet<String>,
}

impl CacheCoordinator {
    pub fn new(tracker: Arc<RevisionTracker>, restrictive_relations: HashSet<String>) -> Self {
        Self {
            tracker,
            invalidators: Vec::new(),
            tiger: None,
            restrictive_relations,
        }
    }

    pub fn register(&mut self, invalidator: Arc<dyn CacheInvalidator>) {
        self.invalidators.push(invalidator);
    }

    pub fn with_tiger(mut self, tiger: Arc<TigerCache>) -> Self {
        self.tiger = Some(tiger);
        self
    }

    /// A change is restrictive when it can take access away: any delete, or a
    /// write to a relation subtracted by an exclusion.
    pub fn is_restrictive(&self, change: &ChangeEntry) -> bool {
        change.kind == ChangeKind::Delete || self.restrictive_relations.contains(&change.tuple.relation)
    }

    pub async fn on_change(&self, change: &ChangeEntry) {
        self.tracker
            .observe(&change.zone_id, change.sequence, self.is_restrictive(change));

        for invalidator in &self.invalidators {
            if let Err(e) = invalidator.invalidate(change).await {
                warn!(
                    cache = invalidator.name(),
                    zone = %change.zone_id,
                    error = %e,
                    "Targeted invalidation failed, clearing zone"
                );
                invalidator.invalidate_zone(&change.zone_id).await;
            }
        }

        if let Some(tiger) = &self.tiger {
            tiger.updater().notify(&change.zone_id);
        }
        debug!(zone = %change.zone_id, sequence = change.sequence, kind = ?change.kind, "Change propagated");
    }
}
