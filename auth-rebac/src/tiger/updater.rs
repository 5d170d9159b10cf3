use crate::check::PermissionComputer;
use crate::config::{LeopardConfig, TigerConfig};
use crate::consistency::RevisionTracker;
use crate::error::RebacError;
use crate::limits::{GraphLimits, TraversalGuard};
use crate::models::*;
use crate::repository::TupleRepository;
use crate::tiger::bitmap::{BitmapCache, BitmapKey};
use crate::tiger::directory::DirectoryGrantExpander;
use crate::tiger::resource_map::ResourceMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Checkpoint consumer name in the changelog store.
pub const CONSUMER: &str = "tiger";

/// Consumes the per-zone changelog in sequence order and flips bitmap bits.
///
/// One FIFO stream per zone: a zone is processed under its own lock, from the
/// stored checkpoint, so a delete is never applied before the write it follows
/// and replay after a crash is idempotent.
pub struct TigerCacheUpdater {
    repository: Arc<dyn TupleRepository>,
    computer: Arc<PermissionComputer>,
    bitmaps: Arc<BitmapCache>,
    resources: Arc<ResourceMap>,
    expander: DirectoryGrantExpander,
    tracker: Arc<RevisionTracker>,
    limits: GraphLimits,
    batch_size: usize,
    leopard: LeopardConfig,
    hierarchy_relations: HashSet<String>,
    zone_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    worker: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl TigerCacheUpdater {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn TupleRepository>,
        computer: Arc<PermissionComputer>,
        bitmaps: Arc<BitmapCache>,
        resources: Arc<ResourceMap>,
        tracker: Arc<RevisionTracker>,
        limits: GraphLimits,
        config: &TigerConfig,
        leopard: LeopardConfig,
    ) -> Self {
        let hierarchy_relations = computer.schema().tupleset_relations();
        Self {
            expander: DirectoryGrantExpander::new(
                Arc::clone(&repository),
                hierarchy_relations.clone(),
                config.directory_expansion_limit,
            ),
            repository,
            computer,
            bitmaps,
            resources,
            tracker,
            limits,
            batch_size: config.changelog_batch_size.max(1),
            leopard,
            hierarchy_relations,
            zone_locks: DashMap::new(),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn zone_lock(&self, zone_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            &self
                .zone_locks
                .entry(zone_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Start the background consumer. Returns `None` if one is already running.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return None;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *worker = Some(tx);

        let updater = Arc::clone(self);
        Some(tokio::spawn(async move {
            info!("Tiger cache updater started");
            while let Some(zone_id) = rx.recv().await {
                if let Err(e) = updater.process_zone(&zone_id).await {
                    warn!(zone = %zone_id, error = %e, "Tiger cache update failed, will retry on next change");
                }
            }
            info!("Tiger cache updater stopped");
        }))
    }

    /// Wake the worker for a zone. Without a worker, readers catch up inline.
    pub fn notify(&self, zone_id: &str) {
        if let Some(tx) = self.worker.lock().as_ref() {
            let _ = tx.send(zone_id.to_string());
        }
    }

    /// Process the zone until its changelog is drained, or at least `revision` is applied.
    pub async fn catch_up(&self, zone_id: &str, revision: u64) -> Result<u64, RebacError> {
        if self.tracker.applied(zone_id) >= revision {
            return Ok(self.tracker.applied(zone_id));
        }
        self.process_zone(zone_id).await
    }

    /// Apply every pending change for the zone. Returns the applied revision.
    pub async fn process_zone(&self, zone_id: &str) -> Result<u64, RebacError> {
        let lock = self.zone_lock(zone_id);
        let _zone = lock.lock().await;

        let mut checkpoint = self.repository.load_checkpoint(CONSUMER, zone_id).await?;
        loop {
            let changes = self
                .repository
                .read_changes(zone_id, checkpoint, self.batch_size)
                .await?;
            if changes.is_empty() {
                break;
            }
            for change in &changes {
                self.apply(change).await?;
                checkpoint = change.sequence;
            }
            self.repository
                .save_checkpoint(CONSUMER, zone_id, checkpoint)
                .await?;
            self.bitmaps.advance(zone_id, checkpoint);
            self.tracker.mark_applied(zone_id, checkpoint);
            debug!(zone = zone_id, checkpoint, applied = changes.len(), "Tiger changelog batch applied");
        }

        self.bitmaps.advance(zone_id, checkpoint);
        self.tracker.mark_applied(zone_id, checkpoint);
        Ok(checkpoint)
    }

    async fn apply(&self, change: &ChangeEntry) -> Result<(), RebacError> {
        let tuple = &change.tuple;
        let zone_id = change.zone_id.as_str();

        if self.leopard.is_membership_edge(tuple) && !tuple.subject.is_userset() {
            self.bitmaps.drop_subject(zone_id, &tuple.subject);
            return Ok(());
        }
        if tuple.subject.is_userset() || self.hierarchy_relations.contains(&tuple.relation) {
            // Reaches an unbounded set of subjects.
            self.bitmaps.drop_zone(zone_id);
            return Ok(());
        }

        let keys = self.bitmaps.keys_for_subject(zone_id, &tuple.subject);
        if keys.is_empty() {
            return Ok(());
        }

        let mut affected = vec![tuple.object.clone()];
        match self.expander.dependents(zone_id, &tuple.object).await? {
            Some(dependents) => affected.extend(dependents),
            None => {
                self.bitmaps.drop_subject(zone_id, &tuple.subject);
                return Ok(());
            }
        }

        for key in keys {
            for object in affected.iter().filter(|o| o.object_type == key.object_type) {
                let allowed = self.recompute(&key, object).await?;
                self.bitmaps
                    .update_bit(&key, self.resources.get_or_assign(object), allowed);
            }
        }
        Ok(())
    }

    async fn recompute(&self, key: &BitmapKey, object: &Object) -> Result<bool, RebacError> {
        let request = CheckRequest::new(key.subject.clone(), &key.permission, object.clone(), &key.zone_id);
        match self
            .computer
            .evaluate(&request, TraversalGuard::new(self.limits), false)
            .await
        {
            Ok(evaluation) => Ok(evaluation.allowed && evaluation.cacheable),
            Err(e) if e.is_fail_closed() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryTupleRepository;
    use crate::schema::Schema;

    struct Fixture {
        repo: Arc<InMemoryTupleRepository>,
        bitmaps: Arc<BitmapCache>,
        resources: Arc<ResourceMap>,
        tracker: Arc<RevisionTracker>,
        updater: Arc<TigerCacheUpdater>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let computer = Arc::new(PermissionComputer::new(repo.clone(), Arc::new(Schema::filesystem())));
        let bitmaps = Arc::new(BitmapCache::new());
        let resources = Arc::new(ResourceMap::new());
        let tracker = Arc::new(RevisionTracker::new());
        let updater = Arc::new(TigerCacheUpdater::new(
            repo.clone(),
            computer,
            bitmaps.clone(),
            resources.clone(),
            tracker.clone(),
            GraphLimits::default(),
            &TigerConfig::default(),
            LeopardConfig::default(),
        ));
        Fixture {
            repo,
            bitmaps,
            resources,
            tracker,
            updater,
        }
    }

    #[tokio::test]
    async fn test_replays_changelog_and_flips_bits() {
        let f = fixture();
        let alice = Subject::user("alice");
        let doc = Object::file("/eng/doc.txt");
        let key = BitmapKey::new("z1", &alice, "file", "viewer");
        f.repo
            .write_tuple(RelationshipTuple::new(Object::dir("/eng").as_subject(), "parent", doc.clone(), "z1"))
            .await
            .unwrap();
        f.updater.process_zone("z1").await.unwrap();
        f.bitmaps.insert(key.clone(), Default::default());
        let doc_id = f.resources.get_or_assign(&doc);

        let grant = f
            .repo
            .write_tuple(RelationshipTuple::new(alice.clone(), "viewer", Object::dir("/eng"), "z1"))
            .await
            .unwrap();
        assert_eq!(f.updater.catch_up("z1", grant.revision).await.unwrap(), 2);
        assert!(f.bitmaps.contains(&key, doc_id, 2));
        assert_eq!(f.tracker.applied("z1"), 2);
        assert_eq!(f.repo.load_checkpoint(CONSUMER, "z1").await.unwrap(), 2);

        f.repo.delete_tuple(grant.tuple_id).await.unwrap();
        f.updater.process_zone("z1").await.unwrap();
        assert!(!f.bitmaps.contains(&key, doc_id, 0));

        // Replaying from the stored checkpoint is a no-op.
        assert_eq!(f.updater.process_zone("z1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_membership_change_drops_subject_bitmaps() {
        let f = fixture();
        let alice = Subject::user("alice");
        f.bitmaps.set_bit(BitmapKey::new("z1", &alice, "file", "viewer"), 1, 0);
        f.bitmaps.set_bit(BitmapKey::new("z1", &Subject::user("bob"), "file", "viewer"), 1, 0);

        f.repo
            .write_tuple(RelationshipTuple::new(alice.clone(), "member", Object::new("group", "eng"), "z1"))
            .await
            .unwrap();
        f.updater.process_zone("z1").await.unwrap();

        assert!(f.bitmaps.keys_for_subject("z1", &alice).is_empty());
        assert_eq!(f.bitmaps.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_is_idempotent() {
        let f = fixture();
        let handle = f.updater.spawn();
        assert!(handle.is_some());
        assert!(f.updater.spawn().is_none());
        f.updater.notify("z1");
    }
}
