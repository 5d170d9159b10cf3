use crate::{
    cache::{result::ResultKey, BoundaryCache, CacheCoordinator, IteratorCache, ResultCache, VisibilityCache},
    cache::iterator::Snapshot,
    check::PermissionComputer,
    config::EngineConfig,
    consistency::{Consistency, ConsistencyToken, RevisionTracker},
    error::{RebacError, Result},
    expand::ExpandEngine,
    leopard::LeopardIndex,
    limits::{NodeBudget, TraversalGuard},
    models::*,
    repository::TupleRepository,
    schema::Schema,
    tiger::{ResourceMap, TigerCache},
    traversal::ZoneAwareTraversal,
    zone::ZoneManager,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WRITE_LOCK_STRIPES: usize = 64;

/// How a read may use derived caches.
#[derive(Debug, Clone, Copy)]
struct ReadPlan {
    use_caches: bool,
    /// Oldest bitmap revision a Tiger answer may come from.
    min_revision: u64,
}

/// ReBAC engine facade.
///
/// Owns the tuple store handle, the schema and every derived cache, and wires
/// writes through the [`CacheCoordinator`] before acknowledging them. All
/// caches are constructed here once and shared by reference; nothing is global.
pub struct RebacManager {
    repository: Arc<dyn TupleRepository>,
    schema: Arc<Schema>,
    config: EngineConfig,
    zones: Arc<ZoneManager>,
    tracker: Arc<RevisionTracker>,
    traversal: ZoneAwareTraversal,
    expander: ExpandEngine,
    leopard: Option<Arc<LeopardIndex>>,
    tiger: Option<Arc<TigerCache>>,
    resources: Arc<ResourceMap>,
    result_cache: Arc<ResultCache>,
    visibility: Arc<VisibilityCache>,
    iterators: IteratorCache,
    coordinator: CacheCoordinator,
    write_locks: Vec<Mutex<()>>,
}

impl RebacManager {
    pub fn new(repository: Arc<dyn TupleRepository>, schema: Schema, config: EngineConfig) -> Result<Self> {
        schema.validate()?;
        config.validate()?;

        let schema = Arc::new(schema);
        let limits = config.limits;
        let zones = Arc::new(ZoneManager::new(&config.zones));
        let tracker = Arc::new(RevisionTracker::new());
        let resources = Arc::new(ResourceMap::new());
        let boundary = Arc::new(BoundaryCache::new());
        let visibility = Arc::new(VisibilityCache::new());
        let result_cache = Arc::new(ResultCache::new(&config.result_cache, schema.tupleset_relations()));

        let leopard = config.leopard.enabled.then(|| {
            Arc::new(LeopardIndex::new(
                Arc::clone(&repository),
                config.leopard.clone(),
                limits,
            ))
        });

        let mut computer = PermissionComputer::new(Arc::clone(&repository), Arc::clone(&schema))
            .with_boundary_cache(Arc::clone(&boundary));
        if let Some(ref leopard) = leopard {
            computer = computer.with_leopard(Arc::clone(leopard));
        }
        let computer = Arc::new(computer);

        let tiger = config.tiger.enabled.then(|| {
            Arc::new(TigerCache::new(
                Arc::clone(&repository),
                Arc::clone(&computer),
                Arc::clone(&resources),
                Arc::clone(&tracker),
                limits,
                &config.tiger,
                config.leopard.clone(),
            ))
        });

        let mut coordinator = CacheCoordinator::new(Arc::clone(&tracker), schema.restrictive_relations());
        coordinator.register(result_cache.clone());
        coordinator.register(boundary);
        coordinator.register(visibility.clone());
        if let Some(ref leopard) = leopard {
            coordinator.register(leopard.clone());
        }
        if let Some(ref tiger) = tiger {
            coordinator = coordinator.with_tiger(Arc::clone(tiger));
        }

        info!(
            namespaces = schema.namespaces.len(),
            tiger = config.tiger.enabled,
            leopard = config.leopard.enabled,
            max_depth = limits.max_depth,
            max_nodes = limits.max_nodes_visited,
            "ReBAC engine initialised"
        );

        Ok(Self {
            traversal: ZoneAwareTraversal::new(computer, Arc::clone(&zones), Arc::clone(&repository)),
            expander: ExpandEngine::new(Arc::clone(&repository), Arc::clone(&schema)),
            iterators: IteratorCache::new(&config.iterator_cache),
            write_locks: (0..WRITE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            repository,
            schema,
            config,
            zones,
            tracker,
            leopard,
            tiger,
            resources,
            result_cache,
            visibility,
            coordinator,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn zones(&self) -> &ZoneManager {
        &self.zones
    }

    // =============================================================================
    // Checks
    // =============================================================================

    pub async fn check(&self, request: &CheckRequest, consistency: Consistency) -> Result<bool> {
        Ok(self.check_with_outcome(request, consistency).await?.allowed)
    }

    /// Check and report which layer answered, with traversal counters.
    pub async fn check_with_outcome(
        &self,
        request: &CheckRequest,
        consistency: Consistency,
    ) -> Result<CheckOutcome> {
        self.zones.validate_zone_id(&request.zone_id)?;
        let plan = self.read_plan(&request.zone_id, &consistency).await?;
        let guard = TraversalGuard::new(self.config.limits);
        self.decide(request, plan, guard).await
    }

    /// Check many keys in one zone under a single node budget.
    ///
    /// An item that exhausts the shared budget or fails closed is `false`;
    /// infrastructure errors abort the whole batch.
    pub async fn check_bulk(
        &self,
        items: Vec<CheckKey>,
        zone_id: &str,
        consistency: Consistency,
    ) -> Result<HashMap<CheckKey, bool>> {
        self.zones.validate_zone_id(zone_id)?;
        let plan = self.read_plan(zone_id, &consistency).await?;
        let limits = self.config.limits;
        let budget = NodeBudget::new(limits.max_nodes_visited);

        let mut results = HashMap::with_capacity(items.len());
        for item in items {
            let request = CheckRequest::new(item.subject.clone(), &item.permission, item.object.clone(), zone_id);
            let guard = TraversalGuard::with_budget(limits, budget.clone());
            let allowed = match self.decide(&request, plan, guard).await {
                Ok(outcome) => outcome.allowed,
                Err(e) if e.is_fail_closed() => {
                    warn!(
                        subject = %item.subject,
                        permission = %item.permission,
                        object = %item.object,
                        zone = zone_id,
                        error = %e,
                        "Bulk check item denied"
                    );
                    false
                }
                Err(e) => return Err(e),
            };
            results.insert(item, allowed);
        }

        debug!(zone = zone_id, items = results.len(), nodes_used = budget.used(), "Bulk check finished");
        Ok(results)
    }

    async fn decide(&self, request: &CheckRequest, plan: ReadPlan, guard: TraversalGuard) -> Result<CheckOutcome> {
        self.traversal.authorize(request).await?;

        let zone_id = request.zone_id.as_str();
        let use_caches = plan.use_caches && request.context.is_none() && request.subject_zone() == zone_id;
        let key = ResultKey::new(zone_id, &request.subject, &request.permission, &request.object);

        if use_caches {
            if let Some(allowed) = self.result_cache.get(&key).await {
                return Ok(Self::cached_outcome(allowed, CheckStrategy::ResultCache));
            }
            if let Some(ref tiger) = self.tiger {
                if tiger.check_bit(zone_id, &request.subject, &request.permission, &request.object, plan.min_revision) {
                    return Ok(Self::cached_outcome(true, CheckStrategy::TigerCache));
                }
            }
        }

        let revision = self.tracker.latest(zone_id);
        let generation = self.result_cache.generation(zone_id);
        let evaluation = self.traversal.run(request, guard, use_caches).await?;

        if use_caches && evaluation.cacheable && self.tracker.latest(zone_id) == revision {
            self.result_cache.insert(key, evaluation.allowed, generation).await;
            if evaluation.allowed {
                if let Some(ref tiger) = self.tiger {
                    tiger
                        .warm_bit(zone_id, &request.subject, &request.permission, &request.object, revision)
                        .await;
                }
            }
        }

        Ok(CheckOutcome {
            allowed: evaluation.allowed,
            stats: evaluation.stats,
            strategy: evaluation.strategy,
        })
    }

    fn cached_outcome(allowed: bool, strategy: CheckStrategy) -> CheckOutcome {
        CheckOutcome {
            allowed,
            stats: TraversalStats {
                cache_hits: 1,
                ..TraversalStats::default()
            },
            strategy,
        }
    }

    async fn ensure_tracked(&self, zone_id: &str) -> Result<()> {
        if !self.tracker.is_tracked(zone_id) {
            let head = self.repository.current_revision(zone_id).await?;
            self.tracker.seed(zone_id, head);
        }
        Ok(())
    }

    async fn read_plan(&self, zone_id: &str, consistency: &Consistency) -> Result<ReadPlan> {
        let token_revision = match consistency.token() {
            Some(token) => {
                let (token_zone, revision) = token.decode()?;
                if token_zone != zone_id {
                    return Err(RebacError::InvalidConsistencyToken);
                }
                Some(revision)
            }
            None => None,
        };
        self.ensure_tracked(zone_id).await?;

        match consistency {
            Consistency::Strong(_) => {
                if let Some(required) = token_revision {
                    self.wait_for_store(zone_id, required).await?;
                }
                Ok(ReadPlan {
                    use_caches: false,
                    min_revision: u64::MAX,
                })
            }
            Consistency::CloseToOpen(_) => {
                let required = token_revision.unwrap_or_else(|| self.tracker.latest(zone_id));
                if let Some(ref tiger) = self.tiger {
                    if self.tracker.applied(zone_id) < required {
                        tiger.updater().catch_up(zone_id, required).await?;
                        self.tracker
                            .wait_applied(zone_id, required, self.consistency_timeout())
                            .await?;
                    }
                }
                Ok(ReadPlan {
                    use_caches: true,
                    min_revision: required,
                })
            }
            Consistency::Eventual => {
                let lag = self.config.tiger.eventual_staleness_revisions;
                let floor = self.tracker.latest(zone_id).saturating_sub(lag);
                Ok(ReadPlan {
                    use_caches: true,
                    min_revision: self.tracker.last_restrictive(zone_id).max(floor),
                })
            }
        }
    }

    fn consistency_timeout(&self) -> Duration {
        Duration::from_millis(self.config.consistency.wait_timeout_ms)
    }

    /// Poll the store until the zone reaches `required`.
    async fn wait_for_store(&self, zone_id: &str, required: u64) -> Result<()> {
        let deadline = Instant::now() + self.consistency_timeout();
        let interval = Duration::from_millis(self.config.consistency.poll_interval_ms.max(1));
        loop {
            let observed = self.repository.current_revision(zone_id).await?;
            if observed >= required {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(zone = zone_id, required, observed, "Strong read timed out waiting for revision");
                return Err(RebacError::ConsistencyTimeout {
                    zone_id: zone_id.to_string(),
                    required,
                    observed,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    // =============================================================================
    // Writes
    // =============================================================================

    fn write_lock(&self, key: &TupleKey) -> &Mutex<()> {
        let mut hasher = ahash::AHasher::default();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % WRITE_LOCK_STRIPES as u64) as usize;
        &self.write_locks[stripe]
    }

    /// Write a tuple. Derived caches are invalidated before the token is returned.
    pub async fn write(&self, tuple: RelationshipTuple) -> Result<(Uuid, ConsistencyToken)> {
        self.zones.validate_write(&tuple)?;
        self.schema.validate_tuple(&tuple)?;
        self.ensure_tracked(&tuple.zone_id).await?;

        let outcome = {
            let _stripe = self.write_lock(&tuple.key()).lock().await;
            let outcome = self.repository.write_tuple(tuple.clone()).await?;
            if outcome.created {
                self.propagate(ChangeKind::Write, outcome.revision, tuple.clone()).await;
            }
            outcome
        };

        info!(
            tuple_id = %outcome.tuple_id,
            tuple = %tuple,
            revision = outcome.revision,
            created = outcome.created,
            "Tuple written"
        );
        Ok((outcome.tuple_id, ConsistencyToken::new(&tuple.zone_id, outcome.revision)))
    }

    pub async fn delete(&self, tuple_id: Uuid) -> Result<bool> {
        Ok(self.delete_with_token(tuple_id).await?.is_some())
    }

    /// Delete a tuple, returning a token for read-your-writes, or `None` if absent.
    pub async fn delete_with_token(&self, tuple_id: Uuid) -> Result<Option<ConsistencyToken>> {
        let Some(tuple) = self.repository.get_tuple(tuple_id).await? else {
            return Ok(None);
        };
        self.ensure_tracked(&tuple.zone_id).await?;

        let _stripe = self.write_lock(&tuple.key()).lock().await;
        let Some(outcome) = self.repository.delete_tuple(tuple_id).await? else {
            return Ok(None);
        };
        self.propagate(ChangeKind::Delete, outcome.revision, outcome.tuple.clone())
            .await;

        info!(%tuple_id, tuple = %outcome.tuple, revision = outcome.revision, "Tuple deleted");
        Ok(Some(ConsistencyToken::new(&outcome.tuple.zone_id, outcome.revision)))
    }

    /// Delete every tuple expired at `now`. Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.repository.purge_expired(now).await?;
        for outcome in &purged {
            self.ensure_tracked(&outcome.tuple.zone_id).await?;
            self.propagate(ChangeKind::Delete, outcome.revision, outcome.tuple.clone())
                .await;
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "Expired tuples purged");
        }
        Ok(purged.len())
    }

    async fn propagate(&self, kind: ChangeKind, revision: u64, tuple: RelationshipTuple) {
        let change = ChangeEntry {
            sequence: revision,
            zone_id: tuple.zone_id.clone(),
            kind,
            tuple,
            recorded_at: Utc::now(),
        };
        self.coordinator.on_change(&change).await;
        if self.tiger.is_none() {
            self.tracker.mark_applied(&change.zone_id, revision);
        }
    }

    // =============================================================================
    // Reads
    // =============================================================================

    pub async fn expand(&self, permission: &str, object: &Object, zone_id: &str) -> Result<ExpandTree> {
        self.zones.validate_zone_id(zone_id)?;
        self.expander
            .expand(permission, object, zone_id, TraversalGuard::new(self.config.limits))
            .await
    }

    pub async fn read_tuples(&self, filter: &TupleFilter, pagination: Pagination) -> Result<TuplePage> {
        self.repository.query_tuples(filter, pagination).await
    }

    /// List the objects of a type the subject holds `permission` on.
    ///
    /// The first call computes the whole result at the current zone revision,
    /// trying the Tiger bitmap, then Leopard-seeded candidates, then a full
    /// walk. Later pages come from that snapshot through the returned cursor.
    pub async fn list_objects(&self, request: &ListObjectsRequest) -> Result<ObjectPage> {
        let zone_id = request.zone_id.as_str();
        self.zones.validate_zone_id(zone_id)?;
        let plan = self.read_plan(zone_id, &request.consistency).await?;

        let query = Self::list_query_hash(request);
        if let Some(ref cursor) = request.cursor {
            let current = self.repository.current_revision(zone_id).await?;
            let page = self
                .iterators
                .resume(cursor, &query, zone_id, current, request.limit)
                .await?;
            return Ok(ObjectPage {
                objects: page.objects,
                next_cursor: page.next_cursor,
                revision: page.revision,
                strategy: ListStrategy::IteratorCache,
            });
        }

        let observed = self.tracker.latest(zone_id);
        let revision = self.repository.current_revision(zone_id).await?;
        let (mut items, strategy, cacheable) = self.list_snapshot(request, plan).await?;
        items.sort_by_key(|(id, _)| *id);

        let complete = request.path_prefix.is_none() && strategy != ListStrategy::TigerCache;
        if plan.use_caches && cacheable && complete && self.tracker.latest(zone_id) == observed {
            if let Some(ref tiger) = self.tiger {
                let ids: Vec<u64> = items.iter().map(|(id, _)| *id).collect();
                tiger
                    .warm_complete(zone_id, &request.subject, &request.object_type, &request.permission, &ids, observed)
                    .await;
            }
        }

        debug!(zone = zone_id, subject = %request.subject, objects = items.len(), ?strategy, "List snapshot built");

        let snapshot_id = IteratorCache::snapshot_id(&query, revision);
        let snapshot = Snapshot {
            zone_id: zone_id.to_string(),
            query,
            revision,
            items,
        };
        let page = self.iterators.start(snapshot_id, snapshot, request.limit).await;

        Ok(ObjectPage {
            objects: page.objects,
            next_cursor: page.next_cursor,
            revision: page.revision,
            strategy,
        })
    }

    fn list_query_hash(request: &ListObjectsRequest) -> String {
        IteratorCache::query_hash(&format!(
            "{}|{}|{}|{}|{}",
            request.zone_id,
            request.subject,
            request.permission,
            request.object_type,
            request.path_prefix.as_deref().unwrap_or("")
        ))
    }

    /// Full result of a list query: `(resource-int, object)` pairs, the
    /// strategy used, and whether every answer may be cached.
    async fn list_snapshot(
        &self,
        request: &ListObjectsRequest,
        plan: ReadPlan,
    ) -> Result<(Vec<(u64, Object)>, ListStrategy, bool)> {
        let zone_id = request.zone_id.as_str();
        let prefix = request.path_prefix.as_deref();

        if plan.use_caches {
            if let Some(ref tiger) = self.tiger {
                if let Some(objects) = tiger.complete_objects(
                    zone_id,
                    &request.subject,
                    &request.object_type,
                    &request.permission,
                    plan.min_revision,
                ) {
                    let items = objects
                        .into_iter()
                        .filter(|(_, o)| prefix.map_or(true, |p| o.is_under(p)))
                        .collect();
                    return Ok((items, ListStrategy::TigerCache, true));
                }
            }

            if let Some(ref leopard) = self.leopard {
                let mut guard = TraversalGuard::new(self.config.limits);
                match leopard
                    .candidate_objects(
                        zone_id,
                        &request.subject,
                        &self.schema,
                        &request.object_type,
                        prefix,
                        &mut guard,
                    )
                    .await
                {
                    Ok(candidates) => {
                        let (items, cacheable) = self.verify(request, candidates, plan.use_caches).await?;
                        return Ok((items, ListStrategy::LeopardBfs, cacheable));
                    }
                    Err(e) if e.is_fail_closed() => {
                        debug!(zone = zone_id, error = %e, "Leopard candidate search over limits, walking every object");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let objects = self
            .repository
            .list_objects_of_type(zone_id, &request.object_type, request.path_prefix.clone())
            .await?;
        let (items, cacheable) = self.verify(request, objects, plan.use_caches).await?;
        Ok((items, ListStrategy::FullWalk, cacheable))
    }

    /// Check each candidate with its own guard; keep the allowed ones.
    async fn verify(
        &self,
        request: &ListObjectsRequest,
        candidates: impl IntoIterator<Item = Object>,
        use_caches: bool,
    ) -> Result<(Vec<(u64, Object)>, bool)> {
        let mut items = Vec::new();
        let mut cacheable = true;
        for object in candidates {
            let check = CheckRequest::new(request.subject.clone(), &request.permission, object, &request.zone_id);
            let (allowed, stable) = self.sample(&check, use_caches).await?;
            cacheable &= stable;
            if allowed {
                items.push((self.resources.get_or_assign(&check.object), check.object));
            }
        }
        Ok((items, cacheable))
    }

    /// One traversal. Fail-closed errors count as an uncacheable deny.
    async fn sample(&self, request: &CheckRequest, use_caches: bool) -> Result<(bool, bool)> {
        let guard = TraversalGuard::new(self.config.limits);
        match self.traversal.run(request, guard, use_caches).await {
            Ok(evaluation) => Ok((evaluation.allowed, evaluation.cacheable)),
            Err(e) if e.is_fail_closed() => Ok((false, false)),
            Err(e) => Err(e),
        }
    }

    /// Whether a directory is granted directly or has any visible descendant.
    pub async fn is_directory_visible(
        &self,
        subject: &Subject,
        permission: &str,
        directory: &Object,
        zone_id: &str,
    ) -> Result<bool> {
        self.zones.validate_zone_id(zone_id)?;
        self.ensure_tracked(zone_id).await?;
        if let Some(visible) = self
            .visibility
            .get(zone_id, subject, permission, &directory.object_id)
        {
            return Ok(visible);
        }

        let observed = self.tracker.latest(zone_id);
        let request = CheckRequest::new(subject.clone(), permission, directory.clone(), zone_id);
        let (mut visible, mut cacheable) = self.sample(&request, true).await?;

        if !visible && directory.is_path() {
            let descendants: BTreeSet<Object> = self
                .repository
                .read_tuples(&TupleFilter::in_zone(zone_id).object_id_prefix(&directory.object_id))
                .await?
                .into_iter()
                .map(|t| t.object)
                .filter(|o| o != directory)
                .collect();

            for object in descendants {
                let check = CheckRequest::new(subject.clone(), permission, object, zone_id);
                let (allowed, stable) = self.sample(&check, true).await?;
                cacheable &= stable;
                if allowed {
                    visible = true;
                    break;
                }
            }
        }

        if cacheable && self.tracker.latest(zone_id) == observed {
            self.visibility
                .insert(zone_id, subject, permission, &directory.object_id, visible);
        }
        Ok(visible)
    }

    // =============================================================================
    // Lifecycle
    // =============================================================================

    /// Replay every zone's changelog from its checkpoint. Safe to call repeatedly.
    pub async fn recover(&self) -> Result<()> {
        for zone_id in self.repository.zones().await? {
            let head = self.repository.current_revision(&zone_id).await?;
            self.tracker.seed(&zone_id, head);
            match self.tiger {
                Some(ref tiger) => {
                    let applied = tiger.updater().process_zone(&zone_id).await?;
                    info!(zone = %zone_id, head, applied, "Zone recovered");
                }
                None => self.tracker.mark_applied(&zone_id, head),
            }
        }
        Ok(())
    }

    /// Start the background Tiger changelog consumer, if Tiger is enabled and
    /// no worker is running yet.
    pub fn spawn_tiger_worker(&self) -> Option<JoinHandle<()>> {
        self.tiger.as_ref().and_then(|tiger| tiger.updater().spawn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryTupleRepository;

    fn manager() -> RebacManager {
        RebacManager::new(
            Arc::new(InMemoryTupleRepository::new()),
            Schema::filesystem(),
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_second_check_served_from_result_cache() {
        let engine = manager();
        engine
            .write(RelationshipTuple::new(Subject::user("alice"), "viewer", Object::file("/doc.txt"), "z1"))
            .await
            .unwrap();

        let request = CheckRequest::new(Subject::user("alice"), "viewer", Object::file("/doc.txt"), "z1");
        let first = engine.check_with_outcome(&request, Consistency::Eventual).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.strategy, CheckStrategy::Traversal);

        let second = engine.check_with_outcome(&request, Consistency::Eventual).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.strategy, CheckStrategy::ResultCache);

        let strong = engine
            .check_with_outcome(&request, Consistency::Strong(None))
            .await
            .unwrap();
        assert_eq!(strong.strategy, CheckStrategy::Traversal);
    }

    #[tokio::test]
    async fn test_tiger_answers_after_result_cache_is_cleared() {
        let engine = manager();
        engine
            .write(RelationshipTuple::new(Subject::user("alice"), "viewer", Object::file("/doc.txt"), "z1"))
            .await
            .unwrap();
        let request = CheckRequest::new(Subject::user("alice"), "viewer", Object::file("/doc.txt"), "z1");
        assert!(engine.check(&request, Consistency::Eventual).await.unwrap());

        engine.result_cache.clear();
        let outcome = engine.check_with_outcome(&request, Consistency::Eventual).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.strategy, CheckStrategy::TigerCache);
    }

    #[tokio::test]
    async fn test_token_from_other_zone_is_rejected() {
        let engine = manager();
        let (_, token) = engine
            .write(RelationshipTuple::new(Subject::user("alice"), "viewer", Object::file("/a"), "z1"))
            .await
            .unwrap();
        let request = CheckRequest::new(Subject::user("alice"), "viewer", Object::file("/a"), "z2");
        assert!(matches!(
            engine.check(&request, Consistency::Strong(Some(token))).await,
            Err(RebacError::InvalidConsistencyToken)
        ));
    }

    #[tokio::test]
    async fn test_strong_read_times_out_on_future_token() {
        let mut config = EngineConfig::default();
        config.consistency.wait_timeout_ms = 30;
        let engine = RebacManager::new(Arc::new(InMemoryTupleRepository::new()), Schema::filesystem(), config).unwrap();

        let request = CheckRequest::new(Subject::user("alice"), "viewer", Object::file("/a"), "z1");
        let token = ConsistencyToken::new("z1", 99);
        assert!(matches!(
            engine.check(&request, Consistency::Strong(Some(token))).await,
            Err(RebacError::ConsistencyTimeout { required: 99, observed: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_writes_are_rejected() {
        let engine = manager();
        let no_zone = RelationshipTuple::new(Subject::user("alice"), "viewer", Object::file("/a"), "");
        assert!(engine.write(no_zone).await.is_err());

        let bridge = RelationshipTuple::new(Subject::user("alice"), "viewer", Object::file("/a"), "z1")
            .with_subject_zone("z2");
        assert!(matches!(engine.write(bridge).await, Err(RebacError::ZoneIsolation { .. })));
    }
}
