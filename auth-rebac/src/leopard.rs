//! Leopard index: transitive closure of group membership.
//!
//! For a subject, the closure is every group reachable over `member` edges,
//! including nested groups (`group:a#member member group:b`). Closures are
//! built lazily by a bounded BFS and kept current by the cache coordinator.
//!
//! Only positive answers are authoritative. Membership can also flow through
//! other usersets (`dir:/x#viewer member group:eng`) or conditional edges,
//! which the closure does not follow.

use crate::cache::CacheInvalidator;
use crate::config::LeopardConfig;
use crate::error::RebacError;
use crate::limits::{GraphLimits, TraversalGuard};
use crate::models::*;
use crate::repository::TupleRepository;
use crate::schema::Schema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Groups reachable from one subject.
#[derive(Debug, Clone, Default)]
pub struct Closure {
    pub groups: HashSet<Object>,
    /// Earliest expiry among the edges used; the closure is stale after it.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Closure {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Proof that the subject is a member of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// The proof relies on an edge that will expire.
    pub expiring: bool,
}

type ClosureKey = (String, Subject);

pub struct LeopardIndex {
    repository: Arc<dyn TupleRepository>,
    config: LeopardConfig,
    limits: GraphLimits,
    closures: DashMap<ClosureKey, Arc<Closure>>,
    /// (zone, group) -> subjects whose cached closure contains the group.
    reverse: DashMap<(String, Object), HashSet<Subject>>,
    /// Bumped on every invalidation so an in-flight BFS cannot publish a stale closure.
    generations: DashMap<String, u64>,
}

impl LeopardIndex {
    pub fn new(repository: Arc<dyn TupleRepository>, config: LeopardConfig, limits: GraphLimits) -> Self {
        Self {
            repository,
            config,
            limits,
            closures: DashMap::new(),
            reverse: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LeopardConfig {
        &self.config
    }

    pub fn cached_closures(&self) -> usize {
        self.closures.len()
    }

    fn generation(&self, zone_id: &str) -> u64 {
        self.generations.get(zone_id).map_or(0, |g| *g)
    }

    fn bump_generation(&self, zone_id: &str) {
        *self.generations.entry(zone_id.to_string()).or_insert(0) += 1;
    }

    /// The closure for `subject`, from the index or by bounded BFS.
    pub async fn closure(
        &self,
        zone_id: &str,
        subject: &Subject,
        guard: &mut TraversalGuard,
    ) -> Result<Arc<Closure>, RebacError> {
        let key = (zone_id.to_string(), subject.clone());
        if let Some(cached) = self.closures.get(&key).map(|c| Arc::clone(&c)) {
            if !cached.is_stale(Utc::now()) {
                guard.record_cache_hit();
                return Ok(cached);
            }
            self.forget(&key);
        }

        let generation = self.generation(zone_id);
        let closure = Arc::new(self.compute(zone_id, subject, guard).await?);
        if self.generation(zone_id) == generation {
            self.publish(key, Arc::clone(&closure));
        }
        Ok(closure)
    }

    /// Membership lookup. `None` means "not proven"; the caller must walk the graph.
    pub async fn lookup(
        &self,
        zone_id: &str,
        subject: &Subject,
        group: &Object,
        guard: &mut TraversalGuard,
    ) -> Result<Option<Membership>, RebacError> {
        let closure = self.closure(zone_id, subject, guard).await?;
        Ok(closure.groups.contains(group).then(|| Membership {
            expiring: closure.expires_at.is_some(),
        }))
    }

    async fn compute(
        &self,
        zone_id: &str,
        subject: &Subject,
        guard: &mut TraversalGuard,
    ) -> Result<Closure, RebacError> {
        let mut closure = Closure::default();
        let mut frontier = VecDeque::from([(subject.clone(), 0u32)]);

        while let Some((current, depth)) = frontier.pop_front() {
            guard.enter(depth)?;
            let edges = self
                .repository
                .read_tuples(
                    &TupleFilter::in_zone(zone_id)
                        .subject(&current)
                        .subject_zone(zone_id)
                        .relation(&self.config.membership_relation),
                )
                .await?;
            guard.check_fanout(edges.len())?;

            for edge in edges {
                if !self.config.is_group_type(&edge.object.object_type) {
                    continue;
                }
                if edge.conditions.is_some() {
                    continue;
                }
                if let Some(at) = edge.expires_at {
                    closure.expires_at = Some(closure.expires_at.map_or(at, |prev| prev.min(at)));
                }
                if closure.groups.insert(edge.object.clone()) {
                    frontier.push_back((
                        Subject::userset(
                            &edge.object.object_type,
                            &edge.object.object_id,
                            &self.config.membership_relation,
                        ),
                        depth + 1,
                    ));
                }
            }
        }

        debug!(zone = zone_id, subject = %subject, groups = closure.groups.len(), "Leopard closure computed");
        Ok(closure)
    }

    fn publish(&self, key: ClosureKey, closure: Arc<Closure>) {
        for group in &closure.groups {
            self.reverse
                .entry((key.0.clone(), group.clone()))
                .or_default()
                .insert(key.1.clone());
        }
        self.closures.insert(key, closure);
    }

    fn forget(&self, key: &ClosureKey) {
        if let Some((_, closure)) = self.closures.remove(key) {
            for group in &closure.groups {
                let reverse_key = (key.0.clone(), group.clone());
                if let Some(mut subjects) = self.reverse.get_mut(&reverse_key) {
                    subjects.remove(&key.1);
                }
                self.reverse.remove_if(&reverse_key, |_, subjects| subjects.is_empty());
            }
        }
    }

    /// Candidate objects for list_objects: everything reachable backwards from
    /// the subject and its groups through direct tuples, usersets naming those
    /// objects, and hierarchy edges. A superset of the accessible objects; the
    /// caller verifies each candidate.
    pub async fn candidate_objects(
        &self,
        zone_id: &str,
        subject: &Subject,
        schema: &Schema,
        object_type: &str,
        path_prefix: Option<&str>,
        guard: &mut TraversalGuard,
    ) -> Result<Vec<Object>, RebacError> {
        let closure = self.closure(zone_id, subject, guard).await?;
        let hierarchy = schema.tupleset_relations();

        let mut seeds = vec![subject.clone()];
        seeds.extend(closure.groups.iter().map(|g| {
            Subject::userset(&g.object_type, &g.object_id, &self.config.membership_relation)
        }));

        let mut queue: VecDeque<(Object, u32)> = VecDeque::new();
        let mut candidates = BTreeSet::new();
        for seed in &seeds {
            guard.enter(1)?;
            let direct = self
                .repository
                .read_tuples(&TupleFilter::in_zone(zone_id).subject(seed).subject_zone(zone_id))
                .await?;
            guard.check_fanout(direct.len())?;
            for tuple in direct {
                if candidates.insert(tuple.object.clone()) {
                    queue.push_back((tuple.object, 2));
                }
            }
        }

        while let Some((current, depth)) = queue.pop_front() {
            guard.enter(depth.min(self.limits.max_depth))?;
            let dependents = self
                .repository
                .read_tuples(
                    &TupleFilter::in_zone(zone_id)
                        .subject_entity(&current)
                        .subject_zone(zone_id),
                )
                .await?;
            guard.check_fanout(dependents.len())?;

            for tuple in dependents {
                let inherits = tuple.subject.is_userset() || hierarchy.contains(&tuple.relation);
                if inherits && candidates.insert(tuple.object.clone()) {
                    queue.push_back((tuple.object, depth + 1));
                }
            }
        }

        Ok(candidates
            .into_iter()
            .filter(|o| o.object_type == object_type)
            .filter(|o| path_prefix.map_or(true, |p| o.is_under(p)))
            .collect())
    }
}

#[async_trait]
impl CacheInvalidator for LeopardIndex {
    fn name(&self) -> &'static str {
        "leopard"
    }

    async fn invalidate(&self, change: &ChangeEntry) -> Result<(), RebacError> {
        let tuple = &change.tuple;
        if !self.config.is_membership_edge(tuple) {
            return Ok(());
        }
        let zone_id = change.zone_id.as_str();
        self.bump_generation(zone_id);

        // The changed subject, plus every subject that reaches it when it is a group.
        let mut affected = vec![tuple.subject.clone()];
        if tuple.subject.is_userset() {
            let nested = (zone_id.to_string(), tuple.subject.as_object());
            if let Some(subjects) = self.reverse.get(&nested) {
                affected.extend(subjects.iter().cloned());
            }
        }

        for subject in affected {
            let key = (zone_id.to_string(), subject);
            let was_cached = self.closures.contains_key(&key);
            self.forget(&key);
            if !was_cached {
                continue;
            }
            let mut guard = TraversalGuard::new(self.limits);
            match self.compute(zone_id, &key.1, &mut guard).await {
                Ok(closure) => self.publish(key, Arc::new(closure)),
                Err(e) => warn!(zone = zone_id, subject = %key.1, error = %e, "Leopard recompute deferred"),
            }
        }
        Ok(())
    }

    async fn invalidate_zone(&self, zone_id: &str) {
        self.bump_generation(zone_id);
        self.closures.retain(|(zone, _), _| zone != zone_id);
        self.reverse.retain(|(zone, _), _| zone != zone_id);
    }
}
