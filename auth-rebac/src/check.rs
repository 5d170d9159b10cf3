use crate::{
    cache::BoundaryCache,
    error::RebacError,
    leopard::LeopardIndex,
    limits::{GraphLimits, TraversalGuard},
    models::*,
    repository::TupleRepository,
    schema::{RelationRule, RewriteRule, Schema},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type Eval<'a> = Pin<Box<dyn Future<Output = Result<bool, RebacError>> + Send + 'a>>;

/// Result of one full evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub allowed: bool,
    /// False when the answer relied on an expiring or conditional tuple.
    pub cacheable: bool,
    pub strategy: CheckStrategy,
    pub stats: TraversalStats,
}

enum Visit {
    InProgress,
    Done(bool),
}

/// Per-request traversal state.
struct Walk {
    subject: Subject,
    subject_zone: String,
    zone_id: String,
    permission: String,
    context: Option<serde_json::Value>,
    guard: TraversalGuard,
    use_caches: bool,
    memo: HashMap<(String, Object), Visit>,
    cycle_hits: u64,
    cacheable: bool,
    /// Outermost ancestor where the requested permission was found by inheritance.
    resolved_at: Option<Object>,
    now: DateTime<Utc>,
}

/// Permission computer: evaluates rewrite rules against the tuple store.
///
/// - Direct tuples and usersets (`group:eng#member`)
/// - Computed relations on the same object
/// - Union, intersection and exclusion
/// - Hierarchical inheritance through tuple_to_userset
///
/// Every step goes through the request's [`TraversalGuard`]; a limit breach
/// aborts the traversal with `GraphLimitExceeded`.
pub struct PermissionComputer {
    repository: Arc<dyn TupleRepository>,
    schema: Arc<Schema>,
    leopard: Option<Arc<LeopardIndex>>,
    boundary: Option<Arc<BoundaryCache>>,
}

impl PermissionComputer {
    pub fn new(repository: Arc<dyn TupleRepository>, schema: Arc<Schema>) -> Self {
        Self {
            repository,
            schema,
            leopard: None,
            boundary: None,
        }
    }

    pub fn with_leopard(mut self, leopard: Arc<LeopardIndex>) -> Self {
        self.leopard = Some(leopard);
        self
    }

    pub fn with_boundary_cache(mut self, boundary: Arc<BoundaryCache>) -> Self {
        self.boundary = Some(boundary);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Plain check against the store, no cache shortcuts.
    pub async fn check(&self, request: &CheckRequest, limits: GraphLimits) -> Result<bool, RebacError> {
        Ok(self
            .evaluate(request, TraversalGuard::new(limits), false)
            .await?
            .allowed)
    }

    pub async fn evaluate(
        &self,
        request: &CheckRequest,
        guard: TraversalGuard,
        use_caches: bool,
    ) -> Result<Evaluation, RebacError> {
        let mut walk = Walk {
            subject: request.subject.clone(),
            subject_zone: request.subject_zone().to_string(),
            zone_id: request.zone_id.clone(),
            permission: request.permission.clone(),
            context: request.context.clone(),
            guard,
            use_caches,
            memo: HashMap::new(),
            cycle_hits: 0,
            cacheable: true,
            resolved_at: None,
            now: Utc::now(),
        };

        debug!(
            subject = %request.subject,
            permission = %request.permission,
            object = %request.object,
            zone = %request.zone_id,
            "Evaluating permission"
        );

        let inherits = request.object.is_path()
            && self
                .schema
                .is_monotonic(&request.object.object_type, &request.permission);

        if use_caches && inherits {
            if let Some(boundary) = self.boundary.as_ref() {
                if let Some(at) = boundary.get(&request.zone_id, &request.subject, &request.permission, &request.object) {
                    walk.guard.record_cache_hit();
                    if self.check_relation(&mut walk, &request.permission, &at, 1).await? {
                        return Ok(Evaluation {
                            allowed: true,
                            cacheable: walk.cacheable,
                            strategy: CheckStrategy::BoundaryCache,
                            stats: walk.guard.stats(),
                        });
                    }
                    boundary.forget(&request.zone_id, &request.subject, &request.permission, &request.object);
                }
            }
        }

        let allowed = self
            .check_relation(&mut walk, &request.permission, &request.object, 0)
            .await?;

        if allowed && use_caches && inherits && walk.cacheable {
            if let (Some(boundary), Some(at)) = (self.boundary.as_ref(), walk.resolved_at.take()) {
                if self.schema.is_monotonic(&at.object_type, &request.permission) {
                    boundary.record(&request.zone_id, &request.subject, &request.permission, &request.object, at);
                }
            }
        }

        Ok(Evaluation {
            allowed,
            cacheable: walk.cacheable,
            strategy: CheckStrategy::Traversal,
            stats: walk.guard.stats(),
        })
    }

    fn check_relation<'a>(
        &'a self,
        walk: &'a mut Walk,
        relation: &'a str,
        object: &'a Object,
        depth: u32,
    ) -> Eval<'a> {
        Box::pin(async move {
            walk.guard.enter(depth)?;

            let key = (relation.to_string(), object.clone());
            match walk.memo.get(&key) {
                Some(Visit::InProgress) => {
                    debug!(relation, object = %object, "Cycle detected, treating revisit as denied");
                    walk.cycle_hits += 1;
                    return Ok(false);
                }
                Some(Visit::Done(allowed)) => {
                    let allowed = *allowed;
                    walk.guard.record_cache_hit();
                    return Ok(allowed);
                }
                None => {}
            }

            walk.memo.insert(key.clone(), Visit::InProgress);
            let cycles_before = walk.cycle_hits;

            let result = match self.schema.resolve(&object.object_type, relation) {
                RelationRule::Defined(rule) => self.eval_rule(walk, rule, relation, object, depth).await,
                RelationRule::Undefined => Ok(false),
                RelationRule::Unconstrained => self.eval_direct(walk, relation, object, depth).await,
            };

            // Answers computed under an in-progress revisit are partial; don't memoise them.
            match &result {
                Ok(allowed) if walk.cycle_hits == cycles_before => {
                    walk.memo.insert(key, Visit::Done(*allowed));
                }
                _ => {
                    walk.memo.remove(&key);
                }
            }
            result
        })
    }

    fn eval_rule<'a>(
        &'a self,
        walk: &'a mut Walk,
        rule: &'a RewriteRule,
        relation: &'a str,
        object: &'a Object,
        depth: u32,
    ) -> Eval<'a> {
        Box::pin(async move {
            match rule {
                RewriteRule::This => self.eval_direct(walk, relation, object, depth).await,
                RewriteRule::Computed { relation: target } => {
                    self.check_relation(walk, target, object, depth + 1).await
                }
                RewriteRule::Union { children } => {
                    for child in children {
                        if self.eval_rule(walk, child, relation, object, depth).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RewriteRule::Intersection { children } => {
                    if children.is_empty() {
                        return Ok(false);
                    }
                    for child in children {
                        if !self.eval_rule(walk, child, relation, object, depth).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                RewriteRule::Exclusion { base, subtract } => {
                    if !self.eval_rule(walk, base, relation, object, depth).await? {
                        return Ok(false);
                    }
                    let cycles_before = walk.cycle_hits;
                    let excluded = self.eval_rule(walk, subtract, relation, object, depth).await?;
                    // A truncated subtract side cannot prove absence.
                    if walk.cycle_hits != cycles_before {
                        return Ok(false);
                    }
                    Ok(!excluded)
                }
                RewriteRule::TupleToUserset { tupleset, computed } => {
                    self.eval_tuple_to_userset(walk, tupleset, computed, object, depth)
                        .await
                }
            }
        })
    }

    /// Direct tuples of `relation` on `object`: the subject itself, or any userset containing it.
    fn eval_direct<'a>(
        &'a self,
        walk: &'a mut Walk,
        relation: &'a str,
        object: &'a Object,
        depth: u32,
    ) -> Eval<'a> {
        Box::pin(async move {
            let exact = self
                .repository
                .read_tuples(
                    &TupleFilter::in_zone(&walk.zone_id)
                        .subject(&walk.subject)
                        .subject_zone(&walk.subject_zone)
                        .relation(relation)
                        .object(object),
                )
                .await?;
            walk.guard.check_fanout(exact.len())?;
            for tuple in &exact {
                if admit(walk, tuple) {
                    return Ok(true);
                }
            }

            let usersets = self
                .repository
                .read_tuples(
                    &TupleFilter::in_zone(&walk.zone_id)
                        .subject_zone(&walk.zone_id)
                        .relation(relation)
                        .object(object)
                        .usersets_only(),
                )
                .await?;
            walk.guard.check_fanout(usersets.len())?;

            for tuple in usersets {
                let Some(userset_relation) = tuple.subject.relation.as_deref() else {
                    continue;
                };
                if !admit(walk, &tuple) {
                    continue;
                }
                let group = tuple.subject.as_object();

                if self.leopard_lookup(walk, &group, userset_relation).await? {
                    return Ok(true);
                }

                if self
                    .check_relation(walk, userset_relation, &group, depth + 1)
                    .await?
                {
                    return Ok(true);
                }
            }

            Ok(false)
        })
    }

    fn eval_tuple_to_userset<'a>(
        &'a self,
        walk: &'a mut Walk,
        tupleset: &'a str,
        computed: &'a str,
        object: &'a Object,
        depth: u32,
    ) -> Eval<'a> {
        Box::pin(async move {
            let edges = self
                .repository
                .read_tuples(
                    &TupleFilter::in_zone(&walk.zone_id)
                        .subject_zone(&walk.zone_id)
                        .relation(tupleset)
                        .object(object),
                )
                .await?;
            walk.guard.check_fanout(edges.len())?;

            for edge in edges {
                if !admit(walk, &edge) {
                    continue;
                }
                let target = edge.subject.as_object();
                if self.check_relation(walk, computed, &target, depth + 1).await? {
                    if walk.permission == computed && target.is_path() && walk.resolved_at.is_none() {
                        walk.resolved_at = Some(target);
                    }
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Membership proven by the Leopard closure. A miss proves nothing.
    async fn leopard_lookup(
        &self,
        walk: &mut Walk,
        group: &Object,
        userset_relation: &str,
    ) -> Result<bool, RebacError> {
        let Some(leopard) = self.leopard.as_ref() else {
            return Ok(false);
        };
        let applies = walk.use_caches
            && walk.subject_zone == walk.zone_id
            && userset_relation == leopard.config().membership_relation
            && leopard.config().is_group_type(&group.object_type)
            && self.schema.is_direct_only(&group.object_type, userset_relation);
        if !applies {
            return Ok(false);
        }

        let membership = leopard
            .lookup(&walk.zone_id, &walk.subject, group, &mut walk.guard)
            .await?;
        match membership {
            Some(m) => {
                if m.expiring {
                    walk.cacheable = false;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Whether a stored tuple counts for this request. Conditional tuples need a
/// matching request context; anything time- or context-dependent is uncacheable.
fn admit(walk: &mut Walk, tuple: &RelationshipTuple) -> bool {
    if tuple.is_expired(walk.now) {
        return false;
    }
    if tuple.expires_at.is_some() {
        walk.cacheable = false;
    }
    match tuple.conditions {
        Some(ref conditions) => {
            walk.cacheable = false;
            conditions_hold(conditions, walk.context.as_ref())
        }
        None => true,
    }
}

pub(crate) fn conditions_hold(conditions: &Conditions, context: Option<&serde_json::Value>) -> bool {
    let Some(context) = context.and_then(|c| c.as_object()) else {
        return conditions.is_empty();
    };
    conditions
        .iter()
        .all(|(key, expected)| context.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimitKind;
    use crate::repository::{InMemoryTupleRepository, MockTupleRepository};
    use serde_json::json;

    fn computer(repo: Arc<InMemoryTupleRepository>) -> PermissionComputer {
        PermissionComputer::new(repo, Arc::new(Schema::filesystem()))
    }

    async fn grant(repo: &InMemoryTupleRepository, subject: Subject, relation: &str, object: Object) {
        repo.write_tuple(RelationshipTuple::new(subject, relation, object, "z1"))
            .await
            .unwrap();
    }

    async fn link(repo: &InMemoryTupleRepository, child: Object, parent: Object) {
        grant(repo, parent.as_subject(), "parent", child).await;
    }

    fn request(subject: Subject, permission: &str, object: Object) -> CheckRequest {
        CheckRequest::new(subject, permission, object, "z1")
    }

    #[tokio::test]
    async fn test_direct_permission() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let checker = computer(repo.clone());
        let doc = Object::file("/doc.txt");

        assert!(!checker
            .check(&request(Subject::user("alice"), "viewer", doc.clone()), GraphLimits::default())
            .await
            .unwrap());

        grant(&repo, Subject::user("alice"), "viewer", doc.clone()).await;

        assert!(checker
            .check(&request(Subject::user("alice"), "viewer", doc.clone()), GraphLimits::default())
            .await
            .unwrap());
        assert!(!checker
            .check(&request(Subject::user("bob"), "viewer", doc), GraphLimits::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_computed_and_inherited_permission() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let checker = computer(repo.clone());
        let doc = Object::file("/eng/doc.txt");
        link(&repo, doc.clone(), Object::dir("/eng")).await;
        grant(&repo, Subject::user("alice"), "owner", Object::dir("/eng")).await;

        // owner -> editor -> viewer on the directory, then parent->viewer on the file.
        let outcome = checker
            .evaluate(&request(Subject::user("alice"), "viewer", doc.clone()), TraversalGuard::new(GraphLimits::default()), false)
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert!(outcome.cacheable);
        assert!(outcome.stats.nodes_visited > 1);
        assert!(checker
            .check(&request(Subject::user("alice"), "editor", doc), GraphLimits::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_group_userset_through_hierarchy() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        grant(&repo, Subject::user("alice"), "member", Object::new("group", "eng")).await;
        link(&repo, Object::file("/doc.txt"), Object::dir("/eng")).await;
        grant(&repo, Subject::userset("group", "eng", "member"), "viewer", Object::dir("/eng")).await;

        let plain = computer(repo.clone());
        let req = request(Subject::user("alice"), "viewer", Object::file("/doc.txt"));
        assert!(plain.check(&req, GraphLimits::default()).await.unwrap());

        let leopard = Arc::new(LeopardIndex::new(repo.clone(), Default::default(), GraphLimits::default()));
        let accelerated = computer(repo.clone()).with_leopard(leopard.clone());
        let outcome = accelerated
            .evaluate(&req, TraversalGuard::new(GraphLimits::default()), true)
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(leopard.cached_closures(), 1);
    }

    #[tokio::test]
    async fn test_membership_through_non_group_userset() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        grant(&repo, Subject::user("alice"), "viewer", Object::dir("/x")).await;
        grant(&repo, Subject::userset("dir", "/x", "viewer"), "member", Object::new("group", "eng")).await;
        grant(&repo, Subject::userset("group", "eng", "member"), "viewer", Object::file("/doc")).await;

        let leopard = Arc::new(LeopardIndex::new(repo.clone(), Default::default(), GraphLimits::default()));
        let accelerated = computer(repo.clone()).with_leopard(leopard);
        let req = request(Subject::user("alice"), "viewer", Object::file("/doc"));
        let outcome = accelerated
            .evaluate(&req, TraversalGuard::new(GraphLimits::default()), true)
            .await
            .unwrap();
        assert!(outcome.allowed);
    }

    #[tokio::test]
    async fn test_exclusion_and_undefined_relation() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let checker = computer(repo.clone());
        let secret = Object::file("/secret.txt");
        grant(&repo, Subject::user("alice"), "viewer", secret.clone()).await;
        grant(&repo, Subject::user("bob"), "viewer", secret.clone()).await;
        grant(&repo, Subject::user("bob"), "blocked", secret.clone()).await;

        let limits = GraphLimits::default();
        assert!(checker.check(&request(Subject::user("alice"), "read", secret.clone()), limits).await.unwrap());
        assert!(!checker.check(&request(Subject::user("bob"), "read", secret.clone()), limits).await.unwrap());
        // Defined namespace, unknown relation: denied.
        assert!(!checker.check(&request(Subject::user("alice"), "delete", secret), limits).await.unwrap());

        // Unknown object type falls back to direct tuples.
        grant(&repo, Subject::user("carol"), "reader", Object::new("doc", "1")).await;
        assert!(checker
            .check(&request(Subject::user("carol"), "reader", Object::new("doc", "1")), limits)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_parent_cycle_terminates() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let checker = computer(repo.clone());
        link(&repo, Object::dir("/a"), Object::dir("/b")).await;
        link(&repo, Object::dir("/b"), Object::dir("/a")).await;

        let allowed = checker
            .check(&request(Subject::user("alice"), "viewer", Object::dir("/a")), GraphLimits::default())
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_limits_fail_closed() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let checker = computer(repo.clone());
        let mut parent = Object::dir("/d0");
        for i in 1..10 {
            let child = Object::dir(&format!("/d{}", i));
            link(&repo, child.clone(), parent.clone()).await;
            parent = child;
        }

        let limits = GraphLimits {
            max_nodes_visited: 5,
            ..GraphLimits::default()
        };
        let err = checker
            .check(&request(Subject::user("alice"), "viewer", parent.clone()), limits)
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::GraphLimitExceeded { limit: LimitKind::NodesVisited, .. }));

        for i in 0..3 {
            grant(&repo, Subject::user(&format!("u{}", i)), "viewer", Object::dir("/d0")).await;
            grant(&repo, Subject::userset("group", &format!("g{}", i), "member"), "viewer", Object::dir("/d0")).await;
        }
        let limits = GraphLimits {
            max_fanout_per_node: 2,
            ..GraphLimits::default()
        };
        let err = checker
            .check(&request(Subject::user("alice"), "viewer", Object::dir("/d0")), limits)
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::GraphLimitExceeded { limit: LimitKind::Fanout, .. }));
    }

    #[tokio::test]
    async fn test_conditional_tuple_requires_context() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let checker = computer(repo.clone());
        let mut conditions = Conditions::new();
        conditions.insert("network".to_string(), json!("corp"));
        repo.write_tuple(
            RelationshipTuple::new(Subject::user("alice"), "viewer", Object::file("/vpn.txt"), "z1")
                .with_conditions(conditions),
        )
        .await
        .unwrap();

        let base = request(Subject::user("alice"), "viewer", Object::file("/vpn.txt"));
        assert!(!checker.check(&base, GraphLimits::default()).await.unwrap());

        let on_vpn = base.clone().with_context(json!({"network": "corp"}));
        let outcome = checker
            .evaluate(&on_vpn, TraversalGuard::new(GraphLimits::default()), false)
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert!(!outcome.cacheable);

        let elsewhere = base.with_context(json!({"network": "home"}));
        assert!(!checker.check(&elsewhere, GraphLimits::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_boundary_cache_records_and_serves() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let boundary = Arc::new(BoundaryCache::new());
        let checker = computer(repo.clone()).with_boundary_cache(boundary.clone());
        link(&repo, Object::dir("/a/b"), Object::dir("/a")).await;
        link(&repo, Object::file("/a/b/c.txt"), Object::dir("/a/b")).await;
        grant(&repo, Subject::user("alice"), "viewer", Object::dir("/a")).await;

        let req = request(Subject::user("alice"), "viewer", Object::file("/a/b/c.txt"));
        let first = checker
            .evaluate(&req, TraversalGuard::new(GraphLimits::default()), true)
            .await
            .unwrap();
        assert_eq!(first.strategy, CheckStrategy::Traversal);
        assert_eq!(
            boundary.get("z1", &Subject::user("alice"), "viewer", &Object::file("/a/b/c.txt")),
            Some(Object::dir("/a"))
        );

        let second = checker
            .evaluate(&req, TraversalGuard::new(GraphLimits::default()), true)
            .await
            .unwrap();
        assert!(second.allowed);
        assert_eq!(second.strategy, CheckStrategy::BoundaryCache);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut repo = MockTupleRepository::new();
        repo.expect_read_tuples()
            .returning(|_| Err(RebacError::StoreUnavailable("connection refused".to_string())));
        let checker = PermissionComputer::new(Arc::new(repo), Arc::new(Schema::filesystem()));

        let err = checker
            .check(&request(Subject::user("alice"), "viewer", Object::file("/a")), GraphLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::StoreUnavailable(_)));
    }

    #[test]
    fn test_conditions_hold() {
        let mut conditions = Conditions::new();
        conditions.insert("tier".to_string(), json!(2));
        assert!(conditions_hold(&conditions, Some(&json!({"tier": 2, "x": 1}))));
        assert!(!conditions_hold(&conditions, Some(&json!({"tier": 3}))));
        assert!(!conditions_hold(&conditions, None));
        assert!(conditions_hold(&Conditions::new(), None));
    }
}
