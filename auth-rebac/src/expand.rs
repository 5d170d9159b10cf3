use crate::{
    error::RebacError,
    limits::TraversalGuard,
    models::*,
    repository::TupleRepository,
    schema::{RelationRule, RewriteRule, Schema},
};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type Expansion<'a> = Pin<Box<dyn Future<Output = Result<ExpandTree, RebacError>> + Send + 'a>>;

struct ExpandState {
    zone_id: String,
    guard: TraversalGuard,
    in_progress: HashSet<(String, Object)>,
}

/// Expands a permission on an object into the userset tree that grants it.
///
/// Walks the same rewrite rules as the permission computer but collects every
/// branch instead of short-circuiting. Cycles and the depth limit produce
/// `Truncated` nodes; the node budget, fan-out and timeout still abort.
pub struct ExpandEngine {
    repository: Arc<dyn TupleRepository>,
    schema: Arc<Schema>,
}

impl ExpandEngine {
    pub fn new(repository: Arc<dyn TupleRepository>, schema: Arc<Schema>) -> Self {
        Self { repository, schema }
    }

    pub async fn expand(
        &self,
        permission: &str,
        object: &Object,
        zone_id: &str,
        guard: TraversalGuard,
    ) -> Result<ExpandTree, RebacError> {
        let mut state = ExpandState {
            zone_id: zone_id.to_string(),
            guard,
            in_progress: HashSet::new(),
        };
        let tree = self.expand_relation(&mut state, permission, object, 0).await?;
        debug!(
            permission,
            object = %object,
            nodes = state.guard.stats().nodes_visited,
            "Expanded userset tree"
        );
        Ok(tree)
    }

    fn expand_relation<'a>(
        &'a self,
        state: &'a mut ExpandState,
        relation: &'a str,
        object: &'a Object,
        depth: u32,
    ) -> Expansion<'a> {
        Box::pin(async move {
            let key = (relation.to_string(), object.clone());
            if depth > state.guard.limits().max_depth || state.in_progress.contains(&key) {
                return Ok(ExpandTree::new(object, relation, ExpandNode::Truncated));
            }
            state.guard.enter(depth)?;

            state.in_progress.insert(key.clone());
            let tree = match self.schema.resolve(&object.object_type, relation) {
                RelationRule::Defined(rule) => self.expand_rule(state, rule, relation, object, depth).await,
                RelationRule::Undefined => Ok(ExpandTree::new(object, relation, ExpandNode::Leaf)),
                RelationRule::Unconstrained => self.expand_direct(state, relation, object, depth).await,
            };
            state.in_progress.remove(&key);
            tree
        })
    }

    fn expand_rule<'a>(
        &'a self,
        state: &'a mut ExpandState,
        rule: &'a RewriteRule,
        relation: &'a str,
        object: &'a Object,
        depth: u32,
    ) -> Expansion<'a> {
        Box::pin(async move {
            let (node, children) = match rule {
                RewriteRule::This => return self.expand_direct(state, relation, object, depth).await,
                RewriteRule::Computed { relation: target } => (
                    ExpandNode::Computed,
                    vec![self.expand_relation(state, target, object, depth + 1).await?],
                ),
                RewriteRule::Union { children } | RewriteRule::Intersection { children } => {
                    let mut trees = Vec::with_capacity(children.len());
                    for child in children {
                        trees.push(self.expand_rule(state, child, relation, object, depth).await?);
                    }
                    let node = if matches!(rule, RewriteRule::Union { .. }) {
                        ExpandNode::Union
                    } else {
                        ExpandNode::Intersection
                    };
                    (node, trees)
                }
                RewriteRule::Exclusion { base, subtract } => {
                    let base = self.expand_rule(state, base, relation, object, depth).await?;
                    let subtract = self.expand_rule(state, subtract, relation, object, depth).await?;
                    (ExpandNode::Exclusion, vec![base, subtract])
                }
                RewriteRule::TupleToUserset { tupleset, computed } => {
                    let edges = self
                        .repository
                        .read_tuples(
                            &TupleFilter::in_zone(&state.zone_id)
                                .subject_zone(&state.zone_id)
                                .relation(tupleset)
                                .object(object),
                        )
                        .await?;
                    state.guard.check_fanout(edges.len())?;

                    let mut trees = Vec::with_capacity(edges.len());
                    for edge in edges {
                        let target = edge.subject.as_object();
                        trees.push(self.expand_relation(state, computed, &target, depth + 1).await?);
                    }
                    (ExpandNode::TupleToUserset, trees)
                }
            };

            let mut tree = ExpandTree::new(object, relation, node);
            tree.children = children;
            Ok(tree)
        })
    }

    fn expand_direct<'a>(
        &'a self,
        state: &'a mut ExpandState,
        relation: &'a str,
        object: &'a Object,
        depth: u32,
    ) -> Expansion<'a> {
        Box::pin(async move {
            let tuples = self
                .repository
                .read_tuples(&TupleFilter::in_zone(&state.zone_id).relation(relation).object(object))
                .await?;
            state.guard.check_fanout(tuples.len())?;

            let mut tree = ExpandTree::new(object, relation, ExpandNode::Leaf);
            for tuple in tuples {
                match tuple.subject.relation {
                    Some(ref userset_relation) => {
                        let userset_object = tuple.subject.as_object();
                        let child = self
                            .expand_relation(state, userset_relation, &userset_object, depth + 1)
                            .await?;
                        tree.children.push(child);
                    }
                    None => tree.subjects.push(tuple.subject),
                }
            }
            Ok(tree)
        })
    }
}
