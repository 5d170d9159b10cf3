use crate::error::RebacError;
use crate::models::*;
use crate::repository::TupleRepository;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Finds the objects whose permissions can change when a grant on a directory
/// changes: descendants through hierarchy edges plus objects granted to a
/// userset of the directory, transitively.
///
/// Expansion is eager up to `limit` objects. Past that it gives up and the
/// caller drops the affected bitmaps, leaving those checks to traversal and
/// the boundary cache.
pub struct DirectoryGrantExpander {
    repository: Arc<dyn TupleRepository>,
    hierarchy_relations: HashSet<String>,
    limit: usize,
}

impl DirectoryGrantExpander {
    pub fn new(repository: Arc<dyn TupleRepository>, hierarchy_relations: HashSet<String>, limit: usize) -> Self {
        Self {
            repository,
            hierarchy_relations,
            limit,
        }
    }

    /// Dependents of `root`, excluding `root`. `None` once past the limit.
    pub async fn dependents(&self, zone_id: &str, root: &Object) -> Result<Option<Vec<Object>>, RebacError> {
        let mut seen: HashSet<Object> = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);
        let mut found = Vec::new();

        while let Some(current) = queue.pop_front() {
            let tuples = self
                .repository
                .read_tuples(
                    &TupleFilter::in_zone(zone_id)
                        .subject_entity(&current)
                        .subject_zone(zone_id),
                )
                .await?;

            for tuple in tuples {
                let inherits = tuple.subject.is_userset() || self.hierarchy_relations.contains(&tuple.relation);
                if !inherits || !seen.insert(tuple.object.clone()) {
                    continue;
                }
                if found.len() >= self.limit {
                    debug!(zone = zone_id, root = %root, limit = self.limit, "Directory expansion over limit");
                    return Ok(None);
                }
                found.push(tuple.object.clone());
                queue.push_back(tuple.object);
            }
        }

        Ok(Some(found))
    }
}
