use crate::{error::RebacError, models::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

pub mod postgres;

pub use postgres::PostgresTupleRepository;

/// Repository interface for relationship tuples and the per-zone changelog.
///
/// The repository is the only source of truth; every cache in the engine is
/// derived from it. Implementations must surface outages as
/// [`RebacError::StoreUnavailable`] and never answer with an empty result
/// instead of an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TupleRepository: Send + Sync {
    /// Write a tuple. Idempotent on the natural key: an existing live tuple
    /// is returned unchanged with `created == false`.
    async fn write_tuple(&self, tuple: RelationshipTuple) -> Result<WriteOutcome, RebacError>;

    /// Delete a tuple by id. Returns `None` when it does not exist.
    async fn delete_tuple(&self, id: Uuid) -> Result<Option<DeleteOutcome>, RebacError>;

    async fn get_tuple(&self, id: Uuid) -> Result<Option<RelationshipTuple>, RebacError>;

    /// Read every tuple matching the filter (unpaginated, for traversal fan-out).
    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>, RebacError>;

    /// Paginated read ordered by creation time.
    async fn query_tuples(
        &self,
        filter: &TupleFilter,
        pagination: Pagination,
    ) -> Result<TuplePage, RebacError>;

    /// Distinct objects of a type known to the zone, optionally under a path prefix.
    async fn list_objects_of_type(
        &self,
        zone_id: &str,
        object_type: &str,
        path_prefix: Option<String>,
    ) -> Result<Vec<Object>, RebacError>;

    /// Delete every tuple expired at `now`, recording changelog entries.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeleteOutcome>, RebacError>;

    async fn current_revision(&self, zone_id: &str) -> Result<u64, RebacError>;

    /// Changelog entries with `sequence > after`, ascending, at most `limit`.
    async fn read_changes(
        &self,
        zone_id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, RebacError>;

    async fn load_checkpoint(&self, consumer: &str, zone_id: &str) -> Result<u64, RebacError>;

    async fn save_checkpoint(
        &self,
        consumer: &str,
        zone_id: &str,
        sequence: u64,
    ) -> Result<(), RebacError>;

    /// Zones that have a changelog.
    async fn zones(&self) -> Result<Vec<String>, RebacError>;
}

#[derive(Default)]
struct MemoryState {
    tuples: HashMap<Uuid, RelationshipTuple>,
    by_key: HashMap<TupleKey, Uuid>,
    changelog: HashMap<String, Vec<ChangeEntry>>,
    revisions: HashMap<String, u64>,
    checkpoints: HashMap<(String, String), u64>,
}

impl MemoryState {
    fn append(&mut self, kind: ChangeKind, tuple: &RelationshipTuple) -> u64 {
        let revision = self.revisions.entry(tuple.zone_id.clone()).or_insert(0);
        *revision += 1;
        let sequence = *revision;
        self.changelog
            .entry(tuple.zone_id.clone())
            .or_default()
            .push(ChangeEntry {
                sequence,
                zone_id: tuple.zone_id.clone(),
                kind,
                tuple: tuple.clone(),
                recorded_at: Utc::now(),
            });
        sequence
    }

    fn remove(&mut self, id: Uuid) -> Option<DeleteOutcome> {
        let tuple = self.tuples.remove(&id)?;
        self.by_key.remove(&tuple.key());
        let revision = self.append(ChangeKind::Delete, &tuple);
        Some(DeleteOutcome { tuple, revision })
    }

    fn matching(&self, filter: &TupleFilter) -> Vec<RelationshipTuple> {
        let now = Utc::now();
        let mut tuples: Vec<RelationshipTuple> = self
            .tuples
            .values()
            .filter(|t| filter.matches(t, now))
            .cloned()
            .collect();
        tuples.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tuples
    }
}

/// In-memory tuple repository for testing and development
pub struct InMemoryTupleRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryTupleRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTupleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TupleRepository for InMemoryTupleRepository {
    async fn write_tuple(&self, tuple: RelationshipTuple) -> Result<WriteOutcome, RebacError> {
        let mut state = self.state.write();
        let key = tuple.key();

        if let Some(existing_id) = state.by_key.get(&key).copied() {
            let live = state
                .tuples
                .get(&existing_id)
                .is_some_and(|t| !t.is_expired(Utc::now()));
            if live {
                let revision = state.revisions.get(&tuple.zone_id).copied().unwrap_or(0);
                return Ok(WriteOutcome {
                    tuple_id: existing_id,
                    revision,
                    created: false,
                });
            }
            // An expired tuple under the same key is replaced.
            state.remove(existing_id);
        }

        let revision = state.append(ChangeKind::Write, &tuple);
        let tuple_id = tuple.id;
        state.by_key.insert(key, tuple_id);
        state.tuples.insert(tuple_id, tuple);
        debug!(%tuple_id, revision, "Tuple written");

        Ok(WriteOutcome {
            tuple_id,
            revision,
            created: true,
        })
    }

    async fn delete_tuple(&self, id: Uuid) -> Result<Option<DeleteOutcome>, RebacError> {
        Ok(self.state.write().remove(id))
    }

    async fn get_tuple(&self, id: Uuid) -> Result<Option<RelationshipTuple>, RebacError> {
        Ok(self.state.read().tuples.get(&id).cloned())
    }

    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>, RebacError> {
        Ok(self.state.read().matching(filter))
    }

    async fn query_tuples(
        &self,
        filter: &TupleFilter,
        pagination: Pagination,
    ) -> Result<TuplePage, RebacError> {
        let all = self.state.read().matching(filter);
        let total = all.len();
        let tuples: Vec<RelationshipTuple> = all
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect();
        let end = pagination.offset.saturating_add(tuples.len());
        Ok(TuplePage {
            next_offset: (end < total).then_some(end),
            tuples,
        })
    }

    async fn list_objects_of_type(
        &self,
        zone_id: &str,
        object_type: &str,
        path_prefix: Option<String>,
    ) -> Result<Vec<Object>, RebacError> {
        let state = self.state.read();
        let now = Utc::now();
        let mut objects = BTreeSet::new();
        for tuple in state.tuples.values() {
            if tuple.zone_id != zone_id || tuple.is_expired(now) {
                continue;
            }
            if tuple.object.object_type == object_type {
                objects.insert(tuple.object.clone());
            }
            if tuple.subject.subject_type == object_type && !tuple.subject.is_userset() {
                objects.insert(tuple.subject.as_object());
            }
        }
        Ok(objects
            .into_iter()
            .filter(|o| path_prefix.as_deref().map_or(true, |p| o.is_under(p)))
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeleteOutcome>, RebacError> {
        let mut state = self.state.write();
        let mut expired: Vec<(DateTime<Utc>, Uuid)> = state
            .tuples
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| (t.created_at, t.id))
            .collect();
        expired.sort();
        Ok(expired
            .into_iter()
            .filter_map(|(_, id)| state.remove(id))
            .collect())
    }

    async fn current_revision(&self, zone_id: &str) -> Result<u64, RebacError> {
        Ok(self.state.read().revisions.get(zone_id).copied().unwrap_or(0))
    }

    async fn read_changes(
        &self,
        zone_id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, RebacError> {
        let state = self.state.read();
        Ok(state
            .changelog
            .get(zone_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_checkpoint(&self, consumer: &str, zone_id: &str) -> Result<u64, RebacError> {
        Ok(self
            .state
            .read()
            .checkpoints
            .get(&(consumer.to_string(), zone_id.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn save_checkpoint(
        &self,
        consumer: &str,
        zone_id: &str,
        sequence: u64,
    ) -> Result<(), RebacError> {
        let mut state = self.state.write();
        let checkpoint = state
            .checkpoints
            .entry((consumer.to_string(), zone_id.to_string()))
            .or_insert(0);
        *checkpoint = (*checkpoint).max(sequence);
        Ok(())
    }

    async fn zones(&self) -> Result<Vec<String>, RebacError> {
        let mut zones: Vec<String> = self.state.read().revisions.keys().cloned().collect();
        zones.sort();
        Ok(zones)
    }
}
