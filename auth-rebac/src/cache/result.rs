//! Check result cache.

use crate::cache::CacheInvalidator;
use crate::config::ResultCacheConfig;
use crate::error::RebacError;
use crate::models::*;
use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub zone_id: String,
    pub subject: Subject,
    pub permission: String,
    pub object: Object,
}

impl ResultKey {
    pub fn new(zone_id: &str, subject: &Subject, permission: &str, object: &Object) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            subject: subject.clone(),
            permission: permission.to_string(),
            object: object.clone(),
        }
    }
}

/// Caches final check answers for a short TTL.
///
/// A change whose subject is a concrete entity can only alter answers for that
/// subject, unless it is a hierarchy edge; everything else clears the zone.
///
/// Each zone carries a generation bumped before every invalidation. Callers
/// capture it before evaluating and pass it to [`ResultCache::insert`], which
/// refuses answers computed across an invalidation.
pub struct ResultCache {
    cache: Cache<ResultKey, bool>,
    enabled: bool,
    tupleset_relations: HashSet<String>,
    generations: DashMap<String, u64>,
}

impl ResultCache {
    pub fn new(config: &ResultCacheConfig, tupleset_relations: HashSet<String>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .support_invalidation_closures()
            .build();

        Self {
            cache,
            enabled: config.enabled,
            tupleset_relations,
            generations: DashMap::new(),
        }
    }

    pub fn generation(&self, zone_id: &str) -> u64 {
        self.generations.get(zone_id).map_or(0, |g| *g)
    }

    fn bump_generation(&self, zone_id: &str) {
        *self.generations.entry(zone_id.to_string()).or_insert(0) += 1;
    }

    pub async fn get(&self, key: &ResultKey) -> Option<bool> {
        if !self.enabled {
            return None;
        }
        self.cache.get(key).await
    }

    /// Cache an answer evaluated while the zone was at `generation`.
    pub async fn insert(&self, key: ResultKey, allowed: bool, generation: u64) {
        if !self.enabled || self.generation(&key.zone_id) != generation {
            return;
        }
        self.cache.insert(key.clone(), allowed).await;
        // An invalidation that started while we were inserting may have missed the entry.
        if self.generation(&key.zone_id) != generation {
            self.cache.invalidate(&key).await;
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl CacheInvalidator for ResultCache {
    fn name(&self) -> &'static str {
        "result"
    }

    async fn invalidate(&self, change: &ChangeEntry) -> Result<(), RebacError> {
        self.bump_generation(&change.zone_id);
        let tuple = &change.tuple;
        if tuple.subject.is_userset() || self.tupleset_relations.contains(&tuple.relation) {
            self.invalidate_zone(&change.zone_id).await;
            return Ok(());
        }

        let zone_id = change.zone_id.clone();
        let subject = tuple.subject.clone();
        debug!(zone = %zone_id, subject = %subject, "Invalidating cached results for subject");
        self.cache
            .invalidate_entries_if(move |key, _| key.zone_id == zone_id && key.subject == subject)
            .map_err(|e| RebacError::Internal(anyhow::anyhow!("result cache invalidation: {}", e)))?;
        Ok(())
    }

    async fn invalidate_zone(&self, zone_id: &str) {
        self.bump_generation(zone_id);
        let zone_id = zone_id.to_string();
        if self
            .cache
            .invalidate_entries_if(move |key, _| key.zone_id == zone_id)
            .is_err()
        {
            self.clear();
        }
    }
}
