//! Engine configuration.
//!
//! Loaded from an optional file layered under `REBAC__`-prefixed environment
//! variables, e.g. `REBAC__LIMITS__MAX_DEPTH=20`.

use crate::error::RebacError;
use crate::limits::GraphLimits;
use crate::models::RelationshipTuple;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: GraphLimits,
    pub result_cache: ResultCacheConfig,
    pub iterator_cache: IteratorCacheConfig,
    pub tiger: TigerConfig,
    pub leopard: LeopardConfig,
    pub zones: ZoneConfig,
    pub consistency: ConsistencyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 10,
            max_entries: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IteratorCacheConfig {
    pub ttl_secs: u64,
    pub max_entries: u64,
    /// Zone revisions a cursor may fall behind before it expires.
    pub staleness_revisions: u64,
}

impl Default for IteratorCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1_000,
            staleness_revisions: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TigerConfig {
    pub enabled: bool,
    /// Descendants a directory grant expands eagerly before deferring to lazy resolution.
    pub directory_expansion_limit: usize,
    /// Revisions an eventual list may lag behind the zone head.
    pub eventual_staleness_revisions: u64,
    pub changelog_batch_size: usize,
}

impl Default for TigerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory_expansion_limit: 10_000,
            eventual_staleness_revisions: 100,
            changelog_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeopardConfig {
    pub enabled: bool,
    pub membership_relation: String,
    pub group_types: Vec<String>,
}

impl LeopardConfig {
    /// True for a group-membership edge, e.g. `user:alice member group:eng`.
    pub fn is_membership_edge(&self, tuple: &RelationshipTuple) -> bool {
        tuple.relation == self.membership_relation
            && self.group_types.iter().any(|t| *t == tuple.object.object_type)
    }

    pub fn is_group_type(&self, object_type: &str) -> bool {
        self.group_types.iter().any(|t| t == object_type)
    }
}

impl Default for LeopardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            membership_relation: "member".to_string(),
            group_types: vec!["group".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Relations allowed to cross zones on explicit share tuples.
    pub cross_zone_relations: Vec<String>,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            cross_zone_relations: vec![
                "shared-viewer".to_string(),
                "shared-editor".to_string(),
                "shared-owner".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 2_000,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,auth_rebac=info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus `REBAC__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, RebacError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(::config::Environment::with_prefix("REBAC").separator("__"))
            .build()
            .map_err(|e| RebacError::Configuration(e.to_string()))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| RebacError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RebacError> {
        let limits = &self.limits;
        if limits.max_depth == 0
            || limits.max_fanout_per_node == 0
            || limits.max_nodes_visited == 0
            || limits.timeout_ms == 0
        {
            return Err(RebacError::Configuration(
                "graph limits must all be non-zero".to_string(),
            ));
        }
        if self.leopard.enabled && self.leopard.membership_relation.is_empty() {
            return Err(RebacError::Configuration(
                "leopard membership relation must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
