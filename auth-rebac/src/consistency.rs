//! Consistency tokens ("zookies") and per-zone revision tracking.

use crate::error::RebacError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Opaque marker proving a read reflects at least a given write in a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsistencyToken {
    pub token: String,
}

impl ConsistencyToken {
    pub fn new(zone_id: &str, revision: u64) -> Self {
        Self {
            token: URL_SAFE_NO_PAD.encode(format!("{}:{}", revision, zone_id)),
        }
    }

    /// Parse a token received from a caller.
    pub fn parse(token: &str) -> Result<Self, RebacError> {
        let parsed = Self {
            token: token.to_string(),
        };
        parsed.decode()?;
        Ok(parsed)
    }

    pub fn decode(&self) -> Result<(String, u64), RebacError> {
        let raw = URL_SAFE_NO_PAD
            .decode(&self.token)
            .map_err(|_| RebacError::InvalidConsistencyToken)?;
        let raw = String::from_utf8(raw).map_err(|_| RebacError::InvalidConsistencyToken)?;
        let (revision, zone) = raw
            .split_once(':')
            .ok_or(RebacError::InvalidConsistencyToken)?;
        let revision = revision
            .parse::<u64>()
            .map_err(|_| RebacError::InvalidConsistencyToken)?;
        if zone.is_empty() {
            return Err(RebacError::InvalidConsistencyToken);
        }
        Ok((zone.to_string(), revision))
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for ConsistencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// Read consistency requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Consistency {
    /// Any cache may answer; may lag writes for a bounded window.
    #[default]
    Eventual,
    /// Wait until derived caches reflect the token (or the zone head).
    CloseToOpen(Option<ConsistencyToken>),
    /// Bypass every cache and read the store at or after the token.
    Strong(Option<ConsistencyToken>),
}

impl Consistency {
    pub fn token(&self) -> Option<&ConsistencyToken> {
        match self {
            Consistency::Eventual => None,
            Consistency::CloseToOpen(token) | Consistency::Strong(token) => token.as_ref(),
        }
    }
}

struct ZoneRevisions {
    latest: u64,
    last_restrictive: u64,
    applied: watch::Sender<u64>,
}

impl ZoneRevisions {
    fn new() -> Self {
        let (applied, _) = watch::channel(0);
        Self {
            latest: 0,
            last_restrictive: 0,
            applied,
        }
    }
}

/// Tracks, per zone, the newest written revision, the newest revision that
/// could have revoked access, and the revision derived caches have applied.
pub struct RevisionTracker {
    zones: DashMap<String, ZoneRevisions>,
}

impl Default for RevisionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionTracker {
    pub fn new() -> Self {
        Self {
            zones: DashMap::new(),
        }
    }

    pub fn observe(&self, zone_id: &str, revision: u64, restrictive: bool) {
        let mut zone = self
            .zones
            .entry(zone_id.to_string())
            .or_insert_with(ZoneRevisions::new);
        zone.latest = zone.latest.max(revision);
        if restrictive {
            zone.last_restrictive = zone.last_restrictive.max(revision);
        }
    }

    /// Seed a zone from the store head without knowing what the revisions changed.
    pub fn seed(&self, zone_id: &str, revision: u64) {
        self.observe(zone_id, revision, true);
    }

    pub fn is_tracked(&self, zone_id: &str) -> bool {
        self.zones.contains_key(zone_id)
    }

    pub fn latest(&self, zone_id: &str) -> u64 {
        self.zones.get(zone_id).map_or(0, |z| z.latest)
    }

    pub fn last_restrictive(&self, zone_id: &str) -> u64 {
        self.zones.get(zone_id).map_or(0, |z| z.last_restrictive)
    }

    pub fn applied(&self, zone_id: &str) -> u64 {
        self.zones.get(zone_id).map_or(0, |z| *z.applied.borrow())
    }

    pub fn mark_applied(&self, zone_id: &str, revision: u64) {
        let zone = self
            .zones
            .entry(zone_id.to_string())
            .or_insert_with(ZoneRevisions::new);
        zone.applied.send_if_modified(|current| {
            if revision > *current {
                *current = revision;
                true
            } else {
                false
            }
        });
    }

    /// Wait until derived caches for the zone have applied `revision`.
    pub async fn wait_applied(
        &self,
        zone_id: &str,
        revision: u64,
        timeout: Duration,
    ) -> Result<(), RebacError> {
        let mut rx = {
            let zone = self
                .zones
                .entry(zone_id.to_string())
                .or_insert_with(ZoneRevisions::new);
            zone.applied.subscribe()
        };

        let waited = tokio::time::timeout(timeout, rx.wait_for(|applied| *applied >= revision)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            _ => Err(RebacError::ConsistencyTimeout {
                zone_id: zone_id.to_string(),
                required: revision,
                observed: self.applied(zone_id),
            }),
        }
    }
}
