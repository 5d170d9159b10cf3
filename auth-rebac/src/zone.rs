//! Zone isolation.
//!
//! Tuples and traversals are confined to a single zone. The only way across
//! is an explicit, unexpired share tuple whose relation is on the configured
//! allow-list.

use crate::config::ZoneConfig;
use crate::error::RebacError;
use crate::models::*;
use crate::repository::TupleRepository;
use std::collections::HashSet;
use tracing::warn;

pub struct ZoneManager {
    cross_zone_relations: HashSet<String>,
}

impl ZoneManager {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            cross_zone_relations: config.cross_zone_relations.iter().cloned().collect(),
        }
    }

    pub fn is_cross_zone_relation(&self, relation: &str) -> bool {
        self.cross_zone_relations.contains(relation)
    }

    pub fn validate_zone_id(&self, zone_id: &str) -> Result<(), RebacError> {
        if zone_id.trim().is_empty() {
            return Err(RebacError::InvalidTuple("zone_id is required".to_string()));
        }
        Ok(())
    }

    /// Reject writes that would bridge zones outside the allow-list.
    pub fn validate_write(&self, tuple: &RelationshipTuple) -> Result<(), RebacError> {
        self.validate_zone_id(&tuple.zone_id)?;
        self.validate_zone_id(&tuple.subject_zone_id)?;
        if tuple.is_cross_zone() && !self.is_cross_zone_relation(&tuple.relation) {
            warn!(
                subject_zone = %tuple.subject_zone_id,
                object_zone = %tuple.zone_id,
                relation = %tuple.relation,
                "Rejected cross-zone tuple"
            );
            return Err(RebacError::ZoneIsolation {
                subject_zone: tuple.subject_zone_id.clone(),
                object_zone: tuple.zone_id.clone(),
                relation: tuple.relation.clone(),
            });
        }
        Ok(())
    }

    /// Before a check whose subject lives in another zone, require an explicit
    /// share tuple from the subject to the object.
    pub async fn authorize_crossing(
        &self,
        repository: &dyn TupleRepository,
        request: &CheckRequest,
    ) -> Result<(), RebacError> {
        let subject_zone = request.subject_zone();
        if subject_zone == request.zone_id {
            return Ok(());
        }

        let shares = repository
            .read_tuples(
                &TupleFilter::in_zone(&request.zone_id)
                    .subject(&request.subject)
                    .subject_zone(subject_zone)
                    .object(&request.object),
            )
            .await?;

        if shares
            .iter()
            .any(|t| self.is_cross_zone_relation(&t.relation))
        {
            return Ok(());
        }

        warn!(
            subject = %request.subject,
            subject_zone = %subject_zone,
            object = %request.object,
            object_zone = %request.zone_id,
            "Cross-zone check without share tuple"
        );
        Err(RebacError::ZoneIsolation {
            subject_zone: subject_zone.to_string(),
            object_zone: request.zone_id.clone(),
            relation: request.permission.clone(),
        })
    }
}
