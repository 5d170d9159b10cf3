//! Zone-aware traversal: every check passes through zone validation and the
//! cross-zone share gate before the permission computer runs, and the whole
//! evaluation is bounded by the request timeout.

use crate::check::{Evaluation, PermissionComputer};
use crate::error::{LimitKind, RebacError};
use crate::limits::TraversalGuard;
use crate::models::CheckRequest;
use crate::repository::TupleRepository;
use crate::zone::ZoneManager;
use std::sync::Arc;
use tracing::warn;

pub struct ZoneAwareTraversal {
    computer: Arc<PermissionComputer>,
    zones: Arc<ZoneManager>,
    repository: Arc<dyn TupleRepository>,
}

impl ZoneAwareTraversal {
    pub fn new(
        computer: Arc<PermissionComputer>,
        zones: Arc<ZoneManager>,
        repository: Arc<dyn TupleRepository>,
    ) -> Self {
        Self {
            computer,
            zones,
            repository,
        }
    }

    pub fn computer(&self) -> &Arc<PermissionComputer> {
        &self.computer
    }

    /// Zone checks only. Errors here are raised, never turned into a silent deny.
    pub async fn authorize(&self, request: &CheckRequest) -> Result<(), RebacError> {
        self.zones.validate_zone_id(&request.zone_id)?;
        self.zones.validate_zone_id(request.subject_zone())?;
        self.zones
            .authorize_crossing(self.repository.as_ref(), request)
            .await
    }

    pub async fn check(
        &self,
        request: &CheckRequest,
        guard: TraversalGuard,
        use_caches: bool,
    ) -> Result<Evaluation, RebacError> {
        self.authorize(request).await?;
        self.run(request, guard, use_caches).await
    }

    /// Evaluate a request that has already been authorized.
    pub(crate) async fn run(
        &self,
        request: &CheckRequest,
        guard: TraversalGuard,
        use_caches: bool,
    ) -> Result<Evaluation, RebacError> {
        let limits = *guard.limits();
        let remaining = guard.remaining();

        match tokio::time::timeout(remaining, self.computer.evaluate(request, guard, use_caches)).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    if e.is_fail_closed() {
                        warn!(
                            subject = %request.subject,
                            permission = %request.permission,
                            object = %request.object,
                            zone = %request.zone_id,
                            error = %e,
                            "Check failed closed"
                        );
                    }
                }
                result
            }
            Err(_) => {
                warn!(
                    subject = %request.subject,
                    object = %request.object,
                    timeout_ms = limits.timeout_ms,
                    "Check cancelled at timeout"
                );
                Err(RebacError::GraphLimitExceeded {
                    limit: LimitKind::Timeout,
                    max: limits.timeout_ms,
                    observed: limits.timeout_ms,
                })
            }
        }
    }
}
