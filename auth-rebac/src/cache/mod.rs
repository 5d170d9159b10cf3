//! Derived permission caches.
//!
//! Every cache here is rebuildable from the tuple store and never
//! authoritative. Each one implements the narrow [`CacheInvalidator`]
//! interface; the [`CacheCoordinator`] fans tuple changes out to them.

pub mod boundary;
pub mod coordinator;
pub mod iterator;
pub mod result;
pub mod visibility;

pub use boundary::BoundaryCache;
pub use coordinator::CacheCoordinator;
pub use iterator::IteratorCache;
pub use result::ResultCache;
pub use visibility::VisibilityCache;

use crate::error::RebacError;
use crate::models::ChangeEntry;
use async_trait::async_trait;

/// A cache that must forget what a tuple change may have made stale.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drop entries affected by `change`. An error makes the coordinator fall
    /// back to [`CacheInvalidator::invalidate_zone`].
    async fn invalidate(&self, change: &ChangeEntry) -> Result<(), RebacError>;

    async fn invalidate_zone(&self, zone_id: &str);
}
