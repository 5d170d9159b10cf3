//! DoS-protection limits for graph traversal.
//!
//! Every traversal owns a [`TraversalGuard`]; the node budget inside it can be
//! shared across a batch so that a bulk check cannot amplify work N times.

use crate::error::{LimitKind, RebacError};
use crate::models::TraversalStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Request-scoped traversal limits. Immutable once a traversal starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphLimits {
    pub max_depth: u32,
    pub max_fanout_per_node: usize,
    pub max_nodes_visited: u64,
    pub timeout_ms: u64,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_fanout_per_node: 1_000,
            max_nodes_visited: 10_000,
            timeout_ms: 1_000,
        }
    }
}

impl GraphLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Node budget, shareable between traversals.
#[derive(Debug, Clone)]
pub struct NodeBudget {
    max: u64,
    used: Arc<AtomicU64>,
}

impl NodeBudget {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            used: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn consume(&self) -> Result<(), RebacError> {
        let max = self.max;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < max).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|used| RebacError::GraphLimitExceeded {
                limit: LimitKind::NodesVisited,
                max,
                observed: used.saturating_add(1),
            })
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.max
    }
}

/// Enforces [`GraphLimits`] for one traversal and collects its stats.
#[derive(Debug, Clone)]
pub struct TraversalGuard {
    limits: GraphLimits,
    budget: NodeBudget,
    started: Instant,
    stats: TraversalStats,
}

impl TraversalGuard {
    pub fn new(limits: GraphLimits) -> Self {
        Self::with_budget(limits, NodeBudget::new(limits.max_nodes_visited))
    }

    pub fn with_budget(limits: GraphLimits, budget: NodeBudget) -> Self {
        Self {
            limits,
            budget,
            started: Instant::now(),
            stats: TraversalStats::default(),
        }
    }

    pub fn limits(&self) -> &GraphLimits {
        &self.limits
    }

    /// Called on every recursive step.
    pub fn enter(&mut self, depth: u32) -> Result<(), RebacError> {
        self.check_deadline()?;
        if depth > self.limits.max_depth {
            return Err(RebacError::GraphLimitExceeded {
                limit: LimitKind::Depth,
                max: u64::from(self.limits.max_depth),
                observed: u64::from(depth),
            });
        }
        self.budget.consume()?;
        self.stats.nodes_visited += 1;
        self.stats.max_depth_reached = self.stats.max_depth_reached.max(depth);
        Ok(())
    }

    pub fn check_fanout(&mut self, fanout: usize) -> Result<(), RebacError> {
        self.stats.tuples_read += fanout as u64;
        if fanout > self.limits.max_fanout_per_node {
            return Err(RebacError::GraphLimitExceeded {
                limit: LimitKind::Fanout,
                max: self.limits.max_fanout_per_node as u64,
                observed: fanout as u64,
            });
        }
        Ok(())
    }

    pub fn check_deadline(&self) -> Result<(), RebacError> {
        let elapsed = self.started.elapsed();
        if elapsed > self.limits.timeout() {
            return Err(RebacError::GraphLimitExceeded {
                limit: LimitKind::Timeout,
                max: self.limits.timeout_ms,
                observed: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(())
    }

    pub fn remaining(&self) -> Duration {
        self.limits.timeout().saturating_sub(self.started.elapsed())
    }

    pub fn record_cache_hit(&mut self) {
        self.stats.cache_hits += 1;
    }

    pub fn stats(&self) -> TraversalStats {
        self.stats
    }
}
