use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Circular dependency detected in namespace '{0}'")]
    CircularDependency(String),

    #[error("Consistency token invalid")]
    InvalidConsistencyToken,

    #[error("Graph limit exceeded: {limit} (limit {max}, observed {observed})")]
    GraphLimitExceeded {
        limit: LimitKind,
        max: u64,
        observed: u64,
    },

    #[error("Zone isolation violated: subject zone '{subject_zone}' cannot reach object zone '{object_zone}' via '{relation}'")]
    ZoneIsolation {
        subject_zone: String,
        object_zone: String,
        relation: String,
    },

    #[error("Cursor expired: snapshot revision {cursor_revision}, zone revision {current_revision}")]
    CursorExpired {
        cursor_revision: u64,
        current_revision: u64,
    },

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Tuple store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Timed out waiting for zone '{zone_id}' to reach revision {required} (observed {observed})")]
    ConsistencyTimeout {
        zone_id: String,
        required: u64,
        observed: u64,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    /// Errors whose only sound interpretation is "not permitted".
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            RebacError::GraphLimitExceeded { .. } | RebacError::ZoneIsolation { .. }
        )
    }
}

/// Which traversal limit tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Depth,
    Fanout,
    NodesVisited,
    Timeout,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LimitKind::Depth => "max_depth",
            LimitKind::Fanout => "max_fanout_per_node",
            LimitKind::NodesVisited => "max_nodes_visited",
            LimitKind::Timeout => "timeout_ms",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
