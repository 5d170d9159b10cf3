use crate::consistency::Consistency;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Attribute conditions attached to a tuple.
pub type Conditions = serde_json::Map<String, serde_json::Value>;

/// Represents a subject in the authorization system.
///
/// A subject with `relation` set is a userset: "every subject holding
/// `relation` on `subject_type:subject_id`", e.g. `group:eng#member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub subject_type: String,
    pub subject_id: String,
    pub relation: Option<String>,
}

impl Subject {
    pub fn new(subject_type: &str, subject_id: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            relation: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn group(group_id: &str) -> Self {
        Self::new("group", group_id)
    }

    pub fn userset(object_type: &str, object_id: &str, relation: &str) -> Self {
        Self {
            subject_type: object_type.to_string(),
            subject_id: object_id.to_string(),
            relation: Some(relation.to_string()),
        }
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }

    /// The entity this subject names, ignoring any userset relation.
    pub fn as_object(&self) -> Object {
        Object::new(&self.subject_type, &self.subject_id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref relation) = self.relation {
            write!(f, "{}:{}#{}", self.subject_type, self.subject_id, relation)
        } else {
            write!(f, "{}:{}", self.subject_type, self.subject_id)
        }
    }
}

/// Represents an object (resource) in the authorization system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Object {
    pub object_type: String,
    pub object_id: String,
}

impl Object {
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        }
    }

    pub fn file(path: &str) -> Self {
        Self::new("file", path)
    }

    pub fn dir(path: &str) -> Self {
        Self::new("dir", path)
    }

    /// Hierarchical objects carry absolute paths as ids.
    pub fn is_path(&self) -> bool {
        self.object_id.starts_with('/')
    }

    /// True when this object's path equals `prefix` or lies beneath it.
    pub fn is_under(&self, prefix: &str) -> bool {
        path_is_under(&self.object_id, prefix)
    }

    pub fn parent_path(&self) -> Option<String> {
        parent_path(&self.object_id)
    }

    /// Ancestor paths, nearest first, ending with `/`.
    pub fn ancestor_paths(&self) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = self.parent_path();
        while let Some(path) = current {
            current = parent_path(&path);
            ancestors.push(path);
        }
        ancestors
    }

    pub fn as_subject(&self) -> Subject {
        Subject::new(&self.object_type, &self.object_id)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

pub(crate) fn path_is_under(path: &str, prefix: &str) -> bool {
    if !path.starts_with('/') {
        return false;
    }
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

pub(crate) fn parent_path(path: &str) -> Option<String> {
    if !path.starts_with('/') || path == "/" {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => trimmed.get(..idx).map(str::to_string),
        None => None,
    }
}

/// Represents a relationship tuple: subject has relation to object, inside a zone.
///
/// Tuples are immutable once written; changing one means delete + write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipTuple {
    pub id: Uuid,
    pub subject: Subject,
    /// Zone the subject lives in. Differs from `zone_id` only on cross-zone shares.
    pub subject_zone_id: String,
    pub relation: String,
    pub object: Object,
    pub zone_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: Option<Conditions>,
    pub created_at: DateTime<Utc>,
}

impl RelationshipTuple {
    pub fn new(subject: Subject, relation: &str, object: Object, zone_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            subject_zone_id: zone_id.to_string(),
            relation: relation.to_string(),
            object,
            zone_id: zone_id.to_string(),
            expires_at: None,
            conditions: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_subject_zone(mut self, subject_zone_id: &str) -> Self {
        self.subject_zone_id = subject_zone_id.to_string();
        self
    }

    pub fn key(&self) -> TupleKey {
        TupleKey {
            zone_id: self.zone_id.clone(),
            subject_zone_id: self.subject_zone_id.clone(),
            subject: self.subject.clone(),
            relation: self.relation.clone(),
            object: self.object.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_cross_zone(&self) -> bool {
        self.subject_zone_id != self.zone_id
    }
}

impl fmt::Display for RelationshipTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @{}",
            self.subject, self.relation, self.object, self.zone_id
        )
    }
}

/// Natural key of a tuple; writes are idempotent on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleKey {
    pub zone_id: String,
    pub subject_zone_id: String,
    pub subject: Subject,
    pub relation: String,
    pub object: Object,
}

/// Filter for tuple reads. `None` fields act as wildcards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TupleFilter {
    pub zone_id: Option<String>,
    pub subject: Option<Subject>,
    /// Subject entity with any (or no) userset relation.
    pub subject_entity: Option<Object>,
    pub subject_zone_id: Option<String>,
    pub relation: Option<String>,
    pub object: Option<Object>,
    pub object_type: Option<String>,
    pub object_id_prefix: Option<String>,
    pub usersets_only: bool,
    pub include_expired: bool,
}

impl TupleFilter {
    pub fn in_zone(zone_id: &str) -> Self {
        Self {
            zone_id: Some(zone_id.to_string()),
            ..Self::default()
        }
    }

    pub fn subject(mut self, subject: &Subject) -> Self {
        self.subject = Some(subject.clone());
        self
    }

    pub fn subject_entity(mut self, entity: &Object) -> Self {
        self.subject_entity = Some(entity.clone());
        self
    }

    pub fn subject_zone(mut self, zone_id: &str) -> Self {
        self.subject_zone_id = Some(zone_id.to_string());
        self
    }

    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn object(mut self, object: &Object) -> Self {
        self.object = Some(object.clone());
        self
    }

    pub fn object_type(mut self, object_type: &str) -> Self {
        self.object_type = Some(object_type.to_string());
        self
    }

    pub fn object_id_prefix(mut self, prefix: &str) -> Self {
        self.object_id_prefix = Some(prefix.to_string());
        self
    }

    pub fn usersets_only(mut self) -> Self {
        self.usersets_only = true;
        self
    }

    pub fn include_expired(mut self) -> Self {
        self.include_expired = true;
        self
    }

    pub fn matches(&self, tuple: &RelationshipTuple, now: DateTime<Utc>) -> bool {
        if !self.include_expired && tuple.is_expired(now) {
            return false;
        }
        if self.zone_id.as_ref().is_some_and(|z| *z != tuple.zone_id) {
            return false;
        }
        if self.subject.as_ref().is_some_and(|s| *s != tuple.subject) {
            return false;
        }
        if self
            .subject_entity
            .as_ref()
            .is_some_and(|e| e.object_type != tuple.subject.subject_type || e.object_id != tuple.subject.subject_id)
        {
            return false;
        }
        if self
            .subject_zone_id
            .as_ref()
            .is_some_and(|z| *z != tuple.subject_zone_id)
        {
            return false;
        }
        if self.relation.as_ref().is_some_and(|r| *r != tuple.relation) {
            return false;
        }
        if self.object.as_ref().is_some_and(|o| *o != tuple.object) {
            return false;
        }
        if self
            .object_type
            .as_ref()
            .is_some_and(|t| *t != tuple.object.object_type)
        {
            return false;
        }
        if self
            .object_id_prefix
            .as_ref()
            .is_some_and(|p| !tuple.object.is_under(p))
        {
            return false;
        }
        if self.usersets_only && !tuple.subject.is_userset() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuplePage {
    pub tuples: Vec<RelationshipTuple>,
    pub next_offset: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Write,
    Delete,
}

/// One entry of the per-zone write changelog. `sequence` is the zone revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub sequence: u64,
    pub zone_id: String,
    pub kind: ChangeKind,
    pub tuple: RelationshipTuple,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub tuple_id: Uuid,
    pub revision: u64,
    /// False when the natural key already existed.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub tuple: RelationshipTuple,
    pub revision: u64,
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub subject: Subject,
    pub permission: String,
    pub object: Object,
    pub zone_id: String,
    /// Zone of the subject; defaults to `zone_id`.
    pub subject_zone_id: Option<String>,
    pub context: Option<serde_json::Value>,
}

impl CheckRequest {
    pub fn new(subject: Subject, permission: &str, object: Object, zone_id: &str) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            object,
            zone_id: zone_id.to_string(),
            subject_zone_id: None,
            context: None,
        }
    }

    pub fn with_subject_zone(mut self, zone_id: &str) -> Self {
        self.subject_zone_id = Some(zone_id.to_string());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn subject_zone(&self) -> &str {
        self.subject_zone_id.as_deref().unwrap_or(&self.zone_id)
    }
}

/// Counters collected while answering a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalStats {
    pub nodes_visited: u64,
    pub cache_hits: u64,
    pub max_depth_reached: u32,
    pub tuples_read: u64,
}

/// Which layer produced a check answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStrategy {
    ResultCache,
    TigerCache,
    BoundaryCache,
    Traversal,
}

/// Authorization check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub stats: TraversalStats,
    pub strategy: CheckStrategy,
}

/// Key of one item in a bulk check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckKey {
    pub subject: Subject,
    pub permission: String,
    pub object: Object,
}

impl CheckKey {
    pub fn new(subject: Subject, permission: &str, object: Object) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            object,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpandNode {
    Leaf,
    Computed,
    Union,
    Intersection,
    Exclusion,
    TupleToUserset,
    /// Cut short by a cycle or the depth limit.
    Truncated,
}

/// Userset tree returned by expand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandTree {
    pub object: Object,
    pub relation: String,
    pub node: ExpandNode,
    /// Concrete subjects found at this node (leaves only).
    pub subjects: Vec<Subject>,
    pub children: Vec<ExpandTree>,
}

impl ExpandTree {
    pub(crate) fn new(object: &Object, relation: &str, node: ExpandNode) -> Self {
        Self {
            object: object.clone(),
            relation: relation.to_string(),
            node,
            subjects: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Every concrete subject anywhere in the tree, deduplicated.
    ///
    /// Ignores the set semantics of intersection and exclusion nodes.
    pub fn leaf_subjects(&self) -> Vec<Subject> {
        let mut out = Vec::new();
        self.collect_subjects(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_subjects(&self, out: &mut Vec<Subject>) {
        out.extend(self.subjects.iter().cloned());
        for child in &self.children {
            child.collect_subjects(out);
        }
    }
}

/// Request for listing the objects a subject can access.
#[derive(Debug, Clone)]
pub struct ListObjectsRequest {
    pub subject: Subject,
    pub permission: String,
    pub object_type: String,
    pub zone_id: String,
    pub path_prefix: Option<String>,
    pub limit: usize,
    pub cursor: Option<String>,
    pub consistency: Consistency,
}

impl ListObjectsRequest {
    pub fn new(subject: Subject, permission: &str, object_type: &str, zone_id: &str) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            object_type: object_type.to_string(),
            zone_id: zone_id.to_string(),
            path_prefix: None,
            limit: 100,
            cursor: None,
            consistency: Consistency::Eventual,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListStrategy {
    TigerCache,
    LeopardBfs,
    FullWalk,
    /// Page served from an existing snapshot.
    IteratorCache,
}

#[derive(Debug, Clone)]
pub struct ObjectPage {
    pub objects: Vec<Object>,
    pub next_cursor: Option<String>,
    /// Zone revision the snapshot was taken at.
    pub revision: u64,
    pub strategy: ListStrategy,
}
