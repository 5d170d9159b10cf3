use crate::{error::RebacError, models::*};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Relation rewrite rule, evaluated by a single recursive interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RewriteRule {
    /// Direct tuples of the relation being defined.
    This,
    /// Another relation on the same object.
    Computed { relation: String },
    Union { children: Vec<RewriteRule> },
    Intersection { children: Vec<RewriteRule> },
    Exclusion {
        base: Box<RewriteRule>,
        subtract: Box<RewriteRule>,
    },
    /// Follow `tupleset` tuples on the object, then check `computed` on each target.
    TupleToUserset { tupleset: String, computed: String },
}

impl RewriteRule {
    pub fn computed(relation: &str) -> Self {
        RewriteRule::Computed {
            relation: relation.to_string(),
        }
    }

    pub fn union(children: Vec<RewriteRule>) -> Self {
        RewriteRule::Union { children }
    }

    pub fn intersection(children: Vec<RewriteRule>) -> Self {
        RewriteRule::Intersection { children }
    }

    pub fn exclusion(base: RewriteRule, subtract: RewriteRule) -> Self {
        RewriteRule::Exclusion {
            base: Box::new(base),
            subtract: Box::new(subtract),
        }
    }

    pub fn tuple_to_userset(tupleset: &str, computed: &str) -> Self {
        RewriteRule::TupleToUserset {
            tupleset: tupleset.to_string(),
            computed: computed.to_string(),
        }
    }
}

/// Permission schema definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Namespace definitions keyed by object type (e.g. "file", "dir", "group")
    pub namespaces: HashMap<String, NamespaceConfig>,
}

/// Definition of a namespace (object type)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    pub relations: Vec<RelationDefinition>,
}

/// Definition of a relation within a namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    pub rewrite: RewriteRule,
    #[serde(default)]
    pub description: String,
}

impl RelationDefinition {
    pub fn new(name: &str, rewrite: RewriteRule) -> Self {
        Self {
            name: name.to_string(),
            rewrite,
            description: String::new(),
        }
    }

    pub fn direct(name: &str) -> Self {
        Self::new(name, RewriteRule::This)
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

impl NamespaceConfig {
    pub fn new(name: &str, relations: Vec<RelationDefinition>) -> Self {
        Self {
            name: name.to_string(),
            relations,
        }
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Outcome of looking up the rule for (object type, relation).
#[derive(Debug, Clone, Copy)]
pub enum RelationRule<'a> {
    Defined(&'a RewriteRule),
    /// The namespace exists but does not define the relation.
    Undefined,
    /// No namespace for the object type: only direct tuples count.
    Unconstrained,
}

impl Default for Schema {
    fn default() -> Self {
        Self::filesystem()
    }
}

impl Schema {
    pub fn new() -> Self {
        Self {
            namespaces: HashMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: NamespaceConfig) -> Self {
        self.namespaces.insert(namespace.name.clone(), namespace);
        self
    }

    /// Groups, directories and files with hierarchical inheritance through `parent`.
    pub fn filesystem() -> Self {
        let hierarchical = |extra: Vec<RelationDefinition>| {
            let mut relations = vec![
                RelationDefinition::direct("parent").describe("Containing directory"),
                RelationDefinition::direct("owner").describe("Full control"),
                RelationDefinition::new(
                    "editor",
                    RewriteRule::union(vec![
                        RewriteRule::This,
                        RewriteRule::computed("owner"),
                        RewriteRule::tuple_to_userset("parent", "editor"),
                    ]),
                )
                .describe("Can modify"),
                RelationDefinition::new(
                    "viewer",
                    RewriteRule::union(vec![
                        RewriteRule::This,
                        RewriteRule::computed("editor"),
                        RewriteRule::computed("shared-viewer"),
                        RewriteRule::tuple_to_userset("parent", "viewer"),
                    ]),
                )
                .describe("Can read"),
                RelationDefinition::direct("shared-viewer").describe("Read access shared from another zone"),
            ];
            relations.extend(extra);
            relations
        };

        Self::new()
            .with_namespace(NamespaceConfig::new(
                "group",
                vec![RelationDefinition::direct("member").describe("Member of this group")],
            ))
            .with_namespace(NamespaceConfig::new("dir", hierarchical(Vec::new())))
            .with_namespace(NamespaceConfig::new(
                "file",
                hierarchical(vec![
                    RelationDefinition::direct("blocked").describe("Explicitly denied"),
                    RelationDefinition::new(
                        "read",
                        RewriteRule::exclusion(
                            RewriteRule::computed("viewer"),
                            RewriteRule::computed("blocked"),
                        ),
                    )
                    .describe("Viewer unless blocked"),
                ]),
            ))
    }

    pub fn resolve(&self, object_type: &str, relation: &str) -> RelationRule<'_> {
        match self.namespaces.get(object_type) {
            Some(namespace) => match namespace.relation(relation) {
                Some(def) => RelationRule::Defined(&def.rewrite),
                None => RelationRule::Undefined,
            },
            None => RelationRule::Unconstrained,
        }
    }

    /// True when (object type, relation) is satisfied by direct tuples alone.
    pub fn is_direct_only(&self, object_type: &str, relation: &str) -> bool {
        matches!(
            self.resolve(object_type, relation),
            RelationRule::Defined(RewriteRule::This) | RelationRule::Unconstrained
        )
    }

    /// True when the relation only grows as tuples are added: no exclusion or
    /// intersection anywhere in its rule, following computed relations.
    pub fn is_monotonic(&self, object_type: &str, relation: &str) -> bool {
        let mut seen = HashSet::new();
        self.monotonic_relation(object_type, relation, &mut seen)
    }

    fn monotonic_relation(&self, object_type: &str, relation: &str, seen: &mut HashSet<String>) -> bool {
        if !seen.insert(format!("{}#{}", object_type, relation)) {
            return true;
        }
        match self.resolve(object_type, relation) {
            RelationRule::Defined(rule) => self.monotonic_rule(object_type, rule, seen),
            RelationRule::Undefined | RelationRule::Unconstrained => true,
        }
    }

    fn monotonic_rule(&self, object_type: &str, rule: &RewriteRule, seen: &mut HashSet<String>) -> bool {
        match rule {
            RewriteRule::This | RewriteRule::TupleToUserset { .. } => true,
            RewriteRule::Computed { relation } => self.monotonic_relation(object_type, relation, seen),
            RewriteRule::Union { children } => children
                .iter()
                .all(|child| self.monotonic_rule(object_type, child, seen)),
            RewriteRule::Intersection { .. } | RewriteRule::Exclusion { .. } => false,
        }
    }

    /// Validate that a tuple conforms to the schema
    pub fn validate_tuple(&self, tuple: &RelationshipTuple) -> Result<(), RebacError> {
        if tuple.subject.subject_type.is_empty() || tuple.subject.subject_id.is_empty() {
            return Err(RebacError::InvalidSubject(tuple.subject.to_string()));
        }
        if tuple.object.object_type.is_empty() || tuple.object.object_id.is_empty() {
            return Err(RebacError::InvalidObject(tuple.object.to_string()));
        }
        if tuple.relation.is_empty() {
            return Err(RebacError::InvalidTuple("empty relation".to_string()));
        }

        if let RelationRule::Undefined = self.resolve(&tuple.object.object_type, &tuple.relation) {
            return Err(RebacError::InvalidTuple(format!(
                "Unknown relation '{}' for object type '{}'",
                tuple.relation, tuple.object.object_type
            )));
        }

        Ok(())
    }

    /// Validate the entire schema is well-formed
    pub fn validate(&self) -> Result<(), RebacError> {
        for (name, namespace) in &self.namespaces {
            if name != &namespace.name {
                return Err(RebacError::InvalidSchema(format!(
                    "Namespace key '{}' doesn't match name '{}'",
                    name, namespace.name
                )));
            }

            let mut graph: DiGraph<&str, ()> = DiGraph::new();
            let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
            for relation in &namespace.relations {
                if nodes.contains_key(relation.name.as_str()) {
                    return Err(RebacError::InvalidSchema(format!(
                        "Relation '{}' defined twice in '{}'",
                        relation.name, name
                    )));
                }
                nodes.insert(&relation.name, graph.add_node(&relation.name));
            }

            for relation in &namespace.relations {
                let mut targets = Vec::new();
                computed_targets(&relation.rewrite, &mut targets);
                for target in targets {
                    let to = nodes.get(target).ok_or_else(|| {
                        RebacError::InvalidSchema(format!(
                            "Relation '{}' in '{}' references unknown relation '{}'",
                            relation.name, name, target
                        ))
                    })?;
                    if let Some(from) = nodes.get(relation.name.as_str()) {
                        graph.add_edge(*from, *to, ());
                    }
                }
            }

            if petgraph::algo::is_cyclic_directed(&graph) {
                return Err(RebacError::CircularDependency(name.clone()));
            }
        }
        Ok(())
    }

    /// Relations that appear on the subtract side of an exclusion, followed
    /// transitively. Writing one of these can revoke access.
    pub fn restrictive_relations(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for namespace in self.namespaces.values() {
            for relation in &namespace.relations {
                self.find_exclusions(&relation.rewrite, &relation.name, &mut out);
            }
        }
        out
    }

    /// Relations used as the tupleset of some tuple_to_userset, i.e. hierarchy edges.
    pub fn tupleset_relations(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for namespace in self.namespaces.values() {
            for relation in &namespace.relations {
                collect_tuplesets(&relation.rewrite, &mut out);
            }
        }
        out
    }

    fn find_exclusions(&self, rule: &RewriteRule, relation: &str, out: &mut HashSet<String>) {
        match rule {
            RewriteRule::Exclusion { base, subtract } => {
                self.collect_restrictive(subtract, relation, out);
                self.find_exclusions(base, relation, out);
            }
            RewriteRule::Union { children } | RewriteRule::Intersection { children } => {
                for child in children {
                    self.find_exclusions(child, relation, out);
                }
            }
            _ => {}
        }
    }

    fn collect_restrictive(&self, rule: &RewriteRule, relation: &str, out: &mut HashSet<String>) {
        match rule {
            RewriteRule::This => {
                out.insert(relation.to_string());
            }
            RewriteRule::Computed { relation: target } => self.follow_by_name(target, out),
            RewriteRule::Union { children } | RewriteRule::Intersection { children } => {
                for child in children {
                    self.collect_restrictive(child, relation, out);
                }
            }
            RewriteRule::Exclusion { base, subtract } => {
                self.collect_restrictive(base, relation, out);
                self.collect_restrictive(subtract, relation, out);
            }
            RewriteRule::TupleToUserset { tupleset, computed } => {
                out.insert(tupleset.clone());
                self.follow_by_name(computed, out);
            }
        }
    }

    fn follow_by_name(&self, relation: &str, out: &mut HashSet<String>) {
        if !out.insert(relation.to_string()) {
            return;
        }
        for namespace in self.namespaces.values() {
            if let Some(def) = namespace.relation(relation) {
                self.collect_restrictive(&def.rewrite, relation, out);
            }
        }
    }
}

fn computed_targets<'a>(rule: &'a RewriteRule, out: &mut Vec<&'a str>) {
    match rule {
        RewriteRule::Computed { relation } => out.push(relation),
        RewriteRule::Union { children } | RewriteRule::Intersection { children } => {
            for child in children {
                computed_targets(child, out);
            }
        }
        RewriteRule::Exclusion { base, subtract } => {
            computed_targets(base, out);
            computed_targets(subtract, out);
        }
        RewriteRule::This | RewriteRule::TupleToUserset { .. } => {}
    }
}

fn collect_tuplesets(rule: &RewriteRule, out: &mut HashSet<String>) {
    match rule {
        RewriteRule::TupleToUserset { tupleset, .. } => {
            out.insert(tupleset.clone());
        }
        RewriteRule::Union { children } | RewriteRule::Intersection { children } => {
            for child in children {
                collect_tuplesets(child, out);
            }
        }
        RewriteRule::Exclusion { base, subtract } => {
            collect_tuplesets(base, out);
            collect_tuplesets(subtract, out);
        }
        RewriteRule::This | RewriteRule::Computed { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_schema() {
        let schema = Schema::filesystem();
        assert!(schema.namespaces.contains_key("file"));
        assert!(schema.namespaces.contains_key("group"));
        assert!(schema.validate().is_ok());
        assert!(schema.is_direct_only("group", "member"));
        assert!(!schema.is_direct_only("file", "viewer"));
        assert!(schema.tupleset_relations().contains("parent"));
    }

    #[test]
    fn test_validate_tuple() {
        let schema = Schema::filesystem();
        let tuple = RelationshipTuple::new(Subject::user("alice"), "owner", Object::file("/a"), "z1");
        assert!(schema.validate_tuple(&tuple).is_ok());

        let invalid = RelationshipTuple::new(Subject::user("alice"), "invalid", Object::file("/a"), "z1");
        assert!(schema.validate_tuple(&invalid).is_err());

        // Unknown object types accept any relation.
        let free = RelationshipTuple::new(Subject::user("alice"), "anything", Object::new("doc", "1"), "z1");
        assert!(schema.validate_tuple(&free).is_ok());
    }

    #[test]
    fn test_cycle_detection() {
        let schema = Schema::new().with_namespace(NamespaceConfig::new(
            "doc",
            vec![
                RelationDefinition::new("a", RewriteRule::computed("b")),
                RelationDefinition::new("b", RewriteRule::union(vec![RewriteRule::This, RewriteRule::computed("a")])),
            ],
        ));
        assert!(matches!(schema.validate(), Err(RebacError::CircularDependency(_))));
    }

    #[test]
    fn test_unknown_computed_target() {
        let schema = Schema::new().with_namespace(NamespaceConfig::new(
            "doc",
            vec![RelationDefinition::new("a", RewriteRule::computed("missing"))],
        ));
        assert!(matches!(schema.validate(), Err(RebacError::InvalidSchema(_))));
    }

    #[test]
    fn test_restrictive_relations() {
        let restrictive = Schema::filesystem().restrictive_relations();
        assert!(restrictive.contains("blocked"));
        assert!(!restrictive.contains("viewer"));
    }

    #[test]
    fn test_monotonic_relations() {
        let schema = Schema::filesystem();
        assert!(schema.is_monotonic("dir", "viewer"));
        assert!(schema.is_monotonic("file", "editor"));
        assert!(!schema.is_monotonic("file", "read"));
    }

    #[test]
    fn test_rewrite_rule_serde() {
        let json = r#"{"op":"union","children":[{"op":"this"},{"op":"tuple_to_userset","tupleset":"parent","computed":"viewer"}]}"#;
        let rule: RewriteRule = serde_json::from_str(json).unwrap();
        assert_eq!(
            rule,
            RewriteRule::union(vec![RewriteRule::This, RewriteRule::tuple_to_userset("parent", "viewer")])
        );
    }
}
