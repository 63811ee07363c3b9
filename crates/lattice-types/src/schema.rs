//! Compiled schema model.
//!
//! The engine consumes a compiled schema tree: object definitions naming
//! relations, where a relation either directly admits subject types or is a
//! permission whose body is a rewrite tree over relations. The schema graph
//! may be cyclic; nodes reference each other by name, never by ownership.

use serde::{Deserialize, Serialize};

use crate::caveat::CaveatDefinition;

/// A complete compiled schema: object definitions plus caveat definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchemaDefinition {
    pub objects: Vec<ObjectDefinition>,
    #[serde(default)]
    pub caveats: Vec<CaveatDefinition>,
}

impl SchemaDefinition {
    pub fn new(objects: Vec<ObjectDefinition>) -> Self {
        Self { objects, caveats: Vec::new() }
    }

    pub fn with_caveats(mut self, caveats: Vec<CaveatDefinition>) -> Self {
        self.caveats = caveats;
        self
    }

    pub fn object(&self, name: &str) -> Option<&ObjectDefinition> {
        self.objects.iter().find(|o| o.name == name)
    }

    pub fn caveat(&self, name: &str) -> Option<&CaveatDefinition> {
        self.caveats.iter().find(|c| c.name == name)
    }
}

/// An object type definition naming its relations and permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDefinition {
    pub name: String,
    pub relations: Vec<Relation>,
}

impl ObjectDefinition {
    pub fn new(name: impl Into<String>, relations: Vec<Relation>) -> Self {
        Self { name: name.into(), relations }
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// A relation on an object type.
///
/// A direct relation admits stored relationships from the listed subject
/// types and has no rewrite. A permission has a rewrite tree and admits no
/// direct writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    #[serde(default)]
    pub allowed_subjects: Vec<AllowedSubject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<RewriteNode>,
}

impl Relation {
    /// A direct relation admitting the given subject types.
    pub fn direct(name: impl Into<String>, allowed_subjects: Vec<AllowedSubject>) -> Self {
        Self { name: name.into(), allowed_subjects, rewrite: None }
    }

    /// A permission defined by a rewrite tree.
    pub fn permission(name: impl Into<String>, rewrite: RewriteNode) -> Self {
        Self { name: name.into(), allowed_subjects: Vec::new(), rewrite: Some(rewrite) }
    }

    pub fn is_permission(&self) -> bool {
        self.rewrite.is_some()
    }

    /// Whether this relation directly admits the given subject type and
    /// subject relation.
    pub fn admits(&self, subject_type: &str, subject_relation: &SubjectRelation) -> bool {
        self.allowed_subjects
            .iter()
            .any(|a| a.object_type == subject_type && a.relation == *subject_relation)
    }
}

/// The subject-relation part of an allowed subject type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectRelation {
    /// The subject object itself.
    Ellipsis,
    /// A userset: subjects reached through the named relation.
    Relation(String),
}

impl SubjectRelation {
    pub fn from_str_form(relation: &str) -> Self {
        if relation == crate::ELLIPSIS {
            SubjectRelation::Ellipsis
        } else {
            SubjectRelation::Relation(relation.to_string())
        }
    }
}

/// One subject type admitted by a direct relation, optionally gated by a
/// caveat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedSubject {
    pub object_type: String,
    pub relation: SubjectRelation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat_name: Option<String>,
}

impl AllowedSubject {
    pub fn direct(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            relation: SubjectRelation::Ellipsis,
            caveat_name: None,
        }
    }

    pub fn userset(object_type: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            relation: SubjectRelation::Relation(relation.into()),
            caveat_name: None,
        }
    }

    pub fn with_caveat(mut self, caveat_name: impl Into<String>) -> Self {
        self.caveat_name = Some(caveat_name.into());
        self
    }
}

/// The permission rewrite tree. Each arm's payload is fixed; there is no
/// open inheritance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RewriteNode {
    /// The relationships stored directly on this relation.
    This,
    /// Re-evaluate against another relation on the same resource.
    ComputedUserset { relation: String },
    /// Walk the tupleset relation on this resource, then evaluate the
    /// computed relation on each tuple's subject.
    TupleToUserset { tupleset: String, computed: String },
    /// Any child grants membership.
    Union(Vec<RewriteNode>),
    /// Every child must grant membership.
    Intersection(Vec<RewriteNode>),
    /// Membership in `base` minus membership in `subtract`.
    Exclusion { base: Box<RewriteNode>, subtract: Box<RewriteNode> },
    /// The empty set.
    Nil,
}

impl RewriteNode {
    /// All relations on the same object type referenced by this tree,
    /// paired with whether every path to the reference is union-only.
    ///
    /// A reference reached beneath an intersection or exclusion cannot be
    /// used to deduce membership without a verifying check.
    pub fn computed_references(&self) -> Vec<(String, bool)> {
        let mut out = Vec::new();
        self.collect_computed(&mut out, true);
        out
    }

    fn collect_computed(&self, out: &mut Vec<(String, bool)>, union_only: bool) {
        match self {
            RewriteNode::ComputedUserset { relation } => {
                out.push((relation.clone(), union_only));
            }
            RewriteNode::Union(children) => {
                for child in children {
                    child.collect_computed(out, union_only);
                }
            }
            RewriteNode::Intersection(children) => {
                for child in children {
                    child.collect_computed(out, false);
                }
            }
            RewriteNode::Exclusion { base, subtract } => {
                base.collect_computed(out, false);
                subtract.collect_computed(out, false);
            }
            RewriteNode::This
            | RewriteNode::TupleToUserset { .. }
            | RewriteNode::Nil => {}
        }
    }

    /// All tuple-to-userset arms in this tree, paired with whether every
    /// path to the arm is union-only.
    pub fn tupleset_references(&self) -> Vec<(String, String, bool)> {
        let mut out = Vec::new();
        self.collect_tuplesets(&mut out, true);
        out
    }

    fn collect_tuplesets(&self, out: &mut Vec<(String, String, bool)>, union_only: bool) {
        match self {
            RewriteNode::TupleToUserset { tupleset, computed } => {
                out.push((tupleset.clone(), computed.clone(), union_only));
            }
            RewriteNode::Union(children) => {
                for child in children {
                    child.collect_tuplesets(out, union_only);
                }
            }
            RewriteNode::Intersection(children) => {
                for child in children {
                    child.collect_tuplesets(out, false);
                }
            }
            RewriteNode::Exclusion { base, subtract } => {
                base.collect_tuplesets(out, false);
                subtract.collect_tuplesets(out, false);
            }
            RewriteNode::This
            | RewriteNode::ComputedUserset { .. }
            | RewriteNode::Nil => {}
        }
    }

    /// Whether this tree contains a `This` arm reached through union-only
    /// paths.
    pub fn has_union_only_this(&self) -> bool {
        match self {
            RewriteNode::This => true,
            RewriteNode::Union(children) => children.iter().any(|c| c.has_union_only_this()),
            _ => false,
        }
    }
}
