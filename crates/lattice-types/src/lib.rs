//! # Lattice Types
//!
//! Shared type definitions for the latticedb authorization system.
//!
//! This crate provides the relationship tuple model, the revision and
//! snapshot model, the compiled schema tree, and the caveat expression
//! types used across the latticedb ecosystem, ensuring a single source of
//! truth and preventing circular dependencies.

use serde::{Deserialize, Serialize};

pub mod caveat;
pub mod revision;
pub mod schema;

pub use caveat::{
    CaveatDefinition, CaveatExpr, CaveatExpression, CaveatOp, CaveatParamType, CaveatReference,
    CaveatValue, CmpOp, ContextualizedCaveat,
};
pub use revision::{HlcTimestamp, Revision, TxSnapshot};
pub use schema::{
    AllowedSubject, ObjectDefinition, Relation, RewriteNode, SchemaDefinition, SubjectRelation,
};

/// Sentinel subject relation meaning "the object itself, not a set".
pub const ELLIPSIS: &str = "...";

/// A reference to a concrete object: a type and an id within that type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self { object_type: object_type.into(), object_id: object_id.into() }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// An object plus a relation on it, denoting the userset `object#relation`.
///
/// With the ellipsis relation this denotes the object itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectAndRelation {
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
}

impl ObjectAndRelation {
    pub fn new(
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
            relation: relation.into(),
        }
    }

    /// A subject denoting the object itself rather than a userset.
    pub fn ellipsis(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::new(object_type, object_id, ELLIPSIS)
    }

    pub fn is_ellipsis(&self) -> bool {
        self.relation == ELLIPSIS
    }

    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(self.object_type.clone(), self.object_id.clone())
    }
}

impl std::fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ellipsis() {
            write!(f, "{}:{}", self.object_type, self.object_id)
        } else {
            write!(f, "{}:{}#{}", self.object_type, self.object_id, self.relation)
        }
    }
}

/// A named relation on an object type, without a concrete object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationRef {
    pub object_type: String,
    pub relation: String,
}

impl RelationRef {
    pub fn new(object_type: impl Into<String>, relation: impl Into<String>) -> Self {
        Self { object_type: object_type.into(), relation: relation.into() }
    }
}

impl std::fmt::Display for RelationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.object_type, self.relation)
    }
}

/// A stored relationship: the ordered septuple of resource, relation,
/// subject, and an optional caveat reference.
///
/// The subject relation is either a named relation (a userset) or the
/// ellipsis sentinel meaning the subject object itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
    pub subject_relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<CaveatReference>,
}

impl Relationship {
    /// A plain uncaveated relationship with an ellipsis subject.
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        relation: impl Into<String>,
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            relation: relation.into(),
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: ELLIPSIS.to_string(),
            caveat: None,
        }
    }

    pub fn with_subject_relation(mut self, subject_relation: impl Into<String>) -> Self {
        self.subject_relation = subject_relation.into();
        self
    }

    pub fn with_caveat(mut self, caveat: CaveatReference) -> Self {
        self.caveat = Some(caveat);
        self
    }

    pub fn resource(&self) -> ObjectRef {
        ObjectRef::new(self.resource_type.clone(), self.resource_id.clone())
    }

    pub fn subject(&self) -> ObjectAndRelation {
        ObjectAndRelation::new(
            self.subject_type.clone(),
            self.subject_id.clone(),
            self.subject_relation.clone(),
        )
    }

    pub fn has_ellipsis_subject(&self) -> bool {
        self.subject_relation == ELLIPSIS
    }

    /// The identity of this relationship for liveness purposes: everything
    /// except the caveat context. At most one live row may carry this key
    /// at any revision.
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            resource_type: self.resource_type.clone(),
            resource_id: self.resource_id.clone(),
            relation: self.relation.clone(),
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            subject_relation: self.subject_relation.clone(),
        }
    }
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.resource_type,
            self.resource_id,
            self.relation,
            self.subject()
        )
    }
}

/// The six-part identity of a relationship, used for write coalescing and
/// the unique live-row constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
    pub subject_relation: String,
}

/// The mutation kinds accepted by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateOperation {
    /// Insert; fails if the tuple is already live at the write snapshot.
    Create,
    /// Create-or-update; idempotent.
    Touch,
    /// Tombstone; fails if the tuple is absent at the write snapshot.
    Delete,
}

/// A single relationship mutation inside a read-write transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub operation: UpdateOperation,
    pub relationship: Relationship,
}

impl RelationshipUpdate {
    pub fn create(relationship: Relationship) -> Self {
        Self { operation: UpdateOperation::Create, relationship }
    }

    pub fn touch(relationship: Relationship) -> Self {
        Self { operation: UpdateOperation::Touch, relationship }
    }

    pub fn delete(relationship: Relationship) -> Self {
        Self { operation: UpdateOperation::Delete, relationship }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ellipsis_subject_display() {
        let rel = Relationship::new("document", "readme", "viewer", "user", "alice");
        assert!(rel.has_ellipsis_subject());
        assert_eq!(rel.to_string(), "document:readme#viewer@user:alice");
    }

    #[test]
    fn userset_subject_display() {
        let rel = Relationship::new("document", "readme", "viewer", "group", "eng")
            .with_subject_relation("member");
        assert!(!rel.has_ellipsis_subject());
        assert_eq!(rel.to_string(), "document:readme#viewer@group:eng#member");
    }

    #[test]
    fn key_ignores_caveat() {
        let plain = Relationship::new("document", "readme", "viewer", "user", "alice");
        let caveated = plain.clone().with_caveat(CaveatReference {
            caveat_name: "has_age".to_string(),
            context: serde_json::Map::new(),
        });
        assert_eq!(plain.key(), caveated.key());
    }

    #[test]
    fn subject_round_trip() {
        let rel = Relationship::new("document", "readme", "viewer", "group", "eng")
            .with_subject_relation("member");
        let subject = rel.subject();
        assert_eq!(subject, ObjectAndRelation::new("group", "eng", "member"));
        assert_eq!(subject.object(), ObjectRef::new("group", "eng"));
    }
}
