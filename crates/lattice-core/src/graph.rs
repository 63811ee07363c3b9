//! Schema reachability.
//!
//! The schema forms a possibly-cyclic graph of relations. The index below
//! answers the reverse questions the lookup walkers need: which relations
//! admit a given subject directly, which relations on the same type
//! consume a relation through their rewrites, and which tuple-to-userset
//! arms walk into it. Each answer carries whether every path to it is
//! union-only; anything under an intersection or exclusion needs a
//! verifying check before its resources may be emitted.

use lattice_store::{Reader, StoreError};
use lattice_types::{ObjectDefinition, SubjectRelation};

use crate::Result;

/// A tuple-to-userset edge pointing up the graph: resources of
/// `object_type` gain `result_relation` through tuples on `tupleset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuplesetEntrypoint {
    pub object_type: String,
    pub tupleset: String,
    pub result_relation: String,
    pub union_only: bool,
}

/// All object definitions live at one revision, indexed for reverse
/// traversal.
pub struct SchemaIndex {
    objects: Vec<ObjectDefinition>,
}

impl SchemaIndex {
    pub async fn load(reader: &dyn Reader) -> Result<Self> {
        let namespaces = reader.list_all_namespaces().await?;
        let mut objects: Vec<ObjectDefinition> =
            namespaces.into_iter().map(|ns| ns.definition).collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { objects })
    }

    pub fn from_definitions(mut objects: Vec<ObjectDefinition>) -> Self {
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Self { objects }
    }

    pub fn object(&self, name: &str) -> Result<&ObjectDefinition> {
        self.objects
            .iter()
            .find(|o| o.name == name)
            .ok_or_else(|| StoreError::NamespaceNotFound(name.to_string()).into())
    }

    pub fn objects(&self) -> &[ObjectDefinition] {
        &self.objects
    }

    /// Direct relations that admit the given subject.
    pub fn direct_entrypoints(
        &self,
        subject_type: &str,
        subject_relation: &SubjectRelation,
    ) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for object in &self.objects {
            for relation in &object.relations {
                if relation.admits(subject_type, subject_relation) {
                    out.push((object.name.clone(), relation.name.clone()));
                }
            }
        }
        out
    }

    /// Relations on `object_type` whose rewrite consumes `relation` via a
    /// computed userset arm.
    pub fn computed_entrypoints(
        &self,
        object_type: &str,
        relation: &str,
    ) -> Vec<(String, bool)> {
        let mut out = Vec::new();
        let Ok(object) = self.object(object_type) else { return out };
        for candidate in &object.relations {
            if let Some(rewrite) = &candidate.rewrite {
                for (referenced, union_only) in rewrite.computed_references() {
                    if referenced == relation {
                        out.push((candidate.name.clone(), union_only));
                    }
                }
            }
        }
        out
    }

    /// Tuple-to-userset arms whose computed relation is `relation` and
    /// whose tupleset admits subjects of `subject_type` directly.
    pub fn tupleset_entrypoints(
        &self,
        subject_type: &str,
        relation: &str,
    ) -> Vec<TuplesetEntrypoint> {
        let mut out = Vec::new();
        for object in &self.objects {
            for candidate in &object.relations {
                let Some(rewrite) = &candidate.rewrite else { continue };
                for (tupleset, computed, union_only) in rewrite.tupleset_references() {
                    if computed != relation {
                        continue;
                    }
                    let admits = object
                        .relation(&tupleset)
                        .map(|ts| ts.admits(subject_type, &SubjectRelation::Ellipsis))
                        .unwrap_or(false);
                    if admits {
                        out.push(TuplesetEntrypoint {
                            object_type: object.name.clone(),
                            tupleset,
                            result_relation: candidate.name.clone(),
                            union_only,
                        });
                    }
                }
            }
        }
        out
    }
}
