//! Relationship filters and query options.

use lattice_types::{Relationship, RelationRef, ELLIPSIS};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Sort order for relationship queries. Cursors are only defined for
/// sorted queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Unsorted,
    ByResource,
}

/// A resumable position within a sorted query: the last relationship
/// produced.
pub type Cursor = Relationship;

/// Options for forward relationship queries.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<u64>,
    pub sort: SortOrder,
    pub after: Option<Cursor>,
}

impl QueryOptions {
    pub fn limited(limit: u64) -> Self {
        Self { limit: Some(limit), ..Default::default() }
    }

    pub fn sorted_by_resource() -> Self {
        Self { sort: SortOrder::ByResource, ..Default::default() }
    }

    /// A cursor is only meaningful under a sort order.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.after.is_some() && self.sort == SortOrder::Unsorted {
            return Err(StoreError::CursorsWithoutSorting);
        }
        Ok(())
    }
}

/// Options for reverse (subject-side) relationship queries.
#[derive(Debug, Clone, Default)]
pub struct ReverseQueryOptions {
    pub limit: Option<u64>,
    /// Restrict results to a single resource type and relation.
    pub resource_relation: Option<RelationRef>,
}

/// A filter over stored relationships, addressed from the resource side.
/// Every field is optional; empty vectors mean "any".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipsFilter {
    pub optional_resource_type: Option<String>,
    pub optional_resource_ids: Vec<String>,
    pub optional_relation: Option<String>,
    pub optional_subjects_selectors: Vec<SubjectsSelector>,
    pub optional_caveat_name: Option<String>,
}

impl RelationshipsFilter {
    pub fn for_resource_type(resource_type: impl Into<String>) -> Self {
        Self { optional_resource_type: Some(resource_type.into()), ..Default::default() }
    }

    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.optional_relation = Some(relation.into());
        self
    }

    pub fn with_resource_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_resource_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subjects_selector(mut self, selector: SubjectsSelector) -> Self {
        self.optional_subjects_selectors.push(selector);
        self
    }

    /// True when no field constrains anything; such a filter is rejected
    /// for deletions.
    pub fn is_empty(&self) -> bool {
        self.optional_resource_type.is_none()
            && self.optional_resource_ids.is_empty()
            && self.optional_relation.is_none()
            && self.optional_subjects_selectors.is_empty()
            && self.optional_caveat_name.is_none()
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        if let Some(resource_type) = &self.optional_resource_type {
            if *resource_type != rel.resource_type {
                return false;
            }
        }
        if !self.optional_resource_ids.is_empty()
            && !self.optional_resource_ids.contains(&rel.resource_id)
        {
            return false;
        }
        if let Some(relation) = &self.optional_relation {
            if *relation != rel.relation {
                return false;
            }
        }
        if let Some(caveat_name) = &self.optional_caveat_name {
            match &rel.caveat {
                Some(reference) if reference.caveat_name == *caveat_name => {}
                _ => return false,
            }
        }
        if !self.optional_subjects_selectors.is_empty()
            && !self.optional_subjects_selectors.iter().any(|s| s.matches(rel))
        {
            return false;
        }
        true
    }
}

/// Selects a set of subjects within a relationship filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectsSelector {
    pub optional_subject_type: Option<String>,
    pub optional_subject_ids: Vec<String>,
    pub relation_filter: SubjectRelationFilter,
}

impl SubjectsSelector {
    pub fn for_subject_type(subject_type: impl Into<String>) -> Self {
        Self { optional_subject_type: Some(subject_type.into()), ..Default::default() }
    }

    pub fn with_subject_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_subject_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relation_filter(mut self, relation_filter: SubjectRelationFilter) -> Self {
        self.relation_filter = relation_filter;
        self
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        if let Some(subject_type) = &self.optional_subject_type {
            if *subject_type != rel.subject_type {
                return false;
            }
        }
        if !self.optional_subject_ids.is_empty()
            && !self.optional_subject_ids.contains(&rel.subject_id)
        {
            return false;
        }
        self.relation_filter.matches(&rel.subject_relation)
    }
}

/// Predicate over the subject-relation part of a relationship.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectRelationFilter {
    /// Match the ellipsis subject relation.
    pub include_ellipsis: bool,
    /// Match this specific named relation.
    pub non_ellipsis_relation: Option<String>,
    /// Match every named relation and never the ellipsis. Overrides the
    /// other fields.
    pub only_non_ellipsis: bool,
}

impl SubjectRelationFilter {
    pub fn ellipsis() -> Self {
        Self { include_ellipsis: true, ..Default::default() }
    }

    pub fn relation(relation: impl Into<String>) -> Self {
        Self { non_ellipsis_relation: Some(relation.into()), ..Default::default() }
    }

    pub fn any_non_ellipsis() -> Self {
        Self { only_non_ellipsis: true, ..Default::default() }
    }

    pub fn matches(&self, subject_relation: &str) -> bool {
        if self.only_non_ellipsis {
            return subject_relation != ELLIPSIS;
        }

        let mut relations: Vec<&str> = Vec::with_capacity(2);
        if self.include_ellipsis {
            relations.push(ELLIPSIS);
        }
        if let Some(relation) = &self.non_ellipsis_relation {
            relations.push(relation);
        }

        relations.is_empty() || relations.contains(&subject_relation)
    }
}

/// A filter over stored relationships addressed from the subject side,
/// used by reverse queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectsFilter {
    pub subject_type: String,
    pub optional_subject_ids: Vec<String>,
    pub relation_filter: SubjectRelationFilter,
}

impl SubjectsFilter {
    pub fn for_subject_type(subject_type: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            optional_subject_ids: Vec::new(),
            relation_filter: SubjectRelationFilter::default(),
        }
    }

    pub fn with_subject_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_subject_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relation_filter(mut self, relation_filter: SubjectRelationFilter) -> Self {
        self.relation_filter = relation_filter;
        self
    }

    pub fn as_selector(&self) -> SubjectsSelector {
        SubjectsSelector {
            optional_subject_type: Some(self.subject_type.clone()),
            optional_subject_ids: self.optional_subject_ids.clone(),
            relation_filter: self.relation_filter.clone(),
        }
    }
}

/// The sort key for [`SortOrder::ByResource`].
pub(crate) fn by_resource_key(rel: &Relationship) -> (&str, &str, &str, &str, &str, &str) {
    (
        &rel.resource_type,
        &rel.resource_id,
        &rel.relation,
        &rel.subject_type,
        &rel.subject_id,
        &rel.subject_relation,
    )
}

#[cfg(test)]
mod tests {
    use lattice_types::CaveatReference;

    use super::*;

    fn rel(resource_id: &str, subject_id: &str) -> Relationship {
        Relationship::new("document", resource_id, "viewer", "user", subject_id)
    }

    #[test]
    fn filter_matches_by_parts() {
        let filter = RelationshipsFilter::for_resource_type("document")
            .with_relation("viewer")
            .with_resource_ids(["readme"]);
        assert!(filter.matches(&rel("readme", "alice")));
        assert!(!filter.matches(&rel("other", "alice")));
        assert!(!filter.matches(&Relationship::new("folder", "readme", "viewer", "user", "a")));
    }

    #[test]
    fn caveat_name_filter() {
        let filter = RelationshipsFilter::default();
        let mut caveat_filter = filter.clone();
        caveat_filter.optional_caveat_name = Some("has_age".to_string());

        let plain = rel("readme", "alice");
        let caveated = plain.clone().with_caveat(CaveatReference::named("has_age"));

        assert!(filter.matches(&plain));
        assert!(!caveat_filter.matches(&plain));
        assert!(caveat_filter.matches(&caveated));
    }

    #[test]
    fn subject_relation_filter_rules() {
        assert!(SubjectRelationFilter::ellipsis().matches(ELLIPSIS));
        assert!(!SubjectRelationFilter::ellipsis().matches("member"));

        assert!(SubjectRelationFilter::relation("member").matches("member"));
        assert!(!SubjectRelationFilter::relation("member").matches(ELLIPSIS));

        assert!(SubjectRelationFilter::any_non_ellipsis().matches("member"));
        assert!(!SubjectRelationFilter::any_non_ellipsis().matches(ELLIPSIS));

        // No constraint matches everything.
        assert!(SubjectRelationFilter::default().matches(ELLIPSIS));
        assert!(SubjectRelationFilter::default().matches("member"));
    }

    #[test]
    fn selectors_are_disjunctive() {
        let filter = RelationshipsFilter::default()
            .with_subjects_selector(
                SubjectsSelector::for_subject_type("user").with_subject_ids(["alice"]),
            )
            .with_subjects_selector(
                SubjectsSelector::default()
                    .with_relation_filter(SubjectRelationFilter::any_non_ellipsis()),
            );

        assert!(filter.matches(&rel("readme", "alice")));
        assert!(!filter.matches(&rel("readme", "bob")));

        let userset = Relationship::new("document", "readme", "viewer", "group", "eng")
            .with_subject_relation("member");
        assert!(filter.matches(&userset));
    }

    #[test]
    fn cursor_requires_sorting() {
        let opts = QueryOptions {
            after: Some(rel("readme", "alice")),
            sort: SortOrder::Unsorted,
            limit: None,
        };
        assert!(matches!(opts.validate(), Err(StoreError::CursorsWithoutSorting)));

        let sorted = QueryOptions {
            after: Some(rel("readme", "alice")),
            sort: SortOrder::ByResource,
            limit: None,
        };
        assert!(sorted.validate().is_ok());
    }
}
