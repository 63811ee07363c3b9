//! Membership algebra.
//!
//! Union, intersection, and exclusion over check results. Definite results
//! dominate; conditional results compose symbolically so that the caveat
//! expression handed to the caller is reproducible for a given input
//! order.

use lattice_dispatch::{CheckResultsMap, Membership};
use lattice_types::CaveatExpression;

/// Union of two memberships: any definite member wins, conditionals
/// disjoin.
pub fn union(a: Membership, b: Membership) -> Membership {
    match (a, b) {
        (Membership::Member, _) | (_, Membership::Member) => Membership::Member,
        (Membership::NotMember, other) => other,
        (other, Membership::NotMember) => other,
        (Membership::Conditional(left), Membership::Conditional(right)) => {
            Membership::Conditional(CaveatExpression::or(vec![left, right]))
        }
    }
}

/// Intersection of two memberships: any definite non-member wins,
/// conditionals conjoin.
pub fn intersect(a: Membership, b: Membership) -> Membership {
    match (a, b) {
        (Membership::NotMember, _) | (_, Membership::NotMember) => Membership::NotMember,
        (Membership::Member, other) => other,
        (other, Membership::Member) => other,
        (Membership::Conditional(left), Membership::Conditional(right)) => {
            Membership::Conditional(CaveatExpression::and(vec![left, right]))
        }
    }
}

/// Exclusion: membership in `base` minus membership in `subtract`.
pub fn exclude(base: Membership, subtract: Membership) -> Membership {
    match (base, subtract) {
        (Membership::NotMember, _) => Membership::NotMember,
        (_, Membership::Member) => Membership::NotMember,
        (Membership::Member, Membership::NotMember) => Membership::Member,
        (Membership::Member, Membership::Conditional(sub)) => {
            Membership::Conditional(CaveatExpression::negated(sub))
        }
        (Membership::Conditional(base), Membership::NotMember) => {
            Membership::Conditional(base)
        }
        (Membership::Conditional(base), Membership::Conditional(sub)) => {
            Membership::Conditional(CaveatExpression::and(vec![
                base,
                CaveatExpression::negated(sub),
            ]))
        }
    }
}

/// Union result maps across branches. Absent entries mean not-member and
/// definite not-members are never stored.
pub fn union_maps(maps: Vec<CheckResultsMap>) -> CheckResultsMap {
    let mut combined = CheckResultsMap::new();
    for map in maps {
        for (resource_id, membership) in map {
            if matches!(membership, Membership::NotMember) {
                continue;
            }
            match combined.remove(&resource_id) {
                Some(existing) => {
                    combined.insert(resource_id, union(existing, membership));
                }
                None => {
                    combined.insert(resource_id, membership);
                }
            }
        }
    }
    combined
}

/// Intersect result maps across branches for the given resource ids. An
/// id missing from any branch is not a member.
pub fn intersect_maps(maps: Vec<CheckResultsMap>, resource_ids: &[String]) -> CheckResultsMap {
    let mut combined = CheckResultsMap::new();
    if maps.is_empty() {
        return combined;
    }

    'ids: for resource_id in resource_ids {
        let mut result: Option<Membership> = None;
        for map in &maps {
            let membership = match map.get(resource_id) {
                Some(m) if !matches!(m, Membership::NotMember) => m.clone(),
                _ => continue 'ids,
            };
            result = Some(match result {
                Some(existing) => intersect(existing, membership),
                None => membership,
            });
        }
        if let Some(membership) = result {
            if !matches!(membership, Membership::NotMember) {
                combined.insert(resource_id.clone(), membership);
            }
        }
    }
    combined
}

/// Exclude the subtrahend map from the base map.
pub fn exclude_maps(base: CheckResultsMap, subtract: &CheckResultsMap) -> CheckResultsMap {
    let mut combined = CheckResultsMap::new();
    for (resource_id, membership) in base {
        let sub = subtract.get(&resource_id).cloned().unwrap_or(Membership::NotMember);
        let result = exclude(membership, sub);
        if !matches!(result, Membership::NotMember) {
            combined.insert(resource_id, result);
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use lattice_types::{CaveatOp, ContextualizedCaveat};

    use super::*;

    fn conditional(name: &str) -> Membership {
        Membership::Conditional(CaveatExpression::Leaf(ContextualizedCaveat {
            caveat_name: name.to_string(),
            context: serde_json::Map::new(),
            missing_parameters: vec![],
        }))
    }

    #[test]
    fn union_prefers_definite_membership() {
        assert_eq!(union(Membership::Member, Membership::NotMember), Membership::Member);
        assert_eq!(union(Membership::NotMember, Membership::Member), Membership::Member);
        assert_eq!(union(Membership::Member, conditional("c")), Membership::Member);
        assert_eq!(union(Membership::NotMember, Membership::NotMember), Membership::NotMember);
    }

    #[test]
    fn union_of_conditionals_disjoins() {
        match union(conditional("a"), conditional("b")) {
            Membership::Conditional(CaveatExpression::Operation { op, children }) => {
                assert_eq!(op, CaveatOp::Or);
                assert_eq!(children.len(), 2);
            }
            other => panic!("expected disjunction, got {other:?}"),
        }
    }

    #[test]
    fn intersection_prefers_definite_absence() {
        assert_eq!(intersect(Membership::Member, Membership::NotMember), Membership::NotMember);
        assert_eq!(intersect(conditional("c"), Membership::NotMember), Membership::NotMember);
        assert_eq!(intersect(Membership::Member, Membership::Member), Membership::Member);
    }

    #[test]
    fn exclusion_table() {
        assert_eq!(exclude(Membership::Member, Membership::NotMember), Membership::Member);
        assert_eq!(exclude(Membership::Member, Membership::Member), Membership::NotMember);
        assert_eq!(exclude(Membership::NotMember, Membership::NotMember), Membership::NotMember);

        // Conditional subtrahend negates.
        match exclude(Membership::Member, conditional("banned")) {
            Membership::Conditional(CaveatExpression::Operation { op, .. }) => {
                assert_eq!(op, CaveatOp::Not)
            }
            other => panic!("expected negation, got {other:?}"),
        }

        // Conditional base with conditional subtrahend conjoins with the
        // negated subtrahend.
        match exclude(conditional("viewer"), conditional("banned")) {
            Membership::Conditional(CaveatExpression::Operation { op, children }) => {
                assert_eq!(op, CaveatOp::And);
                assert_eq!(children.len(), 2);
            }
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn map_union_merges_branches() {
        let mut left = CheckResultsMap::new();
        left.insert("a".to_string(), Membership::Member);
        let mut right = CheckResultsMap::new();
        right.insert("b".to_string(), Membership::Member);
        right.insert("a".to_string(), conditional("c"));

        let combined = union_maps(vec![left, right]);
        assert_eq!(combined.get("a"), Some(&Membership::Member));
        assert_eq!(combined.get("b"), Some(&Membership::Member));
    }

    #[test]
    fn map_intersection_requires_every_branch() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let mut left = CheckResultsMap::new();
        left.insert("a".to_string(), Membership::Member);
        left.insert("b".to_string(), Membership::Member);
        let mut right = CheckResultsMap::new();
        right.insert("a".to_string(), Membership::Member);

        let combined = intersect_maps(vec![left, right], &ids);
        assert_eq!(combined.get("a"), Some(&Membership::Member));
        assert_eq!(combined.get("b"), None);
    }

    #[test]
    fn empty_intersection_is_empty() {
        assert!(intersect_maps(vec![], &["a".to_string()]).is_empty());
    }

    #[test]
    fn map_exclusion_drops_subtracted_members() {
        let mut base = CheckResultsMap::new();
        base.insert("a".to_string(), Membership::Member);
        base.insert("b".to_string(), Membership::Member);
        let mut subtract = CheckResultsMap::new();
        subtract.insert("a".to_string(), Membership::Member);

        let combined = exclude_maps(base, &subtract);
        assert_eq!(combined.get("a"), None);
        assert_eq!(combined.get("b"), Some(&Membership::Member));
    }
}
