//! End-to-end permission scenarios over a single-node service.

mod common;

use common::*;
use lattice_core::service::CheckPermissionRequest;
use lattice_core::{Consistency, EngineError};
use lattice_dispatch::{DispatchError, Membership};
use lattice_store::{QueryOptions, RelationshipsFilter};
use lattice_types::{
    CaveatExpression, CaveatReference, ObjectAndRelation, ObjectRef, Relationship,
    RelationshipUpdate,
};

fn check_req(resource_id: &str, permission: &str, subject_id: &str) -> CheckPermissionRequest {
    CheckPermissionRequest {
        consistency: Consistency::FullyConsistent,
        resource: ObjectRef::new("resource", resource_id),
        permission: permission.to_string(),
        subject: ObjectAndRelation::ellipsis("user", subject_id),
        context: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn direct_viewer_grants_view() {
    let (_ds, service) = test_service();
    service.write_schema(simple_schema()).await.unwrap();
    service
        .write_relationships(vec![RelationshipUpdate::create(Relationship::new(
            "resource", "a", "viewer", "user", "u",
        ))])
        .await
        .unwrap();

    let granted = service.check_permission(check_req("a", "view", "u")).await.unwrap();
    assert_eq!(granted.membership, Membership::Member);

    let denied = service.check_permission(check_req("a", "view", "v")).await.unwrap();
    assert_eq!(denied.membership, Membership::NotMember);
}

#[tokio::test]
async fn exclusion_removes_banned_viewers() {
    let (_ds, service) = test_service();
    service.write_schema(exclusion_schema()).await.unwrap();
    service
        .write_relationships(vec![
            RelationshipUpdate::create(Relationship::new("resource", "a", "viewer", "user", "u")),
            RelationshipUpdate::create(Relationship::new("resource", "a", "banned", "user", "u")),
            RelationshipUpdate::create(Relationship::new("resource", "a", "viewer", "user", "w")),
        ])
        .await
        .unwrap();

    let banned = service.check_permission(check_req("a", "view", "u")).await.unwrap();
    assert_eq!(banned.membership, Membership::NotMember);

    let allowed = service.check_permission(check_req("a", "view", "w")).await.unwrap();
    assert_eq!(allowed.membership, Membership::Member);
}

#[tokio::test]
async fn self_recursive_relation_exhausts_depth() {
    let (_ds, service) = test_service();
    service.write_schema(group_schema()).await.unwrap();
    service
        .write_relationships(vec![RelationshipUpdate::create(
            Relationship::new("resource", "x", "viewer", "resource", "x")
                .with_subject_relation("viewer"),
        )])
        .await
        .unwrap();

    let err = service.check_permission(check_req("x", "viewer", "u")).await.unwrap_err();
    assert!(
        matches!(err, EngineError::Dispatch(DispatchError::MaxDepthExceeded)),
        "expected max depth exceeded, got {err:?}"
    );
}

#[tokio::test]
async fn nested_group_membership_resolves() {
    let (_ds, service) = test_service();
    service.write_schema(group_schema()).await.unwrap();
    service
        .write_relationships(vec![
            RelationshipUpdate::create(Relationship::new("group", "eng", "member", "user", "u")),
            RelationshipUpdate::create(
                Relationship::new("group", "all", "member", "group", "eng")
                    .with_subject_relation("member"),
            ),
            RelationshipUpdate::create(
                Relationship::new("resource", "wiki", "viewer", "group", "all")
                    .with_subject_relation("member"),
            ),
        ])
        .await
        .unwrap();

    let resp = service.check_permission(check_req("wiki", "view", "u")).await.unwrap();
    assert_eq!(resp.membership, Membership::Member);
    // Two userset hops plus the computed-userset hop were dispatched.
    assert!(resp.metadata.dispatch_count >= 3);
    assert!(resp.metadata.depth_required >= 3);

    let other = service.check_permission(check_req("wiki", "view", "stranger")).await.unwrap();
    assert_eq!(other.membership, Membership::NotMember);
}

#[tokio::test]
async fn depth_budget_is_exact() {
    // user -> g0#member -> g1#member -> resource viewer. Resolving needs
    // the root plus three dispatched hops.
    let (_ds, service) = test_service();
    service.write_schema(group_schema()).await.unwrap();
    service
        .write_relationships(vec![
            RelationshipUpdate::create(Relationship::new("group", "g0", "member", "user", "u")),
            RelationshipUpdate::create(
                Relationship::new("group", "g1", "member", "group", "g0")
                    .with_subject_relation("member"),
            ),
            RelationshipUpdate::create(
                Relationship::new("resource", "r", "viewer", "group", "g1")
                    .with_subject_relation("member"),
            ),
        ])
        .await
        .unwrap();

    let enough = service.check_permission(check_req("r", "viewer", "u")).await.unwrap();
    assert_eq!(enough.membership, Membership::Member);
    let required = enough.metadata.depth_required;

    let (_ds, shallow_service) = test_service();
    let shallow_service = shallow_service.with_max_depth(required - 1);
    shallow_service.write_schema(group_schema()).await.unwrap();
    shallow_service
        .write_relationships(vec![
            RelationshipUpdate::create(Relationship::new("group", "g0", "member", "user", "u")),
            RelationshipUpdate::create(
                Relationship::new("group", "g1", "member", "group", "g0")
                    .with_subject_relation("member"),
            ),
            RelationshipUpdate::create(
                Relationship::new("resource", "r", "viewer", "group", "g1")
                    .with_subject_relation("member"),
            ),
        ])
        .await
        .unwrap();

    let err =
        shallow_service.check_permission(check_req("r", "viewer", "u")).await.unwrap_err();
    assert!(matches!(err, EngineError::Dispatch(DispatchError::MaxDepthExceeded)));
}

#[tokio::test]
async fn bulk_writes_and_snapshot_reads() {
    let (_ds, service) = test_service();
    service.write_schema(simple_schema()).await.unwrap();

    let creates: Vec<_> = (0..1000)
        .map(|i| {
            RelationshipUpdate::create(Relationship::new(
                "resource",
                "r",
                "viewer",
                "user",
                format!("u{i}"),
            ))
        })
        .collect();
    let write_revision = service.write_relationships(creates).await.unwrap();

    let deleted = service
        .delete_relationships(
            RelationshipsFilter::for_resource_type("resource").with_relation("viewer"),
            Some(500),
        )
        .await
        .unwrap();
    assert_eq!(deleted.deleted, 500);
    assert!(deleted.limit_reached);

    let at_head = service
        .read_relationships(
            Consistency::FullyConsistent,
            RelationshipsFilter::for_resource_type("resource"),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(at_head.len(), 500);

    let before_delete = service
        .read_relationships(
            Consistency::AtExactSnapshot(write_revision),
            RelationshipsFilter::for_resource_type("resource"),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(before_delete.len(), 1000);
}

#[tokio::test]
async fn caveated_viewer_follows_the_context() {
    let (_ds, service) = test_service();
    service.write_schema(caveat_schema()).await.unwrap();
    service
        .write_relationships(vec![RelationshipUpdate::create(
            Relationship::new("resource", "a", "viewer", "user", "u")
                .with_caveat(CaveatReference::named("has_age")),
        )])
        .await
        .unwrap();

    let mut adult = check_req("a", "view", "u");
    adult.context.insert("n".to_string(), serde_json::json!(21));
    assert_eq!(
        service.check_permission(adult).await.unwrap().membership,
        Membership::Member
    );

    let mut minor = check_req("a", "view", "u");
    minor.context.insert("n".to_string(), serde_json::json!(5));
    assert_eq!(
        service.check_permission(minor).await.unwrap().membership,
        Membership::NotMember
    );

    let missing = service.check_permission(check_req("a", "view", "u")).await.unwrap();
    match missing.membership {
        Membership::Conditional(CaveatExpression::Leaf(partial)) => {
            assert_eq!(partial.caveat_name, "has_age");
            assert_eq!(partial.missing_parameters, vec!["n".to_string()]);
        }
        other => panic!("expected a conditional membership, got {other:?}"),
    }
}

#[tokio::test]
async fn writes_validate_against_the_schema() {
    let (_ds, service) = test_service();
    service.write_schema(simple_schema()).await.unwrap();

    // Unknown relation.
    let err = service
        .write_relationships(vec![RelationshipUpdate::create(Relationship::new(
            "resource", "a", "owner", "user", "u",
        ))])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RelationNotFound { .. }));

    // Permissions accept no direct writes.
    let err = service
        .write_relationships(vec![RelationshipUpdate::create(Relationship::new(
            "resource", "a", "view", "user", "u",
        ))])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RelationNotWritable { .. }));

    // Disallowed subject type.
    let err = service
        .write_relationships(vec![RelationshipUpdate::create(Relationship::new(
            "resource", "a", "viewer", "resource", "b",
        ))])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SubjectTypeNotAllowed { .. }));
}

#[tokio::test]
async fn watch_observes_committed_writes() {
    let (ds, service) = test_service();
    service.write_schema(simple_schema()).await.unwrap();

    let start = lattice_store::Datastore::head_revision(ds.as_ref()).await.unwrap();
    let mut stream = service.watch(&start).await.unwrap();

    service
        .write_relationships(vec![RelationshipUpdate::create(Relationship::new(
            "resource", "a", "viewer", "user", "u",
        ))])
        .await
        .unwrap();

    let changes = stream.next().await.unwrap().unwrap();
    assert_eq!(changes.changes.len(), 1);
    assert_eq!(changes.changes[0].relationship.subject_id, "u");
}
