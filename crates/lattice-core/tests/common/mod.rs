//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use lattice_core::{LocalDispatcher, PermissionService};
use lattice_dispatch::Dispatcher;
use lattice_store::{Datastore, MemoryDatastore};
use lattice_types::{
    AllowedSubject, CaveatDefinition, CaveatExpr, CaveatParamType, CaveatValue, CmpOp,
    ObjectDefinition, Relation, RewriteNode, SchemaDefinition,
};

/// A single-node service over a fresh in-memory datastore.
pub fn test_service() -> (Arc<MemoryDatastore>, PermissionService) {
    let datastore = Arc::new(MemoryDatastore::new());
    let dispatcher = LocalDispatcher::new_local_only(
        Arc::clone(&datastore) as Arc<dyn Datastore>,
        10,
    );
    let service = PermissionService::new(
        Arc::clone(&datastore) as Arc<dyn Datastore>,
        dispatcher as Arc<dyn Dispatcher>,
    );
    (datastore, service)
}

/// `definition user {}` plus a resource with `permission view = viewer`.
pub fn simple_schema() -> SchemaDefinition {
    SchemaDefinition::new(vec![
        ObjectDefinition::new("user", vec![]),
        ObjectDefinition::new(
            "resource",
            vec![
                Relation::direct("viewer", vec![AllowedSubject::direct("user")]),
                Relation::permission(
                    "view",
                    RewriteNode::ComputedUserset { relation: "viewer".to_string() },
                ),
            ],
        ),
    ])
}

/// The simple schema with `permission view = viewer - banned`.
pub fn exclusion_schema() -> SchemaDefinition {
    SchemaDefinition::new(vec![
        ObjectDefinition::new("user", vec![]),
        ObjectDefinition::new(
            "resource",
            vec![
                Relation::direct("viewer", vec![AllowedSubject::direct("user")]),
                Relation::direct("banned", vec![AllowedSubject::direct("user")]),
                Relation::permission(
                    "view",
                    RewriteNode::Exclusion {
                        base: Box::new(RewriteNode::ComputedUserset {
                            relation: "viewer".to_string(),
                        }),
                        subtract: Box::new(RewriteNode::ComputedUserset {
                            relation: "banned".to_string(),
                        }),
                    },
                ),
            ],
        ),
    ])
}

/// Groups whose members may be nested groups, with a resource viewable by
/// a group's members.
pub fn group_schema() -> SchemaDefinition {
    SchemaDefinition::new(vec![
        ObjectDefinition::new("user", vec![]),
        ObjectDefinition::new(
            "group",
            vec![Relation::direct(
                "member",
                vec![
                    AllowedSubject::direct("user"),
                    AllowedSubject::userset("group", "member"),
                ],
            )],
        ),
        ObjectDefinition::new(
            "resource",
            vec![
                Relation::direct(
                    "viewer",
                    vec![
                        AllowedSubject::direct("user"),
                        AllowedSubject::userset("group", "member"),
                        AllowedSubject::userset("resource", "viewer"),
                    ],
                ),
                Relation::permission(
                    "view",
                    RewriteNode::ComputedUserset { relation: "viewer".to_string() },
                ),
            ],
        ),
    ])
}

/// Folders containing documents through a tuple-to-userset arm.
pub fn folder_schema() -> SchemaDefinition {
    SchemaDefinition::new(vec![
        ObjectDefinition::new("user", vec![]),
        ObjectDefinition::new(
            "folder",
            vec![
                Relation::direct("viewer", vec![AllowedSubject::direct("user")]),
                Relation::permission(
                    "view",
                    RewriteNode::ComputedUserset { relation: "viewer".to_string() },
                ),
            ],
        ),
        ObjectDefinition::new(
            "document",
            vec![
                Relation::direct("parent", vec![AllowedSubject::direct("folder")]),
                Relation::direct("viewer", vec![AllowedSubject::direct("user")]),
                Relation::direct("banned", vec![AllowedSubject::direct("user")]),
                Relation::permission(
                    "view",
                    RewriteNode::Exclusion {
                        base: Box::new(RewriteNode::Union(vec![
                            RewriteNode::ComputedUserset { relation: "viewer".to_string() },
                            RewriteNode::TupleToUserset {
                                tupleset: "parent".to_string(),
                                computed: "view".to_string(),
                            },
                        ])),
                        subtract: Box::new(RewriteNode::ComputedUserset {
                            relation: "banned".to_string(),
                        }),
                    },
                ),
            ],
        ),
    ])
}

/// `caveat has_age(n int) { n >= 18 }` attached to viewers.
pub fn caveat_schema() -> SchemaDefinition {
    SchemaDefinition::new(vec![
        ObjectDefinition::new("user", vec![]),
        ObjectDefinition::new(
            "resource",
            vec![
                Relation::direct(
                    "viewer",
                    vec![AllowedSubject::direct("user").with_caveat("has_age")],
                ),
                Relation::permission(
                    "view",
                    RewriteNode::ComputedUserset { relation: "viewer".to_string() },
                ),
            ],
        ),
    ])
    .with_caveats(vec![CaveatDefinition::new(
        "has_age",
        vec![("n".to_string(), CaveatParamType::Int)],
        CaveatExpr::compare(
            CmpOp::Ge,
            CaveatExpr::param("n"),
            CaveatExpr::Literal(CaveatValue::Int(18)),
        ),
    )])
}
