//! # Lattice Core
//!
//! The permission resolution engine: a recursive evaluator that, given a
//! schema and a revision, decides Check, Expand, LookupResources, and
//! LookupSubjects by traversing relation rewrites and stored
//! relationships, dispatching every sub-question through the cluster
//! dispatcher.

use lattice_dispatch::DispatchError;
use lattice_store::StoreError;
use thiserror::Error;

pub mod caveats;
pub mod check;
pub mod concurrency;
pub mod consistency;
pub mod engine;
pub mod expand;
pub mod graph;
pub mod local;
pub mod lookup_resources;
pub mod lookup_subjects;
pub mod membership;
pub mod service;

pub use caveats::{evaluate_caveat, CaveatOutcome};
pub use consistency::{revision_for_consistency, Consistency};
pub use engine::Engine;
pub use graph::SchemaIndex;
pub use local::LocalDispatcher;
pub use service::{
    CheckPermissionRequest, CheckPermissionResponse, PermissionService, WriteSchemaResponse,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("datastore error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("relation `{relation}` not found on object type `{object_type}`")]
    RelationNotFound { object_type: String, relation: String },

    #[error("relation `{relation}` on `{object_type}` does not accept direct writes")]
    RelationNotWritable { object_type: String, relation: String },

    #[error("subject type `{subject_type}` is not allowed on `{object_type}#{relation}`")]
    SubjectTypeNotAllowed { object_type: String, relation: String, subject_type: String },

    #[error("parameter `{parameter}` is not declared by caveat `{caveat}`")]
    UnknownCaveatParameter { caveat: String, parameter: String },

    #[error("parameter `{parameter}` has the wrong type for caveat `{caveat}`")]
    CaveatTypeMismatch { caveat: String, parameter: String },

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),
}

impl From<EngineError> for DispatchError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Dispatch(inner) => inner,
            other => DispatchError::Resolution(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
