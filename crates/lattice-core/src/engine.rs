//! The resolution engine.
//!
//! One engine serves a node. It reads relationships through snapshot
//! readers at the request's revision and hands every sub-question to the
//! dispatcher, which may resolve it locally or forward it to the ring
//! owner.

use std::sync::Arc;
use std::sync::OnceLock;

use lattice_dispatch::{CheckResultsMap, Dispatcher, Membership, ResponseMeta};
use lattice_store::{Datastore, Reader};
use lattice_types::{CaveatExpression, CaveatReference, Relation, RelationRef, Revision};

use crate::caveats::{evaluate_caveat, CaveatOutcome};
use crate::concurrency::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY_LIMIT};
use crate::{EngineError, Result};

/// Intermediate accumulation of one resolution step: the per-resource
/// results plus the dispatch accounting incurred beneath it.
#[derive(Debug, Default, Clone)]
pub(crate) struct CheckPartial {
    pub results: CheckResultsMap,
    pub meta: ResponseMeta,
}

pub struct Engine {
    datastore: Arc<dyn Datastore>,
    /// Set once after construction; sub-questions re-enter through it so
    /// that a cluster node re-shards its own recursion.
    redispatcher: OnceLock<Arc<dyn Dispatcher>>,
    pub(crate) concurrency_limit: usize,
    pub(crate) chunk_size: usize,
}

impl Engine {
    pub fn new(datastore: Arc<dyn Datastore>, concurrency_limit: usize) -> Self {
        Self {
            datastore,
            redispatcher: OnceLock::new(),
            concurrency_limit: if concurrency_limit == 0 {
                DEFAULT_CONCURRENCY_LIMIT
            } else {
                concurrency_limit
            },
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Wire the dispatcher used for sub-questions. Must be called exactly
    /// once during startup; later calls are ignored.
    pub fn set_redispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        let _ = self.redispatcher.set(dispatcher);
    }

    pub(crate) fn dispatcher(&self) -> Result<Arc<dyn Dispatcher>> {
        self.redispatcher
            .get()
            .cloned()
            .ok_or_else(|| EngineError::Evaluation("engine has no dispatcher wired".to_string()))
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub(crate) fn reader_at(&self, revision: &Revision) -> Box<dyn Reader> {
        self.datastore.snapshot_reader(revision)
    }

    pub(crate) async fn load_relation(
        &self,
        reader: &dyn Reader,
        relation_ref: &RelationRef,
    ) -> Result<Relation> {
        let namespace = reader.read_namespace_by_name(&relation_ref.object_type).await?;
        namespace
            .definition
            .relation(&relation_ref.relation)
            .cloned()
            .ok_or_else(|| EngineError::RelationNotFound {
                object_type: relation_ref.object_type.clone(),
                relation: relation_ref.relation.clone(),
            })
    }

    /// The membership contributed by a relationship row's caveat, given
    /// the request context.
    pub(crate) async fn row_caveat_membership(
        &self,
        reader: &dyn Reader,
        reference: &CaveatReference,
        request_context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Membership> {
        let caveat = reader.read_caveat_by_name(&reference.caveat_name).await?;
        Ok(match evaluate_caveat(&caveat.definition, &reference.context, request_context)? {
            CaveatOutcome::True => Membership::Member,
            CaveatOutcome::False => Membership::NotMember,
            CaveatOutcome::Partial(partial) => {
                Membership::Conditional(CaveatExpression::Leaf(partial))
            }
        })
    }

    /// Accounting for the resolution step itself, before any children.
    pub(crate) fn base_meta() -> ResponseMeta {
        ResponseMeta { dispatch_count: 1, cached_dispatch_count: 0, depth_required: 1 }
    }
}
