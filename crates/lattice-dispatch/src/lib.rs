//! # Lattice Dispatch
//!
//! The cluster dispatch layer: request fingerprinting, the consistent
//! hashring that shards sub-questions across peers, the cluster dispatcher
//! with depth tracking and streaming, and the caching dispatcher.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lattice_types::{CaveatExpression, ObjectAndRelation, ObjectRef, RelationRef, Revision};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod cluster;
pub mod keys;
pub mod ring;

pub use cache::CachingDispatcher;
pub use cluster::{ClusterDispatcher, ClusterDispatcherConfig, InProcessPeers, PeerClient};
pub use keys::{DirectKeyHandler, DispatchKey, DispatchKind, KeyHandler, PrefixKeyHandler};
pub use ring::{Hashring, Member};

/// The default bound on a single dispatched call.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("max depth exceeded")]
    MaxDepthExceeded,

    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("no members available in the dispatch ring")]
    EmptyRing,

    #[error("peer {0} unavailable")]
    PeerUnavailable(String),

    #[error("resolution failed: {0}")]
    Resolution(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Resolver metadata carried on every dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverMeta {
    /// Dispatches still allowed below this point. Decremented by one per
    /// dispatch; exhaustion is the only way an over-deep request fails.
    pub depth_remaining: u32,
}

impl ResolverMeta {
    pub fn with_depth(depth_remaining: u32) -> Self {
        Self { depth_remaining }
    }

    /// Metadata for a child dispatch, one level deeper.
    pub fn descend(&self) -> Self {
        Self { depth_remaining: self.depth_remaining.saturating_sub(1) }
    }
}

/// Fails with the dedicated depth error when the request has no budget
/// left for another dispatch.
pub fn check_depth(meta: &ResolverMeta) -> Result<(), DispatchError> {
    if meta.depth_remaining == 0 {
        return Err(DispatchError::MaxDepthExceeded);
    }
    Ok(())
}

/// Usage accounting carried on every response, summed across recursive
/// calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub dispatch_count: u32,
    pub cached_dispatch_count: u32,
    /// The depth the request actually needed.
    pub depth_required: u32,
}

impl ResponseMeta {
    /// Accounting for a single resolved dispatch with no children.
    pub fn dispatched() -> Self {
        Self { dispatch_count: 1, cached_dispatch_count: 0, depth_required: 1 }
    }

    /// Accounting for a dispatch attempt that failed at the transport.
    pub fn failed_request() -> Self {
        Self { dispatch_count: 1, cached_dispatch_count: 0, depth_required: 0 }
    }

    /// Fold a dispatched child response's accounting into this one. The
    /// child ran one level deeper.
    pub fn absorb(&mut self, child: &ResponseMeta) {
        self.dispatch_count = self.dispatch_count.saturating_add(child.dispatch_count);
        self.cached_dispatch_count =
            self.cached_dispatch_count.saturating_add(child.cached_dispatch_count);
        self.depth_required = self.depth_required.max(child.depth_required.saturating_add(1));
    }

    /// Fold a same-level sibling's accounting into this one.
    pub fn merge(&mut self, sibling: &ResponseMeta) {
        self.dispatch_count = self.dispatch_count.saturating_add(sibling.dispatch_count);
        self.cached_dispatch_count =
            self.cached_dispatch_count.saturating_add(sibling.cached_dispatch_count);
        self.depth_required = self.depth_required.max(sibling.depth_required);
    }
}

/// Whether a check should stop at the first definite membership or report
/// every resource id exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultsSetting {
    RequireAllResults,
    AllowSingleResult,
}

/// The membership of a subject for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Membership {
    NotMember,
    Member,
    /// Membership conditioned on a caveat expression the caller must
    /// evaluate at the API boundary.
    Conditional(CaveatExpression),
}

impl Membership {
    pub fn is_member(&self) -> bool {
        matches!(self, Membership::Member)
    }
}

/// Per-resource-id membership results.
pub type CheckResultsMap = BTreeMap<String, Membership>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCheckRequest {
    pub resource_relation: RelationRef,
    pub resource_ids: Vec<String>,
    pub subject: ObjectAndRelation,
    /// Caller-supplied caveat context.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub results_setting: ResultsSetting,
    pub revision: Revision,
    pub metadata: ResolverMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCheckResponse {
    pub metadata: ResponseMeta,
    pub results: CheckResultsMap,
}

impl DispatchCheckResponse {
    pub fn membership_of(&self, resource_id: &str) -> &Membership {
        self.results.get(resource_id).unwrap_or(&Membership::NotMember)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchExpandRequest {
    pub resource: ObjectRef,
    pub relation: String,
    pub revision: Revision,
    pub metadata: ResolverMeta,
}

/// A tree mirroring the rewrite structure of an expanded permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandTree {
    /// The resource and relation this subtree expands.
    pub expanded: ObjectAndRelation,
    pub node: ExpandTreeNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExpandTreeNode {
    /// The direct and indirect user sets stored on this relation.
    Leaf { subjects: Vec<ObjectAndRelation> },
    Union(Vec<ExpandTree>),
    Intersection(Vec<ExpandTree>),
    Exclusion { base: Box<ExpandTree>, subtract: Box<ExpandTree> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchExpandResponse {
    pub metadata: ResponseMeta,
    pub tree: ExpandTree,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchLookupResourcesRequest {
    pub resource_relation: RelationRef,
    pub subject: ObjectAndRelation,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub limit: Option<u64>,
    pub cursor: Option<String>,
    pub revision: Revision,
    pub metadata: ResolverMeta,
}

/// One resource id found by a lookup, with its membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    pub resource_id: String,
    pub membership: Membership,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchLookupSubjectsRequest {
    pub resource: ObjectRef,
    pub relation: String,
    pub subject_type: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub revision: Revision,
    pub metadata: ResolverMeta,
}

/// One subject id found by a lookup, with its membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSubject {
    pub subject_id: String,
    pub membership: Membership,
}

/// Whether a dispatcher can currently reach its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReadyState {
    pub ready: bool,
    pub message: String,
}

/// A push stream for the streaming dispatch kinds. `publish` may block
/// under backpressure; cancellation of the consumer unblocks it with an
/// error.
#[async_trait]
pub trait DispatchStream<T: Send + 'static>: Send + Sync {
    async fn publish(&self, item: T) -> Result<(), DispatchError>;
}

/// A [`DispatchStream`] backed by a bounded channel.
pub struct ChannelStream<T> {
    tx: tokio::sync::mpsc::Sender<T>,
}

impl<T: Send + 'static> ChannelStream<T> {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<T>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl<T: Send + 'static> DispatchStream<T> for ChannelStream<T> {
    async fn publish(&self, item: T) -> Result<(), DispatchError> {
        self.tx.send(item).await.map_err(|_| DispatchError::Cancelled)
    }
}

/// The dispatcher interface consumed by the resolution engine. Every
/// sub-question of a resolution flows through one of these calls.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch_check(
        &self,
        req: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse, DispatchError>;

    async fn dispatch_expand(
        &self,
        req: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse, DispatchError>;

    async fn dispatch_lookup_resources(
        &self,
        req: DispatchLookupResourcesRequest,
        stream: &dyn DispatchStream<ResolvedResource>,
    ) -> Result<ResponseMeta, DispatchError>;

    async fn dispatch_lookup_subjects(
        &self,
        req: DispatchLookupSubjectsRequest,
        stream: &dyn DispatchStream<ResolvedSubject>,
    ) -> Result<ResponseMeta, DispatchError>;

    fn ready_state(&self) -> DispatchReadyState;
}
