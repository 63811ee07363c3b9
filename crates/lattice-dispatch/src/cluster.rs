//! The cluster dispatcher.
//!
//! For every dispatch: verify the remaining depth, compute the dispatch
//! key, look up the owning peer on the ring, and either resolve locally or
//! forward under the per-dispatch overall deadline. Streaming kinds
//! propagate published items one at a time; a peer error stops the stream
//! and surfaces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::keys::{DispatchKey, KeyHandler};
use crate::ring::{Hashring, Member};
use crate::{
    check_depth, DispatchCheckRequest, DispatchCheckResponse, DispatchError,
    DispatchExpandRequest, DispatchExpandResponse, DispatchLookupResourcesRequest,
    DispatchLookupSubjectsRequest, DispatchReadyState, DispatchStream, Dispatcher, ResolvedResource,
    ResolvedSubject, ResponseMeta, DEFAULT_DISPATCH_TIMEOUT,
};

/// The transport used to reach a peer. The dispatch key rides along as a
/// routing hint.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn check(
        &self,
        peer: &Member,
        key: &DispatchKey,
        req: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse, DispatchError>;

    async fn expand(
        &self,
        peer: &Member,
        key: &DispatchKey,
        req: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse, DispatchError>;

    async fn lookup_resources(
        &self,
        peer: &Member,
        key: &DispatchKey,
        req: DispatchLookupResourcesRequest,
        stream: &dyn DispatchStream<ResolvedResource>,
    ) -> Result<ResponseMeta, DispatchError>;

    async fn lookup_subjects(
        &self,
        peer: &Member,
        key: &DispatchKey,
        req: DispatchLookupSubjectsRequest,
        stream: &dyn DispatchStream<ResolvedSubject>,
    ) -> Result<ResponseMeta, DispatchError>;
}

pub struct ClusterDispatcherConfig {
    /// Generates ring keys per dispatch. Defaults to the direct handler.
    pub key_handler: Arc<dyn KeyHandler>,
    /// Maximum duration of one dispatched request.
    pub dispatch_overall_timeout: Duration,
    /// This node's member id on the ring.
    pub local_member_id: String,
}

impl ClusterDispatcherConfig {
    pub fn new(local_member_id: impl Into<String>) -> Self {
        Self {
            key_handler: Arc::new(crate::keys::DirectKeyHandler),
            dispatch_overall_timeout: DEFAULT_DISPATCH_TIMEOUT,
            local_member_id: local_member_id.into(),
        }
    }

    pub fn with_key_handler(mut self, key_handler: Arc<dyn KeyHandler>) -> Self {
        self.key_handler = key_handler;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_overall_timeout = timeout;
        self
    }
}

/// Routes dispatches across the cluster by ring ownership.
pub struct ClusterDispatcher {
    local: Arc<dyn Dispatcher>,
    peers: Arc<dyn PeerClient>,
    ring: Arc<Hashring>,
    config: ClusterDispatcherConfig,
    /// Forward attempts that failed at the transport. Each counts as one
    /// failed dispatch so usage accounting stays exact.
    failed_dispatches: std::sync::atomic::AtomicU64,
}

impl ClusterDispatcher {
    pub fn new(
        local: Arc<dyn Dispatcher>,
        peers: Arc<dyn PeerClient>,
        ring: Arc<Hashring>,
        config: ClusterDispatcherConfig,
    ) -> Self {
        Self {
            local,
            peers,
            ring,
            config,
            failed_dispatches: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn failed_dispatch_count(&self) -> u64 {
        self.failed_dispatches.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn owner_for(&self, key: &DispatchKey) -> Result<Arc<Member>, DispatchError> {
        self.ring.find_owner(key.routing_hash).ok_or(DispatchError::EmptyRing)
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, DispatchError>>,
    ) -> Result<T, DispatchError> {
        let timeout = self.config.dispatch_overall_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        }
    }

    /// Record a failed forward: one dispatch was spent with nothing to
    /// show for it.
    fn record_failed(&self, err: DispatchError) -> DispatchError {
        let meta = ResponseMeta::failed_request();
        self.failed_dispatches
            .fetch_add(meta.dispatch_count as u64, std::sync::atomic::Ordering::Relaxed);
        err
    }
}

#[async_trait]
impl Dispatcher for ClusterDispatcher {
    #[instrument(skip_all, fields(resource = %req.resource_relation))]
    async fn dispatch_check(
        &self,
        req: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse, DispatchError> {
        check_depth(&req.metadata)?;

        let key = self.config.key_handler.check_key(&req);
        let owner = self.owner_for(&key)?;

        if owner.id == self.config.local_member_id {
            return self.with_deadline(self.local.dispatch_check(req)).await;
        }

        debug!(peer = %owner.id, "forwarding check to ring owner");
        let mut resp = self
            .with_deadline(self.peers.check(&owner, &key, req))
            .await
            .map_err(|err| self.record_failed(err))?;
        resp.metadata.dispatch_count = resp.metadata.dispatch_count.saturating_add(1);
        Ok(resp)
    }

    #[instrument(skip_all, fields(resource = %req.resource))]
    async fn dispatch_expand(
        &self,
        req: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse, DispatchError> {
        check_depth(&req.metadata)?;

        let key = self.config.key_handler.expand_key(&req);
        let owner = self.owner_for(&key)?;

        if owner.id == self.config.local_member_id {
            return self.with_deadline(self.local.dispatch_expand(req)).await;
        }

        debug!(peer = %owner.id, "forwarding expand to ring owner");
        let mut resp = self
            .with_deadline(self.peers.expand(&owner, &key, req))
            .await
            .map_err(|err| self.record_failed(err))?;
        resp.metadata.dispatch_count = resp.metadata.dispatch_count.saturating_add(1);
        Ok(resp)
    }

    #[instrument(skip_all, fields(resource = %req.resource_relation))]
    async fn dispatch_lookup_resources(
        &self,
        req: DispatchLookupResourcesRequest,
        stream: &dyn DispatchStream<ResolvedResource>,
    ) -> Result<ResponseMeta, DispatchError> {
        check_depth(&req.metadata)?;

        let key = self.config.key_handler.lookup_resources_key(&req);
        let owner = self.owner_for(&key)?;

        if owner.id == self.config.local_member_id {
            return self.with_deadline(self.local.dispatch_lookup_resources(req, stream)).await;
        }

        debug!(peer = %owner.id, "forwarding lookup-resources to ring owner");
        let mut meta = self
            .with_deadline(self.peers.lookup_resources(&owner, &key, req, stream))
            .await
            .map_err(|err| self.record_failed(err))?;
        meta.dispatch_count = meta.dispatch_count.saturating_add(1);
        Ok(meta)
    }

    #[instrument(skip_all, fields(resource = %req.resource))]
    async fn dispatch_lookup_subjects(
        &self,
        req: DispatchLookupSubjectsRequest,
        stream: &dyn DispatchStream<ResolvedSubject>,
    ) -> Result<ResponseMeta, DispatchError> {
        check_depth(&req.metadata)?;

        let key = self.config.key_handler.lookup_subjects_key(&req);
        let owner = self.owner_for(&key)?;

        if owner.id == self.config.local_member_id {
            return self.with_deadline(self.local.dispatch_lookup_subjects(req, stream)).await;
        }

        debug!(peer = %owner.id, "forwarding lookup-subjects to ring owner");
        let mut meta = self
            .with_deadline(self.peers.lookup_subjects(&owner, &key, req, stream))
            .await
            .map_err(|err| self.record_failed(err))?;
        meta.dispatch_count = meta.dispatch_count.saturating_add(1);
        Ok(meta)
    }

    fn ready_state(&self) -> DispatchReadyState {
        if self.ring.is_empty() {
            return DispatchReadyState {
                ready: false,
                message: "dispatch ring has no members".to_string(),
            };
        }
        DispatchReadyState {
            ready: true,
            message: format!("dispatching across {} members", self.ring.member_ids().len()),
        }
    }
}

/// An in-process peer transport: member id to that node's dispatcher.
/// Used by tests, the testserver, and single-node serving.
#[derive(Default)]
pub struct InProcessPeers {
    nodes: std::sync::RwLock<HashMap<String, Arc<dyn Dispatcher>>>,
}

impl InProcessPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, member_id: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(member_id.into(), dispatcher);
        }
    }

    fn node(&self, peer: &Member) -> Result<Arc<dyn Dispatcher>, DispatchError> {
        self.nodes
            .read()
            .ok()
            .and_then(|nodes| nodes.get(&peer.id).cloned())
            .ok_or_else(|| DispatchError::PeerUnavailable(peer.id.clone()))
    }
}

#[async_trait]
impl PeerClient for InProcessPeers {
    async fn check(
        &self,
        peer: &Member,
        _key: &DispatchKey,
        req: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse, DispatchError> {
        self.node(peer)?.dispatch_check(req).await
    }

    async fn expand(
        &self,
        peer: &Member,
        _key: &DispatchKey,
        req: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse, DispatchError> {
        self.node(peer)?.dispatch_expand(req).await
    }

    async fn lookup_resources(
        &self,
        peer: &Member,
        _key: &DispatchKey,
        req: DispatchLookupResourcesRequest,
        stream: &dyn DispatchStream<ResolvedResource>,
    ) -> Result<ResponseMeta, DispatchError> {
        self.node(peer)?.dispatch_lookup_resources(req, stream).await
    }

    async fn lookup_subjects(
        &self,
        peer: &Member,
        _key: &DispatchKey,
        req: DispatchLookupSubjectsRequest,
        stream: &dyn DispatchStream<ResolvedSubject>,
    ) -> Result<ResponseMeta, DispatchError> {
        self.node(peer)?.dispatch_lookup_subjects(req, stream).await
    }
}
