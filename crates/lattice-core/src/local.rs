//! Local dispatch.
//!
//! Resolves dispatched questions on this node by invoking the engine
//! directly. A cluster node wraps this in the cluster dispatcher; a
//! single node wires the engine's redispatch straight back here.

use std::sync::Arc;

use async_trait::async_trait;
use lattice_dispatch::{
    check_depth, DispatchCheckRequest, DispatchCheckResponse, DispatchError,
    DispatchExpandRequest, DispatchExpandResponse, DispatchLookupResourcesRequest,
    DispatchLookupSubjectsRequest, DispatchReadyState, DispatchStream, Dispatcher,
    ResolvedResource, ResolvedSubject, ResponseMeta,
};
use lattice_store::Datastore;

use crate::engine::Engine;

pub struct LocalDispatcher {
    engine: Arc<Engine>,
}

impl LocalDispatcher {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }

    /// A single-node setup: the engine's sub-questions come straight back
    /// to this dispatcher.
    pub fn new_local_only(datastore: Arc<dyn Datastore>, concurrency_limit: usize) -> Arc<Self> {
        let engine = Arc::new(Engine::new(datastore, concurrency_limit));
        let dispatcher = Self::new(Arc::clone(&engine));
        engine.set_redispatcher(Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        dispatcher
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch_check(
        &self,
        req: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse, DispatchError> {
        check_depth(&req.metadata)?;
        self.engine.check(req).await.map_err(DispatchError::from)
    }

    async fn dispatch_expand(
        &self,
        req: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse, DispatchError> {
        check_depth(&req.metadata)?;
        self.engine.expand(req).await.map_err(DispatchError::from)
    }

    async fn dispatch_lookup_resources(
        &self,
        req: DispatchLookupResourcesRequest,
        stream: &dyn DispatchStream<ResolvedResource>,
    ) -> Result<ResponseMeta, DispatchError> {
        check_depth(&req.metadata)?;
        self.engine.lookup_resources(req, stream).await.map_err(DispatchError::from)
    }

    async fn dispatch_lookup_subjects(
        &self,
        req: DispatchLookupSubjectsRequest,
        stream: &dyn DispatchStream<ResolvedSubject>,
    ) -> Result<ResponseMeta, DispatchError> {
        check_depth(&req.metadata)?;
        self.engine.lookup_subjects(req, stream).await.map_err(DispatchError::from)
    }

    fn ready_state(&self) -> DispatchReadyState {
        DispatchReadyState { ready: true, message: "local dispatch".to_string() }
    }
}
