//! The caching dispatcher.
//!
//! Wraps another dispatcher and caches check and expand responses by
//! canonical dispatch key and revision. A hit reports the work the cached
//! computation originally performed as `cached_dispatch_count`, keeping
//! usage accounting exact. Streaming kinds pass through uncached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::debug;

use crate::keys::KeyHandler;
use crate::{
    DispatchCheckRequest, DispatchCheckResponse, DispatchError, DispatchExpandRequest,
    DispatchExpandResponse, DispatchLookupResourcesRequest, DispatchLookupSubjectsRequest,
    DispatchReadyState, DispatchStream, Dispatcher, ResolvedResource, ResolvedSubject,
    ResponseMeta,
};

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct CachingDispatcher {
    inner: Arc<dyn Dispatcher>,
    key_handler: Arc<dyn KeyHandler>,
    check_cache: Cache<Vec<u8>, Arc<DispatchCheckResponse>>,
    expand_cache: Cache<Vec<u8>, Arc<DispatchExpandResponse>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachingDispatcher {
    pub fn new(
        inner: Arc<dyn Dispatcher>,
        key_handler: Arc<dyn KeyHandler>,
        max_capacity: u64,
    ) -> Self {
        Self {
            inner,
            key_handler,
            check_cache: Cache::new(max_capacity),
            expand_cache: Cache::new(max_capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DispatchCacheStats {
        DispatchCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Accounting for a response served from cache: no new dispatches, and
    /// the original work reported as cached.
    fn cached_meta(original: &ResponseMeta) -> ResponseMeta {
        ResponseMeta {
            dispatch_count: 0,
            cached_dispatch_count: original
                .dispatch_count
                .saturating_add(original.cached_dispatch_count),
            depth_required: original.depth_required,
        }
    }
}

#[async_trait]
impl Dispatcher for CachingDispatcher {
    async fn dispatch_check(
        &self,
        req: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse, DispatchError> {
        let key = self.key_handler.check_key(&req);
        let cache_key = key.cache_key(&req.revision.to_string());

        if let Some(cached) = self.check_cache.get(&cache_key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("check served from dispatch cache");
            let mut resp = (*cached).clone();
            resp.metadata = Self::cached_meta(&cached.metadata);
            return Ok(resp);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let resp = self.inner.dispatch_check(req).await?;
        self.check_cache.insert(cache_key, Arc::new(resp.clone())).await;
        Ok(resp)
    }

    async fn dispatch_expand(
        &self,
        req: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse, DispatchError> {
        let key = self.key_handler.expand_key(&req);
        let cache_key = key.cache_key(&req.revision.to_string());

        if let Some(cached) = self.expand_cache.get(&cache_key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let mut resp = (*cached).clone();
            resp.metadata = Self::cached_meta(&cached.metadata);
            return Ok(resp);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let resp = self.inner.dispatch_expand(req).await?;
        self.expand_cache.insert(cache_key, Arc::new(resp.clone())).await;
        Ok(resp)
    }

    async fn dispatch_lookup_resources(
        &self,
        req: DispatchLookupResourcesRequest,
        stream: &dyn DispatchStream<ResolvedResource>,
    ) -> Result<ResponseMeta, DispatchError> {
        self.inner.dispatch_lookup_resources(req, stream).await
    }

    async fn dispatch_lookup_subjects(
        &self,
        req: DispatchLookupSubjectsRequest,
        stream: &dyn DispatchStream<ResolvedSubject>,
    ) -> Result<ResponseMeta, DispatchError> {
        self.inner.dispatch_lookup_subjects(req, stream).await
    }

    fn ready_state(&self) -> DispatchReadyState {
        self.inner.ready_state()
    }
}
