//! Optimized-revision caching.
//!
//! Computing a fresh revision per request would mint one revision per
//! call and defeat downstream caching. Instead the newest safe revision is
//! cached for the quantization window and shared by every request that
//! arrives within it.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lattice_types::Revision;

use crate::error::StoreError;

struct CachedRevision {
    computed_at: Instant,
    revision: Revision,
}

/// Caches the optimized revision for the quantization window.
///
/// The lock is held only to peek or store the cached value; the revision
/// computation itself runs outside it.
pub struct CachedOptimizedRevisions {
    valid_for: Duration,
    cached: Mutex<Option<CachedRevision>>,
}

impl CachedOptimizedRevisions {
    pub fn new(valid_for: Duration) -> Self {
        Self { valid_for, cached: Mutex::new(None) }
    }

    /// Returns the cached revision if still within the quantization
    /// window, otherwise loads a fresh one via `load` and caches it.
    pub async fn optimized_revision<F, Fut>(&self, load: F) -> Result<Revision, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Revision, StoreError>>,
    {
        {
            let cached = self
                .cached
                .lock()
                .map_err(|_| StoreError::Internal("revision cache poisoned".to_string()))?;
            if let Some(entry) = cached.as_ref() {
                if entry.computed_at.elapsed() < self.valid_for {
                    return Ok(entry.revision.clone());
                }
            }
        }

        let revision = load().await?;

        let mut cached = self
            .cached
            .lock()
            .map_err(|_| StoreError::Internal("revision cache poisoned".to_string()))?;
        *cached = Some(CachedRevision { computed_at: Instant::now(), revision: revision.clone() });
        Ok(revision)
    }
}
