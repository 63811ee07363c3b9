//! Background garbage collection of dead tuples.
//!
//! A cycle computes the watermark (`now - window`), then deletes expired
//! tombstones in bounded batches until either nothing is left or the cycle
//! timeout elapses. Each batch commits independently, so partial progress
//! survives a timeout.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// What one GC batch removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub relationships_removed: usize,
    pub namespaces_removed: usize,
    pub caveats_removed: usize,
    pub transactions_removed: usize,
}

impl GcStats {
    pub fn total(&self) -> usize {
        self.relationships_removed
            + self.namespaces_removed
            + self.caveats_removed
            + self.transactions_removed
    }

    pub fn add(&mut self, other: GcStats) {
        self.relationships_removed += other.relationships_removed;
        self.namespaces_removed += other.namespaces_removed;
        self.caveats_removed += other.caveats_removed;
        self.transactions_removed += other.transactions_removed;
    }
}

/// A datastore that supports garbage collection of expired tombstones.
///
/// `delete_expired` removes at most `batch_size` tombstoned relationship
/// rows whose deletion is older than the watermark. It must never remove a
/// row that is still the most recent version of a live key.
#[async_trait]
pub trait GarbageCollectable: Send + Sync {
    async fn delete_expired(
        &self,
        watermark: SystemTime,
        batch_size: usize,
    ) -> Result<GcStats, StoreError>;
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How often a cycle wakes.
    pub interval: Duration,
    /// How far back readers are supported; rows tombstoned earlier are
    /// collectable.
    pub window: Duration,
    /// Bound on the total work per cycle.
    pub timeout: Duration,
    pub batch_delete_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3 * 60),
            window: Duration::from_secs(24 * 60 * 60),
            timeout: Duration::from_secs(60),
            batch_delete_size: 1000,
        }
    }
}

/// Run one full GC cycle: batches until exhaustion or the cycle timeout.
pub async fn collect_once(
    gc: &dyn GarbageCollectable,
    config: &GcConfig,
) -> Result<GcStats, StoreError> {
    let started = Instant::now();
    let watermark = SystemTime::now()
        .checked_sub(config.window)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut totals = GcStats::default();
    loop {
        let stats = gc.delete_expired(watermark, config.batch_delete_size).await?;
        totals.add(stats);

        if stats.relationships_removed < config.batch_delete_size {
            break;
        }
        if started.elapsed() >= config.timeout {
            debug!(removed = totals.total(), "garbage collection cycle hit its timeout");
            break;
        }
    }

    Ok(totals)
}

/// The background GC loop. Wakes every `interval`, runs a cycle, and exits
/// when `shutdown` flips to true.
pub async fn run_garbage_collector(
    gc: Arc<dyn GarbageCollectable>,
    config: GcConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(
        interval_secs = config.interval.as_secs(),
        window_secs = config.window.as_secs(),
        "starting garbage collector"
    );

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a fresh store is not
    // collected at startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match collect_once(gc.as_ref(), &config).await {
                    Ok(stats) if stats.total() > 0 => {
                        info!(
                            relationships = stats.relationships_removed,
                            transactions = stats.transactions_removed,
                            "garbage collection cycle complete"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "garbage collection cycle failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("garbage collector shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Pretends to hold `remaining` expired rows and removes up to the
    /// batch size per call.
    struct FakeCollectable {
        remaining: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GarbageCollectable for FakeCollectable {
        async fn delete_expired(
            &self,
            _watermark: SystemTime,
            batch_size: usize,
        ) -> Result<GcStats, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.remaining.load(Ordering::SeqCst);
            let removed = remaining.min(batch_size);
            self.remaining.store(remaining - removed, Ordering::SeqCst);
            Ok(GcStats { relationships_removed: removed, ..GcStats::default() })
        }
    }

    #[tokio::test]
    async fn collects_in_batches_until_empty() {
        let fake = FakeCollectable { remaining: AtomicUsize::new(25), calls: AtomicUsize::new(0) };
        let config = GcConfig { batch_delete_size: 10, ..GcConfig::default() };

        let stats = collect_once(&fake, &config).await.unwrap();
        assert_eq!(stats.relationships_removed, 25);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_cycle_timeout() {
        struct SlowCollectable;

        #[async_trait]
        impl GarbageCollectable for SlowCollectable {
            async fn delete_expired(
                &self,
                _watermark: SystemTime,
                batch_size: usize,
            ) -> Result<GcStats, StoreError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(GcStats { relationships_removed: batch_size, ..GcStats::default() })
            }
        }

        let config = GcConfig {
            batch_delete_size: 10,
            timeout: Duration::from_millis(1),
            ..GcConfig::default()
        };
        // A full batch every call would loop forever without the timeout.
        let stats = collect_once(&SlowCollectable, &config).await.unwrap();
        assert!(stats.relationships_removed >= 10);
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let fake = Arc::new(FakeCollectable {
            remaining: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(run_garbage_collector(
            fake,
            GcConfig { interval: Duration::from_secs(3600), ..GcConfig::default() },
            rx,
        ));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gc loop exits promptly")
            .unwrap();
    }
}
