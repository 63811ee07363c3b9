//! Bounded concurrent evaluation.
//!
//! Independent sub-questions run concurrently with a small fan-out bound.
//! Results are yielded in input order so that conditional expressions are
//! reproducible, and the first error cancels the remaining siblings.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;

use crate::Result;

/// The default fan-out bound per resolution node.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// The batch size for chunked sub-problem dispatch.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Run the futures with at most `limit` in flight, returning their
/// results in input order. The first error drops every unfinished
/// sibling.
pub async fn run_all_bounded<T, F>(limit: usize, futures: Vec<F>) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    stream::iter(futures).buffered(limit.max(1)).try_collect().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::EngineError;

    #[tokio::test]
    async fn results_come_back_in_input_order() {
        // Later futures finish first; order must still hold.
        let futures: Vec<_> = (0..5u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(20 - i * 4)).await;
                Ok(i)
            })
            .collect();

        let results = run_all_bounded(3, futures).await.unwrap();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn limit_bounds_concurrent_execution() {
        let current = std::sync::Arc::new(AtomicUsize::new(0));
        let peak = std::sync::Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..20)
            .map(|_| {
                let current = std::sync::Arc::clone(&current);
                let peak = std::sync::Arc::clone(&peak);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();

        run_all_bounded(4, futures).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn first_error_cancels_the_rest() {
        let completed = std::sync::Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for i in 0..10 {
            let completed = std::sync::Arc::clone(&completed);
            futures.push(async move {
                if i == 0 {
                    return Err(EngineError::Evaluation("boom".to_string()));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let err = run_all_bounded(2, futures).await.unwrap_err();
        assert!(matches!(err, EngineError::Evaluation(_)));
        // Unstarted siblings never ran.
        assert!(completed.load(Ordering::SeqCst) < 9);
    }
}
