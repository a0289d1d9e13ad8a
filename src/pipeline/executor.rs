//! Bounded fan-out/fan-in with index-preserving reassembly.
//!
//! Tasks complete in any order (`buffer_unordered`), but every result is
//! written into a pre-sized slot keyed by its input index, so callers always
//! get results back in input order. A task that fails reports its failure in
//! its own return value; siblings keep running.

use futures::stream::{self, StreamExt};
use std::future::Future;
use tracing::debug;

/// Effective pool size for `n` items under `cap`.
pub fn worker_count(n: usize, cap: usize) -> usize {
    n.min(cap).max(1)
}

/// Run `task(index, item)` for every item with at most
/// `min(items.len(), cap)` in flight, returning results in input order.
pub async fn fan_out<I, T, F, Fut>(items: Vec<I>, cap: usize, task: F) -> Vec<T>
where
    F: Fn(usize, I) -> Fut,
    Fut: Future<Output = T>,
{
    let n = items.len();
    if n == 0 {
        return Vec::new();
    }
    let workers = worker_count(n, cap);
    debug!("Fan-out: {} tasks on {} workers", n, workers);

    let mut slots: Vec<Option<T>> = Vec::with_capacity(n);
    slots.resize_with(n, || None);

    let task = &task;
    let mut completed = stream::iter(items.into_iter().enumerate().map(|(idx, item)| async move {
        (idx, task(idx, item).await)
    }))
    .buffer_unordered(workers);

    while let Some((idx, result)) = completed.next().await {
        slots[idx] = Some(result);
    }

    // buffer_unordered drains every future, so every slot is filled.
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pool_size_is_bounded() {
        assert_eq!(worker_count(3, 8), 3);
        assert_eq!(worker_count(20, 8), 8);
        assert_eq!(worker_count(0, 8), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn results_come_back_in_input_order() {
        // Later items finish first.
        let out = fan_out((0..10u64).collect(), 4, |idx, v| async move {
            tokio::time::sleep(Duration::from_millis(100 - v * 10)).await;
            (idx, v * 2)
        })
        .await;
        let expected: Vec<_> = (0..10u64).map(|v| (v as usize, v * 2)).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_cap_and_failures_do_not_cancel() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let out = fan_out((0..12).collect::<Vec<i32>>(), 3, |_, v| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                if v % 5 == 0 {
                    Err(format!("item {v} failed"))
                } else {
                    Ok(v)
                }
            }
        })
        .await;
        assert_eq!(out.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(out.iter().filter(|r| r.is_err()).count(), 3);
        assert_eq!(out[1], Ok(1));
    }

    #[tokio::test]
    async fn empty_input_returns_empty() {
        let out: Vec<u8> = fan_out(Vec::<u8>::new(), 4, |_, v| async move { v }).await;
        assert!(out.is_empty());
    }
}
