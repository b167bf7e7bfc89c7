//! Process-local coalescing of concurrent identical fetches.
//!
//! The registry owns every in-flight fetch: it runs on its own task, so a
//! caller that stops waiting does not cancel the work other callers are
//! joined to. The entry is removed as soon as the fetch settles, and the next
//! call for the same key starts fresh.

use crate::errors::CoalesceError;
use crate::metrics_defs::{COALESCE_INFLIGHT, COALESCE_JOINED, COALESCE_STARTED};
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::AbortHandle;

struct InFlight<T> {
    generation: u64,
    result: watch::Receiver<Option<T>>,
    abort: Option<AbortHandle>,
}

type InFlightMap<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

pub struct CoalescingRegistry<T> {
    in_flight: InFlightMap<T>,
    next_generation: AtomicU64,
}

impl<T> Default for CoalescingRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CoalescingRegistry<T> {
    pub fn new() -> Self {
        CoalescingRegistry {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Aborts the in-flight fetch for `key`. Every caller joined to it receives
    /// [`CoalesceError::Cancelled`]. Returns false if there was nothing to abort.
    pub fn cancel(&self, key: &str) -> bool {
        match self.in_flight.lock().get(key).and_then(|entry| entry.abort.as_ref()) {
            Some(abort) => {
                abort.abort();
                true
            }
            None => false,
        }
    }
}

impl<T> CoalescingRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Returns the result of the fetch in flight for `key`, starting `fetch`
    /// only if there is none. `fetch` is invoked at most once per started entry.
    pub async fn join_or_start<F, Fut>(&self, key: &str, fetch: F) -> Result<T, CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        // Check and insert happen under one lock so two callers can never both
        // start a fetch for the same key.
        let (mut result, start) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(entry) => {
                    counter!(COALESCE_JOINED).increment(1);
                    tracing::debug!(dedup_key = %key, "joined in-flight fetch");
                    (entry.result.clone(), None)
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            generation,
                            result: rx.clone(),
                            abort: None,
                        },
                    );
                    gauge!(COALESCE_INFLIGHT).set(in_flight.len() as f64);
                    counter!(COALESCE_STARTED).increment(1);
                    tracing::debug!(dedup_key = %key, "starting shared fetch");
                    let guard = SettleGuard {
                        key: key.to_string(),
                        generation,
                        in_flight: Arc::clone(&self.in_flight),
                    };
                    (rx, Some((generation, tx, guard)))
                }
            }
        };

        // `fetch` runs outside the lock. If it panics, unwinding drops the
        // guard and the entry goes with it.
        if let Some((generation, tx, guard)) = start {
            let fut = fetch();
            let handle = tokio::spawn(async move {
                let value = fut.await;
                // Deregister before publishing so a caller arriving after the
                // result is visible starts a new fetch.
                drop(guard);
                tx.send_replace(Some(value));
            });

            if let Some(entry) = self.in_flight.lock().get_mut(key)
                && entry.generation == generation
            {
                entry.abort = Some(handle.abort_handle());
            }
        }

        let settled = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoalesceError::Cancelled)?;
        (*settled).clone().ok_or(CoalesceError::Cancelled)
    }
}

/// Removes the registry entry when the fetch task finishes, is aborted or panics.
struct SettleGuard<T> {
    key: String,
    generation: u64,
    in_flight: InFlightMap<T>,
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            in_flight.remove(&self.key);
        }
        gauge!(COALESCE_INFLIGHT).set(in_flight.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinSet;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let registry = Arc::new(CoalescingRegistry::<u64>::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut join_set = JoinSet::new();
        for _ in 0..10 {
            let registry = registry.clone();
            let invocations = invocations.clone();
            join_set.spawn(async move {
                registry
                    .join_or_start("recalls:vin:X", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42
                    })
                    .await
            });
        }

        let results = join_set.join_all().await;
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| *r == Ok(42)));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_entry_is_removed() {
        let registry = CoalescingRegistry::<u32>::new();
        let invocations = AtomicUsize::new(0);

        for expected in 1..=2 {
            let value = registry
                .join_or_start("key", || {
                    let n = invocations.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                    async move { n }
                })
                .await
                .unwrap();
            assert_eq!(value, expected);
            assert_eq!(registry.in_flight(), 0);
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_keys_do_not_block() {
        let registry = Arc::new(CoalescingRegistry::<&'static str>::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow_registry = registry.clone();
        let slow = tokio::spawn(async move {
            slow_registry
                .join_or_start("slow", || async move {
                    let _ = release_rx.await;
                    "slow"
                })
                .await
        });
        tokio::task::yield_now().await;

        let fast = registry
            .join_or_start("fast", || async { "fast" })
            .await
            .unwrap();
        assert_eq!(fast, "fast");
        assert_eq!(registry.in_flight(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), Ok("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_cancel_shared_fetch() {
        let registry = Arc::new(CoalescingRegistry::<u32>::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let fetch = |invocations: Arc<AtomicUsize>| {
            move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                7
            }
        };

        let first_registry = registry.clone();
        let first_fetch = fetch(invocations.clone());
        let first = tokio::spawn(async move { first_registry.join_or_start("key", first_fetch).await });

        let second_registry = registry.clone();
        let second_fetch = fetch(invocations.clone());
        let second =
            tokio::spawn(async move { second_registry.join_or_start("key", second_fetch).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        // The caller that started the fetch goes away
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        assert_eq!(second.await.unwrap(), Ok(7));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reaches_every_joined_caller() {
        let registry = Arc::new(CoalescingRegistry::<u32>::new());

        let mut join_set = JoinSet::new();
        for _ in 0..3 {
            let registry = registry.clone();
            join_set.spawn(async move {
                registry
                    .join_or_start("key", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            });
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.in_flight(), 1);
        assert!(registry.cancel("key"));
        assert!(!registry.cancel("other"));

        let results = join_set.join_all().await;
        assert!(results.iter().all(|r| *r == Err(CoalesceError::Cancelled)));
        assert_eq!(registry.in_flight(), 0);

        // A later call starts fresh
        let value = registry.join_or_start("key", || async { 2 }).await;
        assert_eq!(value, Ok(2));
    }

    async fn explode() -> u32 {
        panic!("upstream exploded")
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_while_building_fetch_does_not_wedge_key() {
        let registry = Arc::new(CoalescingRegistry::<u32>::new());

        let failing = registry.clone();
        let outcome = tokio::spawn(async move {
            failing
                .join_or_start("key", || -> std::future::Ready<u32> {
                    panic!("could not build request")
                })
                .await
        })
        .await;
        assert!(outcome.unwrap_err().is_panic());
        assert_eq!(registry.in_flight(), 0);

        let value = registry.join_or_start("key", || async { 3 }).await;
        assert_eq!(value, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_is_reported_as_cancelled() {
        let registry = CoalescingRegistry::<u32>::new();
        let result = registry.join_or_start("key", explode).await;
        assert_eq!(result, Err(CoalesceError::Cancelled));
        assert_eq!(registry.in_flight(), 0);
    }
}
