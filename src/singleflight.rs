//! Per-key call coalescing.
//!
//! The first caller for a key starts the work on a spawned task; callers
//! arriving while it runs attach to the same shared future. The map entry is
//! removed by the task itself once the result is ready, so a caller that
//! gives up early never leaves a stale entry behind.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type SharedCall<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct Call<V, E> {
    generation: u64,
    waiters: Arc<AtomicUsize>,
    future: SharedCall<V, E>,
}

/// Outcome of [`SingleFlight::run`].
pub struct Joined<V, E> {
    pub result: Result<V, E>,
    /// True when this caller attached to a call started by someone else.
    pub coalesced: bool,
    /// Callers that shared the call, including the one that started it,
    /// as known when this caller joined.
    pub waiters: usize,
}

pub struct SingleFlight<V, E> {
    calls: Arc<DashMap<String, Call<V, E>>>,
    generation: AtomicU64,
}

impl<V, E> Default for SingleFlight<V, E> {
    fn default() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<V, E> SingleFlight<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<tokio::task::JoinError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a call currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.calls.contains_key(key)
    }

    /// Run `work` for `key` unless a call is already outstanding, in which
    /// case wait for that call's result instead. `work` is only invoked by
    /// the caller that creates the call.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Joined<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (future, coalesced, waiters) = match self.calls.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                let call = existing.get();
                let waiters = call.waiters.fetch_add(1, Ordering::AcqRel) + 1;
                (call.future.clone(), true, waiters)
            }
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let calls = Arc::clone(&self.calls);
                let owned_key = key.to_string();
                let task = work();
                // Spawned on first poll, after the entry lock is released.
                let future = async move {
                    let task_calls = Arc::clone(&calls);
                    let task_key = owned_key.clone();
                    let handle = tokio::spawn(async move {
                        let result = task.await;
                        task_calls.remove_if(&task_key, |_, call| call.generation == generation);
                        result
                    });
                    handle.await.unwrap_or_else(|err| {
                        // The task panicked before it could clear its entry.
                        calls.remove_if(&owned_key, |_, call| call.generation == generation);
                        Err(E::from(err))
                    })
                }
                .boxed()
                .shared();
                slot.insert(Call {
                    generation,
                    waiters: Arc::new(AtomicUsize::new(1)),
                    future: future.clone(),
                });
                (future, false, 1)
            }
        };
        let result = future.await;
        Joined {
            result,
            coalesced,
            waiters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    struct Boom(String);

    impl From<tokio::task::JoinError> for Boom {
        fn from(err: tokio::task::JoinError) -> Self {
            Boom(err.to_string())
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_call() {
        let flights: Arc<SingleFlight<u32, Boom>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("k", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(7)
                    })
                    .await
            }));
        }
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let mut coalesced = 0;
        for h in handles {
            let joined = h.await.unwrap();
            assert_eq!(joined.result, Ok(7));
            if joined.coalesced {
                coalesced += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalesced, 4);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_and_entry_cleared() {
        let flights: SingleFlight<u32, Boom> = SingleFlight::new();
        let joined = flights
            .run("k", || async { Err(Boom("nope".into())) })
            .await;
        assert_eq!(joined.result, Err(Boom("nope".into())));
        assert!(!flights.is_in_flight("k"));

        let joined = flights.run("k", || async { Ok(1) }).await;
        assert_eq!(joined.result, Ok(1));
        assert!(!joined.coalesced);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_leader_keeps_call_alive_for_followers() {
        let flights: SingleFlight<u32, Boom> = SingleFlight::new();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            flights.run("k", || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(flights.is_in_flight("k"));

        let joined = flights.run("k", || async { Ok(99) }).await;
        assert_eq!(joined.result, Ok(1));
        assert!(joined.coalesced);
        assert_eq!(flights.in_flight(), 0);
    }
}
