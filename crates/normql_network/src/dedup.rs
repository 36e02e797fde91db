//! Collapsing of identical in-flight requests.
//!
//! Concurrent calls with the same [`Fingerprint`] share one transport call.
//! The call runs on its own task, so a caller that stops waiting never
//! cancels it for the others. Whatever way the task ends, the fingerprint is
//! cleared before waiters are woken, and the next identical call goes to the
//! network again.

use crate::error::{NetworkError, NetworkResult};
use crate::request::{Fingerprint, Request, Response};
use crate::transport::{QueryFetcher, Transport};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type Waiters = Vec<oneshot::Sender<NetworkResult<Response>>>;
type InFlight = Arc<Mutex<FxHashMap<Fingerprint, Waiters>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, FxHashMap<Fingerprint, Waiters>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shares in-flight calls between identical requests.
pub struct Deduplicator<T> {
    transport: Arc<T>,
    in_flight: InFlight,
}

impl<T> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<T> std::fmt::Debug for Deduplicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("in_flight", &lock(&self.in_flight).len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> Deduplicator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            in_flight: Arc::default(),
        }
    }

    /// Number of distinct requests currently on the wire.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Sends `request`, joining an identical in-flight call when `dedupe`
    /// is set. Without `dedupe` the call bypasses the shared table entirely.
    pub async fn query(&self, request: Request, dedupe: bool) -> NetworkResult<Response> {
        if !dedupe {
            return self.transport.send(request).await;
        }

        let fingerprint = request.fingerprint();
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get_mut(&fingerprint) {
                Some(waiters) => {
                    waiters.push(tx);
                    debug!(waiters = waiters.len(), "joined in-flight request");
                    false
                }
                None => {
                    in_flight.insert(fingerprint.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            let completion = Completion {
                in_flight: Arc::clone(&self.in_flight),
                fingerprint,
                done: false,
            };
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let result = transport.send(request).await;
                completion.finish(result);
            });
        }

        rx.await.unwrap_or(Err(NetworkError::Dropped))
    }
}

#[async_trait]
impl<T: Transport + 'static> QueryFetcher for Deduplicator<T> {
    async fn fetch(&self, request: Request) -> NetworkResult<Response> {
        self.query(request, true).await
    }
}

/// Owns a fingerprint's table entry for the lifetime of its call.
struct Completion {
    in_flight: InFlight,
    fingerprint: Fingerprint,
    done: bool,
}

impl Completion {
    fn take_waiters(&self) -> Waiters {
        lock(&self.in_flight)
            .remove(&self.fingerprint)
            .unwrap_or_default()
    }

    fn finish(mut self, result: NetworkResult<Response>) {
        self.done = true;
        let waiters = self.take_waiters();
        trace!(waiters = waiters.len(), ok = result.is_ok(), "in-flight request settled");
        for waiter in waiters {
            // A waiter that walked away is not an error.
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // The task died without a result; waiters observe `Dropped`.
        let waiters = self.take_waiters();
        warn!(waiters = waiters.len(), "in-flight request ended without a result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use normql_syntax::parse_query;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowTransport {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(&self, _request: Request) -> NetworkResult<Response> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                Err(NetworkError::transport("offline"))
            } else {
                Ok(Response::from_data(
                    json!({"call": call}).as_object().cloned().unwrap_or_default(),
                ))
            }
        }
    }

    fn transport(fail: bool) -> Arc<SlowTransport> {
        Arc::new(SlowTransport {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn request() -> Request {
        Request::new(parse_query("{ me { id } }").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_requests_share_a_call() {
        let transport = transport(false);
        let dedup = Deduplicator::new(Arc::clone(&transport));

        let results = futures_join(&dedup, 5, true).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &results[0]));
        assert_eq!(dedup.in_flight(), 0);

        dedup.query(request(), true).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reach_every_waiter_and_clear() {
        let transport = transport(true);
        let dedup = Deduplicator::new(Arc::clone(&transport));

        let results = futures_join(&dedup, 3, true).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| r == &Err(NetworkError::transport("offline"))));

        let _ = dedup.query(request(), true).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedupe_disabled_bypasses_table() {
        let transport = transport(false);
        let dedup = Deduplicator::new(Arc::clone(&transport));
        futures_join(&dedup, 3, false).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_cancel_others() {
        let transport = transport(false);
        let dedup = Deduplicator::new(Arc::clone(&transport));

        let first = {
            let dedup = dedup.clone();
            tokio::spawn(async move { dedup.query(request(), true).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let dedup = dedup.clone();
            tokio::spawn(async move { dedup.query(request(), true).await })
        };
        tokio::task::yield_now().await;
        first.abort();

        assert!(second.await.unwrap().is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    async fn futures_join(
        dedup: &Deduplicator<Arc<SlowTransport>>,
        n: usize,
        dedupe: bool,
    ) -> Vec<NetworkResult<Response>> {
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let dedup = dedup.clone();
                tokio::spawn(async move { dedup.query(request(), dedupe).await })
            })
            .collect();
        let mut results = Vec::with_capacity(n);
        for handle in handles {
            results.push(handle.await.unwrap_or(Err(NetworkError::Dropped)));
        }
        results
    }
}
