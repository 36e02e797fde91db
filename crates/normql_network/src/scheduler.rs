//! Interval polling of queries.
//!
//! Queries polled at the same interval share one bucket and one timer.
//! Every tick fetches each query in the bucket unless its previous fetch is
//! still running. Results and failures reach subscribers as [`PollEvent`]s.
//!
//! Registration, ticks and result delivery all go through one lock, so once
//! [`QueryScheduler::stop_polling_query`] returns the query is neither
//! fetched nor delivered again.

use crate::error::{NetworkError, SchedulerError};
use crate::request::{Request, Response};
use crate::transport::QueryFetcher;
use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Buffered events per query before slow subscribers start lagging.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { event_capacity: 16 }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// What to poll and how often.
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub request: Request,
    pub poll_interval: Option<Duration>,
}

impl PollOptions {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            poll_interval: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

/// One poll outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Result(Response),
    Error(NetworkError),
}

struct PolledQuery {
    options: PollOptions,
    interval: Duration,
    generation: u64,
    in_flight: Option<JoinHandle<()>>,
    events: broadcast::Sender<PollEvent>,
}

struct Bucket {
    query_ids: IndexSet<String, FxBuildHasher>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    buckets: FxHashMap<Duration, Bucket>,
    queries: FxHashMap<String, PolledQuery>,
    next_generation: u64,
}

struct Inner {
    fetcher: Arc<dyn QueryFetcher>,
    config: SchedulerConfig,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(self: &Arc<Self>, interval: Duration) {
        let mut state = self.lock();
        let State {
            buckets, queries, ..
        } = &mut *state;
        let Some(bucket) = buckets.get(&interval) else {
            return;
        };

        for query_id in &bucket.query_ids {
            let Some(query) = queries.get_mut(query_id) else {
                continue;
            };
            if query
                .in_flight
                .as_ref()
                .is_some_and(|task| !task.is_finished())
            {
                trace!(query_id = %query_id, "previous poll still in flight, skipping");
                continue;
            }

            let fetcher = Arc::clone(&self.fetcher);
            let request = query.options.request.clone();
            let generation = query.generation;
            let weak = Arc::downgrade(self);
            let id = query_id.clone();
            query.in_flight = Some(tokio::spawn(async move {
                let outcome = fetcher.fetch(request).await;
                if let Some(inner) = weak.upgrade() {
                    inner.deliver(&id, generation, outcome);
                }
            }));
        }
        debug!(interval = ?interval, queries = bucket.query_ids.len(), "poll tick");
    }

    fn deliver(
        &self,
        query_id: &str,
        generation: u64,
        outcome: Result<Response, NetworkError>,
    ) {
        let mut state = self.lock();
        let Some(query) = state
            .queries
            .get_mut(query_id)
            .filter(|query| query.generation == generation)
        else {
            trace!(query_id, "dropping result of stopped poll");
            return;
        };
        query.in_flight = None;

        let event = match outcome {
            Ok(response) => PollEvent::Result(response),
            Err(err) => {
                warn!(query_id, error = %err, "poll failed");
                PollEvent::Error(err)
            }
        };
        if query.events.send(event).is_err() {
            trace!(query_id, "no poll subscribers");
        }
    }

    fn add(self: &Arc<Self>, query_id: &str, options: PollOptions) -> Result<(), SchedulerError> {
        let interval = options
            .poll_interval
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| SchedulerError::InvalidInterval {
                query_id: query_id.to_string(),
                interval: options.poll_interval,
            })?;

        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let events = match remove_query(&mut state, query_id) {
            Some(previous) => previous.events,
            None => broadcast::channel(self.config.event_capacity).0,
        };
        state.queries.insert(
            query_id.to_string(),
            PolledQuery {
                options,
                interval,
                generation,
                in_flight: None,
                events,
            },
        );

        let bucket = state.buckets.entry(interval).or_insert_with(|| Bucket {
            query_ids: IndexSet::default(),
            timer: spawn_timer(Arc::downgrade(self), interval),
        });
        bucket.query_ids.insert(query_id.to_string());
        debug!(query_id, interval = ?interval, "polling query");
        Ok(())
    }

    fn stop(&self, query_id: &str) -> bool {
        let stopped = remove_query(&mut self.lock(), query_id).is_some();
        if stopped {
            debug!(query_id, "stopped polling query");
        }
        stopped
    }

    fn subscribe(&self, query_id: &str) -> Option<broadcast::Receiver<PollEvent>> {
        self.lock()
            .queries
            .get(query_id)
            .map(|query| query.events.subscribe())
    }
}

/// Unregisters a query, aborting its fetch and, when its bucket empties,
/// the bucket's timer.
fn remove_query(state: &mut State, query_id: &str) -> Option<PolledQuery> {
    let mut query = state.queries.remove(query_id)?;
    if let Some(task) = query.in_flight.take() {
        task.abort();
    }
    if let Some(bucket) = state.buckets.get_mut(&query.interval) {
        bucket.query_ids.shift_remove(query_id);
        if bucket.query_ids.is_empty() {
            if let Some(bucket) = state.buckets.remove(&query.interval) {
                bucket.timer.abort();
            }
        }
    }
    Some(query)
}

fn spawn_timer(inner: Weak<Inner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.tick(interval);
        }
    })
}

/// Owns the polling of queries. Cheap to clone.
#[derive(Clone)]
pub struct QueryScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("QueryScheduler")
            .field("config", &self.inner.config)
            .field("queries", &state.queries.len())
            .field("buckets", &state.buckets.len())
            .finish()
    }
}

impl QueryScheduler {
    pub fn new(fetcher: impl QueryFetcher + 'static) -> Self {
        Self::with_config(fetcher, SchedulerConfig::default())
    }

    pub fn with_config(fetcher: impl QueryFetcher + 'static, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher: Arc::new(fetcher),
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Starts polling `query_id` and subscribes to its events.
    ///
    /// Restarting an id replaces its options; subscribers of the previous
    /// registration keep receiving events.
    pub fn start_polling_query(
        &self,
        options: PollOptions,
        query_id: impl Into<String>,
    ) -> Result<PollingHandle, SchedulerError> {
        let query_id = query_id.into();
        self.add_query_on_interval(&query_id, options)?;
        let events = self
            .inner
            .subscribe(&query_id)
            .unwrap_or_else(|| broadcast::channel(1).1);
        Ok(PollingHandle {
            query_id,
            events,
            scheduler: Arc::downgrade(&self.inner),
        })
    }

    /// Registers `query_id` in the bucket for its interval without
    /// subscribing to it.
    pub fn add_query_on_interval(
        &self,
        query_id: &str,
        options: PollOptions,
    ) -> Result<(), SchedulerError> {
        self.inner.add(query_id, options)
    }

    /// Stops polling `query_id`. Returns whether it was being polled.
    pub fn stop_polling_query(&self, query_id: &str) -> bool {
        self.inner.stop(query_id)
    }

    /// Subscribes to a registered query's events.
    pub fn subscribe(&self, query_id: &str) -> Option<broadcast::Receiver<PollEvent>> {
        self.inner.subscribe(query_id)
    }

    pub fn is_polling(&self, query_id: &str) -> bool {
        self.inner.lock().queries.contains_key(query_id)
    }

    /// Intervals that currently have a bucket, shortest first.
    pub fn intervals(&self) -> Vec<Duration> {
        let mut intervals: Vec<_> = self.inner.lock().buckets.keys().copied().collect();
        intervals.sort_unstable();
        intervals
    }

    /// Query ids in the bucket for `interval`, in registration order.
    pub fn queries_on_interval(&self, interval: Duration) -> Vec<String> {
        self.inner
            .lock()
            .buckets
            .get(&interval)
            .map(|bucket| bucket.query_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops every query.
    pub fn stop_all(&self) {
        let mut state = self.inner.lock();
        let ids: Vec<_> = state.queries.keys().cloned().collect();
        for id in ids {
            remove_query(&mut state, &id);
        }
    }
}

/// A subscription to one polled query.
///
/// Dropping the handle only unsubscribes; polling continues until
/// [`cancel`](Self::cancel) or [`QueryScheduler::stop_polling_query`].
#[derive(Debug)]
pub struct PollingHandle {
    query_id: String,
    events: broadcast::Receiver<PollEvent>,
    scheduler: Weak<Inner>,
}

impl PollingHandle {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Waits for the next event. Returns `None` once the query is stopped.
    pub async fn next_event(&mut self) -> Option<PollEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(query_id = %self.query_id, skipped, "poll subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stops polling the query.
    pub fn cancel(self) {
        if let Some(inner) = self.scheduler.upgrade() {
            inner.stop(&self.query_id);
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkResult;
    use async_trait::async_trait;
    use normql_syntax::parse_query;
    use serde_json::json;

    #[derive(Default)]
    struct CountingFetcher {
        calls: Mutex<FxHashMap<String, usize>>,
        delay: Duration,
        fail: bool,
    }

    impl CountingFetcher {
        fn calls(&self, name: &str) -> usize {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl QueryFetcher for CountingFetcher {
        async fn fetch(&self, request: Request) -> NetworkResult<Response> {
            let name = request.operation_name.clone().unwrap_or_default();
            *self
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name.clone())
                .or_default() += 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(NetworkError::transport("down"));
            }
            Ok(Response::from_data(
                json!({"op": name}).as_object().cloned().unwrap_or_default(),
            ))
        }
    }

    fn options(name: &str, millis: u64) -> PollOptions {
        PollOptions::new(
            Request::new(parse_query(&format!("query {name} {{ x }}")).unwrap())
                .operation_name(name),
        )
        .poll_interval(Duration::from_millis(millis))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_interval_shares_a_bucket() {
        let scheduler = QueryScheduler::new(CountingFetcher::default());
        scheduler.start_polling_query(options("A", 100), "a").unwrap();
        scheduler.start_polling_query(options("B", 100), "b").unwrap();
        scheduler.start_polling_query(options("C", 250), "c").unwrap();

        assert_eq!(
            scheduler.intervals(),
            vec![Duration::from_millis(100), Duration::from_millis(250)]
        );
        assert_eq!(scheduler.queries_on_interval(Duration::from_millis(100)), vec!["a", "b"]);

        scheduler.stop_polling_query("c");
        assert_eq!(scheduler.intervals(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_interval() {
        let scheduler = QueryScheduler::new(CountingFetcher::default());
        let request = options("A", 0).request;
        let err = scheduler
            .start_polling_query(PollOptions::new(request.clone()), "a")
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval { interval: None, .. }));
        assert!(scheduler
            .start_polling_query(PollOptions::new(request).poll_interval(Duration::ZERO), "a")
            .is_err());
        assert!(!scheduler.is_polling("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_one_leaves_siblings_ticking() {
        let fetcher = Arc::new(CountingFetcher::default());
        let scheduler = QueryScheduler::new(Arc::clone(&fetcher));
        let mut a = scheduler.start_polling_query(options("A", 100), "a").unwrap();
        let mut b = scheduler.start_polling_query(options("B", 100), "b").unwrap();

        assert!(matches!(a.next_event().await, Some(PollEvent::Result(_))));
        assert!(matches!(b.next_event().await, Some(PollEvent::Result(_))));

        a.cancel();
        let stopped_at = fetcher.calls("A");
        for _ in 0..3 {
            assert!(matches!(b.next_event().await, Some(PollEvent::Result(_))));
        }
        assert_eq!(fetcher.calls("A"), stopped_at);
        assert!(fetcher.calls("B") >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_event_stream() {
        let scheduler = QueryScheduler::new(CountingFetcher::default());
        let mut handle = scheduler.start_polling_query(options("A", 100), "a").unwrap();
        assert!(handle.next_event().await.is_some());
        assert!(scheduler.stop_polling_query("a"));
        assert!(!scheduler.stop_polling_query("a"));
        assert_eq!(handle.next_event().await, None);
        assert!(scheduler.intervals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_polls_do_not_overlap() {
        let fetcher = Arc::new(CountingFetcher {
            delay: Duration::from_millis(350),
            ..CountingFetcher::default()
        });
        let scheduler = QueryScheduler::new(Arc::clone(&fetcher));
        let mut handle = scheduler.start_polling_query(options("A", 100), "a").unwrap();

        assert!(handle.next_event().await.is_some());
        // Ticks at 200, 300 and 400 fell inside the fetch started at 100.
        assert_eq!(fetcher.calls("A"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_resurrect_stopped_query() {
        let fetcher = Arc::new(CountingFetcher::default());
        let scheduler = QueryScheduler::new(Arc::clone(&fetcher));
        scheduler.start_polling_query(options("A", 100), "a").unwrap();
        scheduler.stop_polling_query("a");

        let mut b = scheduler.start_polling_query(options("B", 100), "b").unwrap();
        for _ in 0..2 {
            b.next_event().await;
        }
        assert_eq!(fetcher.calls("A"), 0);
        assert_eq!(scheduler.queries_on_interval(Duration::from_millis(100)), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_events() {
        let scheduler = QueryScheduler::new(CountingFetcher {
            fail: true,
            ..CountingFetcher::default()
        });
        let mut handle = scheduler.start_polling_query(options("A", 50), "a").unwrap();
        assert_eq!(
            handle.next_event().await,
            Some(PollEvent::Error(NetworkError::transport("down")))
        );
        assert!(handle.next_event().await.is_some());
    }
}
