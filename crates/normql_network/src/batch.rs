//! Time-windowed batching of requests.
//!
//! Requests enqueued between two flushes go out together through one
//! [`BatchTransport::send_batch`] call and each caller gets the response at
//! its own position. Flushes happen on [`QueryBatcher::consume_queue`] or on
//! the periodic poller started by [`QueryBatcher::start`].

use crate::error::{NetworkError, NetworkResult};
use crate::request::{Request, Response};
use crate::transport::BatchTransport;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Batching configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Period of the flush poller.
    pub batch_interval: Duration,
    /// Largest number of requests per transport call. `None` sends the whole
    /// queue at once.
    pub max_batch_size: Option<usize>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(10),
            max_batch_size: None,
        }
    }
}

impl BatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size.max(1));
        self
    }
}

struct QueuedRequest {
    request: Request,
    reply: oneshot::Sender<NetworkResult<Response>>,
}

/// Resolves to the response of one enqueued request.
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<NetworkResult<Response>>,
}

impl Future for PendingResult {
    type Output = NetworkResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(NetworkError::Dropped)))
    }
}

/// The transport calls started by one flush.
#[derive(Debug)]
pub struct BatchHandle {
    requests: usize,
    calls: Vec<JoinHandle<()>>,
}

impl BatchHandle {
    /// Requests taken from the queue.
    pub fn len(&self) -> usize {
        self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests == 0
    }

    /// Transport calls made.
    pub fn calls(&self) -> usize {
        self.calls.len()
    }

    /// Waits until every response of the flush has been delivered.
    pub async fn finished(self) {
        for call in self.calls {
            if let Err(err) = call.await {
                warn!(error = %err, "batch task failed");
            }
        }
    }
}

struct Inner<T> {
    transport: Arc<T>,
    config: BatcherConfig,
    queue: Mutex<Vec<QueuedRequest>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: BatchTransport + 'static> Inner<T> {
    fn consume_queue(&self) -> Option<BatchHandle> {
        let queued = std::mem::take(&mut *lock(&self.queue));
        if queued.is_empty() {
            return None;
        }

        let requests = queued.len();
        let chunk_size = self.config.max_batch_size.unwrap_or(requests);
        let mut calls = Vec::new();
        let mut queued = queued.into_iter().peekable();
        while queued.peek().is_some() {
            let batch: Vec<_> = queued.by_ref().take(chunk_size).collect();
            let transport = Arc::clone(&self.transport);
            calls.push(tokio::spawn(send_batch(transport, batch)));
        }

        debug!(requests, calls = calls.len(), "flushed batch queue");
        Some(BatchHandle { requests, calls })
    }
}

async fn send_batch<T: BatchTransport>(transport: Arc<T>, batch: Vec<QueuedRequest>) {
    let (requests, replies): (Vec<_>, Vec<_>) = batch
        .into_iter()
        .map(|queued| (queued.request, queued.reply))
        .unzip();
    let expected = requests.len();

    let outcome = match transport.send_batch(requests).await {
        Ok(responses) if responses.len() == expected => Ok(responses),
        Ok(responses) => Err(NetworkError::BatchSizeMismatch {
            expected,
            actual: responses.len(),
        }),
        Err(err) => Err(err),
    };

    match outcome {
        Ok(responses) => {
            for (reply, response) in replies.into_iter().zip(responses) {
                let _ = reply.send(Ok(response));
            }
        }
        Err(err) => {
            warn!(error = %err, requests = expected, "batch failed");
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}

/// Groups requests into batched transport calls.
pub struct QueryBatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for QueryBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for QueryBatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBatcher")
            .field("config", &self.inner.config)
            .field("queued", &lock(&self.inner.queue).len())
            .finish_non_exhaustive()
    }
}

impl<T: BatchTransport + 'static> QueryBatcher<T> {
    pub fn new(transport: T, config: BatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport: Arc::new(transport),
                config,
                queue: Mutex::new(Vec::new()),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }

    /// Queues a request for the next flush.
    pub fn enqueue_request(&self, request: Request) -> PendingResult {
        let (reply, rx) = oneshot::channel();
        lock(&self.inner.queue).push(QueuedRequest { request, reply });
        PendingResult { rx }
    }

    /// Requests waiting for a flush.
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Sends everything queued. Returns `None`, without touching the
    /// transport, when the queue is empty.
    pub fn consume_queue(&self) -> Option<BatchHandle> {
        self.inner.consume_queue()
    }

    /// Starts flushing every `batch_interval`. Calling it again while
    /// running does nothing.
    pub fn start(&self) {
        let mut poller = lock(&self.inner.poller);
        if poller.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.batch_interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.consume_queue();
            }
        }));
        debug!(interval = ?period, "batch poller started");
    }

    /// Stops the poller. Queued requests stay queued.
    pub fn stop(&self) {
        if let Some(task) = lock(&self.inner.poller).take() {
            task.abort();
            debug!(queued = self.queued(), "batch poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.poller)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}
