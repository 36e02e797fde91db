//! Request coordination for normql.
//!
//! This crate provides:
//! - `request`: Requests, fingerprints and responses
//! - `transport`: The traits a wire implementation plugs into
//! - `error`: Network and scheduler errors
//! - `dedup`: Collapsing of identical in-flight requests
//! - `batch`: Time-windowed request batching
//! - `scheduler`: Interval polling

pub mod batch;
pub mod dedup;
pub mod error;
pub mod request;
pub mod scheduler;
pub mod transport;

pub use batch::{BatchHandle, BatcherConfig, PendingResult, QueryBatcher};
pub use dedup::Deduplicator;
pub use error::{NetworkError, NetworkResult, SchedulerError};
pub use request::{Fingerprint, GraphQLError, Request, Response};
pub use scheduler::{PollEvent, PollOptions, PollingHandle, QueryScheduler, SchedulerConfig};
pub use transport::{BatchTransport, QueryFetcher, Transport};
