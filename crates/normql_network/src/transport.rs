//! Boundaries to the wire.
//!
//! Nothing in this crate speaks a protocol. Callers plug in an
//! implementation of these traits.

use crate::error::NetworkResult;
use crate::request::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;

/// Sends one operation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> NetworkResult<Response>;
}

/// Sends several operations in one call.
///
/// Implementations return one response per request, in request order.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send_batch(&self, requests: Vec<Request>) -> NetworkResult<Vec<Response>>;
}

/// Fetches a request on behalf of the poll scheduler.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> NetworkResult<Response>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: Request) -> NetworkResult<Response> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T: BatchTransport + ?Sized> BatchTransport for Arc<T> {
    async fn send_batch(&self, requests: Vec<Request>) -> NetworkResult<Vec<Response>> {
        (**self).send_batch(requests).await
    }
}

#[async_trait]
impl<T: QueryFetcher + ?Sized> QueryFetcher for Arc<T> {
    async fn fetch(&self, request: Request) -> NetworkResult<Response> {
        (**self).fetch(request).await
    }
}
