//! Error types for request coordination.

use crate::request::GraphQLError;
use std::time::Duration;
use thiserror::Error;

/// A failed network operation. Cloned to every waiter of a shared call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("execution failed: {}", summarize(.0))]
    Execution(Vec<GraphQLError>),

    #[error("batch returned {actual} results for {expected} requests")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("request was dropped before completing")]
    Dropped,
}

fn summarize(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl NetworkError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Rejected polling registrations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("query `{query_id}` needs a positive poll interval, got {interval:?}")]
    InvalidInterval {
        query_id: String,
        interval: Option<Duration>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = NetworkError::Execution(vec![GraphQLError::new("a"), GraphQLError::new("b")]);
        assert_eq!(err.to_string(), "execution failed: a; b");
        assert_eq!(
            NetworkError::BatchSizeMismatch {
                expected: 3,
                actual: 2
            }
            .to_string(),
            "batch returned 2 results for 3 requests"
        );
    }
}
