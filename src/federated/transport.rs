use std::time::Duration;

use super::{FederatedError, FederatedUpdate};
use crate::http_client::{self, RetryConfig};

/// Largest acknowledgement body accepted from the aggregator.
const MAX_ACK_BYTES: usize = 64 * 1024;

const RETRY: RetryConfig = RetryConfig {
    max_attempts: 3,
    base_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(4),
};

/// Delivers a prepared update to the aggregation endpoint.
pub trait FederatedTransport: Send {
    fn send(&self, update: &FederatedUpdate) -> Result<(), FederatedError>;
}

/// JSON POST with bounded retry for transient failures.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl FederatedTransport for HttpTransport {
    fn send(&self, update: &FederatedUpdate) -> Result<(), FederatedError> {
        http_client::retry_with_backoff(
            RETRY,
            || http_client::post_json(&self.endpoint, update, MAX_ACK_BYTES),
            |err| err.is_transient(),
        )
        .map(|_| ())
        .map_err(|err| FederatedError::Transport {
            endpoint: self.endpoint.clone(),
            message: err.to_string(),
        })
    }
}
