//! Poll transport over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use persist_transport::{PollRequest, PollResponse};

use crate::{TransportError, runtime::PollTransport};

/// Bound on a single round trip so a hung listener cannot stall the loop.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs polls to a listener's channel endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport for `endpoint`, e.g. `http://127.0.0.1:3000/api/persist`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PollTransport for HttpTransport {
    async fn poll(&self, request: &PollRequest) -> Result<PollResponse, TransportError> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        Ok(response.json::<PollResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_listener_is_an_error() {
        // Port 9 (discard) on loopback is not expected to be listening.
        let transport = HttpTransport::new("http://127.0.0.1:9/api/persist").unwrap();
        let result = transport.poll(&PollRequest::heartbeat("r1", true)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoint() {
        let transport = HttpTransport::new("http://listener/api/persist").unwrap();
        assert_eq!(transport.endpoint(), "http://listener/api/persist");
    }
}
