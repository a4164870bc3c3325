//! Client for the inter-process API of other devflow instances.

use crate::error::{SdkError, SdkResult};
use async_trait::async_trait;
use devflow_core::registry::{ExcludePayload, PeerClient, PingPayload};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Talks to peers over plain HTTP.
///
/// Peers are addressed by the `server` value of their ownership record,
/// either `host:port` or a full URL.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: Client,
    ping_timeout: Duration,
    exclude_timeout: Duration,
}

impl HttpPeerClient {
    /// Each request carries its own timeout; the client has none
    pub fn new(ping_timeout: Duration, exclude_timeout: Duration) -> SdkResult<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            ping_timeout,
            exclude_timeout,
        })
    }

    fn endpoint(server: &str, path: &str) -> SdkResult<Url> {
        let base = if server.contains("://") {
            server.to_string()
        } else {
            format!("http://{}", server)
        };
        Ok(Url::parse(&base)?.join(path)?)
    }

    /// POST `payload` and report whether the peer answered 200
    async fn post<B: Serialize>(
        &self,
        server: &str,
        path: &str,
        payload: &B,
        timeout: Duration,
    ) -> SdkResult<bool> {
        let url = Self::endpoint(server, path)?;
        debug!(url = %url, "Contacting peer");

        let request = self.client.post(url).json(payload).timeout(timeout);
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SdkError::Timeout
            } else {
                SdkError::Http(e)
            }
        })?;
        Ok(response.status() == StatusCode::OK)
    }
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self {
            client: Client::new(),
            ping_timeout: Duration::from_secs(2),
            exclude_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn ping(&self, server: &str, payload: &PingPayload) -> anyhow::Result<bool> {
        Ok(self
            .post(server, "/api/ping", payload, self.ping_timeout)
            .await?)
    }

    async fn exclude_dependency(
        &self,
        server: &str,
        payload: &ExcludePayload,
    ) -> anyhow::Result<bool> {
        Ok(self
            .post(server, "/api/exclude-dependency", payload, self.exclude_timeout)
            .await?)
    }
}
