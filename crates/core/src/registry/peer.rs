use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(rename = "runID")]
    pub run_id: String,
}

/// Body of `POST /api/exclude-dependency`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludePayload {
    #[serde(rename = "runID")]
    pub run_id: String,
    #[serde(rename = "dependencyName")]
    pub dependency_name: String,
}

/// Outbound side of the inter-process protocol
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// `Ok(true)` if the process at `server` is still running `payload.run_id`
    async fn ping(&self, server: &str, payload: &PingPayload) -> anyhow::Result<bool>;

    /// `Ok(true)` if the owner agreed to release the dependency
    async fn exclude_dependency(&self, server: &str, payload: &ExcludePayload)
        -> anyhow::Result<bool>;
}

/// Peer client for offline runs; no other process is ever reachable
#[derive(Debug, Default, Clone)]
pub struct NoPeers;

#[async_trait]
impl PeerClient for NoPeers {
    async fn ping(&self, _server: &str, _payload: &PingPayload) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn exclude_dependency(
        &self,
        _server: &str,
        _payload: &ExcludePayload,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}
