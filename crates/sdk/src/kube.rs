//! Ownership store backed by a Kubernetes ConfigMap.

use crate::config::ClientConfig;
use crate::error::{SdkError, SdkResult};
use crate::transport::{error_for_response, HttpTransport};
use async_trait::async_trait;
use devflow_core::error::StoreError;
use devflow_core::registry::{OwnershipDocument, OwnershipStore, OWNERSHIP_DOCUMENT};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// How to reach the cluster API server.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_server: Url,
    pub namespace: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

impl KubeConfig {
    pub fn new(api_server: Url, namespace: impl Into<String>) -> Self {
        Self {
            api_server,
            namespace: namespace.into(),
            token: None,
            ca_pem: None,
            insecure: false,
        }
    }

    /// Service account configuration when running inside a pod.
    ///
    /// `None` outside a cluster.
    pub fn in_cluster() -> SdkResult<Option<Self>> {
        let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) else {
            return Ok(None);
        };
        Self::from_service_account(&host, &port, Path::new(SERVICE_ACCOUNT_DIR)).map(Some)
    }

    fn from_service_account(host: &str, port: &str, dir: &Path) -> SdkResult<Self> {
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        let api_server = Url::parse(&format!("https://{}:{}", host, port))?;

        let token = std::fs::read_to_string(dir.join("token"))?;
        let namespace = std::fs::read_to_string(dir.join("namespace"))
            .map(|ns| ns.trim().to_string())
            .unwrap_or_else(|_| "default".to_string());
        let ca_pem = std::fs::read(dir.join("ca.crt")).ok();

        Ok(Self {
            api_server,
            namespace,
            token: Some(token.trim().to_string()),
            ca_pem,
            insecure: false,
        })
    }

    /// Load the bearer token from a file
    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> SdkResult<Self> {
        let token = std::fs::read_to_string(path.into())?;
        self.token = Some(token.trim().to_string());
        Ok(self)
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> SdkResult<Self> {
        self.ca_pem = Some(std::fs::read(path.into())?);
        Ok(self)
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.api_server.clone()).with_timeout(Duration::from_secs(15));
        config.bearer_token = self.token.clone();
        config.ca_pem = self.ca_pem.clone();
        config.accept_invalid_certs = self.insecure;
        config
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigMap {
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl From<ConfigMap> for OwnershipDocument {
    fn from(map: ConfigMap) -> Self {
        Self {
            data: map.data,
            resource_version: map.metadata.resource_version.unwrap_or_default(),
        }
    }
}

/// Shared ownership document stored as a ConfigMap in one namespace.
///
/// Updates are JSON merge patches of the changed keys carrying the
/// observed `resourceVersion`, so a concurrent writer makes them fail
/// with a conflict instead of being overwritten.
pub struct ConfigMapStore {
    transport: HttpTransport,
    namespace: String,
    name: String,
}

impl ConfigMapStore {
    pub fn new(config: &KubeConfig) -> SdkResult<Self> {
        if config.namespace.is_empty() {
            return Err(SdkError::Config("namespace must not be empty".to_string()));
        }

        Ok(Self {
            transport: HttpTransport::new(Arc::new(config.client_config()))?,
            namespace: config.namespace.clone(),
            name: OWNERSHIP_DOCUMENT.to_string(),
        })
    }

    /// Use a different ConfigMap name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn collection_path(&self) -> String {
        format!("/api/v1/namespaces/{}/configmaps", self.namespace)
    }

    fn item_path(&self) -> String {
        format!("{}/{}", self.collection_path(), self.name)
    }
}

async fn read_document(response: Response) -> Result<OwnershipDocument, StoreError> {
    let map: ConfigMap = response.json().await.map_err(other)?;
    Ok(map.into())
}

fn other(err: impl Into<SdkError>) -> StoreError {
    StoreError::Other(anyhow::Error::new(err.into()))
}

#[async_trait]
impl OwnershipStore for ConfigMapStore {
    async fn get(&self) -> Result<Option<OwnershipDocument>, StoreError> {
        let response = self.transport.get(&self.item_path()).await.map_err(other)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => read_document(response).await.map(Some),
            _ => Err(other(error_for_response(response).await)),
        }
    }

    async fn create(&self, data: BTreeMap<String, String>) -> Result<OwnershipDocument, StoreError> {
        let body = ConfigMap {
            api_version: Some("v1".to_string()),
            kind: Some("ConfigMap".to_string()),
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: None,
            },
            data,
        };
        let response = self
            .transport
            .post(&self.collection_path(), &body)
            .await
            .map_err(other)?;

        match response.status() {
            StatusCode::CONFLICT => {
                debug!(namespace = %self.namespace, "Ownership ConfigMap was created concurrently");
                Err(StoreError::AlreadyExists)
            }
            status if status.is_success() => read_document(response).await,
            _ => Err(other(error_for_response(response).await)),
        }
    }

    async fn update(
        &self,
        changes: BTreeMap<String, String>,
        resource_version: &str,
    ) -> Result<OwnershipDocument, StoreError> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "data": changes,
        });
        let response = self
            .transport
            .merge_patch(&self.item_path(), &patch)
            .await
            .map_err(other)?;

        match response.status() {
            // A deleted map is re-read and recreated by the next attempt
            StatusCode::CONFLICT | StatusCode::NOT_FOUND => Err(StoreError::Conflict),
            status if status.is_success() => read_document(response).await,
            _ => Err(other(error_for_response(response).await)),
        }
    }
}
