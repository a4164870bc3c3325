use anyhow::{Context, Result};
use devflow_core::registry::ClaimPolicy;
use devflow_core::ProjectConfig;
use devflow_sdk::KubeConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default)]
    pub server: HttpConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,

    #[serde(default)]
    pub registry: RegistryConfig,

    /// Download sources of fallback tools
    #[serde(default)]
    pub tools: BTreeMap<String, ToolSource>,

    /// Directory the configuration was loaded from
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Inter-process API listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// 0 picks a free port
    #[serde(default)]
    pub port: u16,

    /// Address peers should use to reach this process, if not the bound one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            advertise: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_exclude_timeout_ms")]
    pub exclude_timeout_ms: u64,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Release dependencies when another session asks for them
    #[serde(default = "default_allow_takeover")]
    pub allow_takeover: bool,
}

fn default_max_retries() -> u32 {
    4
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_exclude_timeout_ms() -> u64 {
    10000
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_allow_takeover() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            ping_timeout_ms: default_ping_timeout_ms(),
            exclude_timeout_ms: default_exclude_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            allow_takeover: default_allow_takeover(),
        }
    }
}

impl RegistryConfig {
    pub fn policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            max_retries: self.max_retries,
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            exclude_timeout: Duration::from_millis(self.exclude_timeout_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            allow_takeover: self.allow_takeover,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSource {
    pub url: String,
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            Self::parse(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file {} not found, using defaults", config_path.display());
            Self::default()
        };

        config.base_dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::env::current_dir().context("Failed to determine working directory")?,
        };
        if config.project.name.is_empty() {
            config.project.name = config
                .base_dir
                .canonicalize()
                .ok()
                .and_then(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "devflow".to_string());
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn tool_sources(&self) -> BTreeMap<String, String> {
        self.tools
            .iter()
            .map(|(name, source)| (name.clone(), source.url.clone()))
            .collect()
    }

    /// Cluster connection, `None` when running offline.
    ///
    /// An explicit `[cluster] api_server` wins over the in-cluster service account.
    pub fn kube_config(&self, namespace: Option<&str>) -> Result<Option<KubeConfig>> {
        let cluster = self.cluster.clone().unwrap_or_default();

        let mut kube = match cluster.api_server.as_deref() {
            Some(api_server) => {
                let url: Url = api_server
                    .parse()
                    .with_context(|| format!("Invalid cluster api_server {}", api_server))?;
                let mut kube = KubeConfig::new(url, "default");
                kube.token = cluster.token.clone();
                if let Some(ref path) = cluster.token_file {
                    kube = kube
                        .with_token_file(self.base_dir.join(path))
                        .context("Failed to read cluster token file")?;
                }
                if let Some(ref path) = cluster.ca_file {
                    kube = kube
                        .with_ca_file(self.base_dir.join(path))
                        .context("Failed to read cluster CA file")?;
                }
                kube.insecure = cluster.insecure;
                kube
            }
            None => match KubeConfig::in_cluster().context("Failed to load in-cluster configuration")? {
                Some(kube) => kube,
                None => return Ok(None),
            },
        };

        if let Some(namespace) = namespace.or(cluster.namespace.as_deref()) {
            kube.namespace = namespace.to_string();
        }
        Ok(Some(kube))
    }
}
