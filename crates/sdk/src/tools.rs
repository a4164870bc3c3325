//! Downloads fallback tools that are missing from `PATH`.

use crate::error::{SdkError, SdkResult};
use crate::transport::error_for_response;
use anyhow::Context;
use async_trait::async_trait;
use devflow_core::dispatch::ToolInstaller;
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use url::Url;

/// Downloads configured tools into a cache directory and reuses them.
pub struct BinaryDownloader {
    client: Client,
    cache_dir: PathBuf,
    sources: BTreeMap<String, Url>,
    // one download at a time
    lock: Mutex<()>,
}

impl BinaryDownloader {
    pub fn new(cache_dir: impl Into<PathBuf>, sources: BTreeMap<String, String>) -> SdkResult<Self> {
        let sources = sources
            .into_iter()
            .map(|(name, url)| Ok((name, Url::parse(&url)?)))
            .collect::<SdkResult<BTreeMap<_, _>>>()?;
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            sources,
            lock: Mutex::new(()),
        })
    }

    /// `~/.devflow/bin`, or a directory under the system temp dir without a home
    pub fn default_cache_dir() -> PathBuf {
        match std::env::var_os("HOME") {
            Some(home) if !home.is_empty() => PathBuf::from(home).join(".devflow").join("bin"),
            _ => std::env::temp_dir().join("devflow").join("bin"),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cached_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    async fn download(&self, url: &Url, target: &Path) -> SdkResult<()> {
        info!(url = %url, "Downloading {}", target.display());

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let partial = target.with_extension("download");
        tokio::fs::write(&partial, &bytes).await?;
        make_executable(&partial).await?;
        tokio::fs::rename(&partial, target).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> SdkResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> SdkResult<()> {
    Ok(())
}

#[async_trait]
impl ToolInstaller for BinaryDownloader {
    fn provides(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    async fn install(&self, name: &str) -> anyhow::Result<PathBuf> {
        let url = self
            .sources
            .get(name)
            .ok_or_else(|| SdkError::NotFound(format!("no download source for {}", name)))?;

        let _guard = self.lock.lock().await;
        let target = self.cached_path(name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(target);
        }

        self.download(url, &target)
            .await
            .with_context(|| format!("download {} from {}", name, url))?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sources(server: &MockServer) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "kubectl".to_string(),
            format!("{}/releases/kubectl", server.uri()),
        )])
    }

    #[tokio::test]
    async fn test_install_downloads_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases/kubectl"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"#!/bin/sh\necho ok\n".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = BinaryDownloader::new(dir.path(), sources(&server)).unwrap();

        assert!(downloader.provides("kubectl"));
        assert!(!downloader.provides("helm"));

        let first = downloader.install("kubectl").await.unwrap();
        let second = downloader.install("kubectl").await.unwrap();

        assert_eq!(first, dir.path().join("kubectl"));
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"#!/bin/sh\necho ok\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&first).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_binary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases/kubectl"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = BinaryDownloader::new(dir.path(), sources(&server)).unwrap();

        let err = downloader.install("kubectl").await.unwrap_err();
        assert!(format!("{:#}", err).contains("status 404"));
        assert!(!dir.path().join("kubectl").exists());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = BinaryDownloader::new(dir.path(), BTreeMap::new()).unwrap();

        let err = downloader.install("helm").await.unwrap_err();
        assert!(err.to_string().contains("no download source for helm"));
    }

    #[test]
    fn test_invalid_source_url_is_rejected() {
        let sources = BTreeMap::from([("kubectl".to_string(), "not a url".to_string())]);
        assert!(BinaryDownloader::new("/tmp/unused", sources).is_err());
    }
}
