//! # devflow SDK
//!
//! HTTP clients connecting the devflow engine to the outside world.
//!
//! - [`ConfigMapStore`] keeps the shared dependency ownership document in
//!   a Kubernetes ConfigMap.
//! - [`HttpPeerClient`] pings other devflow processes and asks them to
//!   release dependencies.
//! - [`BinaryDownloader`] fetches fallback tools missing from `PATH`.
//!
//! ```rust,no_run
//! use devflow_sdk::{ConfigMapStore, KubeConfig, SdkResult};
//!
//! fn store() -> SdkResult<Option<ConfigMapStore>> {
//!     let Some(config) = KubeConfig::in_cluster()? else {
//!         return Ok(None);
//!     };
//!     ConfigMapStore::new(&config).map(Some)
//! }
//! ```

pub mod config;
pub mod error;
pub mod kube;
pub mod peer;
pub mod tools;
pub mod transport;

pub use config::{ClientConfig, RetryConfig};
pub use error::{SdkError, SdkResult};
pub use kube::{ConfigMapStore, KubeConfig};
pub use peer::HttpPeerClient;
pub use tools::BinaryDownloader;
pub use transport::HttpTransport;
