//! HTTP transport shared by the SDK clients.

use crate::config::ClientConfig;
use crate::error::{SdkError, SdkResult};
use reqwest::{header, Certificate, Client, RequestBuilder, Response};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

const MERGE_PATCH: &str = "application/merge-patch+json";

/// HTTP transport with authentication and retries.
///
/// Responses with a non-retryable status are returned to the caller as-is,
/// since 404 and 409 carry meaning for the ownership protocol.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: Arc<ClientConfig>,
}

impl HttpTransport {
    /// Create a new HTTP transport with the given configuration.
    pub fn new(config: Arc<ClientConfig>) -> SdkResult<Self> {
        let mut headers = header::HeaderMap::new();

        if let Some(ref token) = config.bearer_token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| SdkError::Config("Invalid bearer token format".to_string()))?,
            );
        }

        let mut builder = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(ref pem) = config.ca_pem {
            let certificate = Certificate::from_pem(pem)
                .map_err(|e| SdkError::Config(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build a URL for the given path.
    pub fn build_url(&self, path: &str) -> SdkResult<url::Url> {
        Ok(self.config.base_url.join(path)?)
    }

    /// Execute a request, retrying on timeouts and retryable statuses.
    async fn execute_with_retry(&self, request_builder: RequestBuilder) -> SdkResult<Response> {
        let retry_config = &self.config.retry_config;
        let mut attempts = 0;

        loop {
            let request = request_builder
                .try_clone()
                .ok_or_else(|| SdkError::Config("Request cannot be cloned".to_string()))?;

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();

                    if attempts < retry_config.max_retries && retry_config.should_retry_status(status) {
                        let backoff = retry_config.backoff_for_attempt(attempts);
                        warn!(
                            status = status,
                            attempt = attempts + 1,
                            backoff_ms = backoff.as_millis(),
                            "Request failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        continue;
                    }

                    return Ok(response);
                }
                Err(e) => {
                    if attempts < retry_config.max_retries && (e.is_timeout() || e.is_connect()) {
                        let backoff = retry_config.backoff_for_attempt(attempts);
                        warn!(
                            attempt = attempts + 1,
                            backoff_ms = backoff.as_millis(),
                            "Request could not be sent, retrying: {}",
                            e
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        continue;
                    }
                    if e.is_timeout() {
                        return Err(SdkError::Timeout);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Execute a GET request.
    pub async fn get(&self, path: &str) -> SdkResult<Response> {
        let url = self.build_url(path)?;
        debug!(url = %url, "GET request");

        self.execute_with_retry(self.client.get(url)).await
    }

    /// Execute a POST request with a JSON body.
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> SdkResult<Response> {
        let url = self.build_url(path)?;
        debug!(url = %url, "POST request");

        self.execute_with_retry(self.client.post(url).json(body)).await
    }

    /// Execute a JSON merge-patch request.
    pub async fn merge_patch<B: Serialize>(&self, path: &str, body: &B) -> SdkResult<Response> {
        let url = self.build_url(path)?;
        debug!(url = %url, "PATCH request");

        let body = serde_json::to_vec(body)?;
        self.execute_with_retry(
            self.client
                .patch(url)
                .header(header::CONTENT_TYPE, MERGE_PATCH)
                .body(body),
        )
        .await
    }
}

/// Turn a non-success response into an [`SdkError::Api`].
pub async fn error_for_response(response: Response) -> SdkError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    SdkError::from_response(status, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{body_json, header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_transport(server: &MockServer, retry_config: RetryConfig) -> HttpTransport {
        let config = ClientConfig::new(Url::parse(&server.uri()).unwrap())
            .with_bearer_token("secret")
            .with_retry_config(RetryConfig {
                initial_backoff: Duration::from_millis(1),
                ..retry_config
            });
        HttpTransport::new(Arc::new(config)).unwrap()
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces"))
            .and(header_is("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = create_test_transport(&server, RetryConfig::no_retry());
        let response = transport.get("/api/v1/namespaces").await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = create_test_transport(&server, RetryConfig::default());
        let response = transport.get("/flaky").await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_conflict_is_returned_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/things"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let transport = create_test_transport(&server, RetryConfig::default());
        let response = transport
            .post("/things", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 409);
    }

    #[tokio::test]
    async fn test_merge_patch_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/things/one"))
            .and(header_is("content-type", MERGE_PATCH))
            .and(body_json(serde_json::json!({"data": {"a": "b"}})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = create_test_transport(&server, RetryConfig::no_retry());
        let response = transport
            .merge_patch("/things/one", &serde_json::json!({"data": {"a": "b"}}))
            .await
            .unwrap();
        assert!(response.status().is_success());
    }
}
