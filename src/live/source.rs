//! REST seam used for polling and actions.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{LiveError, LiveResult, generate_id};

/// Boxed future returned by [`DataSource`] calls.
pub type DataFuture = Pin<Box<dyn Future<Output = LiveResult<Value>> + Send>>;

/// JSON-over-HTTP backend the live layer polls and posts actions to.
///
/// Endpoints are paths such as `/api/alerts`; the implementation owns the base URL.
pub trait DataSource: Send + Sync + 'static {
    fn get(&self, endpoint: &str) -> DataFuture;
    fn post(&self, endpoint: &str, body: Option<Value>) -> DataFuture;
    fn put(&self, endpoint: &str, body: Value) -> DataFuture;
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub auth_token: Option<String>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(30),
            auth_token: None,
        }
    }
}

/// reqwest-backed [`DataSource`].
#[derive(Clone)]
pub struct HttpDataSource {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpDataSource {
    pub fn new(config: HttpSourceConfig) -> LiveResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LiveError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    fn call(&self, method: Method, endpoint: &str, body: Option<Value>) -> DataFuture {
        let request_id = generate_id("req");
        let mut request = self
            .client
            .request(method.clone(), self.url(endpoint))
            .header("X-Request-ID", request_id.as_str());
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let endpoint = endpoint.to_string();

        Box::pin(async move {
            debug!(%method, endpoint = %endpoint, request_id = %request_id, "http request");
            let response = request
                .send()
                .await
                .map_err(|e| LiveError::Request(e.to_string()))?;
            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|e| LiveError::Request(e.to_string()))?;

            if !status.is_success() {
                let message = error_message(status, &body);
                if status == StatusCode::UNAUTHORIZED {
                    warn!(endpoint = %endpoint, "authentication error; token may be expired");
                }
                return Err(LiveError::Http {
                    status: status.as_u16(),
                    message,
                });
            }

            if body.is_empty() {
                return Ok(Value::Null);
            }
            Ok(sonic_rs::from_slice(&body)?)
        })
    }
}

/// The body's `error` field when present, otherwise the status text.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    sonic_rs::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string())
}

impl DataSource for HttpDataSource {
    fn get(&self, endpoint: &str) -> DataFuture {
        self.call(Method::GET, endpoint, None)
    }

    fn post(&self, endpoint: &str, body: Option<Value>) -> DataFuture {
        self.call(Method::POST, endpoint, body)
    }

    fn put(&self, endpoint: &str, body: Value) -> DataFuture {
        self.call(Method::PUT, endpoint, Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_the_base_url() {
        let source = HttpDataSource::new(HttpSourceConfig {
            base_url: "http://backend:8080/".to_string(),
            ..HttpSourceConfig::default()
        })
        .unwrap();
        assert_eq!(source.url("/api/alerts"), "http://backend:8080/api/alerts");
        assert_eq!(source.url("api/alerts"), "http://backend:8080/api/alerts");
        assert_eq!(source.url("https://other/x"), "https://other/x");
    }

    #[test]
    fn error_text_prefers_body_field() {
        assert_eq!(
            error_message(StatusCode::NOT_FOUND, br#"{"error":"alert a1 not found"}"#),
            "alert a1 not found"
        );
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, b"<html>"), "Bad Gateway");
    }
}
