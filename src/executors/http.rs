use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use super::HttpDispatcher;
use crate::errors::ChainError;
use crate::protocol::{CapturedResponse, ResolvedRequest};

/// Dispatcher backed by reqwest.
///
/// Relative paths are joined to `base_url`; absolute URLs are used as-is.
/// Default headers are sent on every call, and request headers with the
/// same name win over them.
pub struct ReqwestDispatcher {
    client: Client,
    base_url: String,
    default_headers: BTreeMap<String, String>,
    timeout: Duration,
}

impl ReqwestDispatcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            default_headers: BTreeMap::new(),
            timeout,
        }
    }

    pub fn with_default_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.default_headers = headers;
        self
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

#[async_trait]
impl HttpDispatcher for ReqwestDispatcher {
    #[tracing::instrument(name = "http_dispatch", skip_all, fields(method = %request.method, path = %request.path))]
    async fn dispatch(&self, request: &ResolvedRequest) -> Result<CapturedResponse, ChainError> {
        let start_time = Instant::now();
        let url = self.url_for(&request.path);

        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|e| {
            ChainError::HttpRequest {
                method: request.method.clone(),
                url: url.clone(),
                message: format!("invalid HTTP method: {}", e),
                timeout: false,
                connect: false,
            }
        })?;

        let mut builder = self.client.request(method, &url).timeout(self.timeout);

        for (name, value) in &self.default_headers {
            if !request.headers.contains_key(name) {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&request.method, &url, &e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let raw_body = response
            .text()
            .await
            .map_err(|e| transport_error(&request.method, &url, &e))?;

        let duration = start_time.elapsed().as_millis() as u64;
        tracing::info!(%url, status, duration_ms = duration, "HTTP call finished");

        Ok(CapturedResponse {
            status,
            body: parse_body(&raw_body),
            headers,
        })
    }
}

fn transport_error(method: &str, url: &str, error: &reqwest::Error) -> ChainError {
    tracing::error!(error = %error, %url, "HTTP request failed");
    ChainError::HttpRequest {
        method: method.to_string(),
        url: url.to_string(),
        message: error.to_string(),
        timeout: error.is_timeout(),
        connect: error.is_connect(),
    }
}

/// JSON bodies are parsed; anything else is kept as a string. Empty is null.
fn parse_body(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn request(method: &str, path: &str) -> ResolvedRequest {
        ResolvedRequest {
            method: method.into(),
            path: path.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[test]
    fn test_url_for_joins_base() {
        let dispatcher = ReqwestDispatcher::new("http://api.local/v1/", Duration::from_secs(1));

        assert_eq!(dispatcher.url_for("/users"), "http://api.local/v1/users");
        assert_eq!(dispatcher.url_for("users"), "http://api.local/v1/users");
        assert_eq!(dispatcher.url_for("https://other/x"), "https://other/x");
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_body("plain text"), json!("plain text"));
    }

    #[tokio::test]
    async fn test_dispatch_sends_query_headers_and_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/orders")
                    .query_param("dry_run", "true")
                    .header("X-Tenant", "acme")
                    .header("Authorization", "Bearer abc")
                    .json_body(json!({"qty": 2}));
                then.status(201).json_body(json!({"data": {"id": 7}}));
            })
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("X-Tenant".to_string(), "acme".to_string());
        headers.insert("Authorization".to_string(), "Bearer default".to_string());
        let dispatcher = ReqwestDispatcher::new(server.base_url(), Duration::from_secs(5))
            .with_default_headers(headers);

        let mut req = request("post", "/orders");
        req.query.insert("dry_run".into(), "true".into());
        req.headers.insert("Authorization".into(), "Bearer abc".into());
        req.body = Some(json!({"qty": 2}));

        let response = dispatcher.dispatch(&req).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 201);
        assert_eq!(response.body, json!({"data": {"id": 7}}));
    }

    #[tokio::test]
    async fn test_dispatch_returns_error_statuses_as_responses() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404).body("not here");
            })
            .await;

        let dispatcher = ReqwestDispatcher::new(server.base_url(), Duration::from_secs(5));
        let response = dispatcher.dispatch(&request("GET", "/missing")).await.unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(response.body, json!("not here"));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_is_flagged() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let dispatcher = ReqwestDispatcher::new(server.base_url(), Duration::from_millis(50));
        let err = dispatcher.dispatch(&request("GET", "/slow")).await.unwrap_err();

        match err {
            ChainError::HttpRequest { timeout, .. } => assert!(timeout),
            other => panic!("erro inesperado: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_invalid_method() {
        let dispatcher = ReqwestDispatcher::new("http://127.0.0.1:1", Duration::from_secs(1));
        let err = dispatcher.dispatch(&request("GE T", "/x")).await.unwrap_err();

        assert!(matches!(err, ChainError::HttpRequest { connect: false, timeout: false, .. }));
    }
}
