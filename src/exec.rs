//! HTTP request execution capability.
//!
//! The engine never manages TCP/TLS itself; it drives a [`RequestExecutor`],
//! which reports the status, body and measured duration of each request.
//! Tests substitute a scripted executor for deterministic outcomes.

use async_trait::async_trait;
use reqwest::Method;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One outbound request as built by a scenario step.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl StepRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            body: Some(body),
            headers: Vec::new(),
        }
    }
}

/// Completed exchange: status, body and the executor-measured duration.
#[derive(Debug, Clone)]
pub struct ExecutedResponse {
    pub status: u16,
    pub body: String,
    pub duration: Duration,
}

/// Connection failure, timeout, or any other transport-level error.
#[derive(Debug, Clone, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
    /// Elapsed time until the failure surfaced.
    pub duration: Duration,
}

/// Capability to execute one HTTP request with timing.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn send(&self, request: StepRequest) -> Result<ExecutedResponse, TransportError>;
}

/// Production executor backed by a shared reqwest client.
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    /// Create an executor with the given request timeout and connection pool size.
    pub fn new(timeout: Duration, pool_size: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_size)
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }
}

#[async_trait]
impl RequestExecutor for ReqwestExecutor {
    async fn send(&self, request: StepRequest) -> Result<ExecutedResponse, TransportError> {
        let start = Instant::now();

        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Ok(ExecutedResponse {
                    status,
                    body,
                    duration: start.elapsed(),
                })
            }
            Err(e) => Err(TransportError {
                message: e.to_string(),
                duration: start.elapsed(),
            }),
        }
    }
}
