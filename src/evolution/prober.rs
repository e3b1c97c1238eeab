//! Endpoint fallback prober.
//!
//! Tries each candidate endpoint of an operation in order and stops at the
//! first `200` response with a usable body. There is no backoff and no
//! circuit breaker; a failed probe reports every attempt instead.

use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::endpoints::{Endpoint, Operation};
use super::normalize::normalize_records;
use crate::credentials::ServerCredentials;
use crate::error::{FailedAttempt, GatewayError};

/// Maximum number of characters of an upstream body kept in error messages
const ERROR_BODY_PREVIEW: usize = 200;

/// Parameters of a probe
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub operation: Operation,
    pub remote_jid: Option<String>,
    pub message_id: Option<String>,
    pub limit: usize,
}

impl ProbeRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            remote_jid: None,
            message_id: None,
            limit: 100,
        }
    }

    pub fn with_remote_jid(mut self, jid: impl Into<String>) -> Self {
        self.remote_jid = Some(jid.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// The first endpoint that produced a usable payload
#[derive(Debug, Clone)]
pub struct ProbeSuccess {
    pub endpoint: &'static Endpoint,
    pub url: String,
    pub body: Value,
    /// Number of endpoints called, including the successful one
    pub attempts: usize,
}

/// Diagnostic report for a single endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointReport {
    pub version: String,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub ok: bool,
    pub records: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why one attempt did not produce a payload
#[derive(Debug)]
struct AttemptFailure {
    status: Option<StatusCode>,
    reason: String,
}

impl AttemptFailure {
    fn is_auth(&self) -> bool {
        matches!(
            self.status,
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN)
        )
    }
}

/// Sequential fallback prober over the endpoint catalog
#[derive(Clone)]
pub struct EndpointProber {
    client: Client,
}

impl Default for EndpointProber {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl EndpointProber {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Probe the operation's endpoints in order until one succeeds.
    pub async fn probe(
        &self,
        creds: &ServerCredentials,
        request: &ProbeRequest,
    ) -> Result<ProbeSuccess, GatewayError> {
        let operation = request.operation;
        let endpoints = operation.endpoints_for(creds.api_version);
        let mut failures: Vec<(String, AttemptFailure)> = Vec::new();

        for (index, endpoint) in endpoints.into_iter().enumerate() {
            let url = endpoint.url(&creds.api_url, &creds.instance_id);
            debug!(
                "Probing {} [{} {}] {}",
                operation,
                endpoint.version,
                endpoint.method.to_method(),
                url
            );

            match self.attempt(creds, endpoint, request).await {
                Ok(body) => {
                    info!(
                        "{} succeeded via {} after {} attempt(s)",
                        operation,
                        url,
                        index + 1
                    );
                    return Ok(ProbeSuccess {
                        endpoint,
                        url,
                        body,
                        attempts: index + 1,
                    });
                }
                Err(failure) => {
                    warn!("{} failed at {}: {}", operation, url, failure.reason);
                    failures.push((url, failure));
                }
            }
        }

        let responded: Vec<_> = failures.iter().filter(|(_, f)| f.status.is_some()).collect();
        if !responded.is_empty() && responded.iter().all(|(_, f)| f.is_auth()) {
            return Err(GatewayError::UpstreamAuth {
                service: "evolution api".to_string(),
            });
        }

        Err(GatewayError::AllEndpointsFailed {
            operation: operation.name().to_string(),
            attempts: failures
                .into_iter()
                .map(|(url, f)| FailedAttempt {
                    url,
                    reason: f.reason,
                })
                .collect(),
        })
    }

    /// Call every endpoint of the operation and report on each one.
    pub async fn diagnose(
        &self,
        creds: &ServerCredentials,
        request: &ProbeRequest,
    ) -> Vec<EndpointReport> {
        let endpoints = request.operation.endpoints_for(creds.api_version);
        let checks = endpoints.into_iter().map(|endpoint| async move {
            let started = Instant::now();
            let result = self.attempt(creds, endpoint, request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let url = endpoint.url(&creds.api_url, &creds.instance_id);
            let version = endpoint.version.to_string();
            let method = endpoint.method.to_method().to_string();

            match result {
                Ok(body) => EndpointReport {
                    version,
                    method,
                    url,
                    status: Some(StatusCode::OK.as_u16()),
                    ok: true,
                    records: normalize_records(&body).len(),
                    elapsed_ms,
                    error: None,
                },
                Err(failure) => EndpointReport {
                    version,
                    method,
                    url,
                    status: failure.status.map(|s| s.as_u16()),
                    ok: false,
                    records: 0,
                    elapsed_ms,
                    error: Some(failure.reason),
                },
            }
        });

        futures::future::join_all(checks).await
    }

    /// Single request without fallback, for operations with one known endpoint.
    pub async fn send(
        &self,
        creds: &ServerCredentials,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let url = format!(
            "{}{}",
            creds.api_url,
            path.replace("{instance}", &urlencoding::encode(&creds.instance_id))
        );
        let mut builder = self
            .client
            .request(method, &url)
            .timeout(timeout)
            .header("apikey", &creds.api_token)
            .bearer_auth(&creds.api_token);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(GatewayError::from_request)?;
        let status = response.status();
        let text = response.text().await.map_err(GatewayError::from_request)?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::UpstreamAuth {
                service: "evolution api".to_string(),
            });
        }
        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                message: preview(&text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::MalformedResponse(e.to_string()))
    }

    async fn attempt(
        &self,
        creds: &ServerCredentials,
        endpoint: &Endpoint,
        request: &ProbeRequest,
    ) -> Result<Value, AttemptFailure> {
        let mut url = endpoint.url(&creds.api_url, &creds.instance_id);
        if let Some(query) = endpoint.query(request.remote_jid.as_deref()) {
            url = format!("{}?{}", url, query);
        }

        let mut builder = self
            .client
            .request(endpoint.method.to_method(), &url)
            .timeout(request.operation.timeout())
            .header("apikey", &creds.api_token)
            .bearer_auth(&creds.api_token);
        if let Some(body) = endpoint.body(
            request.remote_jid.as_deref(),
            request.message_id.as_deref(),
            request.limit,
        ) {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(|e| AttemptFailure {
            status: None,
            reason: if e.is_timeout() {
                "timed out".to_string()
            } else {
                format!("request failed: {}", e)
            },
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| AttemptFailure {
            status: Some(status),
            reason: format!("failed to read body: {}", e),
        })?;

        if status != StatusCode::OK {
            return Err(AttemptFailure {
                status: Some(status),
                reason: format!("HTTP {}: {}", status.as_u16(), preview(&text)),
            });
        }

        usable_payload(&text).ok_or_else(|| AttemptFailure {
            status: Some(status),
            reason: "empty or unparseable body".to_string(),
        })
    }
}

/// Parse a body, treating blank, `null`, `[]` and `{}` as unusable.
fn usable_payload(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(text).ok()?;
    let empty = match &value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        None
    } else {
        Some(value)
    }
}

fn preview(text: &str) -> String {
    text.chars().take(ERROR_BODY_PREVIEW).collect()
}
