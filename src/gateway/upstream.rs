//! Upstream transports.
//!
//! # Responsibilities
//! - Turn `(operation, payload)` into a call on a leased connection
//! - Classify failures so the gateway can decide on retries
//! - Report the metered cost of a call when the upstream states it
//!
//! # Design Decisions
//! - `Upstream` is a trait so the gateway can be driven by scripted
//!   transports in tests
//! - API keys are read from the environment once, at construction

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::config::{HttpMethod, ServiceConfig};
use crate::error::UpstreamFailure;
use crate::pool::Connection;

/// A successful upstream answer.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub body: Value,
    /// Metered usage reported by the upstream (e.g. LLM tokens).
    pub cost: Option<u64>,
}

impl UpstreamResponse {
    pub fn new(body: Value) -> Self {
        let cost = extract_cost(&body);
        Self { body, cost }
    }
}

/// Something that can execute a call against an upstream service.
#[async_trait]
pub trait Upstream: Send + Sync + std::fmt::Debug {
    async fn call(
        &self,
        connection: &Connection,
        service: &ServiceConfig,
        operation: &str,
        payload: &Value,
    ) -> Result<UpstreamResponse, UpstreamFailure>;
}

/// Token usage as reported by LLM APIs.
///
/// Accepts `usage.total_tokens`, or `usage.input_tokens + usage.output_tokens`.
pub fn extract_cost(body: &Value) -> Option<u64> {
    let usage = body.get("usage")?;
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
        return Some(total);
    }
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
    }
}

/// HTTP/JSON transport over the pooled `reqwest::Client`.
#[derive(Debug, Default)]
pub struct HttpUpstream {
    api_keys: HashMap<String, String>,
}

impl HttpUpstream {
    /// Resolve each service's `api_key_env` from the process environment.
    pub fn from_env(services: &[ServiceConfig]) -> Self {
        let mut api_keys = HashMap::new();
        for service in services {
            let Some(var) = &service.api_key_env else {
                continue;
            };
            match std::env::var(var) {
                Ok(key) if !key.is_empty() => {
                    api_keys.insert(service.name.clone(), key);
                }
                _ => tracing::warn!(service = %service.name, env = %var, "API key not set; calling without credentials"),
            }
        }
        Self { api_keys }
    }

    pub fn with_keys(api_keys: HashMap<String, String>) -> Self {
        Self { api_keys }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(
        &self,
        connection: &Connection,
        service: &ServiceConfig,
        operation: &str,
        payload: &Value,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let url = endpoint_url(connection.base_url.as_str(), operation);

        let mut request = match service.method {
            HttpMethod::Get => connection.client.get(&url).query(&query_pairs(payload)),
            HttpMethod::Post => connection.client.post(&url).json(payload),
        };

        if let Some(key) = self.api_keys.get(&service.name) {
            request = match &service.api_key_header {
                Some(header) => request.header(header.as_str(), key.as_str()),
                None => request.bearer_auth(key),
            };
        }

        tracing::debug!(service = %service.name, url = %url, method = ?service.method, "Calling upstream");

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamFailure::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UpstreamFailure::Transport(e.to_string()))?;

        if status.is_client_error() || status.is_server_error() {
            return Err(UpstreamFailure::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| UpstreamFailure::InvalidResponse(e.to_string()))?
        };
        Ok(UpstreamResponse::new(body))
    }
}

fn endpoint_url(base: &str, operation: &str) -> String {
    let operation = operation.trim_start_matches('/');
    if operation.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), operation)
    }
}

/// Flatten a JSON object into query parameters. Non-objects yield none.
fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = payload else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}
