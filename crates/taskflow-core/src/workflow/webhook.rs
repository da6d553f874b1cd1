//! Outbound HTTP calls for WEBHOOK steps.
//!
//! The engine only sees the [`WebhookCaller`] trait; [`HttpWebhookCaller`]
//! is the reqwest-backed default.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// A request built from a WEBHOOK step's config and input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl WebhookRequest {
    /// Build from step config `{url, method = "POST", headers = {}}` with `body` as payload.
    pub fn from_step_config(config: &Value, body: Value) -> Result<Self, EngineError> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| EngineError::BadRequest("Webhook step requires a 'url'".to_string()))?;
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_uppercase();
        let headers = config
            .get("headers")
            .and_then(Value::as_object)
            .map(|h| {
                h.iter()
                    .map(|(k, v)| {
                        let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            url: url.to_string(),
            method,
            headers,
            body,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookResponse {
    pub status_code: u16,
    /// Parsed JSON body, or the raw text when the body is not JSON.
    pub body: Value,
}

/// Any HTTP response, whatever its status, is a [`WebhookResponse`].
/// Errors are reserved for transport and body-read failures.
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn call(&self, request: WebhookRequest) -> Result<WebhookResponse, EngineError>;
}

/// Calls webhooks over HTTP with reqwest.
pub struct HttpWebhookCaller {
    client: reqwest::Client,
}

impl HttpWebhookCaller {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for HttpWebhookCaller {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn call(&self, request: WebhookRequest) -> Result<WebhookResponse, EngineError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            EngineError::BadRequest(format!("Invalid HTTP method '{}'", request.method))
        })?;

        tracing::info!("[Webhook] {} {}", method, request.url);

        let mut builder = self.client.request(method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if method != reqwest::Method::GET && method != reqwest::Method::HEAD {
            builder = builder.json(&request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Internal(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Internal(format!("Failed to read webhook response: {}", e)))?;

        if !status.is_success() {
            tracing::warn!("[Webhook] {} returned {}", request.url, status);
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(WebhookResponse {
            status_code: status.as_u16(),
            body,
        })
    }
}
