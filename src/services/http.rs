//! JSON-over-HTTP clients for the extraction and structuring services

use super::{ExtractionService, ServiceError, StructuringService};
use crate::{ExtractedText, StructuringHints};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP connect timeout (seconds)
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds)
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Longest error body excerpt kept in error messages
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Build a client with explicit connect and request timeouts
pub fn build_http_client() -> Result<Client, ServiceError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| ServiceError::Fatal(format!("failed to build HTTP client: {e}")))
}

/// Classify a non-success HTTP status
///
/// 429 is a rate limit; 408 and 5xx are transient; any other status is fatal.
pub fn classify_status(status: u16, detail: &str) -> ServiceError {
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(detail))
    };
    match status {
        429 => ServiceError::RateLimited(message),
        408 | 500..=599 => ServiceError::Transient(message),
        _ => ServiceError::Fatal(message),
    }
}

/// Classify a `success: false` body by its error text
pub fn classify_reported_failure(error: &str) -> ServiceError {
    let lowered = error.to_lowercase();
    if lowered.contains("429") || lowered.contains("rate limit") {
        ServiceError::RateLimited(error.to_string())
    } else {
        ServiceError::Fatal(error.to_string())
    }
}

/// Classify a transport-level failure
pub fn classify_transport_error(err: &reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Transient(format!("request timed out: {err}"))
    } else if err.is_connect() || err.is_request() {
        ServiceError::Transient(format!("connection failed: {err}"))
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), &err.to_string())
    } else if err.is_decode() || err.is_body() {
        ServiceError::Transient(format!("incomplete response: {err}"))
    } else {
        ServiceError::Fatal(err.to_string())
    }
}

fn truncate(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{cut}...")
    }
}

/// Send a request and decode its JSON body, classifying every failure
async fn send_json<T: serde::de::DeserializeOwned>(
    request: RequestBuilder,
    endpoint: &str,
) -> Result<T, ServiceError> {
    let response = request.send().await.map_err(|e| {
        warn!(endpoint = %endpoint, error = %e, "Request failed before a response");
        classify_transport_error(&e)
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status.as_u16(), &body);
        warn!(
            endpoint = %endpoint,
            status = status.as_u16(),
            class = err.class().as_str(),
            "Service returned an error status"
        );
        return Err(err);
    }

    let body = response.bytes().await.map_err(|e| classify_transport_error(&e))?;
    serde_json::from_slice(&body)
        .map_err(|e| ServiceError::Fatal(format!("invalid response body: {e}")))
}

fn with_api_key(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    words: Vec<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StructuringResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    record: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct StructuringRequest<'a> {
    text: &'a str,
    confidence: f64,
    item_id: &'a str,
}

fn default_success() -> bool {
    true
}

/// Extraction service reached over HTTP
///
/// Posts the raw image bytes and expects
/// `{success, text, confidence, words, error?}` back.
#[derive(Debug, Clone)]
pub struct HttpExtractionClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpExtractionClient {
    /// Create a client for `endpoint`
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, ServiceError> {
        Ok(Self::with_client(build_http_client()?, endpoint, api_key))
    }

    /// Create a client reusing an existing `reqwest::Client`
    pub fn with_client(client: Client, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionClient {
    async fn extract_text(&self, image: &[u8]) -> Result<ExtractedText, ServiceError> {
        debug!(endpoint = %self.endpoint, bytes = image.len(), "Sending extraction request");
        let request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec());
        let response: ExtractionResponse =
            send_json(with_api_key(request, self.api_key.as_deref()), &self.endpoint).await?;

        if !response.success {
            let error = response
                .error
                .unwrap_or_else(|| "extraction reported failure".to_string());
            return Err(classify_reported_failure(&error));
        }

        let extracted = ExtractedText {
            text: response.text,
            confidence: response.confidence,
            words: response.words,
        };
        extracted.validate().map_err(ServiceError::Fatal)?;
        Ok(extracted)
    }
}

/// Structuring service reached over HTTP
///
/// Posts `{text, confidence, item_id}` and expects `{success, record, error?}`.
#[derive(Debug, Clone)]
pub struct HttpStructuringClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpStructuringClient {
    /// Create a client for `endpoint`
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, ServiceError> {
        Ok(Self::with_client(build_http_client()?, endpoint, api_key))
    }

    /// Create a client reusing an existing `reqwest::Client`
    pub fn with_client(client: Client, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl StructuringService for HttpStructuringClient {
    async fn structure(
        &self,
        text: &ExtractedText,
        hints: &StructuringHints,
    ) -> Result<serde_json::Value, ServiceError> {
        debug!(endpoint = %self.endpoint, item_id = %hints.item_id, "Sending structuring request");
        let body = StructuringRequest {
            text: &text.text,
            confidence: hints.confidence,
            item_id: &hints.item_id,
        };
        let request = self.client.post(&self.endpoint).json(&body);
        let response: StructuringResponse =
            send_json(with_api_key(request, self.api_key.as_deref()), &self.endpoint).await?;

        if !response.success {
            let error = response
                .error
                .unwrap_or_else(|| "structuring reported failure".to_string());
            return Err(classify_reported_failure(&error));
        }

        match response.record {
            Some(record) if record.is_object() => Ok(record),
            Some(_) => Err(ServiceError::Fatal(
                "structuring record is not a JSON object".to_string(),
            )),
            None => Err(ServiceError::Fatal(
                "structuring response has no record".to_string(),
            )),
        }
    }
}
