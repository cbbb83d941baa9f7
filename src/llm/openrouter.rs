//! OpenAI-compatible chat completion client (OpenRouter by default).
//!
//! The same client serves alternate and offline providers by pointing
//! `base_url` at any endpoint that speaks the chat completions protocol.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{classify_http_status, LlmError, LlmErrorKind};
use super::{truncate, ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Used when the caller sets no deadline.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// OpenRouter API client. Issues one request per call.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterClient {
    /// Create a new client against the public OpenRouter endpoint.
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, OPENROUTER_API_URL.to_string())
    }

    /// Create a client against a custom OpenAI-compatible endpoint.
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    /// Create an LlmError from HTTP response status and body.
    fn create_error(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
        timeout: Duration,
    ) -> LlmError {
        let status_code = status.as_u16();

        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::Client => LlmError::client_error(status_code, body.to_string()),
            LlmErrorKind::PayloadTooLarge => LlmError::client_error(status_code, body.to_string()),
            LlmErrorKind::Timeout => LlmError::timeout(timeout),
            _ => LlmError::infra(status_code, body.to_string()),
        }
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let request = OpenRouterRequest {
            model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let timeout = options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        tracing::debug!(model = %model, messages = messages.len(), "Sending completion request");

        let response = match self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "overseer")
            .json(&request)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(LlmError::timeout(timeout));
                } else if e.is_connect() {
                    return Err(LlmError::network_error(format!("Connection failed: {}", e)));
                } else {
                    return Err(LlmError::network_error(format!("Request failed: {}", e)));
                }
            }
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after, timeout));
        }

        let parsed: OpenRouterResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!(
                "Failed to parse response: {}, body: {}",
                e,
                truncate(&body, 500)
            ))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(model.to_string())),
        })
    }
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

/// OpenRouter API response format.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
    #[serde(default)]
    model: Option<String>,
}

/// A choice in the OpenRouter response.
#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
    finish_reason: Option<String>,
}

/// Message in OpenRouter response.
#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
}

/// Usage data (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_from_status() {
        let err = OpenRouterClient::create_error(
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            "overloaded",
            None,
            Duration::from_secs(30),
        );
        assert_eq!(err.kind, LlmErrorKind::Infra);
        assert_eq!(err.status_code, Some(503));

        let err = OpenRouterClient::create_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down",
            Some(Duration::from_secs(2)),
            Duration::from_secs(30),
        );
        assert_eq!(err.kind, LlmErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));

        let err = OpenRouterClient::create_error(
            reqwest::StatusCode::UNAUTHORIZED,
            "bad key",
            None,
            Duration::from_secs(30),
        );
        assert_eq!(err.kind, LlmErrorKind::Client);
    }

    #[test]
    fn test_request_timeout_reports_configured_deadline() {
        let err = OpenRouterClient::create_error(
            reqwest::StatusCode::REQUEST_TIMEOUT,
            "",
            None,
            Duration::from_secs(45),
        );
        assert_eq!(err.kind, LlmErrorKind::Timeout);
        assert!(err.to_string().contains("45000"), "{}", err);
    }

    #[test]
    fn test_error_body_truncation_respects_char_boundaries() {
        let body = format!("{}é trailing", "x".repeat(499));
        let cut = truncate(&body, 500);
        assert!(cut.ends_with("..."));
        assert!(cut.starts_with(&"x".repeat(499)));
        assert!(!cut.contains('é'));
    }

    #[test]
    fn test_request_serialization_skips_unset_options() {
        let messages = vec![ChatMessage::user("hi")];
        let request = OpenRouterRequest {
            model: "m",
            messages: &messages,
            temperature: None,
            max_tokens: Some(10),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["max_tokens"], 10);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hi");
    }
}
