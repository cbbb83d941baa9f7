//! Throttled text and vision completions against named model tiers.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, Role, TokenUsage};
use crate::capture::Observation;
use crate::throttle::{RequestThrottler, ThrottleRequest, PRIORITY_NORMAL};

/// A named (provider, model) pair with its own timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTier {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub vision: bool,
    pub timeout: Duration,
}

impl ModelTier {
    pub fn text(
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            model: model.into(),
            vision: false,
            timeout,
        }
    }

    pub fn vision(
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            vision: true,
            ..Self::text(name, provider, model, timeout)
        }
    }
}

/// A text completion request.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub tier: ModelTier,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub priority: u8,
    pub batch_key: Option<String>,
}

impl TextRequest {
    pub fn new(tier: ModelTier, messages: Vec<ChatMessage>) -> Self {
        Self {
            tier,
            messages,
            temperature: None,
            max_tokens: None,
            priority: PRIORITY_NORMAL,
            batch_key: None,
        }
    }
}

/// A single-image vision completion request.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub tier: ModelTier,
    pub image: Observation,
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u64>,
    pub priority: u8,
    pub batch_key: Option<String>,
}

/// Completion text plus provenance.
#[derive(Debug, Clone)]
pub struct CapabilityResponse {
    pub text: String,
    pub tier: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
}

/// Content hash of one upstream call, used for request deduplication.
pub fn payload_hash(model: &str, messages: &[ChatMessage], options: &ChatOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(messages).unwrap_or_default());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(options).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Routes every capability call through the shared throttler.
pub struct CapabilityClient {
    providers: HashMap<String, Arc<dyn LlmClient>>,
    throttler: RequestThrottler<ChatResponse>,
    max_image_bytes: usize,
}

impl CapabilityClient {
    pub fn new(throttler: RequestThrottler<ChatResponse>, max_image_bytes: usize) -> Self {
        Self {
            providers: HashMap::new(),
            throttler,
            max_image_bytes,
        }
    }

    /// Register a provider under the name tiers refer to.
    pub fn with_provider(mut self, name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        self.providers.insert(name.into(), client);
        self
    }

    pub fn throttler(&self) -> &RequestThrottler<ChatResponse> {
        &self.throttler
    }

    pub async fn complete_text(&self, request: TextRequest) -> Result<CapabilityResponse, LlmError> {
        let options = ChatOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,

            ..ChatOptions::default()
        };
        self.dispatch(
            &request.tier,
            request.messages,
            options,
            request.priority,
            request.batch_key,
        )
        .await
    }

    /// Vision completion. Images over the byte budget are rejected before
    /// anything is queued.
    pub async fn complete_vision(
        &self,
        request: VisionRequest,
    ) -> Result<CapabilityResponse, LlmError> {
        if request.image.len() > self.max_image_bytes {
            return Err(LlmError::payload_too_large(
                request.image.len(),
                self.max_image_bytes,
            ));
        }
        if !request.tier.vision {
            return Err(LlmError::client_error(
                400,
                format!("tier {} does not accept images", request.tier.name),
            ));
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::with_image(
            Role::User,
            request.prompt,
            request.image.data_url(),
        ));

        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: request.max_tokens,

            ..ChatOptions::default()
        };
        self.dispatch(
            &request.tier,
            messages,
            options,
            request.priority,
            request.batch_key,
        )
        .await
    }

    async fn dispatch(
        &self,
        tier: &ModelTier,
        messages: Vec<ChatMessage>,
        mut options: ChatOptions,
        priority: u8,
        batch_key: Option<String>,
    ) -> Result<CapabilityResponse, LlmError> {
        let client = self.providers.get(&tier.provider).cloned().ok_or_else(|| {
            LlmError::client_error(404, format!("no provider registered as {}", tier.provider))
        })?;

        options.timeout = Some(tier.timeout);
        let hash = payload_hash(&tier.model, &messages, &options);
        let model = tier.model.clone();
        let mut request = ThrottleRequest::new(hash, move || async move {
            client.chat_completion(&model, &messages, &options).await
        })
        .with_priority(priority)
        .with_timeout(tier.timeout);
        if let Some(key) = batch_key {
            request = request.with_batch_key(key);
        }

        tracing::debug!(tier = %tier.name, model = %tier.model, "Submitting capability call");
        let response = self.throttler.submit(request).await?;

        let text = response
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::parse_error("empty completion".to_string()))?;

        Ok(CapabilityResponse {
            text,
            tier: tier.name.clone(),
            model: response.model.unwrap_or_else(|| tier.model.clone()),
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{reply, test_capability, ScriptedLlm};
    use crate::llm::LlmErrorKind;

    fn tier() -> ModelTier {
        ModelTier::vision("fast", "mock", "vision-a", Duration::from_secs(5))
    }

    #[test]
    fn test_payload_hash_depends_on_model_and_content() {
        let messages = vec![ChatMessage::user("hello")];
        let options = ChatOptions::default();
        let a = payload_hash("m1", &messages, &options);
        assert_eq!(a, payload_hash("m1", &messages, &options));
        assert_ne!(a, payload_hash("m2", &messages, &options));
        assert_ne!(
            a,
            payload_hash("m1", &[ChatMessage::user("hello!")], &options)
        );
    }

    #[tokio::test]
    async fn test_oversized_image_rejected_before_submission() {
        let llm = Arc::new(ScriptedLlm::new());
        let client = test_capability(llm.clone(), 16);

        let err = client
            .complete_vision(VisionRequest {
                tier: tier(),
                image: Observation::from_bytes("image/png", vec![0u8; 17], None),
                system: None,
                prompt: "what is shown?".to_string(),
                max_tokens: None,
                priority: PRIORITY_NORMAL,
                batch_key: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, LlmErrorKind::PayloadTooLarge);
        assert_eq!(llm.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_vision_request_carries_image() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script("vision-a", vec![reply("a calculator")]);
        let client = test_capability(llm.clone(), 1024);

        let response = client
            .complete_vision(VisionRequest {
                tier: tier(),
                image: Observation::from_bytes("image/png", vec![1, 2, 3], None),
                system: Some("judge".to_string()),
                prompt: "what is shown?".to_string(),
                max_tokens: Some(50),
                priority: PRIORITY_NORMAL,
                batch_key: None,
            })
            .await
            .unwrap();

        assert_eq!(response.text, "a calculator");
        assert_eq!(response.tier, "fast");
        let sent = llm.last_messages("vision-a").unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].content.has_image());
    }

    #[tokio::test]
    async fn test_empty_completion_is_parse_error() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script("text-a", vec![reply("   ")]);
        let client = test_capability(llm, 1024);

        let err = client
            .complete_text(TextRequest::new(
                ModelTier::text("t", "mock", "text-a", Duration::from_secs(5)),
                vec![ChatMessage::user("plan")],
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_client_error() {
        let client = test_capability(Arc::new(ScriptedLlm::new()), 1024);
        let err = client
            .complete_text(TextRequest::new(
                ModelTier::text("t", "elsewhere", "m", Duration::from_secs(5)),
                vec![ChatMessage::user("x")],
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Client);
    }
}
