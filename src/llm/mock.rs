use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CapabilityClient, ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, TokenUsage,
};
use crate::config::ThrottleConfig;
use crate::throttle::RequestThrottler;

pub(crate) const MOCK_PROVIDER: &str = "mock";

/// Successful completion with the given text.
pub(crate) fn reply(text: &str) -> Result<ChatResponse, LlmError> {
    Ok(ChatResponse {
        content: Some(text.to_string()),
        finish_reason: Some("stop".to_string()),
        usage: Some(TokenUsage::new(10, 5)),
        model: None,
    })
}

/// Throttler settings that add almost no latency.
pub(crate) fn fast_throttle() -> ThrottleConfig {
    ThrottleConfig {
        base_delay: Duration::from_millis(1),
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_concurrent: 8,
        batch_wait_time: Duration::from_millis(5),
        failure_threshold: 1_000,
        ..ThrottleConfig::default()
    }
}

/// Capability client backed by `llm` under the `mock` provider name.
pub(crate) fn test_capability(llm: Arc<ScriptedLlm>, max_image_bytes: usize) -> CapabilityClient {
    CapabilityClient::new(RequestThrottler::spawn(fast_throttle()), max_image_bytes)
        .with_provider(MOCK_PROVIDER, llm)
}

/// Scripted completions per model, consumed in order.
///
/// When a model's script runs dry its `always` response is used, if any.
#[derive(Default)]
pub(crate) struct ScriptedLlm {
    scripts: Mutex<HashMap<String, VecDeque<Result<ChatResponse, LlmError>>>>,
    fallback: Mutex<HashMap<String, Result<ChatResponse, LlmError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl ScriptedLlm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, model: &str, responses: Vec<Result<ChatResponse, LlmError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .extend(responses);
    }

    pub(crate) fn always(&self, model: &str, response: Result<ChatResponse, LlmError>) {
        self.fallback
            .lock()
            .unwrap()
            .insert(model.to_string(), response);
    }

    pub(crate) fn delay(&self, model: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(model.to_string(), delay);
    }

    pub(crate) fn calls_for(&self, model: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == model)
            .count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn last_messages(&self, model: &str) -> Option<Vec<ChatMessage>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == model)
            .map(|(_, messages)| messages.clone())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));

        let delay = self.delays.lock().unwrap().get(model).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(result) => result,
            None => self
                .fallback
                .lock()
                .unwrap()
                .get(model)
                .cloned()
                .unwrap_or_else(|| {
                    Err(LlmError::client_error(
                        404,
                        format!("no scripted response for {}", model),
                    ))
                }),
        }
    }
}
