//! Chooses how an attempt is verified: visual, probe or hybrid.

use std::sync::Arc;

use serde_json::Value;

use super::parse::extract_json;
use super::VerificationRequest;
use crate::config::SelectorConfig;
use crate::llm::{CapabilityClient, ChatMessage, ModelTier, TextRequest};
use crate::todo::VerificationMethod;

const JUDGE_PROMPT: &str = "You choose how to verify that an automated action succeeded.\n\
- visual: look at a screenshot of the target\n\
- probe: run programmatic checks (files, commands, read-only tool queries)\n\
- hybrid: probe first, then look if the probe is inconclusive\n\
Respond with JSON only: {\"method\": \"visual|probe|hybrid\", \"confidence\": 0-100}";

/// A verification method with the confidence behind choosing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyChoice {
    pub method: VerificationMethod,
    pub confidence: u8,
}

impl StrategyChoice {
    pub fn new(method: VerificationMethod, confidence: u8) -> Self {
        Self {
            method,
            confidence: confidence.min(100),
        }
    }
}

/// Context-only choice, before any judge is consulted.
pub fn heuristic(has_probe: bool, capture_available: bool, config: &SelectorConfig) -> StrategyChoice {
    match (has_probe, capture_available) {
        (false, true) => StrategyChoice::new(VerificationMethod::Visual, config.heuristic_confidence),
        (true, true) => StrategyChoice::new(VerificationMethod::Hybrid, config.hybrid_confidence),
        (false, false) => StrategyChoice::new(VerificationMethod::Probe, config.probe_confidence),
        // An explicit probe and nothing to look at
        (true, false) => StrategyChoice::new(
            VerificationMethod::Probe,
            config.probe_confidence.saturating_add(5),
        ),
    }
}

/// Whether a judgement could change the outcome at all.
pub fn judge_can_override(heuristic: StrategyChoice, config: &SelectorConfig) -> bool {
    let keeps = heuristic.confidence >= config.keep_threshold;
    !(keeps && heuristic.confidence as u16 + config.override_gap as u16 >= 100)
}

/// Keep the heuristic iff it is confident enough and the judgement does not
/// beat it by more than the override gap.
pub fn decide(
    heuristic: StrategyChoice,
    judgement: Option<StrategyChoice>,
    config: &SelectorConfig,
) -> StrategyChoice {
    let Some(judgement) = judgement else {
        return heuristic;
    };
    let keep = heuristic.confidence >= config.keep_threshold
        && judgement.confidence as u16 <= heuristic.confidence as u16 + config.override_gap as u16;
    if keep {
        heuristic
    } else {
        judgement
    }
}

fn parse_choice(text: &str) -> Option<StrategyChoice> {
    let value = extract_json(text)?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(|m| Value::String(m.trim().to_lowercase()))
        .and_then(|m| serde_json::from_value::<VerificationMethod>(m).ok())?;
    let confidence = value.get("confidence").and_then(Value::as_f64)?;
    let confidence = if confidence > 0.0 && confidence < 1.0 {
        confidence * 100.0
    } else {
        confidence
    };
    Some(StrategyChoice::new(
        method,
        confidence.clamp(0.0, 100.0).round() as u8,
    ))
}

pub struct VerificationStrategySelector {
    capability: Arc<CapabilityClient>,
    judge_tier: ModelTier,
    config: SelectorConfig,
}

impl VerificationStrategySelector {
    pub fn new(capability: Arc<CapabilityClient>, judge_tier: ModelTier, config: SelectorConfig) -> Self {
        Self {
            capability,
            judge_tier,
            config,
        }
    }

    pub async fn select(
        &self,
        request: &VerificationRequest,
        capture_available: bool,
    ) -> StrategyChoice {
        let heuristic = heuristic(request.probe.is_some(), capture_available, &self.config);
        if !self.config.judge_enabled || !judge_can_override(heuristic, &self.config) {
            return heuristic;
        }

        let judgement = self.judge(request).await;
        let mut choice = decide(heuristic, judgement, &self.config);
        if !capture_available && choice.method != VerificationMethod::Probe {
            tracing::debug!(item = %request.item_id, method = %choice.method, "No capture available, downgrading to probe");
            choice.method = VerificationMethod::Probe;
        }
        tracing::debug!(
            item = %request.item_id,
            heuristic = %heuristic.method,
            chosen = %choice.method,
            confidence = choice.confidence,
            "Verification strategy selected"
        );
        choice
    }

    async fn judge(&self, request: &VerificationRequest) -> Option<StrategyChoice> {
        let prompt = format!(
            "Action: {}\nSuccess criterion: {}\nExecution result: {}\nExplicit probe available: {}",
            request.action,
            request.success_criteria,
            serde_json::to_string(&request.execution).unwrap_or_default(),
            request.probe.is_some()
        );
        let mut call = TextRequest::new(
            self.judge_tier.clone(),
            vec![ChatMessage::system(JUDGE_PROMPT), ChatMessage::user(prompt)],
        );
        call.temperature = Some(0.0);
        call.max_tokens = Some(200);
        // Concurrent selections for the same item and criterion share one judgement
        call.batch_key = Some(format!("judge:{}:{}", request.item_id, request.success_criteria));

        match self.capability.complete_text(call).await {
            Ok(response) => {
                let choice = parse_choice(&response.text);
                if choice.is_none() {
                    tracing::warn!(item = %request.item_id, "Unparseable strategy judgement, keeping heuristic");
                }
                choice
            }
            Err(e) => {
                tracing::warn!(item = %request.item_id, error = %e, "Strategy judge failed, keeping heuristic");
                None
            }
        }
    }
}
