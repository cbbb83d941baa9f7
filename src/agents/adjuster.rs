//! Decides what happens after an attempt that was not verified.
//!
//! Analyzes the failure mode of the latest attempt and recommends:
//! - retry unchanged while attempt budget remains
//! - retry with a rewritten action/criterion when the target was reached but
//!   showed the wrong outcome
//! - a bounded replan once the budget is spent
//! - terminal failure otherwise

use std::sync::Arc;

use serde::Deserialize;

use crate::config::AdjusterConfig;
use crate::llm::{CapabilityClient, ChatMessage, ModelTier, TextRequest};
use crate::todo::{Action, Attempt, TodoItem, ToolCallSpec};
use crate::verify::extract_json;

/// Below this verification confidence a negative verdict counts as
/// inconclusive rather than a wrong outcome.
const INCONCLUSIVE_CONFIDENCE: u8 = 50;

/// Why the latest attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// A tool call returned an error
    ToolError,
    /// The judge's justification contradicted the criterion
    Contradiction,
    /// Verification confidently saw the criterion unmet
    WrongOutcome,
    /// Verification could not tell
    Inconclusive,
}

impl FailureMode {
    pub fn of(attempt: &Attempt) -> Self {
        if attempt.execution_result().error.is_some() {
            return FailureMode::ToolError;
        }
        match attempt.verification() {
            Some(v) if v.contradiction_detected() => FailureMode::Contradiction,
            Some(v) if v.confidence() >= INCONCLUSIVE_CONFIDENCE => FailureMode::WrongOutcome,
            _ => FailureMode::Inconclusive,
        }
    }

    fn warrants_rewrite(&self) -> bool {
        matches!(self, FailureMode::Contradiction | FailureMode::WrongOutcome)
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Adjustment {
    Retry {
        reason: String,
    },
    Rewrite {
        action: Action,
        success_criteria: String,
        reason: String,
    },
    Replan {
        reason: String,
    },
    Fail {
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct RewriteProposal {
    #[serde(alias = "description")]
    action: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallSpec>,
    success_criteria: String,
}

pub struct Adjuster {
    capability: Arc<CapabilityClient>,
    tier: ModelTier,
    config: AdjusterConfig,
    max_replans: u32,
}

impl Adjuster {
    pub fn new(
        capability: Arc<CapabilityClient>,
        tier: ModelTier,
        config: AdjusterConfig,
        max_replans: u32,
    ) -> Self {
        Self {
            capability,
            tier,
            config,
            max_replans,
        }
    }

    /// Decide for `item`, which is verifying with its failed attempt recorded.
    pub async fn adjust(&self, item: &TodoItem, replans_used: u32) -> Adjustment {
        let Some(attempt) = item.last_attempt() else {
            return Adjustment::Retry {
                reason: "no attempt recorded".to_string(),
            };
        };
        let mode = FailureMode::of(attempt);
        let reason = describe(attempt, mode);

        if item.attempts_remaining() == 0 {
            return if replans_used < self.max_replans {
                Adjustment::Replan { reason }
            } else {
                Adjustment::Fail {
                    reason: format!(
                        "{} after {} attempts",
                        reason,
                        item.attempts().len()
                    ),
                }
            };
        }

        if self.config.rewrite_enabled
            && mode.warrants_rewrite()
            && item.rewrites() < self.config.max_rewrites
        {
            if let Some((action, success_criteria)) = self.rewrite(item, &reason).await {
                return Adjustment::Rewrite {
                    action,
                    success_criteria,
                    reason,
                };
            }
        }
        Adjustment::Retry { reason }
    }

    async fn rewrite(&self, item: &TodoItem, reason: &str) -> Option<(Action, String)> {
        let prompt = format!(
            "A step did not achieve its goal.\nAction: {}\nTool calls: {}\nSuccess criteria: {}\nWhat went wrong: {}\n\n\
             Rewrite the step so the next attempt can succeed. Keep the same goal.\n\
             Respond with JSON only: {{\"action\": \"...\", \"tool_calls\": [...], \"success_criteria\": \"...\"}}",
            item.action().description,
            serde_json::to_string(&item.action().tool_calls).unwrap_or_default(),
            item.success_criteria(),
            reason
        );
        let mut call = TextRequest::new(self.tier.clone(), vec![ChatMessage::user(prompt)]);
        call.temperature = Some(0.2);
        call.max_tokens = Some(800);

        let response = match self.capability.complete_text(call).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(item = %item.id(), error = %e, "Rewrite call failed, retrying unchanged");
                return None;
            }
        };
        let proposal = extract_json(&response.text)
            .and_then(|v| serde_json::from_value::<RewriteProposal>(v).ok())
            .filter(|p| !p.success_criteria.trim().is_empty());
        match proposal {
            Some(p) => {
                // Keep the original tool calls when the rewrite drops them
                let tool_calls = if p.tool_calls.is_empty() {
                    item.action().tool_calls.clone()
                } else {
                    p.tool_calls
                };
                tracing::info!(item = %item.id(), criteria = %p.success_criteria, "Item rewritten");
                Some((Action::new(p.action, tool_calls), p.success_criteria))
            }
            None => {
                tracing::warn!(item = %item.id(), "Unusable rewrite, retrying unchanged");
                None
            }
        }
    }
}

fn describe(attempt: &Attempt, mode: FailureMode) -> String {
    match (mode, &attempt.execution_result().error, attempt.verification()) {
        (FailureMode::ToolError, Some(e), _) => format!("tool error: {}", e),
        (_, _, Some(v)) => format!("not verified ({}): {}", v.method(), v.reason()),
        _ => "not verified".to_string(),
    }
}
