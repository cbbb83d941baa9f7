//! Screenshot-based verification with tier fallback.
//!
//! Tiers are tried in order. Definitive failures (5xx, timeout, payload too
//! large, client errors) advance to the next tier at once; transient failures
//! (network, 429, queue overflow) get a bounded same-tier retry first. When
//! every tier fails the verdict comes from a text-only heuristic over the
//! tool output, at low confidence.

use std::sync::Arc;
use std::time::Instant;

use super::cache::{FallbackEvent, FallbackLog, VerdictCache};
use super::contradiction::{self, key_terms, semantic_match};
use super::parse::{parse_judgement, Judgement, ParsedJudgement};
use super::VerificationRequest;
use crate::capture::{Observation, ObservationCapture};
use crate::config::VisionConfig;
use crate::llm::{truncate, CapabilityClient, CapabilityResponse, LlmError, ModelTier, VisionRequest};
use crate::throttle::PRIORITY_CRITICAL;
use crate::todo::{Evidence, ParseOutcome, VerificationMethod, VerificationResult};

const MAX_RAW_LEN: usize = 2_000;
const MAX_OUTPUT_IN_PROMPT: usize = 1_500;

const SYSTEM_PROMPT: &str = "You check whether an action achieved its goal by looking at a screenshot. \
Judge only what is visible. Quote the exact value you see.\n\
Respond with JSON only:\n\
{\"verified\": true|false, \"confidence\": 0-100, \"reason\": \"...\", \
\"evidence\": {\"observed\": \"what is visible\", \"expected\": \"what the criterion requires\"}}";

pub struct VisionVerifier {
    capability: Arc<CapabilityClient>,
    capture: Arc<dyn ObservationCapture>,
    tiers: Vec<ModelTier>,
    config: VisionConfig,
    cache: VerdictCache,
    fallbacks: FallbackLog,
}

impl VisionVerifier {
    pub fn new(
        capability: Arc<CapabilityClient>,
        capture: Arc<dyn ObservationCapture>,
        tiers: Vec<ModelTier>,
        config: VisionConfig,
    ) -> Self {
        let cache = VerdictCache::new(config.cache_ttl);
        let fallbacks = FallbackLog::new(config.fallback_event_capacity);
        Self {
            capability,
            capture,
            tiers,
            config,
            cache,
            fallbacks,
        }
    }

    pub fn capture_available(&self) -> bool {
        self.capture.is_available()
    }

    pub fn fallback_log(&self) -> &FallbackLog {
        &self.fallbacks
    }

    pub async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        let observation = match self
            .capture
            .capture(request.target.as_deref(), false)
            .await
        {
            Ok(observation) => observation,
            Err(e) => {
                tracing::warn!(item = %request.item_id, error = %e, "Capture failed, using text heuristic");
                return self.text_heuristic(request, &format!("capture failed: {}", e));
            }
        };

        if let Some(cached) = self
            .cache
            .get(&observation.hash, &request.success_criteria)
            .await
        {
            tracing::debug!(item = %request.item_id, hash = %observation.hash, "Verdict cache hit");
            let mut evidence = cached.evidence().clone();
            evidence.source = "cache".to_string();
            return VerificationResult::new(
                cached.method(),
                cached.verified(),
                cached.confidence(),
                cached.reason(),
                evidence,
                cached.contradiction_detected(),
            );
        }

        let chain_length = self.tiers.len() as u32;
        for (index, tier) in self.tiers.iter().enumerate() {
            let started = Instant::now();
            match self.ask_tier(tier, &observation, request).await {
                Ok(response) => {
                    let result = self.judge(&response, &observation, request);
                    if result.evidence().parse != ParseOutcome::ParseFailed {
                        self.cache
                            .insert(&observation.hash, &request.success_criteria, result.clone())
                            .await;
                    }
                    return result;
                }
                Err(e) => {
                    tracing::warn!(
                        item = %request.item_id,
                        tier = %tier.name,
                        model = %tier.model,
                        error = %e,
                        "Vision tier failed, falling back"
                    );
                    self.fallbacks
                        .record(FallbackEvent::new(
                            &tier.name,
                            &tier.model,
                            e.kind,
                            e.status_code,
                            started.elapsed(),
                            index as u32 + 1,
                            chain_length,
                        ))
                        .await;
                }
            }
        }

        self.text_heuristic(request, "all vision tiers failed")
    }

    /// One tier, with same-tier retry for transient errors only.
    async fn ask_tier(
        &self,
        tier: &ModelTier,
        observation: &Observation,
        request: &VerificationRequest,
    ) -> Result<CapabilityResponse, LlmError> {
        let retry = &self.config.retry;
        // Checks of the same criterion against the same screen share one call per tier
        let batch_key = format!(
            "verify:{}:{}:{}:{}",
            request.item_id, request.success_criteria, observation.hash, tier.name
        );
        let mut attempt = 0;
        loop {
            let call = VisionRequest {
                tier: tier.clone(),
                image: observation.clone(),
                system: Some(SYSTEM_PROMPT.to_string()),
                prompt: self.prompt(request),
                max_tokens: Some(self.config.max_tokens),
                priority: PRIORITY_CRITICAL,
                batch_key: Some(batch_key.clone()),
            };
            match self.capability.complete_vision(call).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < retry.max_retries && retry.should_retry(&e) => {
                    let delay = retry.delay_for(&e, attempt);
                    tracing::debug!(
                        tier = %tier.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying vision tier"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn prompt(&self, request: &VerificationRequest) -> String {
        let mut prompt = format!(
            "Action performed: {}\nSuccess criterion: {}\n",
            request.action, request.success_criteria
        );
        let output = request.execution.output_text();
        if !output.trim().is_empty() {
            prompt.push_str(&format!(
                "Tool output:\n{}\n",
                truncate(&output, MAX_OUTPUT_IN_PROMPT)
            ));
        }
        prompt.push_str("Does the screenshot show that the success criterion is met?");
        prompt
    }

    fn judge(
        &self,
        response: &CapabilityResponse,
        observation: &Observation,
        request: &VerificationRequest,
    ) -> VerificationResult {
        let criterion = &request.success_criteria;
        let (judgement, parse) = match parse_judgement(&response.text) {
            ParsedJudgement::Structured(judgement) => (judgement, ParseOutcome::Structured),
            ParsedJudgement::Unstructured { judgement, .. } => {
                (judgement, ParseOutcome::Unstructured)
            }
            ParsedJudgement::ParseFailed { raw } => {
                tracing::warn!(item = %request.item_id, tier = %response.tier, "Unparseable vision response");
                let mut evidence = Evidence::new(&response.tier, ParseOutcome::ParseFailed);
                evidence.observation_hash = Some(observation.hash.clone());
                evidence.raw = Some(truncate(&raw, MAX_RAW_LEN));
                return VerificationResult::new(
                    VerificationMethod::Visual,
                    false,
                    0,
                    format!("{} returned no verdict", response.tier),
                    evidence,
                    false,
                );
            }
        };

        let Judgement {
            verified,
            confidence,
            reason,
            observed,
            expected,
        } = judgement;

        let check = contradiction::check(
            observed.as_deref(),
            expected.as_deref(),
            &reason,
            criterion,
        );
        let semantic = !check.contradiction
            && semantic_match(&reason, criterion, self.config.key_term_ratio);
        let matches = !check.contradiction && (verified || semantic);

        if check.contradiction {
            tracing::warn!(
                item = %request.item_id,
                observed = ?check.observed,
                expected = ?check.expected,
                "Judge justification contradicts its verdict"
            );
        } else if semantic && !verified {
            tracing::info!(item = %request.item_id, "Semantic match overrides negative verdict");
        }

        let mut evidence = Evidence::new(&response.tier, parse);
        evidence.observed = check.observed;
        evidence.expected = check.expected;
        evidence.matches = matches;
        evidence.observation_hash = Some(observation.hash.clone());
        if parse == ParseOutcome::Unstructured {
            evidence.raw = Some(truncate(&response.text, MAX_RAW_LEN));
        }

        VerificationResult::new(
            VerificationMethod::Visual,
            matches,
            confidence.unwrap_or(50),
            reason,
            evidence,
            check.contradiction,
        )
    }

    /// Last resort: every criterion term must appear in a successful tool output.
    fn text_heuristic(&self, request: &VerificationRequest, why: &str) -> VerificationResult {
        let output = request.execution.output_text().to_lowercase();
        let (words, numbers) = key_terms(&request.success_criteria);
        let found = words
            .iter()
            .chain(numbers.iter())
            .all(|term| output.contains(term.as_str()));
        let has_terms = !(words.is_empty() && numbers.is_empty());
        let verified = request.execution.success && has_terms && found;

        let mut evidence = Evidence::new("heuristic", ParseOutcome::NotApplicable);
        evidence.matches = verified;
        evidence.raw = Some(truncate(&output, MAX_RAW_LEN));

        VerificationResult::new(
            VerificationMethod::Visual,
            verified,
            self.config.heuristic_confidence,
            format!(
                "{}; tool output {} the criterion terms",
                why,
                if found && has_terms { "mentions" } else { "does not mention" }
            ),
            evidence,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fixtures::FixedCapture;
    use crate::capture::NoCapture;
    use crate::llm::mock::{reply, test_capability, ScriptedLlm, MOCK_PROVIDER};
    use crate::llm::RetryConfig;
    use crate::todo::ExecutionResult;
    use serde_json::json;
    use std::time::Duration;

    fn tiers() -> Vec<ModelTier> {
        vec![
            ModelTier::vision("fast", MOCK_PROVIDER, "vision-a", Duration::from_secs(5)),
            ModelTier::vision("strong", MOCK_PROVIDER, "vision-b", Duration::from_secs(5)),
        ]
    }

    fn request(criterion: &str, output: serde_json::Value) -> VerificationRequest {
        VerificationRequest {
            item_id: "1".to_string(),
            action: "type 915 into the calculator".to_string(),
            success_criteria: criterion.to_string(),
            execution: ExecutionResult::succeeded(output),
            probe: None,
            target: Some("calculator".to_string()),
        }
    }

    fn verifier(llm: Arc<ScriptedLlm>, config: VisionConfig) -> (VisionVerifier, Arc<FixedCapture>) {
        let capture = Arc::new(FixedCapture::new(vec![1, 2, 3, 4]));
        let verifier = VisionVerifier::new(
            Arc::new(test_capability(llm, config.max_image_bytes)),
            capture.clone(),
            tiers(),
            config,
        );
        (verifier, capture)
    }

    #[tokio::test]
    async fn test_infra_error_falls_back_without_retry() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.always("vision-a", Err(LlmError::infra(503, "overloaded".to_string())));
        llm.script(
            "vision-b",
            vec![reply(r#"{"verified": true, "confidence": 92, "reason": "display shows 915"}"#)],
        );
        let (verifier, capture) = verifier(llm.clone(), VisionConfig::default());

        let started = Instant::now();
        let result = verifier.verify(&request("display shows 915", json!(null))).await;

        assert!(result.verified());
        assert_eq!(result.evidence().source, "strong");
        assert_eq!(llm.calls_for("vision-a"), 1);
        assert_eq!(llm.calls_for("vision-b"), 1);
        assert!(started.elapsed() < VisionConfig::default().retry.base_delay);
        assert_eq!(capture.activations.load(std::sync::atomic::Ordering::SeqCst), 0);

        let events = verifier.fallback_log().recent(10).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from_tier, "fast");
        assert_eq!(events[0].status_code, Some(503));
        assert_eq!(events[0].chain_length, 2);
    }

    #[tokio::test]
    async fn test_transient_error_retries_same_tier() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script(
            "vision-a",
            vec![
                Err(LlmError::network_error("connection reset".to_string())),
                reply(r#"{"verified": true, "confidence": 80, "reason": "window open"}"#),
            ],
        );
        let config = VisionConfig {
            retry: RetryConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                ..RetryConfig::default()
            },
            ..VisionConfig::default()
        };
        let (verifier, _) = verifier(llm.clone(), config);

        let result = verifier.verify(&request("window open", json!(null))).await;
        assert!(result.verified());
        assert_eq!(llm.calls_for("vision-a"), 2);
        assert_eq!(llm.calls_for("vision-b"), 0);
        assert!(verifier.fallback_log().recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_contradiction_vetoes_positive_verdict() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script(
            "vision-a",
            vec![reply(
                r#"{"verified": true, "confidence": 95, "reason": "displays -51, matches expected 915", "evidence": {"observed": "-51"}}"#,
            )],
        );
        let (verifier, _) = verifier(llm, VisionConfig::default());

        let result = verifier
            .verify(&request("the display shows 915", json!(null)))
            .await;
        assert!(!result.verified());
        assert!(result.contradiction_detected());
        assert_eq!(result.evidence().observed.as_deref(), Some("-51"));
        assert_eq!(result.evidence().expected.as_deref(), Some("915"));
    }

    #[tokio::test]
    async fn test_semantic_match_overrides_low_confidence_negative() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script(
            "vision-a",
            vec![reply(
                r#"{"verified": false, "confidence": 30, "reason": "The calculator display shows 915"}"#,
            )],
        );
        let (verifier, _) = verifier(llm, VisionConfig::default());

        let result = verifier
            .verify(&request("calculator display shows 915", json!(null)))
            .await;
        assert!(result.verified());
        assert!(result.evidence().matches);
        assert_eq!(result.confidence(), 30);
    }

    #[tokio::test]
    async fn test_unparseable_response_is_not_verified() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script("vision-a", vec![reply("Looks great to me!")]);
        let (verifier, _) = verifier(llm.clone(), VisionConfig::default());

        let result = verifier.verify(&request("window open", json!(null))).await;
        assert!(!result.verified());
        assert_eq!(result.evidence().parse, ParseOutcome::ParseFailed);
        assert_eq!(result.evidence().raw.as_deref(), Some("Looks great to me!"));
        assert_eq!(llm.calls_for("vision-b"), 0);
    }

    #[tokio::test]
    async fn test_same_frame_and_criterion_hits_cache() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.always(
            "vision-a",
            reply(r#"{"verified": true, "confidence": 90, "reason": "window open"}"#),
        );
        let (verifier, capture) = verifier(llm.clone(), VisionConfig::default());

        let req = request("window open", json!(null));
        assert!(verifier.verify(&req).await.verified());
        let second = verifier.verify(&req).await;
        assert!(second.verified());
        assert_eq!(second.evidence().source, "cache");
        assert_eq!(llm.calls_for("vision-a"), 1);
        assert_eq!(capture.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_checks_of_one_frame_share_a_call() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.always(
            "vision-a",
            reply(r#"{"verified": true, "confidence": 90, "reason": "display shows 915"}"#),
        );
        let (verifier, capture) = verifier(llm.clone(), VisionConfig::default());

        let req = request("display shows 915", json!(null));
        let (first, second) = tokio::join!(verifier.verify(&req), verifier.verify(&req));
        assert!(first.verified());
        assert!(second.verified());
        assert_eq!(first.evidence().source, "fast");
        assert_eq!(second.evidence().source, "fast");
        assert_eq!(capture.calls(), 2);
        assert_eq!(llm.calls_for("vision-a"), 1);
    }

    #[tokio::test]
    async fn test_all_tiers_failing_uses_text_heuristic() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.always("vision-a", Err(LlmError::infra(502, "bad gateway".to_string())));
        llm.always("vision-b", Err(LlmError::timeout(Duration::from_secs(1))));
        let (verifier, _) = verifier(llm, VisionConfig::default());

        let result = verifier
            .verify(&request("total 915", json!({"stdout": "Total: 915"})))
            .await;
        assert!(result.verified());
        assert_eq!(result.confidence(), 35);
        assert_eq!(result.evidence().source, "heuristic");

        let result = verifier
            .verify(&request("total 916", json!({"stdout": "Total: 915"})))
            .await;
        assert!(!result.verified());
        assert_eq!(verifier.fallback_log().recent(10).await.len(), 4);
    }

    #[tokio::test]
    async fn test_capture_failure_uses_text_heuristic() {
        let llm = Arc::new(ScriptedLlm::new());
        let verifier = VisionVerifier::new(
            Arc::new(test_capability(llm.clone(), 1024)),
            Arc::new(NoCapture),
            tiers(),
            VisionConfig::default(),
        );
        assert!(!verifier.capture_available());

        let result = verifier.verify(&request("done", json!("done"))).await;
        assert!(result.verified());
        assert_eq!(result.evidence().source, "heuristic");
        assert_eq!(llm.total_calls(), 0);
    }
}
