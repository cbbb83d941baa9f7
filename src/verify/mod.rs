//! Verification of executed attempts.
//!
//! Each attempt is judged against its success criterion with independent
//! evidence. The [`VerificationStrategySelector`] picks a method, then:
//! - `visual` asks vision tiers about a fresh observation ([`VisionVerifier`])
//! - `probe` runs programmatic checks ([`ProbeVerifier`])
//! - `hybrid` probes first and falls back to the visual verdict

pub mod cache;
pub mod contradiction;
pub mod parse;
pub mod probe;
pub mod selector;
pub mod vision;

pub use cache::{FallbackEvent, FallbackLog, VerdictCache};
pub use parse::{extract_json, parse_judgement, Judgement, ParsedJudgement};
pub use probe::{CheckOutcome, ProbeVerifier};
pub use selector::{StrategyChoice, VerificationStrategySelector};
pub use vision::VisionVerifier;

use async_trait::async_trait;

use crate::todo::{ExecutionResult, ProgrammaticCheck, VerificationMethod, VerificationResult};

/// Everything a verifier may look at for one attempt.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub item_id: String,
    pub action: String,
    pub success_criteria: String,
    pub execution: ExecutionResult,
    pub probe: Option<ProgrammaticCheck>,
    /// Window or application the observation should focus on
    pub target: Option<String>,
}

/// The seam the executor verifies attempts through.
#[async_trait]
pub trait AttemptVerifier: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> VerificationResult;
}

/// Strategy selection plus the visual and probe verifiers.
pub struct VerificationService {
    selector: VerificationStrategySelector,
    vision: VisionVerifier,
    probe: ProbeVerifier,
}

impl VerificationService {
    pub fn new(
        selector: VerificationStrategySelector,
        vision: VisionVerifier,
        probe: ProbeVerifier,
    ) -> Self {
        Self {
            selector,
            vision,
            probe,
        }
    }

    pub fn fallback_log(&self) -> &FallbackLog {
        self.vision.fallback_log()
    }
}

#[async_trait]
impl AttemptVerifier for VerificationService {
    async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        let choice = self
            .selector
            .select(request, self.vision.capture_available())
            .await;

        let result = match choice.method {
            VerificationMethod::Visual => self.vision.verify(request).await,
            VerificationMethod::Probe => self.probe.verify(request).await,
            VerificationMethod::Hybrid => {
                let probed = self.probe.verify(request).await;
                if probed.verified() {
                    probed.with_method(VerificationMethod::Hybrid)
                } else {
                    tracing::debug!(item = %request.item_id, reason = %probed.reason(), "Probe inconclusive, looking instead");
                    self.vision
                        .verify(request)
                        .await
                        .with_method(VerificationMethod::Hybrid)
                }
            }
        };

        tracing::info!(
            item = %request.item_id,
            method = %result.method(),
            verified = result.verified(),
            confidence = result.confidence(),
            contradiction = result.contradiction_detected(),
            "Attempt verified"
        );
        result
    }
}
