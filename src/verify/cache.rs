//! Short-lived cache of vision verdicts and the tier fallback log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::llm::LlmErrorKind;
use crate::todo::VerificationResult;

/// Verdicts keyed by (observation hash, success criterion).
///
/// The same frame judged against the same criterion within the TTL reuses the
/// earlier verdict instead of another tier round-trip.
#[derive(Debug, Clone)]
pub struct VerdictCache {
    entries: Arc<RwLock<HashMap<(String, String), (Instant, VerificationResult)>>>,
    ttl: Duration,
}

impl VerdictCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get(&self, observation_hash: &str, criterion: &str) -> Option<VerificationResult> {
        let entries = self.entries.read().await;
        let (stored_at, result) =
            entries.get(&(observation_hash.to_string(), criterion.to_string()))?;
        (stored_at.elapsed() < self.ttl).then(|| result.clone())
    }

    pub async fn insert(&self, observation_hash: &str, criterion: &str, result: VerificationResult) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.write().await;
        // Expired entries are swept on write
        let ttl = self.ttl;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        entries.insert(
            (observation_hash.to_string(), criterion.to_string()),
            (Instant::now(), result),
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// A single fallback event: a tier failed and the pipeline moved on.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackEvent {
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// Tier that failed.
    pub from_tier: String,
    /// Model that was being requested.
    pub from_model: String,
    /// Why it failed.
    pub reason: String,
    /// HTTP status, if the failure carried one.
    pub status_code: Option<u16>,
    /// Time spent on the tier before giving up.
    pub latency_ms: u64,
    /// 1-indexed position of this tier in the chain.
    pub attempt_number: u32,
    /// Total number of tiers in the chain.
    pub chain_length: u32,
}

impl FallbackEvent {
    pub fn new(
        from_tier: &str,
        from_model: &str,
        kind: LlmErrorKind,
        status_code: Option<u16>,
        latency: Duration,
        attempt_number: u32,
        chain_length: u32,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            from_tier: from_tier.to_string(),
            from_model: from_model.to_string(),
            reason: kind.to_string(),
            status_code,
            latency_ms: latency.as_millis() as u64,
            attempt_number,
            chain_length,
        }
    }
}

/// Bounded ring buffer of recent fallback events, newest last.
#[derive(Debug, Clone)]
pub struct FallbackLog {
    events: Arc<RwLock<Vec<FallbackEvent>>>,
    capacity: usize,
}

impl FallbackLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, event: FallbackEvent) {
        let mut events = self.events.write().await;
        events.push(event);
        if events.len() > self.capacity {
            let excess = events.len() - self.capacity;
            events.drain(..excess);
        }
    }

    /// Most recent `limit` events (newest last).
    pub async fn recent(&self, limit: usize) -> Vec<FallbackEvent> {
        let events = self.events.read().await;
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }
}
