//! Configuration management for overseer.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `OPENROUTER_BASE_URL` - Optional. OpenAI-compatible endpoint override.
//! - `PLANNER_MODEL` - Optional. Model used to plan and replan. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `JUDGE_MODEL` - Optional. Cheap model for strategy judgements. Defaults to `openai/gpt-4.1-mini`.
//! - `VISION_MODELS` - Optional. Comma-separated vision tiers, fastest first.
//! - `OFFLINE_VISION_URL` / `OFFLINE_VISION_MODEL` - Optional. Extra vision tier on a local endpoint.
//! - `WORKING_DIR` - Optional. Default directory for tool operations. Defaults to current directory.
//! - `DESKTOP_DISPLAY` - Optional. X11 display for screenshot capture (e.g. `:99`).
//! - `MAX_ATTEMPTS` - Optional. Attempts per item. Defaults to `3`.
//! - `FAN_OUT` - Optional. Independent items executed concurrently. Defaults to `1`.
//! - `MAX_REPLANS` - Optional. Replans allowed per request. Defaults to `1`.
//! - `THROTTLE_BASE_DELAY_MS`, `THROTTLE_MAX_CONCURRENT`, `THROTTLE_BATCH_WAIT_MS`,
//!   `THROTTLE_BATCH_SIZE` - Optional. Throttler tuning.
//! - `REPORT_PATH` - Optional. Where to write the JSON execution report.
//!
//! Every threshold in the system lives in one of the structs below and is
//! injected at construction time.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::llm::{ModelTier, RetryConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Admission control parameters for the request throttler.
///
/// The batching constants (150ms window, batch of 3) were tuned against one
/// provider; re-tune them when pointing at another.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Initial inter-dispatch delay
    pub base_delay: Duration,
    /// Lower bound for the adaptive delay
    pub min_delay: Duration,
    /// Upper bound for the adaptive delay
    pub max_delay: Duration,
    /// Upstream calls allowed in flight at once
    pub max_concurrent: usize,
    /// Queued (not in-flight) entries beyond which submissions are rejected
    pub max_queue_size: usize,
    /// Waiters that make a keyed batch "full"
    pub batch_size: usize,
    /// How long a keyed batch collects waiters before dispatch
    pub batch_wait_time: Duration,
    /// Response time the controller aims to stay under
    pub target_response_time: Duration,
    /// Fraction of the target that counts as "comfortably under"
    pub comfort_ratio: f64,
    /// Multiplier applied on overload failures
    pub increase_factor: f64,
    /// Multiplier applied when the provider is comfortably fast
    pub decrease_factor: f64,
    /// Multiplier applied when arrivals outpace dispatches
    pub queue_pressure_factor: f64,
    /// Consecutive overload failures that open the cooldown
    pub failure_threshold: u32,
    /// How long the cooldown stays open
    pub cooldown: Duration,
    /// Requests with priority <= this value still queue during cooldown
    pub cooldown_bypass_priority: u8,
    /// Samples kept for rolling statistics
    pub stats_window: usize,
    /// Timeout for requests that do not set one
    pub default_timeout: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
            max_concurrent: 2,
            max_queue_size: 64,
            batch_size: 3,
            batch_wait_time: Duration::from_millis(150),
            target_response_time: Duration::from_secs(4),
            comfort_ratio: 0.5,
            increase_factor: 2.0,
            decrease_factor: 0.85,
            queue_pressure_factor: 1.1,
            failure_threshold: 5,
            cooldown: Duration::from_secs(15),
            cooldown_bypass_priority: 0,
            stats_window: 20,
            default_timeout: Duration::from_secs(60),
        }
    }
}

impl ThrottleConfig {
    /// Repair inconsistent bounds so `min_delay <= base_delay <= max_delay`.
    pub fn normalized(mut self) -> Self {
        if self.max_delay < self.min_delay {
            std::mem::swap(&mut self.min_delay, &mut self.max_delay);
        }
        self.base_delay = self.base_delay.clamp(self.min_delay, self.max_delay);
        self.max_concurrent = self.max_concurrent.max(1);
        self.batch_size = self.batch_size.max(1);
        self.stats_window = self.stats_window.max(1);
        self
    }
}

/// Verification strategy selection thresholds.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Baseline confidence of the visual heuristic
    pub heuristic_confidence: u8,
    /// Heuristic confidence when the item carries an explicit probe
    pub hybrid_confidence: u8,
    /// Heuristic confidence when no observation can be captured
    pub probe_confidence: u8,
    /// Heuristic is kept only at or above this confidence...
    pub keep_threshold: u8,
    /// ...and only if the judgement does not beat it by more than this gap
    pub override_gap: u8,
    /// Whether to ask a capability tier for an eligibility judgement
    pub judge_enabled: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            heuristic_confidence: 70,
            hybrid_confidence: 85,
            probe_confidence: 90,
            keep_threshold: 80,
            override_gap: 20,
            judge_enabled: true,
        }
    }
}

/// Vision verification pipeline parameters.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// Byte budget for a captured image; larger images are rejected
    pub max_image_bytes: usize,
    /// How long a cached verdict stays valid
    pub cache_ttl: Duration,
    /// Same-tier retry policy for transient errors
    pub retry: RetryConfig,
    /// Output token cap for a tier judgement
    pub max_tokens: u64,
    /// Confidence assigned to the emergency text-only heuristic
    pub heuristic_confidence: u8,
    /// Share of criterion word terms that must appear for a semantic match
    pub key_term_ratio: f64,
    /// Fallback events retained for inspection
    pub fallback_event_capacity: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 512 * 1024,
            cache_ttl: Duration::from_secs(30),
            retry: RetryConfig::default(),
            max_tokens: 400,
            heuristic_confidence: 35,
            key_term_ratio: 0.6,
            fallback_event_capacity: 100,
        }
    }
}

/// Todo execution parameters.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Independent ready items executed concurrently
    pub fan_out: usize,
    /// Default attempt budget per item
    pub max_attempts: u32,
    /// Replans allowed per request
    pub max_replans: u32,
    /// Timeout for one tool invocation
    pub tool_timeout: Duration,
    /// Agent name passed to the notifier
    pub agent_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fan_out: 1,
            max_attempts: 3,
            max_replans: 1,
            tool_timeout: Duration::from_secs(60),
            agent_name: "overseer".to_string(),
        }
    }
}

/// Planning parameters.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Upper bound on items in one plan
    pub max_items: usize,
    /// Sampling temperature for planning calls
    pub temperature: f64,
    /// Output token cap for planning calls
    pub max_tokens: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_items: 20,
            temperature: 0.2,
            max_tokens: 2000,
        }
    }
}

/// Failure adjustment parameters.
#[derive(Debug, Clone)]
pub struct AdjusterConfig {
    /// Whether the adjuster may ask a capability tier to rewrite an item
    pub rewrite_enabled: bool,
    /// Rewrites allowed per item
    pub max_rewrites: u32,
}

impl Default for AdjusterConfig {
    fn default() -> Self {
        Self {
            rewrite_enabled: true,
            max_rewrites: 1,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Completion endpoint (OpenAI-compatible)
    pub base_url: Option<String>,

    /// Local OpenAI-compatible endpoint serving the offline vision tier
    pub offline_url: Option<String>,

    /// Default working directory for tool operations
    pub working_dir: PathBuf,

    /// X11 display for screenshot capture
    pub display: Option<String>,

    /// Where to write the JSON execution report
    pub report_path: Option<PathBuf>,

    /// Tier used for planning, replanning and rewrites
    pub planner_tier: ModelTier,

    /// Cheap tier used for strategy judgements
    pub judge_tier: ModelTier,

    /// Vision tiers in fallback order
    pub vision_tiers: Vec<ModelTier>,

    pub throttle: ThrottleConfig,
    pub selector: SelectorConfig,
    pub vision: VisionConfig,
    pub executor: ExecutorConfig,
    pub planner: PlannerConfig,
    pub adjuster: AdjusterConfig,
}

/// Provider name for the primary endpoint.
pub const PRIMARY_PROVIDER: &str = "openrouter";

/// Provider name for an optional local endpoint.
pub const OFFLINE_PROVIDER: &str = "offline";

fn default_vision_tiers() -> Vec<ModelTier> {
    vec![
        ModelTier::vision("fast", PRIMARY_PROVIDER, "openai/gpt-4o-mini", Duration::from_secs(20)),
        ModelTier::vision(
            "strong",
            PRIMARY_PROVIDER,
            "anthropic/claude-sonnet-4.5",
            Duration::from_secs(45),
        ),
        ModelTier::vision(
            "alternate",
            PRIMARY_PROVIDER,
            "google/gemini-2.5-flash",
            Duration::from_secs(30),
        ),
    ]
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

/// Split a comma-separated model list into vision tiers, fastest first.
pub fn parse_vision_models(raw: &str) -> Vec<ModelTier> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .enumerate()
        .map(|(i, model)| {
            ModelTier::vision(
                format!("vision-{}", i + 1),
                PRIMARY_PROVIDER,
                model,
                Duration::from_secs(30),
            )
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// and `ConfigError::InvalidValue` for unparseable numeric overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let working_dir = std::env::var("WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut config = Self::new(api_key, working_dir);
        config.base_url = std::env::var("OPENROUTER_BASE_URL").ok();
        config.display = std::env::var("DESKTOP_DISPLAY").ok();
        config.report_path = std::env::var("REPORT_PATH").ok().map(PathBuf::from);

        if let Ok(model) = std::env::var("PLANNER_MODEL") {
            config.planner_tier.model = model;
        }
        if let Ok(model) = std::env::var("JUDGE_MODEL") {
            config.judge_tier.model = model;
        }
        if let Ok(models) = std::env::var("VISION_MODELS") {
            let tiers = parse_vision_models(&models);
            if tiers.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "VISION_MODELS".to_string(),
                    "no models listed".to_string(),
                ));
            }
            config.vision_tiers = tiers;
        }
        if let (Ok(url), Ok(model)) = (
            std::env::var("OFFLINE_VISION_URL"),
            std::env::var("OFFLINE_VISION_MODEL"),
        ) {
            config.offline_url = Some(url);
            config.vision_tiers.push(ModelTier::vision(
                "offline",
                OFFLINE_PROVIDER,
                model,
                Duration::from_secs(60),
            ));
        }

        config.executor.max_attempts = env_parse("MAX_ATTEMPTS", config.executor.max_attempts)?;
        config.executor.fan_out = env_parse("FAN_OUT", config.executor.fan_out)?;
        config.executor.max_replans = env_parse("MAX_REPLANS", config.executor.max_replans)?;

        config.throttle.base_delay =
            env_millis("THROTTLE_BASE_DELAY_MS", config.throttle.base_delay)?;
        config.throttle.max_concurrent =
            env_parse("THROTTLE_MAX_CONCURRENT", config.throttle.max_concurrent)?;
        config.throttle.batch_wait_time =
            env_millis("THROTTLE_BATCH_WAIT_MS", config.throttle.batch_wait_time)?;
        config.throttle.batch_size = env_parse("THROTTLE_BATCH_SIZE", config.throttle.batch_size)?;
        config.throttle = config.throttle.normalized();

        if config.executor.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Create a config with default values (useful for testing).
    pub fn new(api_key: String, working_dir: PathBuf) -> Self {
        Self {
            api_key,
            base_url: None,
            offline_url: None,
            working_dir,
            display: None,
            report_path: None,
            planner_tier: ModelTier::text(
                "planner",
                PRIMARY_PROVIDER,
                "anthropic/claude-sonnet-4.5",
                Duration::from_secs(90),
            ),
            judge_tier: ModelTier::text(
                "judge",
                PRIMARY_PROVIDER,
                "openai/gpt-4.1-mini",
                Duration::from_secs(20),
            ),
            vision_tiers: default_vision_tiers(),
            throttle: ThrottleConfig::default(),
            selector: SelectorConfig::default(),
            vision: VisionConfig::default(),
            executor: ExecutorConfig::default(),
            planner: PlannerConfig::default(),
            adjuster: AdjusterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_carry_tuned_constants() {
        let config = Config::new("key".to_string(), PathBuf::from("."));
        assert_eq!(config.selector.heuristic_confidence, 70);
        assert_eq!(config.selector.keep_threshold, 80);
        assert_eq!(config.selector.override_gap, 20);
        assert_eq!(config.throttle.batch_wait_time, Duration::from_millis(150));
        assert_eq!(config.throttle.batch_size, 3);
        assert_eq!(config.vision.max_image_bytes, 512 * 1024);
        assert_eq!(config.executor.fan_out, 1);
        assert_eq!(config.vision_tiers.len(), 3);
    }

    #[test]
    fn test_parse_vision_models() {
        let tiers = parse_vision_models("a/fast, b/strong,,c/alt ");
        let models: Vec<_> = tiers.iter().map(|t| t.model.as_str()).collect();
        assert_eq!(models, vec!["a/fast", "b/strong", "c/alt"]);
        assert!(tiers.iter().all(|t| t.vision));
        assert_eq!(tiers[0].name, "vision-1");
    }

    #[test]
    fn test_throttle_normalization() {
        let config = ThrottleConfig {
            base_delay: Duration::from_secs(60),
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_millis(10),
            max_concurrent: 0,
            ..ThrottleConfig::default()
        }
        .normalized();

        assert_eq!(config.min_delay, Duration::from_millis(10));
        assert_eq!(config.max_delay, Duration::from_secs(5));
        assert_eq!(config.base_delay, Duration::from_secs(5));
        assert_eq!(config.max_concurrent, 1);
    }
}
