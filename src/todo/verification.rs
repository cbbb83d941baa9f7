//! Verification probes, evidence and results.
//!
//! A [`VerificationResult`] is the common contract shared by the visual,
//! probe and hybrid verifiers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Checks that can be performed without a capability call.
///
/// # Exhaustive Matching
/// All variants must be handled explicitly - no catch-all allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgrammaticCheck {
    /// Check if a file exists at the given path
    FileExists { path: String },

    /// Check if a file contains specific content
    FileContains { path: String, content: String },

    /// Check if a command exits with code 0
    CommandSucceeds { command: String },

    /// Check if a command output matches expected pattern
    CommandOutputMatches { command: String, pattern: String },

    /// Check if a directory exists
    DirectoryExists { path: String },

    /// Check if a file matches a regex pattern
    FileMatchesRegex { path: String, pattern: String },

    /// Invoke a read-only tool operation; passes when it succeeds and its
    /// output contains `expect` (if given)
    ToolOutput {
        provider: String,
        operation: String,
        #[serde(default)]
        parameters: Value,
        #[serde(default)]
        expect: Option<String>,
    },

    /// Multiple checks that must all pass
    All { checks: Vec<ProgrammaticCheck> },

    /// At least one check must pass
    Any { checks: Vec<ProgrammaticCheck> },
}

impl ProgrammaticCheck {
    pub fn file_exists(path: impl Into<String>) -> Self {
        Self::FileExists { path: path.into() }
    }

    pub fn file_contains(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::FileContains {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn command_succeeds(command: impl Into<String>) -> Self {
        Self::CommandSucceeds {
            command: command.into(),
        }
    }

    pub fn all(checks: Vec<ProgrammaticCheck>) -> Self {
        Self::All { checks }
    }

    pub fn any(checks: Vec<ProgrammaticCheck>) -> Self {
        Self::Any { checks }
    }
}

/// Method used for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    /// Judge a captured observation with a vision tier
    Visual,
    /// Programmatic or read-only tool probe
    Probe,
    /// Probe first, visual evidence when the probe does not pass
    Hybrid,
}

impl std::fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMethod::Visual => write!(f, "visual"),
            VerificationMethod::Probe => write!(f, "probe"),
            VerificationMethod::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// How a verdict was extracted from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseOutcome {
    Structured,
    Unstructured,
    ParseFailed,
    NotApplicable,
}

/// Structured observation backing a verdict.
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    /// Where the verdict came from (tier name, `probe`, `heuristic`, `cache`)
    pub source: String,
    /// Value the judge reported seeing
    pub observed: Option<String>,
    /// Value the judge (or criterion) expected
    pub expected: Option<String>,
    /// Whether the evidence supports the success criterion
    pub matches: bool,
    /// Hash of the observation that was judged
    pub observation_hash: Option<String>,
    pub parse: ParseOutcome,
    /// Raw response text, kept for diagnostics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl Evidence {
    pub fn new(source: impl Into<String>, parse: ParseOutcome) -> Self {
        Self {
            source: source.into(),
            observed: None,
            expected: None,
            matches: false,
            observation_hash: None,
            parse,
            raw: None,
        }
    }
}

/// Result of verifying one attempt.
///
/// # Invariants
/// - `contradiction_detected == true` implies `verified == false`
/// - `confidence <= 100`
///
/// Fields are private; the constructor is the only way to build one.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    method: VerificationMethod,
    verified: bool,
    confidence: u8,
    reason: String,
    evidence: Evidence,
    contradiction_detected: bool,
}

impl VerificationResult {
    /// # Postcondition
    /// `result.verified() == verified && !contradiction_detected`
    pub fn new(
        method: VerificationMethod,
        verified: bool,
        confidence: u8,
        reason: impl Into<String>,
        evidence: Evidence,
        contradiction_detected: bool,
    ) -> Self {
        Self {
            method,
            verified: verified && !contradiction_detected,
            confidence: confidence.min(100),
            reason: reason.into(),
            evidence,
            contradiction_detected,
        }
    }

    /// Relabel the method (e.g. a visual verdict reached via hybrid).
    pub fn with_method(mut self, method: VerificationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn method(&self) -> VerificationMethod {
        self.method
    }

    pub fn verified(&self) -> bool {
        self.verified
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn evidence(&self) -> &Evidence {
        &self.evidence
    }

    pub fn contradiction_detected(&self) -> bool {
        self.contradiction_detected
    }
}
