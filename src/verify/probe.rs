//! Programmatic verification: filesystem checks, inspection commands and
//! read-only tool probes.
//!
//! Probes observe, they never act. A `tool_output` probe naming an operation
//! that is not declared read-only fails without being invoked, and command
//! checks run only allow-listed inspection programs, without a shell.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::contradiction::key_terms;
use super::VerificationRequest;
use crate::tools::{resolve_path, run_inspection, ToolError, ToolInvoker};
use crate::todo::{Evidence, ParseOutcome, ProgrammaticCheck, VerificationMethod, VerificationResult};

const PROBE_CONFIDENCE: u8 = 95;
const OUTPUT_CHECK_CONFIDENCE: u8 = 60;

/// Result of one programmatic check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    fn new(passed: bool, detail: impl Into<String>) -> Self {
        Self {
            passed,
            detail: detail.into(),
        }
    }
}

pub struct ProbeVerifier {
    invoker: Arc<dyn ToolInvoker>,
    working_dir: PathBuf,
    command_timeout: Duration,
}

impl ProbeVerifier {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        working_dir: impl Into<PathBuf>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            invoker,
            working_dir: working_dir.into(),
            command_timeout,
        }
    }

    pub async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        let Some(probe) = &request.probe else {
            return self.output_check(request);
        };

        let (outcome, failure) = match self.run_check(probe).await {
            Ok(outcome) => (outcome, None),
            Err(e) => (CheckOutcome::new(false, e.to_string()), Some(e)),
        };
        tracing::debug!(
            item = %request.item_id,
            passed = outcome.passed,
            detail = %outcome.detail,
            "Probe finished"
        );

        let mut evidence = Evidence::new("probe", ParseOutcome::NotApplicable);
        evidence.observed = Some(outcome.detail.clone());
        evidence.expected = Some(request.success_criteria.clone());
        evidence.matches = outcome.passed;
        if let Some(e) = failure {
            evidence.raw = Some(e.code);
        }

        VerificationResult::new(
            VerificationMethod::Probe,
            outcome.passed,
            PROBE_CONFIDENCE,
            outcome.detail,
            evidence,
            false,
        )
    }

    /// Without an explicit probe, the tool output itself must mention every
    /// criterion term.
    fn output_check(&self, request: &VerificationRequest) -> VerificationResult {
        let output = request.execution.output_text().to_lowercase();
        let (words, numbers) = key_terms(&request.success_criteria);
        let missing: Vec<&String> = words
            .iter()
            .chain(numbers.iter())
            .filter(|term| !output.contains(term.as_str()))
            .collect();
        let has_terms = !(words.is_empty() && numbers.is_empty());
        let passed = request.execution.success && has_terms && missing.is_empty();

        let reason = if !request.execution.success {
            "tool call failed".to_string()
        } else if !has_terms {
            "criterion has no checkable terms".to_string()
        } else if missing.is_empty() {
            "tool output mentions every criterion term".to_string()
        } else {
            format!(
                "tool output lacks {}",
                missing
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        let mut evidence = Evidence::new("probe", ParseOutcome::NotApplicable);
        evidence.matches = passed;
        evidence.expected = Some(request.success_criteria.clone());

        VerificationResult::new(
            VerificationMethod::Probe,
            passed,
            OUTPUT_CHECK_CONFIDENCE,
            reason,
            evidence,
            false,
        )
    }

    fn path(&self, path: &str) -> PathBuf {
        resolve_path(path, &self.working_dir)
    }

    /// Run one check. `All` and `Any` recurse, hence the boxed future.
    pub fn run_check<'a>(
        &'a self,
        check: &'a ProgrammaticCheck,
    ) -> BoxFuture<'a, Result<CheckOutcome, ToolError>> {
        async move {
            match check {
                ProgrammaticCheck::FileExists { path } => {
                    let exists = tokio::fs::metadata(self.path(path)).await.is_ok();
                    Ok(CheckOutcome::new(
                        exists,
                        format!("{} {}", path, if exists { "exists" } else { "is missing" }),
                    ))
                }

                ProgrammaticCheck::DirectoryExists { path } => {
                    let is_dir = tokio::fs::metadata(self.path(path))
                        .await
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    Ok(CheckOutcome::new(
                        is_dir,
                        format!("{} {} a directory", path, if is_dir { "is" } else { "is not" }),
                    ))
                }

                ProgrammaticCheck::FileContains { path, content } => {
                    let found = match tokio::fs::read_to_string(self.path(path)).await {
                        Ok(text) => text.contains(content.as_str()),
                        Err(_) => false,
                    };
                    Ok(CheckOutcome::new(
                        found,
                        format!(
                            "{} {} {:?}",
                            path,
                            if found { "contains" } else { "does not contain" },
                            content
                        ),
                    ))
                }

                ProgrammaticCheck::FileMatchesRegex { path, pattern } => {
                    let regex = compile(pattern)?;
                    let found = match tokio::fs::read_to_string(self.path(path)).await {
                        Ok(text) => regex.is_match(&text),
                        Err(_) => false,
                    };
                    Ok(CheckOutcome::new(
                        found,
                        format!(
                            "{} {} /{}/",
                            path,
                            if found { "matches" } else { "does not match" },
                            pattern
                        ),
                    ))
                }

                ProgrammaticCheck::CommandSucceeds { command } => {
                    let output = run_inspection(command, &self.working_dir, self.command_timeout).await?;
                    Ok(CheckOutcome::new(
                        output.exit_code == 0,
                        format!("`{}` exited with {}", command, output.exit_code),
                    ))
                }

                ProgrammaticCheck::CommandOutputMatches { command, pattern } => {
                    let regex = compile(pattern)?;
                    let output = run_inspection(command, &self.working_dir, self.command_timeout).await?;
                    let found = regex.is_match(&output.stdout);
                    Ok(CheckOutcome::new(
                        found,
                        format!(
                            "`{}` output {} /{}/",
                            command,
                            if found { "matches" } else { "does not match" },
                            pattern
                        ),
                    ))
                }

                ProgrammaticCheck::ToolOutput {
                    provider,
                    operation,
                    parameters,
                    expect,
                } => {
                    if !self.invoker.is_read_only(provider, operation) {
                        tracing::warn!(provider = %provider, operation = %operation, "Refusing non-read-only probe");
                        return Err(ToolError::new(
                            ToolError::NOT_READ_ONLY,
                            format!("{}.{} is not read-only", provider, operation),
                        ));
                    }
                    let output = self
                        .invoker
                        .invoke(provider, operation, parameters.clone())
                        .await?;
                    let text = match &output {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let passed = expect
                        .as_deref()
                        .map_or(true, |needle| text.contains(needle));
                    Ok(CheckOutcome::new(
                        passed,
                        match expect {
                            Some(needle) => format!(
                                "{}.{} output {} {:?}",
                                provider,
                                operation,
                                if passed { "contains" } else { "does not contain" },
                                needle
                            ),
                            None => format!("{}.{} succeeded", provider, operation),
                        },
                    ))
                }

                ProgrammaticCheck::All { checks } => {
                    let mut details = Vec::new();
                    for c in checks {
                        let outcome = self.run_check(c).await?;
                        if !outcome.passed {
                            return Ok(outcome);
                        }
                        details.push(outcome.detail);
                    }
                    Ok(CheckOutcome::new(true, details.join("; ")))
                }

                ProgrammaticCheck::Any { checks } => {
                    let mut details = Vec::new();
                    for c in checks {
                        match self.run_check(c).await {
                            Ok(outcome) if outcome.passed => return Ok(outcome),
                            Ok(outcome) => details.push(outcome.detail),
                            Err(e) => details.push(e.to_string()),
                        }
                    }
                    Ok(CheckOutcome::new(false, details.join("; ")))
                }
            }
        }
        .boxed()
    }
}

fn compile(pattern: &str) -> Result<regex::Regex, ToolError> {
    regex::Regex::new(pattern)
        .map_err(|e| ToolError::invalid_parameters(format!("bad pattern {:?}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fixtures::ScriptedInvoker;
    use crate::tools::ToolRegistry;
    use crate::todo::ExecutionResult;
    use serde_json::json;
    use std::path::Path;

    fn request(probe: Option<ProgrammaticCheck>, output: serde_json::Value) -> VerificationRequest {
        VerificationRequest {
            item_id: "1".to_string(),
            action: "write the report".to_string(),
            success_criteria: "report contains total 915".to_string(),
            execution: ExecutionResult::succeeded(output),
            probe,
            target: None,
        }
    }

    fn registry_probe(dir: &Path) -> ProbeVerifier {
        ProbeVerifier::new(
            Arc::new(ToolRegistry::with_defaults(dir, Duration::from_secs(5))),
            dir,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), "total: 915\n").unwrap();
        let probe = registry_probe(dir.path());

        let check = ProgrammaticCheck::all(vec![
            ProgrammaticCheck::file_exists("report.txt"),
            ProgrammaticCheck::file_contains("report.txt", "915"),
            ProgrammaticCheck::FileMatchesRegex {
                path: "report.txt".to_string(),
                pattern: r"total:\s+\d+".to_string(),
            },
        ]);
        assert!(probe.run_check(&check).await.unwrap().passed);

        let missing = probe
            .run_check(&ProgrammaticCheck::file_contains("report.txt", "916"))
            .await
            .unwrap();
        assert!(!missing.passed);
        assert!(missing.detail.contains("does not contain"));

        let either = ProgrammaticCheck::any(vec![
            ProgrammaticCheck::file_exists("nope.txt"),
            ProgrammaticCheck::DirectoryExists {
                path: ".".to_string(),
            },
        ]);
        assert!(probe.run_check(&either).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_command_checks() {
        let dir = tempfile::tempdir().unwrap();
        let probe = registry_probe(dir.path());

        assert!(probe
            .run_check(&ProgrammaticCheck::command_succeeds("true"))
            .await
            .unwrap()
            .passed);
        assert!(!probe
            .run_check(&ProgrammaticCheck::command_succeeds("test -f missing.txt"))
            .await
            .unwrap()
            .passed);
        assert!(probe
            .run_check(&ProgrammaticCheck::CommandOutputMatches {
                command: "echo total 915".to_string(),
                pattern: r"\b915\b".to_string(),
            })
            .await
            .unwrap()
            .passed);
    }

    #[tokio::test]
    async fn test_mutating_command_check_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), "total: 915\n").unwrap();
        let probe = registry_probe(dir.path());

        let check = ProgrammaticCheck::command_succeeds("rm report.txt && touch marker");
        let err = probe.run_check(&check).await.unwrap_err();
        assert_eq!(err.code, ToolError::NOT_READ_ONLY);

        let result = probe.verify(&request(Some(check), json!(null))).await;
        assert!(!result.verified());
        assert_eq!(result.evidence().raw.as_deref(), Some(ToolError::NOT_READ_ONLY));

        let err = probe
            .run_check(&ProgrammaticCheck::CommandOutputMatches {
                command: "find . -name report.txt -delete".to_string(),
                pattern: "report".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ToolError::NOT_READ_ONLY);

        assert!(dir.path().join("report.txt").exists());
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_mutating_tool_probe_is_refused() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let probe = ProbeVerifier::new(invoker.clone(), ".", Duration::from_secs(5));

        let check = ProgrammaticCheck::ToolOutput {
            provider: "app".to_string(),
            operation: "press".to_string(),
            parameters: json!({}),
            expect: None,
        };
        let err = probe.run_check(&check).await.unwrap_err();
        assert_eq!(err.code, ToolError::NOT_READ_ONLY);
        assert_eq!(invoker.call_count("app", "press"), 0);

        let result = probe.verify(&request(Some(check), json!(null))).await;
        assert!(!result.verified());
        assert_eq!(result.method(), VerificationMethod::Probe);
        assert_eq!(result.evidence().raw.as_deref(), Some(ToolError::NOT_READ_ONLY));
    }

    #[tokio::test]
    async fn test_read_only_tool_probe() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.mark_read_only("app", "read_display");
        invoker.script("app", "read_display", vec![Ok(json!({"display": "915"}))]);
        let probe = ProbeVerifier::new(invoker.clone(), ".", Duration::from_secs(5));

        let check = ProgrammaticCheck::ToolOutput {
            provider: "app".to_string(),
            operation: "read_display".to_string(),
            parameters: json!({}),
            expect: Some("915".to_string()),
        };
        let result = probe.verify(&request(Some(check), json!(null))).await;
        assert!(result.verified());
        assert_eq!(result.confidence(), 95);
        assert_eq!(invoker.call_count("app", "read_display"), 1);
    }

    #[tokio::test]
    async fn test_output_check_without_probe() {
        let probe = ProbeVerifier::new(Arc::new(ScriptedInvoker::new()), ".", Duration::from_secs(5));

        let result = probe
            .verify(&request(None, json!("Report written, total 915")))
            .await;
        assert!(result.verified());

        let result = probe.verify(&request(None, json!("Report written"))).await;
        assert!(!result.verified());
        assert!(result.reason().contains("915"));
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_check() {
        let probe = registry_probe(Path::new("."));
        let err = probe
            .run_check(&ProgrammaticCheck::FileMatchesRegex {
                path: "x".to_string(),
                pattern: "(".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ToolError::INVALID_PARAMETERS);
    }
}
