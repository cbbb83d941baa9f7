//! TodoItem and its attempt history.
//!
//! # State Machine
//! ```text
//! Pending -> Ready -> Executing -> Verifying -> Completed
//!    |         ^                       |  \
//!    |         +------- retry ---------+   \-> Failed
//!    +-> Skipped (broken dependency)
//! any non-terminal -> Aborted (cancellation)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::verification::{ProgrammaticCheck, VerificationResult};
use super::TodoError;
use crate::tools::ToolError;

/// Status of a todo item in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    Pending,
    Ready,
    Executing,
    Verifying,
    Completed,
    Failed,
    Skipped,
    Aborted,
}

impl TodoStatus {
    /// # Property
    /// `is_terminal() => no further transitions`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TodoStatus::Completed | TodoStatus::Failed | TodoStatus::Skipped | TodoStatus::Aborted
        )
    }
}

impl std::fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TodoStatus::Pending => "pending",
            TodoStatus::Ready => "ready",
            TodoStatus::Executing => "executing",
            TodoStatus::Verifying => "verifying",
            TodoStatus::Completed => "completed",
            TodoStatus::Failed => "failed",
            TodoStatus::Skipped => "skipped",
            TodoStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One operation against a tool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSpec {
    pub provider: String,
    pub operation: String,
    #[serde(default)]
    pub parameters: Value,
}

impl ToolCallSpec {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>, parameters: Value) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            parameters,
        }
    }
}

/// The externally-described action an item performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub description: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallSpec>,
}

impl Action {
    pub fn new(description: impl Into<String>, tool_calls: Vec<ToolCallSpec>) -> Self {
        Self {
            description: description.into(),
            tool_calls,
        }
    }
}

/// Outcome of running an action's tool calls.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// One entry per completed tool call
    pub output: Value,
    pub error: Option<ToolError>,
}

impl ExecutionResult {
    pub fn succeeded(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(output: Value, error: ToolError) -> Self {
        Self {
            success: false,
            output,
            error: Some(error),
        }
    }

    /// Flattened text of the output, for heuristics and prompts.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// One execution-plus-verification cycle. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    index: u32,
    tool_calls: Vec<ToolCallSpec>,
    execution_result: ExecutionResult,
    verification: Option<VerificationResult>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(
        index: u32,
        tool_calls: Vec<ToolCallSpec>,
        execution_result: ExecutionResult,
        verification: Option<VerificationResult>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            index,
            tool_calls,
            execution_result,
            verification,
            started_at,
            ended_at: Utc::now(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn tool_calls(&self) -> &[ToolCallSpec] {
        &self.tool_calls
    }

    pub fn execution_result(&self) -> &ExecutionResult {
        &self.execution_result
    }

    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verification.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    pub fn verified(&self) -> bool {
        self.verification.as_ref().is_some_and(|v| v.verified())
    }
}

/// A planned unit of work with a checkable success criterion.
///
/// # Invariants
/// - `attempts.len() <= max_attempts`
/// - status is `Ready` only if every dependency was `Completed` when it
///   became ready (enforced by [`super::TodoList`])
/// - status only changes through the transition methods below
#[derive(Debug, Clone, Serialize)]
pub struct TodoItem {
    id: String,
    action: Action,
    success_criteria: String,
    dependencies: BTreeSet<String>,
    probe: Option<ProgrammaticCheck>,
    status: TodoStatus,
    status_reason: Option<String>,
    attempts: Vec<Attempt>,
    max_attempts: u32,
    rewrites: u32,
}

impl TodoItem {
    /// # Errors
    /// Returns `Err` if `id` or `success_criteria` is empty or
    /// `max_attempts == 0`.
    pub fn new(
        id: impl Into<String>,
        action: Action,
        success_criteria: impl Into<String>,
        dependencies: impl IntoIterator<Item = String>,
        max_attempts: u32,
    ) -> Result<Self, TodoError> {
        let id = id.into();
        let success_criteria = success_criteria.into();
        if id.trim().is_empty() {
            return Err(TodoError::EmptyField("id".to_string()));
        }
        if success_criteria.trim().is_empty() {
            return Err(TodoError::EmptyField(format!("{}.success_criteria", id)));
        }
        if max_attempts == 0 {
            return Err(TodoError::EmptyField(format!("{}.max_attempts", id)));
        }
        Ok(Self {
            id,
            action,
            success_criteria,
            dependencies: dependencies.into_iter().collect(),
            probe: None,
            status: TodoStatus::Pending,
            status_reason: None,
            attempts: Vec::new(),
            max_attempts,
            rewrites: 0,
        })
    }

    pub fn with_probe(mut self, probe: ProgrammaticCheck) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn success_criteria(&self) -> &str {
        &self.success_criteria
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn probe(&self) -> Option<&ProgrammaticCheck> {
        self.probe.as_ref()
    }

    pub fn status(&self) -> TodoStatus {
        self.status
    }

    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn rewrites(&self) -> u32 {
        self.rewrites
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts
            .saturating_sub(self.attempts.len() as u32)
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    fn invalid(&self, to: TodoStatus) -> TodoError {
        TodoError::InvalidTransition {
            item: self.id.clone(),
            from: self.status,
            to,
        }
    }

    // State transitions - explicit and validated

    /// Pending -> Ready. Dependency checks live in the owning list.
    pub(super) fn mark_ready(&mut self) -> Result<(), TodoError> {
        match self.status {
            TodoStatus::Pending => {
                self.status = TodoStatus::Ready;
                Ok(())
            }
            _ => Err(self.invalid(TodoStatus::Ready)),
        }
    }

    /// Ready -> Executing. Returns the index of the attempt being started.
    ///
    /// # Errors
    /// Returns `AttemptsExhausted` if no attempt budget remains.
    pub fn start(&mut self) -> Result<u32, TodoError> {
        if self.status != TodoStatus::Ready {
            return Err(self.invalid(TodoStatus::Executing));
        }
        if self.attempts_remaining() == 0 {
            return Err(TodoError::AttemptsExhausted {
                item: self.id.clone(),
                max_attempts: self.max_attempts,
            });
        }
        self.status = TodoStatus::Executing;
        Ok(self.attempts.len() as u32 + 1)
    }

    /// Executing -> Verifying.
    pub fn begin_verification(&mut self) -> Result<(), TodoError> {
        match self.status {
            TodoStatus::Executing => {
                self.status = TodoStatus::Verifying;
                Ok(())
            }
            _ => Err(self.invalid(TodoStatus::Verifying)),
        }
    }

    /// Append a finished attempt. Only valid while verifying.
    pub fn record_attempt(&mut self, attempt: Attempt) -> Result<(), TodoError> {
        if self.status != TodoStatus::Verifying {
            return Err(TodoError::NotVerifying(self.id.clone()));
        }
        if self.attempts_remaining() == 0 {
            return Err(TodoError::AttemptsExhausted {
                item: self.id.clone(),
                max_attempts: self.max_attempts,
            });
        }
        self.attempts.push(attempt);
        Ok(())
    }

    /// Verifying -> Completed.
    pub fn complete(&mut self) -> Result<(), TodoError> {
        match self.status {
            TodoStatus::Verifying => {
                self.status = TodoStatus::Completed;
                self.status_reason = None;
                Ok(())
            }
            _ => Err(self.invalid(TodoStatus::Completed)),
        }
    }

    /// Verifying -> Ready, when attempt budget remains.
    pub fn retry(&mut self) -> Result<(), TodoError> {
        if self.status != TodoStatus::Verifying {
            return Err(self.invalid(TodoStatus::Ready));
        }
        if self.attempts_remaining() == 0 {
            return Err(TodoError::AttemptsExhausted {
                item: self.id.clone(),
                max_attempts: self.max_attempts,
            });
        }
        self.status = TodoStatus::Ready;
        Ok(())
    }

    /// Replace action and criterion ahead of a retry.
    pub fn rewrite(
        &mut self,
        action: Action,
        success_criteria: impl Into<String>,
    ) -> Result<(), TodoError> {
        if self.status != TodoStatus::Verifying {
            return Err(TodoError::NotVerifying(self.id.clone()));
        }
        let success_criteria = success_criteria.into();
        if success_criteria.trim().is_empty() {
            return Err(TodoError::EmptyField(format!(
                "{}.success_criteria",
                self.id
            )));
        }
        self.action = action;
        self.success_criteria = success_criteria;
        self.rewrites += 1;
        Ok(())
    }

    /// Verifying -> Failed.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TodoError> {
        match self.status {
            TodoStatus::Verifying => {
                self.status = TodoStatus::Failed;
                self.status_reason = Some(reason.into());
                Ok(())
            }
            _ => Err(self.invalid(TodoStatus::Failed)),
        }
    }

    /// Pending/Ready -> Skipped, for a broken dependency.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), TodoError> {
        match self.status {
            TodoStatus::Pending | TodoStatus::Ready => {
                self.status = TodoStatus::Skipped;
                self.status_reason = Some(reason.into());
                Ok(())
            }
            _ => Err(self.invalid(TodoStatus::Skipped)),
        }
    }

    /// Any non-terminal status -> Aborted.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), TodoError> {
        if self.status.is_terminal() {
            return Err(self.invalid(TodoStatus::Aborted));
        }
        self.status = TodoStatus::Aborted;
        self.status_reason = Some(reason.into());
        Ok(())
    }

    /// Rename the item and its dependency references (used when an item is
    /// spliced into a list by a replan).
    pub(super) fn set_id(&mut self, id: String) {
        self.id = id;
    }

    pub(super) fn replace_dependency(&mut self, old: &str, new: &str) {
        if self.dependencies.remove(old) {
            self.dependencies.insert(new.to_string());
        }
    }

    pub(super) fn rename_dependencies(&mut self, rename: &dyn Fn(&str) -> Option<String>) {
        self.dependencies = self
            .dependencies
            .iter()
            .map(|d| rename(d).unwrap_or_else(|| d.clone()))
            .collect();
    }
}
