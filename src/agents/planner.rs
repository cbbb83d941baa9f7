//! Turns a request into an ordered todo list, and failed items into
//! replacement items.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::config::PlannerConfig;
use crate::llm::{CapabilityClient, ChatMessage, LlmError, ModelTier, TextRequest};
use crate::throttle::PRIORITY_CRITICAL;
use crate::todo::{Action, ProgrammaticCheck, TodoError, TodoItem, TodoList, TodoStatus, ToolCallSpec};
use crate::tools::ToolInvoker;
use crate::verify::extract_json;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Planning call failed: {0}")]
    Capability(#[from] LlmError),

    #[error("Could not parse plan: {0}")]
    Parse(String),

    #[error("Plan is invalid: {0}")]
    Invalid(#[from] TodoError),
}

const PLAN_FORMAT: &str = r#"Respond with JSON only, an array of steps in execution order:
[
  {
    "id": "1",
    "action": "what this step does",
    "tool_calls": [{"provider": "...", "operation": "...", "parameters": {...}}],
    "success_criteria": "an observable condition that proves the step worked",
    "dependencies": ["ids of EARLIER steps this one needs"],
    "probe": null
  }
]
"probe" is optional. When the result can be checked programmatically, give one of:
{"kind": "file_exists", "path": "..."}
{"kind": "file_contains", "path": "...", "content": "..."}
{"kind": "command_succeeds", "command": "..."}
{"kind": "command_output_matches", "command": "...", "pattern": "regex"}
{"kind": "tool_output", "provider": "...", "operation": "<read-only operation>", "parameters": {...}, "expect": "substring"}
Probe commands must only inspect: one program such as ls, cat, grep, test, wc or stat, with no pipes, redirects or chaining.
Success criteria must name concrete values (numbers, titles, file contents) when they are known."#;

/// Plan step as produced by the planning tier. Ids may arrive as numbers.
#[derive(Debug, Deserialize)]
struct PlannedStep {
    id: Value,
    #[serde(alias = "description")]
    action: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallSpec>,
    #[serde(alias = "criteria")]
    success_criteria: String,
    #[serde(default, alias = "depends_on")]
    dependencies: Vec<Value>,
    #[serde(default)]
    probe: Option<ProgrammaticCheck>,
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a planning response into validated-ready items.
///
/// Accepts a bare array or an object with an `items`/`steps`/`plan` array.
pub fn parse_plan(text: &str, max_items: usize, max_attempts: u32) -> Result<Vec<TodoItem>, PlanError> {
    let value = extract_json(text).ok_or_else(|| PlanError::Parse("no JSON in response".to_string()))?;
    let steps = match value {
        Value::Array(steps) => steps,
        Value::Object(mut obj) => ["items", "steps", "plan"]
            .iter()
            .find_map(|k| match obj.remove(*k) {
                Some(Value::Array(steps)) => Some(steps),
                _ => None,
            })
            .ok_or_else(|| PlanError::Parse("object without a step array".to_string()))?,
        _ => return Err(PlanError::Parse("expected an array of steps".to_string())),
    };
    if steps.len() > max_items {
        return Err(PlanError::Parse(format!(
            "{} steps exceeds the limit of {}",
            steps.len(),
            max_items
        )));
    }

    steps
        .into_iter()
        .enumerate()
        .map(|(n, step)| -> Result<TodoItem, PlanError> {
            let step: PlannedStep = serde_json::from_value(step)
                .map_err(|e| PlanError::Parse(format!("step {}: {}", n + 1, e)))?;
            let id = id_text(&step.id)
                .ok_or_else(|| PlanError::Parse(format!("step {} has no usable id", n + 1)))?;
            let dependencies = step.dependencies.iter().filter_map(id_text);
            let item = TodoItem::new(
                id,
                Action::new(step.action, step.tool_calls),
                step.success_criteria,
                dependencies,
                max_attempts,
            )?;
            Ok(match step.probe {
                Some(probe) => item.with_probe(probe),
                None => item,
            })
        })
        .collect()
}

pub struct Planner {
    capability: Arc<CapabilityClient>,
    invoker: Arc<dyn ToolInvoker>,
    tier: ModelTier,
    config: PlannerConfig,
    max_attempts: u32,
}

impl Planner {
    pub fn new(
        capability: Arc<CapabilityClient>,
        invoker: Arc<dyn ToolInvoker>,
        tier: ModelTier,
        config: PlannerConfig,
        max_attempts: u32,
    ) -> Self {
        Self {
            capability,
            invoker,
            tier,
            config,
            max_attempts,
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You plan desktop and workspace automation as a short list of verifiable steps.\n\
             Available tool providers and operations:\n{}\n{}",
            self.invoker.describe(),
            PLAN_FORMAT
        )
    }

    async fn ask(&self, prompt: String) -> Result<String, PlanError> {
        let mut call = TextRequest::new(
            self.tier.clone(),
            vec![ChatMessage::system(self.system_prompt()), ChatMessage::user(prompt)],
        );
        call.temperature = Some(self.config.temperature);
        call.max_tokens = Some(self.config.max_tokens);
        call.priority = PRIORITY_CRITICAL;
        Ok(self.capability.complete_text(call).await?.text)
    }

    /// Plan a fresh request.
    pub async fn plan(&self, request: &str) -> Result<TodoList, PlanError> {
        tracing::info!(request, "Planning request");
        let text = self.ask(format!("Request: {}", request)).await?;
        let items = parse_plan(&text, self.config.max_items, self.max_attempts)?;
        let list = TodoList::new(request, items)?;
        tracing::info!(list_id = %list.id(), items = list.items().len(), "Plan ready");
        Ok(list)
    }

    /// Propose replacement steps for an item that ran out of attempts.
    ///
    /// Replacements may depend on completed items and on each other; the
    /// caller splices them into the list.
    pub async fn replan(&self, list: &TodoList, failed: &TodoItem) -> Result<Vec<TodoItem>, PlanError> {
        let completed: Vec<String> = list
            .items()
            .iter()
            .filter(|i| i.status() == TodoStatus::Completed)
            .map(|i| format!("- {}: {} (verified: {})", i.id(), i.action().description, i.success_criteria()))
            .collect();
        let history: Vec<String> = failed
            .attempts()
            .iter()
            .map(|a| {
                let outcome = match (&a.execution_result().error, a.verification()) {
                    (Some(e), _) => format!("tool error {}", e),
                    (None, Some(v)) => format!("not verified: {}", v.reason()),
                    (None, None) => "not verified".to_string(),
                };
                format!("- attempt {}: {}", a.index(), outcome)
            })
            .collect();

        let prompt = format!(
            "Original request: {}\n\nCompleted steps:\n{}\n\nThis step failed every attempt:\n\
             id {}: {}\nsuccess criteria: {}\n{}\n\n\
             Propose replacement steps that reach the same goal differently. \
             Use fresh ids (r1, r2, ...); dependencies may name completed steps or earlier replacements.",
            list.original_request(),
            if completed.is_empty() { "(none)".to_string() } else { completed.join("\n") },
            failed.id(),
            failed.action().description,
            failed.success_criteria(),
            history.join("\n"),
        );

        tracing::info!(item = %failed.id(), "Replanning failed item");
        let text = self.ask(prompt).await?;
        let items = parse_plan(&text, self.config.max_items, self.max_attempts)?;
        if items.is_empty() {
            return Err(PlanError::Parse("replan produced no steps".to_string()));
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{reply, test_capability, ScriptedLlm, MOCK_PROVIDER};
    use crate::tools::fixtures::ScriptedInvoker;
    use std::time::Duration;

    fn planner(llm: Arc<ScriptedLlm>) -> Planner {
        Planner::new(
            Arc::new(test_capability(llm, 1024)),
            Arc::new(ScriptedInvoker::new()),
            ModelTier::text("planner", MOCK_PROVIDER, "planner", Duration::from_secs(5)),
            PlannerConfig::default(),
            3,
        )
    }

    const PLAN: &str = r#"Here is the plan:
```json
[
  {"id": 1, "action": "open calculator", "tool_calls": [{"provider": "app", "operation": "launch", "parameters": {"name": "calc"}}],
   "success_criteria": "calculator window visible", "dependencies": []},
  {"id": 2, "action": "type 915", "success_criteria": "display shows 915", "dependencies": [1],
   "probe": {"kind": "tool_output", "provider": "app", "operation": "read_display", "expect": "915"}}
]
```"#;

    #[tokio::test]
    async fn test_plan_parses_numeric_ids_and_probes() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script("planner", vec![reply(PLAN)]);
        let planner = planner(llm.clone());

        let list = planner.plan("compute 915 on the calculator").await.unwrap();
        assert_eq!(list.items().len(), 2);
        assert_eq!(list.items()[0].id(), "1");
        assert_eq!(list.items()[0].action().tool_calls[0].operation, "launch");
        assert!(list.items()[1].dependencies().contains("1"));
        assert!(list.items()[1].probe().is_some());
        assert_eq!(list.items()[1].max_attempts(), 3);

        let messages = llm.last_messages("planner").unwrap();
        assert!(messages[0].text_content().unwrap().contains("scripted test provider"));
    }

    #[test]
    fn test_plan_wrapped_in_object() {
        let items = parse_plan(
            r#"{"steps": [{"id": "a", "description": "do a", "criteria": "a done"}]}"#,
            20,
            2,
        )
        .unwrap();
        assert_eq!(items[0].action().description, "do a");
        assert_eq!(items[0].success_criteria(), "a done");
    }

    #[test]
    fn test_invalid_plans_are_rejected() {
        assert!(matches!(parse_plan("no plan today", 20, 3), Err(PlanError::Parse(_))));
        assert!(matches!(
            parse_plan(r#"[{"id": "1", "action": "x"}]"#, 20, 3),
            Err(PlanError::Parse(_))
        ));
        assert!(matches!(
            parse_plan(r#"[{"id": "1", "action": "x", "success_criteria": ""}]"#, 20, 3),
            Err(PlanError::Invalid(TodoError::EmptyField(_)))
        ));
        let too_many = format!(
            "[{}]",
            (0..3)
                .map(|i| format!(r#"{{"id": "{}", "action": "x", "success_criteria": "y"}}"#, i))
                .collect::<Vec<_>>()
                .join(",")
        );
        assert!(matches!(parse_plan(&too_many, 2, 3), Err(PlanError::Parse(_))));
    }

    #[tokio::test]
    async fn test_forward_dependency_rejected() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script(
            "planner",
            vec![reply(
                r#"[{"id": "1", "action": "x", "success_criteria": "y", "dependencies": ["2"]},
                    {"id": "2", "action": "z", "success_criteria": "w"}]"#,
            )],
        );
        let err = planner(llm).plan("anything").await.unwrap_err();
        assert!(matches!(err, PlanError::Invalid(TodoError::ForwardDependency { .. })));
    }

    #[tokio::test]
    async fn test_capability_failure_surfaces() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script("planner", vec![Err(LlmError::client_error(401, "bad key".to_string()))]);
        let err = planner(llm).plan("anything").await.unwrap_err();
        assert!(matches!(err, PlanError::Capability(_)));
    }

    #[tokio::test]
    async fn test_replan_mentions_failure_history() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.script("planner", vec![reply(PLAN)]);
        llm.script(
            "planner",
            vec![reply(r#"[{"id": "r1", "action": "use keyboard", "success_criteria": "display shows 915"}]"#)],
        );
        let planner = planner(llm.clone());

        let list = planner.plan("compute 915").await.unwrap();
        let failed = list.item("2").unwrap().clone();
        let replacements = planner.replan(&list, &failed).await.unwrap();
        assert_eq!(replacements.len(), 1);
        assert_eq!(replacements[0].id(), "r1");

        let prompt = llm.last_messages("planner").unwrap()[1]
            .text_content()
            .unwrap()
            .to_string();
        assert!(prompt.contains("Original request: compute 915"));
        assert!(prompt.contains("id 2: type 915"));
    }
}
