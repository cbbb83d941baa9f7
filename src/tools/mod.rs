//! Tool invocation protocol.
//!
//! Actions reach the controlled target through named providers, each exposing
//! a set of operations: `invoke(provider, operation, parameters)` yields a JSON
//! output or a typed [`ToolError`]. Every operation declares whether it is
//! read-only; verification may only call read-only operations.
//!
//! ## Workspace-First Design
//!
//! Built-in providers resolve relative paths from the configured working
//! directory; absolute paths work as an escape hatch.

mod file_ops;
mod terminal;

pub use file_ops::FilesProvider;
pub use terminal::{run_inspection, CommandOutput, ShellProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Resolve a path relative to the workspace. Absolute paths are used as-is.
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// Failure of a tool operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

impl ToolError {
    pub const UNKNOWN_PROVIDER: &'static str = "unknown_provider";
    pub const UNKNOWN_OPERATION: &'static str = "unknown_operation";
    pub const INVALID_PARAMETERS: &'static str = "invalid_parameters";
    pub const EXECUTION_FAILED: &'static str = "execution_failed";
    pub const EXIT_STATUS: &'static str = "exit_status";
    pub const TIMEOUT: &'static str = "timeout";
    pub const BLOCKED: &'static str = "blocked";
    pub const NOT_READ_ONLY: &'static str = "not_read_only";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMETERS, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(Self::EXECUTION_FAILED, message)
    }
}

/// Read a required string parameter.
pub(crate) fn required_str<'a>(parameters: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    parameters[key]
        .as_str()
        .ok_or_else(|| ToolError::invalid_parameters(format!("Missing '{}' argument", key)))
}

/// Description of one provider operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationInfo {
    pub name: String,
    pub description: String,
    pub read_only: bool,
    pub parameters_schema: Value,
}

/// A named group of operations against the controlled target.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// The unique name of this provider.
    fn name(&self) -> &str;

    /// What this provider controls.
    fn description(&self) -> &str;

    fn operations(&self) -> Vec<OperationInfo>;

    /// Execute one operation. Relative paths resolve from `working_dir`.
    async fn execute(
        &self,
        operation: &str,
        parameters: Value,
        working_dir: &Path,
    ) -> Result<Value, ToolError>;
}

/// The invocation seam used by the executor and the probe verifier.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        provider: &str,
        operation: &str,
        parameters: Value,
    ) -> Result<Value, ToolError>;

    /// Whether the operation is declared read-only. Unknown operations are not.
    fn is_read_only(&self, provider: &str, operation: &str) -> bool;

    /// Human/LLM-readable catalogue of providers and operations.
    fn describe(&self) -> String;
}

/// Registry of tool providers.
pub struct ToolRegistry {
    providers: HashMap<String, Arc<dyn ToolProvider>>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ToolRegistry {
    /// Create an empty registry (no built-in providers).
    pub fn empty(working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    /// Create a registry with the `shell` and `files` providers.
    pub fn with_defaults(working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        let mut registry = Self::empty(working_dir, timeout);
        registry.register(Arc::new(ShellProvider));
        registry.register(Arc::new(FilesProvider));
        tracing::debug!(
            providers = registry.providers.len(),
            "Tool registry initialised"
        );
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ToolProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn operation(&self, provider: &str, operation: &str) -> Option<OperationInfo> {
        self.providers
            .get(provider)?
            .operations()
            .into_iter()
            .find(|op| op.name == operation)
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(
        &self,
        provider: &str,
        operation: &str,
        parameters: Value,
    ) -> Result<Value, ToolError> {
        let tool = self.providers.get(provider).ok_or_else(|| {
            ToolError::new(
                ToolError::UNKNOWN_PROVIDER,
                format!("Unknown provider: {}", provider),
            )
        })?;
        if self.operation(provider, operation).is_none() {
            return Err(ToolError::new(
                ToolError::UNKNOWN_OPERATION,
                format!("Unknown operation: {}.{}", provider, operation),
            ));
        }

        tracing::debug!(provider, operation, "Invoking tool operation");
        match tokio::time::timeout(
            self.timeout,
            tool.execute(operation, parameters, &self.working_dir),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ToolError::new(
                ToolError::TIMEOUT,
                format!(
                    "{}.{} timed out after {}s",
                    provider,
                    operation,
                    self.timeout.as_secs()
                ),
            )),
        }
    }

    fn is_read_only(&self, provider: &str, operation: &str) -> bool {
        self.operation(provider, operation)
            .is_some_and(|op| op.read_only)
    }

    fn describe(&self) -> String {
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();

        let mut out = String::new();
        for name in names {
            let Some(provider) = self.providers.get(name) else {
                continue;
            };
            out.push_str(&format!("- {}: {}\n", name, provider.description()));
            for op in provider.operations() {
                out.push_str(&format!(
                    "  - {}{}: {} parameters={}\n",
                    op.name,
                    if op.read_only { " (read-only)" } else { "" },
                    op.description,
                    op.parameters_schema
                ));
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Invoker that replays scripted results per operation and records calls.
    #[derive(Default)]
    pub struct ScriptedInvoker {
        results: Mutex<HashMap<String, VecDeque<Result<Value, ToolError>>>>,
        read_only: Mutex<Vec<String>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedInvoker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, provider: &str, operation: &str, results: Vec<Result<Value, ToolError>>) {
            self.results
                .lock()
                .unwrap()
                .entry(format!("{}.{}", provider, operation))
                .or_default()
                .extend(results);
        }

        pub fn mark_read_only(&self, provider: &str, operation: &str) {
            self.read_only
                .lock()
                .unwrap()
                .push(format!("{}.{}", provider, operation));
        }

        pub fn call_count(&self, provider: &str, operation: &str) -> usize {
            let key = format!("{}.{}", provider, operation);
            self.calls.lock().unwrap().iter().filter(|c| **c == key).count()
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            provider: &str,
            operation: &str,
            _parameters: Value,
        ) -> Result<Value, ToolError> {
            let key = format!("{}.{}", provider, operation);
            self.calls.lock().unwrap().push(key.clone());
            self.results
                .lock()
                .unwrap()
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(Value::String("ok".to_string())))
        }

        fn is_read_only(&self, provider: &str, operation: &str) -> bool {
            self.read_only
                .lock()
                .unwrap()
                .contains(&format!("{}.{}", provider, operation))
        }

        fn describe(&self) -> String {
            "- app: scripted test provider\n  - press: press a button\n".to_string()
        }
    }
}
