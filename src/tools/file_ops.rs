//! File operation provider: read, write, list and probe files.
//!
//! These operations work relative to the workspace by default:
//! - `output/report.md` → `{workspace}/output/report.md`
//! - `/etc/hosts` → absolute path for system access (escape hatch)

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{required_str, resolve_path, OperationInfo, ToolError, ToolProvider};

const MAX_READ_BYTES: usize = 256 * 1024;

fn path_schema(extra: Value) -> Value {
    let mut properties = json!({
        "path": {"type": "string", "description": "File path, relative to the workspace or absolute"}
    });
    let mut required = vec![json!("path")];
    if let (Some(props), Value::Object(more)) = (properties.as_object_mut(), extra) {
        for (key, schema) in more {
            required.push(json!(key.clone()));
            props.insert(key, schema);
        }
    }
    json!({"type": "object", "properties": properties, "required": required})
}

/// File system access for the working directory.
pub struct FilesProvider;

impl FilesProvider {
    async fn read_file(&self, path: &str, working_dir: &Path) -> Result<Value, ToolError> {
        let resolved = resolve_path(path, working_dir);
        let bytes = tokio::fs::read(&resolved).await.map_err(|e| {
            ToolError::execution_failed(format!(
                "Cannot read {} (resolved to: {}): {}",
                path,
                resolved.display(),
                e
            ))
        })?;
        if bytes.len() > MAX_READ_BYTES {
            return Err(ToolError::execution_failed(format!(
                "{} is {} bytes, larger than the {} byte read limit",
                path,
                bytes.len(),
                MAX_READ_BYTES
            )));
        }
        let content = String::from_utf8(bytes).map_err(|_| {
            ToolError::execution_failed(format!("Binary file detected: {}", resolved.display()))
        })?;
        Ok(json!({"path": path, "content": content}))
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        working_dir: &Path,
    ) -> Result<Value, ToolError> {
        let resolved = resolve_path(path, working_dir);
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::execution_failed(e.to_string()))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::execution_failed(format!("Cannot write {}: {}", path, e)))?;
        tracing::debug!(path = %resolved.display(), bytes = content.len(), "Wrote file");
        Ok(json!({"path": path, "bytes": content.len()}))
    }

    async fn list_directory(&self, path: &str, working_dir: &Path) -> Result<Value, ToolError> {
        let resolved = resolve_path(path, working_dir);
        let mut reader = tokio::fs::read_dir(&resolved).await.map_err(|e| {
            ToolError::execution_failed(format!("Cannot list {}: {}", path, e))
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::execution_failed(e.to_string()))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok(json!({"path": path, "entries": entries}))
    }

    async fn file_exists(&self, path: &str, working_dir: &Path) -> Result<Value, ToolError> {
        let resolved = resolve_path(path, working_dir);
        let metadata = tokio::fs::metadata(&resolved).await.ok();
        Ok(json!({
            "path": path,
            "exists": metadata.is_some(),
            "is_dir": metadata.map(|m| m.is_dir()).unwrap_or(false),
        }))
    }
}

#[async_trait]
impl ToolProvider for FilesProvider {
    fn name(&self) -> &str {
        "files"
    }

    fn description(&self) -> &str {
        "Read, write and inspect files in the working directory"
    }

    fn operations(&self) -> Vec<OperationInfo> {
        vec![
            OperationInfo {
                name: "read_file".to_string(),
                description: "Read a UTF-8 file".to_string(),
                read_only: true,
                parameters_schema: path_schema(json!({})),
            },
            OperationInfo {
                name: "write_file".to_string(),
                description: "Create or overwrite a file, creating parent directories".to_string(),
                read_only: false,
                parameters_schema: path_schema(json!({
                    "content": {"type": "string", "description": "Content to write"}
                })),
            },
            OperationInfo {
                name: "list_directory".to_string(),
                description: "List directory entries (directories end with '/')".to_string(),
                read_only: true,
                parameters_schema: path_schema(json!({})),
            },
            OperationInfo {
                name: "file_exists".to_string(),
                description: "Check whether a path exists".to_string(),
                read_only: true,
                parameters_schema: path_schema(json!({})),
            },
        ]
    }

    async fn execute(
        &self,
        operation: &str,
        parameters: Value,
        working_dir: &Path,
    ) -> Result<Value, ToolError> {
        let path = required_str(&parameters, "path")?;
        match operation {
            "read_file" => self.read_file(path, working_dir).await,
            "write_file" => {
                let content = required_str(&parameters, "content")?;
                self.write_file(path, content, working_dir).await
            }
            "list_directory" => self.list_directory(path, working_dir).await,
            "file_exists" => self.file_exists(path, working_dir).await,
            other => Err(ToolError::new(
                ToolError::UNKNOWN_OPERATION,
                format!("files has no operation {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let files = FilesProvider;

        files
            .execute(
                "write_file",
                json!({"path": "out/result.txt", "content": "total: 915"}),
                dir.path(),
            )
            .await
            .unwrap();

        let read = files
            .execute("read_file", json!({"path": "out/result.txt"}), dir.path())
            .await
            .unwrap();
        assert_eq!(read["content"], "total: 915");

        let listing = files
            .execute("list_directory", json!({"path": "."}), dir.path())
            .await
            .unwrap();
        assert_eq!(listing["entries"], json!(["out/"]));
    }

    #[tokio::test]
    async fn test_file_exists_and_missing_read() {
        let dir = tempfile::tempdir().unwrap();
        let files = FilesProvider;

        let exists = files
            .execute("file_exists", json!({"path": "nope.txt"}), dir.path())
            .await
            .unwrap();
        assert_eq!(exists["exists"], false);

        let err = files
            .execute("read_file", json!({"path": "nope.txt"}), dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.code, ToolError::EXECUTION_FAILED);
    }

    #[test]
    fn test_write_schema_requires_content() {
        let op = FilesProvider
            .operations()
            .into_iter()
            .find(|o| o.name == "write_file")
            .unwrap();
        assert_eq!(op.parameters_schema["required"], json!(["path", "content"]));
        assert!(!op.read_only);
    }
}
