//! Shell command execution provider.
//!
//! ## Workspace-First Design
//!
//! Commands run in the workspace by default:
//! - `run_command("ls")` → lists workspace contents
//! - `run_command("cat output/report.md")` → reads workspace file

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{required_str, resolve_path, OperationInfo, ToolError, ToolProvider};

const MAX_STREAM_LEN: usize = 10_000;

/// Sanitize command output to be safe for LLM consumption.
/// Removes binary garbage while preserving valid text.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% non-printable (excluding newlines/tabs) is treated as binary
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let mut text: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect();

    if text.len() > MAX_STREAM_LEN {
        let mut cut = MAX_STREAM_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [output truncated]");
    }
    text
}

/// Command patterns that are never run.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf /", "This would destroy the entire system"),
    ("rm -rf /*", "This would destroy the entire system"),
    ("> /dev/", "Writing to device files is blocked"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
    ("mkfs", "Formatting filesystems is blocked"),
    ("find / ", "Use a specific directory path instead of root"),
    ("grep -r /", "Use a specific directory path instead of root"),
];

/// Validate a command against dangerous patterns.
fn validate_command(cmd: &str) -> Result<(), ToolError> {
    let trimmed = cmd.trim();
    let unprefixed = ["sudo ", "time ", "nice ", "nohup "]
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);

    for (pattern, suggestion) in DANGEROUS_PATTERNS {
        if trimmed.starts_with(pattern) || unprefixed.starts_with(pattern) {
            return Err(ToolError::new(
                ToolError::BLOCKED,
                format!("Blocked command pattern '{}'. {}", pattern, suggestion),
            ));
        }
    }
    Ok(())
}

/// Captured result of a finished shell command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Programs an inspection command may start. None of them writes when
/// given plain arguments; `find` and `sed` are further restricted below.
const INSPECTION_PROGRAMS: &[&str] = &[
    "cat", "diff", "echo", "file", "find", "grep", "head", "ls", "md5sum", "pgrep", "ps", "pwd",
    "readlink", "realpath", "sed", "sha256sum", "stat", "tail", "test", "true", "false", "wc",
    "which",
];

/// `find` actions that write files or launch other programs.
const FIND_ACTIONS: &[&str] = &[
    "-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fprint0", "-fprintf", "-fls",
];

/// Whether `arg` makes `program` write or launch something.
fn writes(program: &str, arg: &str) -> bool {
    match program {
        "find" => FIND_ACTIONS.contains(&arg),
        // -i, -i.bak, -ni and --in-place all edit in place
        "sed" => {
            arg.starts_with("--in-place")
                || (arg.starts_with('-') && !arg.starts_with("--") && arg[1..].contains('i'))
        }
        _ => false,
    }
}

/// Split an inspection command into argv, refusing anything that needs a
/// shell or could change state. Quoting is not interpreted.
fn inspection_argv(command: &str) -> Result<Vec<String>, ToolError> {
    let not_read_only = |why: String| {
        ToolError::new(
            ToolError::NOT_READ_ONLY,
            format!("Refusing check command `{}`: {}", command, why),
        )
    };

    if let Some(c) = command
        .chars()
        .find(|c| matches!(c, ';' | '&' | '|' | '>' | '<' | '$' | '`' | '(' | ')' | '\n'))
    {
        return Err(not_read_only(format!("shell syntax {:?} is not allowed", c)));
    }

    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    let Some(program) = argv.first() else {
        return Err(ToolError::invalid_parameters("empty check command"));
    };
    if !INSPECTION_PROGRAMS.contains(&program.as_str()) {
        return Err(not_read_only(format!("{} is not an inspection program", program)));
    }
    if let Some(arg) = argv[1..].iter().find(|a| writes(program, a)) {
        return Err(not_read_only(format!("{} {} writes", program, arg)));
    }
    Ok(argv)
}

/// Run a read-only inspection command in `cwd` without a shell.
pub async fn run_inspection(
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, ToolError> {
    let argv = inspection_argv(command)?;
    tracing::debug!(cwd = %cwd.display(), command, "Running inspection command");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    collect_output(cmd, cwd, timeout).await
}

/// Run `command` through `/bin/sh -c` in `cwd`.
///
/// A non-zero exit is not an error here; callers decide what it means.
async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, ToolError> {
    validate_command(command)?;

    tracing::info!(cwd = %cwd.display(), command, "Executing command");

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    collect_output(cmd, cwd, timeout).await
}

async fn collect_output(
    mut cmd: Command,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, ToolError> {
    let output = match tokio::time::timeout(
        timeout,
        cmd.current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Command execution failed");
            return Err(ToolError::execution_failed(format!(
                "Failed to execute command: {}",
                e
            )));
        }
        Err(_) => {
            return Err(ToolError::new(
                ToolError::TIMEOUT,
                format!("Command timed out after {}s", timeout.as_secs()),
            ));
        }
    };

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: sanitize_output(&output.stdout),
        stderr: sanitize_output(&output.stderr),
    };

    tracing::debug!(
        exit = result.exit_code,
        stdout_len = result.stdout.len(),
        stderr_len = result.stderr.len(),
        "Command completed"
    );
    Ok(result)
}

/// Runs shell commands on the host. Every operation is mutating.
pub struct ShellProvider;

#[async_trait]
impl ToolProvider for ShellProvider {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute shell commands in the working directory"
    }

    fn operations(&self) -> Vec<OperationInfo> {
        vec![OperationInfo {
            name: "run_command".to_string(),
            description: "Run a shell command; fails on non-zero exit".to_string(),
            read_only: false,
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to execute"},
                    "cwd": {"type": "string", "description": "Optional working directory"},
                    "timeout_secs": {"type": "integer", "description": "Timeout in seconds (default: 60)"}
                },
                "required": ["command"]
            }),
        }]
    }

    async fn execute(
        &self,
        operation: &str,
        parameters: Value,
        working_dir: &Path,
    ) -> Result<Value, ToolError> {
        if operation != "run_command" {
            return Err(ToolError::new(
                ToolError::UNKNOWN_OPERATION,
                format!("shell has no operation {}", operation),
            ));
        }

        let command = required_str(&parameters, "command")?;
        let cwd = parameters["cwd"]
            .as_str()
            .map(|p| resolve_path(p, working_dir))
            .unwrap_or_else(|| working_dir.to_path_buf());
        let timeout = Duration::from_secs(parameters["timeout_secs"].as_u64().unwrap_or(60));

        let output = run_shell(command, &cwd, timeout).await?;
        if output.exit_code != 0 {
            return Err(ToolError::new(
                ToolError::EXIT_STATUS,
                format!(
                    "exit code {}: {}",
                    output.exit_code,
                    if output.stderr.is_empty() {
                        &output.stdout
                    } else {
                        &output.stderr
                    }
                ),
            ));
        }

        serde_json::to_value(&output).map_err(|e| ToolError::execution_failed(e.to_string()))
    }
}
