use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Oracle, OracleReply};

/// Configuration for the subprocess-backed oracle.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Worker binary invoked in print-once-and-exit mode.
    pub command: String,
    /// Any writable directory; the oracle has no tools, so no filesystem
    /// effects are expected.
    pub working_dir: PathBuf,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            working_dir: std::env::temp_dir(),
            timeout_secs: 300,
        }
    }
}

/// Oracle backed by a single-shot worker subprocess with tools disabled.
/// Stdout is the stream-JSON protocol; assistant text is accumulated, with
/// the terminal result text as a fallback.
pub struct CliOracle {
    config: OracleConfig,
}

impl CliOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Oracle for CliOracle {
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> OracleReply {
        let mut command = Command::new(&self.config.command);
        command
            .args(["--print", "--verbose", "--output-format", "stream-json"])
            .args(["--allowedTools", ""])
            .args(["--max-turns", "1"]);
        if let Some(system) = system_prompt {
            command.args(["--append-system-prompt", system]);
        }
        command
            .arg("--")
            .arg(prompt)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(prompt_len = prompt.len(), "Running oracle completion");

        let future = command.output();
        let output = match timeout(Duration::from_secs(self.config.timeout_secs), future).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "Oracle subprocess failed to run");
                return OracleReply::failed(format!("oracle spawn failed: {}", e));
            }
            Err(_) => {
                return OracleReply::failed(format!(
                    "oracle timed out after {}s",
                    self.config.timeout_secs
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let content = accumulate_text(&stdout);

        if content.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                format!("oracle produced no text (exit: {:?})", output.status.code())
            } else {
                format!("oracle produced no text: {}", stderr.trim())
            };
            return OracleReply::failed(detail);
        }

        OracleReply::ok(content)
    }
}

/// Walk the stream-JSON lines, collecting assistant text. The terminal
/// `result` event's text is used only when no assistant text arrived.
fn accumulate_text(stdout: &str) -> String {
    let mut assistant = String::new();
    let mut result_text = String::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                if let Some(text) = assistant_text(&event) {
                    assistant.push_str(&text);
                }
            }
            Some("result") => {
                if let Some(text) = event.get("result").and_then(Value::as_str) {
                    result_text = text.to_string();
                }
            }
            _ => {}
        }
    }

    if assistant.trim().is_empty() {
        result_text
    } else {
        assistant
    }
}

/// Text of an assistant event: either a plain string `message.content` or
/// the concatenation of its text blocks.
fn assistant_text(event: &Value) -> Option<String> {
    let content = event.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    let blocks = content.as_array()?;
    let text: String = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_assistant_blocks() {
        let stdout = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello "},{"type":"tool_use","name":"Read"}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":"world"}}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"ignored"}"#,
        );
        assert_eq!(accumulate_text(stdout), "hello world");
    }

    #[test]
    fn test_result_fallback_when_no_assistant_text() {
        let stdout = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"the answer"}"#,
        );
        assert_eq!(accumulate_text(stdout), "the answer");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let stdout = "not json\n{\"type\":\"assistant\",\"message\":{\"content\":\"ok\"}}";
        assert_eq!(accumulate_text(stdout), "ok");
    }
}
