use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use mission_protocol::EffortLevel;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use uuid::Uuid;

use super::AgentQuery;
use super::PermissionRequest;
use super::QueryClient;
use super::QueryError;
use super::QueryMessage;
use super::QueryRequest;
use super::stream_json::Frame;
use super::stream_json::JsonLineDecoder;
use super::stream_json::StreamInterpreter;
use crate::config::StreamingSettings;
use crate::permission::PermissionDecision;
use crate::permission::allowed_builtin_tools;

const STDERR_TAIL_LINES: usize = 20;
/// Longest stdout line kept; anything longer is skipped up to its newline.
const MAX_STDOUT_LINE_BYTES: usize = 100_000;

/// Starts the agent CLI in stream-json mode with permission prompts routed
/// back over stdio.
#[derive(Debug, Clone)]
pub struct ProcessQueryClient {
    settings: StreamingSettings,
}

impl ProcessQueryClient {
    pub fn new(settings: StreamingSettings) -> Self {
        Self { settings }
    }

    pub fn build_args(&self, request: &QueryRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--permission-prompt-tool",
            "stdio",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let mut push = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };
        // Every tool use must reach the permission gate, so the CLI never
        // runs in a bypass mode and never receives the allowlist.
        push(
            "--permission-mode",
            if request.plan_mode { "plan" } else { "default" }.to_string(),
        );
        if let Some(model) = &request.model {
            push("--model", model.clone());
        }
        if let Some(model) = &request.fallback_model {
            push("--fallback-model", model.clone());
        }
        if let Some(turns) = request.max_turns {
            push("--max-turns", turns.to_string());
        }
        if let Some(budget) = request.max_budget_usd {
            push("--max-budget-usd", format!("{budget:.2}"));
        }
        if let Some(prompt) = &request.system_prompt {
            push("--append-system-prompt", prompt.clone());
        }
        // The CLI runs some read-only tools without asking, so an allowlist
        // also narrows the tool set it starts with.
        if !request.allowed_tools.is_empty() {
            push("--tools", allowed_builtin_tools(&request.allowed_tools).join(","));
        }
        if !request.disallowed_tools.is_empty() {
            push("--disallowedTools", request.disallowed_tools.join(","));
        }
        for dir in &request.additional_directories {
            push("--add-dir", dir.display().to_string());
        }
        if !request.tool_servers.is_empty() {
            push("--mcp-config", mcp_config(request).to_string());
        }
        push(
            "--setting-sources",
            if request.load_settings {
                "user,project,local".to_string()
            } else {
                String::new()
            },
        );
        if let Some(resume) = &request.resume {
            push("--resume", resume.clone());
        }
        args.extend(self.settings.extra_args.iter().cloned());
        args
    }
}

fn mcp_config(request: &QueryRequest) -> Value {
    let servers: serde_json::Map<String, Value> = request
        .tool_servers
        .iter()
        .map(|server| {
            let env: serde_json::Map<String, Value> = server
                .env
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            (
                server.name.clone(),
                json!({ "command": server.command, "args": server.args, "env": env }),
            )
        })
        .collect();
    json!({ "mcpServers": servers })
}

fn thinking_tokens(effort: EffortLevel) -> u32 {
    match effort {
        EffortLevel::Low => 1_024,
        EffortLevel::Medium => 8_000,
        EffortLevel::High => 16_000,
        EffortLevel::Max => 31_999,
    }
}

#[async_trait]
impl QueryClient for ProcessQueryClient {
    async fn start(&self, request: QueryRequest) -> Result<Box<dyn AgentQuery>, QueryError> {
        let args = self.build_args(&request);
        let mut command = Command::new(&self.settings.program);
        command
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(effort) = request.effort {
            command.env("MAX_THINKING_TOKENS", thinking_tokens(effort).to_string());
        }
        if request.enable_checkpointing {
            command.env("CLAUDE_CODE_ENABLE_SDK_FILE_CHECKPOINTING", "true");
        }

        tracing::debug!(program = %self.settings.program, ?args, "starting agent query");
        let mut child = command.spawn().map_err(QueryError::Spawn)?;
        let stdout = child.stdout.take().ok_or(QueryError::Closed)?;
        let stdin = child.stdin.take().ok_or(QueryError::Closed)?;

        let stderr_tail = Arc::new(StdMutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "mission_core::agent_stderr", "{line}");
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            });
        }

        let mut query = ProcessQuery {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            skipping_line: false,
            decoder: JsonLineDecoder::new(),
            interpreter: StreamInterpreter::new(),
            pending: VecDeque::new(),
            stderr_tail,
            finished: false,
            saw_result: false,
        };
        query
            .write_line(&json!({
                "type": "control_request",
                "request_id": format!("init_{}", Uuid::new_v4()),
                "request": { "subtype": "initialize" }
            }))
            .await?;
        query
            .write_line(&json!({
                "type": "user",
                "message": { "role": "user", "content": request.prompt },
                "parent_tool_use_id": null,
                "session_id": "default"
            }))
            .await?;
        Ok(Box::new(query))
    }
}

#[derive(Serialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
enum PermissionResult<'a> {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: &'a Value,
    },
    Deny {
        message: &'a str,
    },
}

struct ProcessQuery {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    /// Inside an oversized line that is being dropped.
    skipping_line: bool,
    decoder: JsonLineDecoder,
    interpreter: StreamInterpreter,
    pending: VecDeque<QueryMessage>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    finished: bool,
    saw_result: bool,
}

impl ProcessQuery {
    async fn write_line(&mut self, value: &Value) -> Result<(), QueryError> {
        let stdin = self.stdin.as_mut().ok_or(QueryError::Closed)?;
        let mut line = value.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next stdout line with its newline, `None` at end of stream. Bytes
    /// that are not UTF-8 are replaced instead of failing the run.
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let mut buf = Vec::new();
            let read = (&mut self.stdout)
                .take(MAX_STDOUT_LINE_BYTES as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            let complete = buf.last() == Some(&b'\n');
            if self.skipping_line {
                self.skipping_line = !complete;
                continue;
            }
            if !complete && buf.len() > MAX_STDOUT_LINE_BYTES {
                tracing::warn!(
                    limit = MAX_STDOUT_LINE_BYTES,
                    "agent output line too long; skipping it"
                );
                self.skipping_line = true;
                continue;
            }
            return Ok(Some(match String::from_utf8(buf) {
                Ok(line) => line,
                Err(err) => {
                    tracing::debug!("agent output is not valid utf-8; replacing bad bytes");
                    String::from_utf8_lossy(err.as_bytes()).into_owned()
                }
            }));
        }
    }

    fn absorb(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Json(value) => self.pending.extend(self.interpreter.interpret(&value)),
                Frame::Text { text, .. } => {
                    tracing::debug!(line = %text, "non-json agent output");
                }
            }
        }
    }

    fn stderr_summary(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentQuery for ProcessQuery {
    async fn next_message(&mut self) -> Option<Result<QueryMessage, QueryError>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                if matches!(message, QueryMessage::Result(_)) {
                    // End of turn: closing stdin lets the CLI exit.
                    self.saw_result = true;
                    self.stdin = None;
                }
                return Some(Ok(message));
            }
            if self.finished {
                return None;
            }
            match self.read_line().await {
                Ok(Some(line)) => {
                    let frames = self.decoder.push(&line);
                    self.absorb(frames);
                }
                Ok(None) => {
                    self.finished = true;
                    let frames = self.decoder.finish();
                    self.absorb(frames);
                    let status = match self.child.wait().await {
                        Ok(status) => status,
                        Err(err) => return Some(Err(QueryError::Io(err))),
                    };
                    if !status.success() && !self.saw_result && self.pending.is_empty() {
                        let code = status.code().unwrap_or(-1);
                        return Some(Err(QueryError::Upstream(format!(
                            "agent exited with code {code}: {}",
                            self.stderr_summary()
                        ))));
                    }
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(QueryError::Io(err)));
                }
            }
        }
    }

    async fn respond_permission(
        &mut self,
        request: &PermissionRequest,
        decision: &PermissionDecision,
    ) -> Result<(), QueryError> {
        let result = match decision {
            PermissionDecision::Allow => PermissionResult::Allow {
                updated_input: &request.input,
            },
            PermissionDecision::Deny { reason } => PermissionResult::Deny { message: reason },
        };
        let result = serde_json::to_value(&result)
            .map_err(|err| QueryError::Upstream(format!("failed to encode decision: {err}")))?;
        self.write_line(&json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request.request_id,
                "response": result
            }
        }))
        .await
    }

    async fn close(&mut self) {
        self.stdin = None;
        self.finished = true;
        if let Err(err) = self.child.kill().await {
            tracing::debug!(error = %err, "agent process already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mission_protocol::ApprovalMode;
    use mission_protocol::ExecutionMode;
    use mission_protocol::SessionConfig;
    use mission_protocol::ToolServerConfig;

    #[test]
    fn args_never_bypass_the_gate() {
        let mut config = SessionConfig::new(ExecutionMode::Streaming, "/work", "do it");
        config.allowed_tools = vec!["Read".to_string()];
        config.disallowed_tools = vec!["WebFetch".to_string()];
        config.model = Some("claude-sonnet-4-5".to_string());
        config.max_budget_usd = Some(1.5);
        config.tool_servers = vec![ToolServerConfig {
            name: "fs".to_string(),
            command: "mcp-fs".to_string(),
            args: vec![],
            env: vec![],
        }];
        let request = QueryRequest::from_session(&config, ApprovalMode::Yolo, "do it", Some("conv-1"));
        let args = ProcessQueryClient::new(StreamingSettings::default()).build_args(&request);

        let joined = args.join(" ");
        assert!(joined.contains("--permission-mode default"));
        assert!(joined.contains("--permission-prompt-tool stdio"));
        assert!(joined.contains("--max-budget-usd 1.50"));
        assert!(joined.contains("--disallowedTools WebFetch"));
        assert!(joined.contains("--resume conv-1"));
        assert!(joined.contains("--tools Read"));
        assert!(joined.contains("--setting-sources "));
        assert!(!joined.contains("user,project,local"));
        assert!(joined.contains("mcpServers"));
        assert!(!joined.contains("--allowedTools"));
        assert!(!joined.contains("bypassPermissions"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_output_lines_do_not_end_the_run() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "read -r _\n",
                "printf '%s\\n' '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"conv-9\"}'\n",
                "printf 'garbage \\377 bytes\\n'\n",
                "head -c 150000 /dev/zero | tr '\\0' x\n",
                "printf '\\n'\n",
                "printf '%s\\n' '{\"type\":\"assistant\",\"message\":{\"id\":\"msg_1\",\"content\":[{\"type\":\"text\",\"text\":\"still here\"}]}}'\n",
                "printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"success\",\"uuid\":\"r-1\",\"total_cost_usd\":0.01}'\n",
                "cat >/dev/null\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = ProcessQueryClient::new(StreamingSettings {
            program: script.display().to_string(),
            extra_args: Vec::new(),
        });
        let config = SessionConfig::new(ExecutionMode::Streaming, dir.path(), "go");
        let request = QueryRequest::from_session(&config, ApprovalMode::Manual, "go", None);
        let mut query = client.start(request).await.unwrap();

        let mut messages = Vec::new();
        while let Some(message) = query.next_message().await {
            messages.push(message.unwrap());
        }

        assert!(matches!(
            &messages[0],
            QueryMessage::Init { conversation_id, .. } if conversation_id == "conv-9"
        ));
        assert!(messages.iter().any(|message| matches!(
            message,
            QueryMessage::Text { text, .. } if text == "still here"
        )));
        assert!(matches!(messages.last(), Some(QueryMessage::Result(_))));
    }

    #[test]
    fn plan_mode_is_forwarded() {
        let config = SessionConfig::new(ExecutionMode::Streaming, "/work", "plan it");
        let request = QueryRequest::from_session(&config, ApprovalMode::Plan, "plan it", None);
        let args = ProcessQueryClient::new(StreamingSettings::default()).build_args(&request);
        let joined = args.join(" ");
        assert!(joined.contains("--permission-mode plan"));
        assert!(joined.contains("--setting-sources user,project,local"));
        assert!(!joined.contains("--tools"));
    }
}
