use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::QueryMessage;
use super::TaskRunner;
use super::WorkerError;
use super::WorkerReport;
use super::WorkerStep;
use super::WorkerTask;
use super::stream_json::Frame;
use super::stream_json::JsonLineDecoder;
use super::stream_json::StreamInterpreter;
use crate::config::WorkerSettings;

/// Runs the agent CLI non-interactively and folds its stream-json output
/// into a [`WorkerReport`].
#[derive(Debug, Clone)]
pub struct ProcessTaskRunner {
    settings: WorkerSettings,
}

impl ProcessTaskRunner {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }

    pub fn build_args(&self, task: &WorkerTask) -> Vec<String> {
        let budget = format!("{:.2}", task.max_budget_usd);
        let mut args: Vec<String> = self
            .settings
            .args
            .iter()
            .map(|arg| arg.replace("{task}", &task.prompt).replace("{budget}", &budget))
            .collect();
        args.push("--max-turns".to_string());
        args.push(task.max_turns.to_string());
        if let Some(model) = &task.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(prompt) = &task.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        args
    }
}

/// Accumulates interpreted messages into a report.
#[derive(Default)]
pub(crate) struct ReportBuilder {
    interpreter: StreamInterpreter,
    report: WorkerReport,
    seen_usage: std::collections::HashSet<String>,
    finished: bool,
}

impl ReportBuilder {
    pub(crate) fn absorb(&mut self, frame: Frame) {
        let Frame::Json(value) = frame else {
            return;
        };
        for message in self.interpreter.interpret(&value) {
            match message {
                QueryMessage::Text { text, partial: false, .. } => {
                    self.report.steps.push(WorkerStep::Message { text });
                }
                QueryMessage::ToolUse { name, input, .. } => {
                    self.report.steps.push(WorkerStep::ToolCall { tool: name, input });
                }
                QueryMessage::ToolResult {
                    tool_use_id,
                    output,
                    ..
                } => {
                    let tool = self
                        .interpreter
                        .tool_name(&tool_use_id)
                        .unwrap_or("tool")
                        .to_string();
                    self.report.steps.push(WorkerStep::ToolResult { tool, output });
                }
                QueryMessage::Usage { message_id, usage } => {
                    if self.seen_usage.insert(message_id) {
                        self.report.tokens_in += usage.input_tokens;
                        self.report.tokens_out += usage.output_tokens;
                    }
                }
                QueryMessage::Result(result) => {
                    self.finished = true;
                    self.report.cost_usd = result.cost_usd;
                    self.report.success = !result.is_error;
                    self.report.summary = if result.is_error && result.is_budget_exhausted() {
                        format!("Budget exceeded: {}", result.error_message())
                    } else {
                        result.text.clone().unwrap_or_else(|| result.error_message())
                    };
                }
                QueryMessage::Text { .. }
                | QueryMessage::Init { .. }
                | QueryMessage::PermissionRequest(_) => {}
            }
        }
    }

    pub(crate) fn finish(mut self, exit_code: Option<i32>) -> WorkerReport {
        if !self.finished {
            self.report.success = false;
            self.report.summary = match exit_code {
                Some(code) => format!("worker exited with code {code} before reporting a result"),
                None => "worker ended before reporting a result".to_string(),
            };
        }
        self.report
    }
}

#[async_trait]
impl TaskRunner for ProcessTaskRunner {
    async fn run_task(
        &self,
        task: WorkerTask,
        cancel: CancellationToken,
    ) -> Result<WorkerReport, WorkerError> {
        let args = self.build_args(&task);
        tracing::debug!(program = %self.settings.program, "starting worker task");
        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .current_dir(&task.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;
        let Some(stdout) = child.stdout.take() else {
            return Err(WorkerError::Io(std::io::Error::other("worker stdout unavailable")));
        };

        let timeout = self.settings.timeout();
        let collect = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut decoder = JsonLineDecoder::new();
            let mut builder = ReportBuilder::default();
            while let Some(mut line) = lines.next_line().await? {
                line.push('\n');
                for frame in decoder.push(&line) {
                    builder.absorb(frame);
                }
            }
            for frame in decoder.finish() {
                builder.absorb(frame);
            }
            let status = child.wait().await?;
            Ok::<_, WorkerError>(builder.finish(status.code()))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            outcome = tokio::time::timeout(timeout, collect) => match outcome {
                Ok(report) => report,
                Err(_) => Err(WorkerError::Timeout(timeout)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn feed(builder: &mut ReportBuilder, value: serde_json::Value) {
        builder.absorb(Frame::Json(value));
    }

    #[test]
    fn report_collects_steps_and_dedups_usage() {
        let mut builder = ReportBuilder::default();
        // One assistant event per content block, all carrying the same usage.
        feed(&mut builder, json!({
            "type": "assistant",
            "message": {
                "id": "m1",
                "content": [{"type": "text", "text": "Listing"}],
                "usage": {"input_tokens": 100, "output_tokens": 20}
            }
        }));
        feed(&mut builder, json!({
            "type": "assistant",
            "message": {
                "id": "m1",
                "content": [{"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}],
                "usage": {"input_tokens": 100, "output_tokens": 20}
            }
        }));
        feed(&mut builder, json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "t1", "content": "a.txt"}]}
        }));
        feed(&mut builder, json!({
            "type": "result", "subtype": "success", "is_error": false,
            "result": "listed files", "total_cost_usd": 0.02
        }));

        let report = builder.finish(Some(0));
        assert!(report.success);
        assert_eq!(report.summary, "listed files");
        assert_eq!(report.tokens_in, 100);
        assert_eq!(report.tokens_out, 20);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(
            report.steps[2],
            WorkerStep::ToolResult {
                tool: "Bash".to_string(),
                output: "a.txt".to_string()
            }
        );
    }

    #[test]
    fn missing_result_is_a_failure() {
        let report = ReportBuilder::default().finish(Some(3));
        assert!(!report.success);
        assert!(report.summary.contains("code 3"));
    }

    #[test]
    fn budget_result_is_reported_as_budget_exceeded() {
        let mut builder = ReportBuilder::default();
        feed(&mut builder, json!({
            "type": "result", "subtype": "error_max_budget_usd", "is_error": true, "total_cost_usd": 2.05
        }));
        let report = builder.finish(Some(1));
        assert!(!report.success);
        assert!(report.summary.starts_with("Budget exceeded"));
    }

    #[test]
    fn args_substitute_task_and_budget() {
        let runner = ProcessTaskRunner::new(WorkerSettings::default());
        let args = runner.build_args(&WorkerTask {
            prompt: "write docs".to_string(),
            cwd: "/work".into(),
            model: None,
            system_prompt: None,
            max_turns: 30,
            max_budget_usd: 2.0,
        });
        assert_eq!(args[1], "write docs");
        assert!(args.join(" ").contains("--max-budget-usd 2.00 --max-turns 30"));
    }
}
