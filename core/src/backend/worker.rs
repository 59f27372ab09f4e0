use std::sync::Arc;

use async_trait::async_trait;
use mission_protocol::SessionStatus;
use mission_utils_string::truncate_middle;

use super::BackendContext;
use super::BackendError;
use super::ExecutionBackend;
use crate::agent::TaskRunner;
use crate::agent::WorkerError;
use crate::agent::WorkerStep;
use crate::agent::WorkerTask;
use crate::config::WorkerSettings;

const TOOL_RESULT_PREVIEW_BYTES: usize = 2_000;

/// Runs one bounded task and replays its step log into the session.
pub struct WorkerBackend {
    runner: Arc<dyn TaskRunner>,
    default_budget_usd: f64,
    default_max_turns: u32,
}

impl WorkerBackend {
    pub fn new(runner: Arc<dyn TaskRunner>, settings: &WorkerSettings) -> Self {
        Self {
            runner,
            default_budget_usd: settings.default_budget_usd,
            default_max_turns: settings.default_max_turns,
        }
    }
}

#[async_trait]
impl ExecutionBackend for WorkerBackend {
    async fn run(&self, ctx: BackendContext) -> Result<(), BackendError> {
        let BackendContext {
            session_id,
            config,
            prompt,
            events,
            cancel,
            ..
        } = ctx;
        events.status(SessionStatus::Working);

        let task = WorkerTask {
            prompt,
            cwd: config.cwd.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_turns: config.max_turns.unwrap_or(self.default_max_turns),
            max_budget_usd: config.max_budget_usd.unwrap_or(self.default_budget_usd),
        };
        let budget = task.max_budget_usd;
        let report = match self.runner.run_task(task, cancel.clone()).await {
            Ok(report) => report,
            Err(WorkerError::Cancelled) => return Err(BackendError::Cancelled),
            Err(WorkerError::Spawn(err)) => return Err(BackendError::spawn(err)),
            Err(err) => return Err(BackendError::transient(err.to_string())),
        };
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        for step in &report.steps {
            match step {
                WorkerStep::ToolCall { tool, input } => events.tool_call(tool, input),
                WorkerStep::ToolResult { tool, output } => events.output(
                    &format!("[{tool}] {}", truncate_middle(output, TOOL_RESULT_PREVIEW_BYTES)),
                    false,
                ),
                WorkerStep::Message { text } => events.output(text, false),
            }
        }
        events.result(report.cost_usd, report.tokens_in, report.tokens_out);
        tracing::info!(
            session_id = %session_id,
            success = report.success,
            cost_usd = report.cost_usd,
            "worker finished"
        );

        if report.cost_usd >= budget && !report.success {
            return Err(BackendError::BudgetExhausted {
                message: format!(
                    "Budget exceeded: ${:.2} >= ${budget:.2}",
                    report.cost_usd
                ),
            });
        }
        if !report.success {
            return Err(BackendError::from_message(report.summary));
        }
        let summary_replayed = report
            .steps
            .iter()
            .any(|step| matches!(step, WorkerStep::Message { text } if *text == report.summary));
        if !report.summary.is_empty() && !summary_replayed {
            events.output(&report.summary, false);
        }
        events.status(SessionStatus::Idle);
        events.complete();
        Ok(())
    }
}
