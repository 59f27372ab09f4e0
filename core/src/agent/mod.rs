//! Client side of the agent CLI.
//!
//! [`QueryClient`] and [`AgentQuery`] are the seam the streaming backend is
//! written against; [`ProcessQueryClient`] implements them over the CLI's
//! stream-json stdio protocol. [`TaskRunner`] is the equivalent seam for
//! the worker backend.

use std::path::PathBuf;

use async_trait::async_trait;
use mission_protocol::ApprovalMode;
use mission_protocol::EffortLevel;
use mission_protocol::SessionConfig;
use mission_protocol::ToolServerConfig;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::permission::PermissionDecision;
use crate::permission::has_static_policy;

mod process;
mod runner;
pub mod stream_json;

pub use process::ProcessQueryClient;
pub use runner::ProcessTaskRunner;
pub use stream_json::Frame;
pub use stream_json::JsonLineDecoder;
pub use stream_json::StreamInterpreter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Includes cache reads and cache writes.
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub id: Option<String>,
    pub subtype: String,
    pub is_error: bool,
    pub text: Option<String>,
    pub cost_usd: f64,
    pub num_turns: Option<u32>,
    pub usage: Option<TokenUsage>,
}

impl QueryResult {
    pub fn is_budget_exhausted(&self) -> bool {
        self.subtype.contains("budget")
    }

    pub fn error_message(&self) -> String {
        match &self.text {
            Some(text) if !text.is_empty() => text.clone(),
            _ => format!("agent finished with {}", self.subtype),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: Option<String>,
}

/// Typed events produced by an agent query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryMessage {
    Init {
        conversation_id: String,
        model: Option<String>,
    },
    Text {
        message_id: Option<String>,
        text: String,
        partial: bool,
    },
    ToolUse {
        message_id: Option<String>,
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
    Usage {
        message_id: String,
        usage: TokenUsage,
    },
    Result(QueryResult),
    PermissionRequest(PermissionRequest),
}

/// Everything needed to start one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub effort: Option<EffortLevel>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub additional_directories: Vec<PathBuf>,
    pub tool_servers: Vec<ToolServerConfig>,
    pub enable_checkpointing: bool,
    pub load_settings: bool,
    pub plan_mode: bool,
    pub resume: Option<String>,
}

impl QueryRequest {
    pub fn from_session(
        config: &SessionConfig,
        approval_mode: ApprovalMode,
        prompt: &str,
        resume: Option<&str>,
    ) -> Self {
        Self {
            prompt: prompt.to_string(),
            cwd: config.cwd.clone(),
            model: config.model.clone(),
            fallback_model: config.fallback_model.clone(),
            max_turns: config.max_turns,
            max_budget_usd: config.max_budget_usd,
            effort: config.effort,
            system_prompt: config.system_prompt.clone(),
            allowed_tools: config.allowed_tools.clone(),
            disallowed_tools: config.disallowed_tools.clone(),
            additional_directories: config.additional_directories.clone(),
            tool_servers: config.tool_servers.clone(),
            enable_checkpointing: config.enable_checkpointing,
            load_settings: config.load_settings && !has_static_policy(config),
            plan_mode: approval_mode == ApprovalMode::Plan,
            resume: resume.map(str::to_string),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to start agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent stream closed")]
    Closed,
    #[error("{0}")]
    Upstream(String),
}

/// A running query. Messages arrive in upstream order.
#[async_trait]
pub trait AgentQuery: Send {
    /// `None` once the upstream is exhausted.
    async fn next_message(&mut self) -> Option<Result<QueryMessage, QueryError>>;

    async fn respond_permission(
        &mut self,
        request: &PermissionRequest,
        decision: &PermissionDecision,
    ) -> Result<(), QueryError>;

    /// Stop the query and release the underlying process.
    async fn close(&mut self);
}

#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn start(&self, request: QueryRequest) -> Result<Box<dyn AgentQuery>, QueryError>;
}

/// One step of a worker run, replayed into the session afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerStep {
    ToolCall { tool: String, input: Value },
    ToolResult { tool: String, output: String },
    Message { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTask {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_turns: u32,
    pub max_budget_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub success: bool,
    pub summary: String,
    pub steps: Vec<WorkerStep>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("worker cancelled")]
    Cancelled,
}

/// Runs one bounded, non-interactive task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(
        &self,
        task: WorkerTask,
        cancel: CancellationToken,
    ) -> Result<WorkerReport, WorkerError>;
}
