use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::SessionId;

/// Which execution backend drives the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionMode {
    /// Agent SDK query with an interactive permission loop.
    #[default]
    #[serde(alias = "sdk")]
    Streaming,
    /// Interactive CLI attached to a pseudo-terminal.
    #[serde(alias = "pty")]
    Terminal,
    /// Bounded single-shot task runner.
    #[serde(alias = "api")]
    Worker,
}

/// How tool-use requests are approved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Manual,
    Auto,
    Yolo,
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EffortLevel {
    Low,
    Medium,
    High,
    Max,
}

/// Outbound network rules applied to shell commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicyConfig {
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    /// Ecosystem names such as `npm` or `github`, expanded into allowed domains.
    pub presets: Vec<String>,
}

impl NetworkPolicyConfig {
    pub fn is_empty(&self) -> bool {
        self.allowed_domains.is_empty() && self.blocked_domains.is_empty() && self.presets.is_empty()
    }
}

/// An external tool server attached to a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

fn default_max_restarts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Input accepted by `spawn`. Only `approval_mode` and `task` change after
/// the session exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub id: Option<SessionId>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub cwd: PathBuf,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub effort: Option<EffortLevel>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub additional_directories: Vec<PathBuf>,
    #[serde(default)]
    pub network_policy: Option<NetworkPolicyConfig>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub enable_checkpointing: bool,
    #[serde(default = "default_true")]
    pub load_settings: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl SessionConfig {
    pub fn new(mode: ExecutionMode, cwd: impl Into<PathBuf>, task: impl Into<String>) -> Self {
        Self {
            id: None,
            machine_id: None,
            mode,
            task: task.into(),
            cwd: cwd.into(),
            approval_mode: ApprovalMode::default(),
            model: None,
            max_budget_usd: None,
            effort: None,
            system_prompt: None,
            max_turns: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            additional_directories: Vec::new(),
            network_policy: None,
            tool_servers: Vec::new(),
            fallback_model: None,
            enable_checkpointing: false,
            load_settings: true,
            auto_restart: false,
            max_restarts: default_max_restarts(),
        }
    }
}
