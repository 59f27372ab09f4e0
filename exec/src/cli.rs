use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use mission_protocol::ApprovalMode;
use mission_protocol::ExecutionMode;
use mission_protocol::NetworkPolicyConfig;
use mission_protocol::SessionConfig;
use mission_protocol::SessionId;

#[derive(Parser, Debug)]
#[command(version, about = "Run one supervised agent session headlessly")]
pub struct Cli {
    /// Task for the agent. Use `-` to read it from stdin.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    #[arg(long, value_enum, default_value_t = ModeArg::Streaming)]
    pub mode: ModeArg,

    #[arg(long = "approval-mode", short = 'a', value_enum, default_value_t = ApprovalArg::Manual)]
    pub approval_mode: ApprovalArg,

    /// Working directory for the agent.
    #[arg(long = "cd", short = 'C', value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    #[arg(long, short = 'm')]
    pub model: Option<String>,

    #[arg(long = "fallback-model")]
    pub fallback_model: Option<String>,

    #[arg(long = "max-budget-usd")]
    pub max_budget_usd: Option<f64>,

    #[arg(long = "max-turns")]
    pub max_turns: Option<u32>,

    #[arg(long = "system-prompt")]
    pub system_prompt: Option<String>,

    /// Only these tools may run. Accepts `*` wildcards.
    #[arg(long = "allow-tool", value_name = "TOOL")]
    pub allowed_tools: Vec<String>,

    #[arg(long = "deny-tool", value_name = "TOOL")]
    pub disallowed_tools: Vec<String>,

    #[arg(long = "add-dir", value_name = "DIR")]
    pub additional_directories: Vec<PathBuf>,

    #[arg(long = "allow-domain", value_name = "DOMAIN")]
    pub allowed_domains: Vec<String>,

    #[arg(long = "block-domain", value_name = "DOMAIN")]
    pub blocked_domains: Vec<String>,

    /// Ecosystem preset such as `npm` or `github`.
    #[arg(long = "network-preset", value_name = "NAME")]
    pub presets: Vec<String>,

    #[arg(long = "auto-restart", default_value_t = false)]
    pub auto_restart: bool,

    #[arg(long = "max-restarts", default_value_t = 3)]
    pub max_restarts: u32,

    #[arg(long = "session-id")]
    pub session_id: Option<String>,

    /// Print events as JSON lines.
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,

    /// Directory holding `config.toml`. Defaults to `$MISSION_HOME`.
    #[arg(long = "home", value_name = "DIR")]
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    #[value(alias = "sdk")]
    Streaming,
    #[value(alias = "pty")]
    Terminal,
    #[value(alias = "api")]
    Worker,
}

impl From<ModeArg> for ExecutionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Streaming => ExecutionMode::Streaming,
            ModeArg::Terminal => ExecutionMode::Terminal,
            ModeArg::Worker => ExecutionMode::Worker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApprovalArg {
    Manual,
    Auto,
    Yolo,
    Plan,
}

impl From<ApprovalArg> for ApprovalMode {
    fn from(value: ApprovalArg) -> Self {
        match value {
            ApprovalArg::Manual => ApprovalMode::Manual,
            ApprovalArg::Auto => ApprovalMode::Auto,
            ApprovalArg::Yolo => ApprovalMode::Yolo,
            ApprovalArg::Plan => ApprovalMode::Plan,
        }
    }
}

impl Cli {
    pub fn session_config(&self, task: String, cwd: PathBuf) -> SessionConfig {
        let mut config = SessionConfig::new(self.mode.into(), cwd, task);
        config.id = self.session_id.clone().map(SessionId::from);
        config.approval_mode = self.approval_mode.into();
        config.model = self.model.clone();
        config.fallback_model = self.fallback_model.clone();
        config.max_budget_usd = self.max_budget_usd;
        config.max_turns = self.max_turns;
        config.system_prompt = self.system_prompt.clone();
        config.allowed_tools = self.allowed_tools.clone();
        config.disallowed_tools = self.disallowed_tools.clone();
        config.additional_directories = self.additional_directories.clone();
        config.auto_restart = self.auto_restart;
        config.max_restarts = self.max_restarts;

        let network = NetworkPolicyConfig {
            allowed_domains: self.allowed_domains.clone(),
            blocked_domains: self.blocked_domains.clone(),
            presets: self.presets.clone(),
        };
        if !network.is_empty() {
            config.network_policy = Some(network);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_map_onto_the_session_config() {
        let cli = Cli::parse_from([
            "mission-exec",
            "--mode",
            "pty",
            "-a",
            "yolo",
            "--block-domain",
            "evil.example",
            "--network-preset",
            "npm",
            "--allow-tool",
            "Read",
            "--auto-restart",
            "fix the build",
        ]);
        let config = cli.session_config("fix the build".to_string(), PathBuf::from("/work"));

        assert_eq!(config.mode, ExecutionMode::Terminal);
        assert_eq!(config.approval_mode, ApprovalMode::Yolo);
        assert_eq!(config.allowed_tools, vec!["Read".to_string()]);
        assert!(config.auto_restart);
        let network = config.network_policy.expect("network policy");
        assert_eq!(network.blocked_domains, vec!["evil.example".to_string()]);
        assert_eq!(network.presets, vec!["npm".to_string()]);
    }

    #[test]
    fn no_network_flags_means_no_policy() {
        let cli = Cli::parse_from(["mission-exec", "task"]);
        let config = cli.session_config("task".to_string(), PathBuf::from("/work"));
        assert_eq!(config.network_policy, None);
        assert_eq!(config.mode, ExecutionMode::Streaming);
    }
}
