//! Decides whether a tool-use request may run.
//!
//! Order of evaluation: allow/deny lists, network policy for shell tools,
//! then the session's approval mode (`yolo` allows, `auto` asks the
//! auto-approval rules first, everything else waits for a human). The static
//! checks short-circuit before any auto-approval or human prompt happens.

use std::sync::Arc;

use mission_protocol::ApprovalMode;
use mission_protocol::JournalEntryKind;
use mission_protocol::SessionConfig;
use mission_protocol::SessionId;
use mission_protocol::SessionStatus;
use mission_utils_string::take_bytes_at_char_boundary;
use serde_json::Value;
use serde_json::json;
use wildmatch::WildMatch;

use crate::approval::ALLOW_OPTION;
use crate::approval::ApprovalQueue;
use crate::approval::AutoApproval;
use crate::approval::DENY_OPTION;
use crate::approval::answer_allows;
use crate::backend::EventSink;
use crate::network_policy::NetworkPolicy;
use crate::network_policy::NetworkVerdict;

const AUDIT_TARGET: &str = "mission_core::audit";
const QUESTION_PREVIEW_BYTES: usize = 500;
const JOURNAL_PREVIEW_BYTES: usize = 200;
const SHELL_TOOLS: &[&str] = &[
    "bash",
    "shell",
    "exec_command",
    "run_command",
    "execute_command",
    "terminal",
];
/// Built-in tools of the agent CLI, used to narrow its tool set to an
/// allowlist.
const BUILTIN_TOOLS: &[&str] = &[
    "Bash",
    "BashOutput",
    "Edit",
    "Glob",
    "Grep",
    "KillShell",
    "LS",
    "MultiEdit",
    "NotebookEdit",
    "NotebookRead",
    "Read",
    "SlashCommand",
    "Task",
    "TodoWrite",
    "WebFetch",
    "WebSearch",
    "Write",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
}

impl PermissionDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Per-run view of the session the gate decides for.
pub struct GateContext<'a> {
    pub session_id: &'a SessionId,
    pub config: &'a SessionConfig,
    pub network: NetworkPolicy,
    pub events: &'a EventSink,
}

impl<'a> GateContext<'a> {
    pub fn new(session_id: &'a SessionId, config: &'a SessionConfig, events: &'a EventSink) -> Self {
        let network = config
            .network_policy
            .as_ref()
            .map(NetworkPolicy::from_config)
            .unwrap_or_default();
        Self {
            session_id,
            config,
            network,
            events,
        }
    }
}

pub struct PermissionGate {
    approvals: Arc<dyn ApprovalQueue>,
}

impl PermissionGate {
    pub fn new(approvals: Arc<dyn ApprovalQueue>) -> Self {
        Self { approvals }
    }

    /// `approval_mode` is read by the caller right before the check so that
    /// mode changes apply to the next request.
    pub async fn check(
        &self,
        ctx: &GateContext<'_>,
        approval_mode: ApprovalMode,
        tool_name: &str,
        input: &Value,
    ) -> PermissionDecision {
        if let Some(reason) = static_policy_denial(ctx.config, &ctx.network, tool_name, input) {
            audit(ctx.session_id, tool_name, "deny", &reason);
            return PermissionDecision::Deny { reason };
        }

        let question = ctx.events.redactor().redact(&describe_request(tool_name, input));
        let preview = take_bytes_at_char_boundary(&question, JOURNAL_PREVIEW_BYTES);
        let mut escalation = None;
        match approval_mode {
            ApprovalMode::Yolo => {
                audit(ctx.session_id, tool_name, "allow", "yolo mode");
                return PermissionDecision::Allow;
            }
            ApprovalMode::Auto => {
                match self.approvals.try_auto_approve(ctx.session_id, &question).await {
                    AutoApproval::Resolved { answer, reason } => {
                        let decision = decision_from_answer(&answer);
                        audit(ctx.session_id, tool_name, decision_label(&decision), &reason);
                        let (kind, verb) = if decision.is_allow() {
                            (JournalEntryKind::AutoApproved, "Auto-approved")
                        } else {
                            (JournalEntryKind::Output, "Auto-denied")
                        };
                        ctx.events
                            .journal(kind, &format!("{verb}: {preview}"), json!({ "reason": reason }));
                        return decision;
                    }
                    AutoApproval::Unresolved { reason } => {
                        tracing::debug!(session_id = %ctx.session_id, reason = %reason, "auto approval escalated");
                        escalation = Some(reason);
                    }
                }
            }
            ApprovalMode::Manual | ApprovalMode::Plan => {}
        }

        let content = match &escalation {
            Some(reason) => format!("Escalated to human: {reason}"),
            None => format!("Waiting for approval: {tool_name}"),
        };
        ctx.events
            .journal(JournalEntryKind::Prompt, &content, json!({ "question": preview }));
        ctx.events.status(SessionStatus::WaitingForInput);
        let options = vec![ALLOW_OPTION.to_string(), DENY_OPTION.to_string()];
        let answer = self
            .approvals
            .enqueue_and_wait(ctx.session_id, &question, &options)
            .await;
        ctx.events.status(SessionStatus::Working);

        let decision = match answer {
            Ok(answer) => decision_from_answer(&answer),
            Err(err) => PermissionDecision::deny(err.to_string()),
        };
        audit(ctx.session_id, tool_name, decision_label(&decision), "human decision");
        decision
    }
}

/// Allow/deny lists and network policy. Returns the denial reason.
pub fn static_policy_denial(
    config: &SessionConfig,
    network: &NetworkPolicy,
    tool_name: &str,
    input: &Value,
) -> Option<String> {
    if !config.allowed_tools.is_empty()
        && !config
            .allowed_tools
            .iter()
            .any(|pattern| tool_matches(pattern, tool_name))
    {
        return Some(format!("tool {tool_name} is not in the allowed tools"));
    }
    if config
        .disallowed_tools
        .iter()
        .any(|pattern| tool_matches(pattern, tool_name))
    {
        return Some(format!("tool {tool_name} is disallowed"));
    }
    if is_shell_tool(tool_name)
        && !network.is_empty()
        && let Some(command) = shell_command(input)
        && let NetworkVerdict::Denied { reason, .. } = network.evaluate_command(&command)
    {
        return Some(reason);
    }
    None
}

/// Whether the session carries allow/deny lists or a network policy. Such
/// sessions must not pick up allow rules from agent settings files, since
/// those let the agent run tools without asking the gate.
pub fn has_static_policy(config: &SessionConfig) -> bool {
    !config.allowed_tools.is_empty()
        || !config.disallowed_tools.is_empty()
        || config
            .network_policy
            .as_ref()
            .is_some_and(|network| !network.is_empty())
}

/// Built-in tools covered by `allowed_tools`. The agent runs some read-only
/// tools without asking, so an allowlist has to shrink its tool set too.
pub fn allowed_builtin_tools(allowed_tools: &[String]) -> Vec<String> {
    BUILTIN_TOOLS
        .iter()
        .filter(|tool| {
            allowed_tools
                .iter()
                .any(|pattern| tool_matches(pattern, tool))
        })
        .map(|tool| (*tool).to_string())
        .collect()
}

/// `Bash(git:*)` style entries match on the part before the parenthesis.
fn tool_matches(pattern: &str, tool_name: &str) -> bool {
    let name = pattern.split('(').next().unwrap_or(pattern).trim();
    WildMatch::new(name).matches(tool_name)
}

pub fn is_shell_tool(tool_name: &str) -> bool {
    SHELL_TOOLS
        .iter()
        .any(|shell| shell.eq_ignore_ascii_case(tool_name))
}

/// The command line carried by a shell tool input.
pub fn shell_command(input: &Value) -> Option<String> {
    match input.get("command").or_else(|| input.get("cmd"))? {
        Value::String(command) => Some(command.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

fn describe_request(tool_name: &str, input: &Value) -> String {
    let detail = shell_command(input)
        .or_else(|| {
            ["file_path", "path", "pattern", "url", "query"]
                .iter()
                .find_map(|key| input.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| input.to_string());
    format!(
        "{tool_name}: {}",
        take_bytes_at_char_boundary(&detail, QUESTION_PREVIEW_BYTES)
    )
}

fn decision_from_answer(answer: &str) -> PermissionDecision {
    if answer_allows(answer) {
        PermissionDecision::Allow
    } else {
        PermissionDecision::deny("Denied by user")
    }
}

fn decision_label(decision: &PermissionDecision) -> &'static str {
    match decision {
        PermissionDecision::Allow => "allow",
        PermissionDecision::Deny { .. } => "deny",
    }
}

fn audit(session_id: &SessionId, tool_name: &str, decision: &str, reason: &str) {
    tracing::info!(
        target: AUDIT_TARGET,
        session_id = %session_id,
        tool = tool_name,
        decision,
        reason,
        "tool permission decided"
    );
}
