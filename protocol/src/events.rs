use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::ApprovalMode;
use crate::SessionId;
use crate::SessionStatus;

/// Event pushed to observers: `{sessionId, type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub body: EventBody,
}

impl OutboundEvent {
    pub fn new(session_id: SessionId, body: EventBody) -> Self {
        Self { session_id, body }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    Output {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        streaming: bool,
    },
    Status {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "oldStatus")]
        old_status: Option<SessionStatus>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            rename = "approvalMode"
        )]
        approval_mode: Option<ApprovalMode>,
    },
    ToolCall {
        tool: String,
        input: Value,
    },
    Complete {
        #[serde(default)]
        killed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        restarting: bool,
    },
}
