use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use mission_protocol::SessionStatus;

use super::BackendContext;
use super::BackendError;
use super::EventSink;
use super::ExecutionBackend;
use crate::agent::QueryClient;
use crate::agent::QueryMessage;
use crate::agent::QueryRequest;
use crate::agent::QueryResult;
use crate::permission::GateContext;
use crate::permission::PermissionDecision;

/// Drives an agent query and bridges its permission requests through the
/// permission gate.
pub struct StreamingBackend {
    client: Arc<dyn QueryClient>,
}

impl StreamingBackend {
    pub fn new(client: Arc<dyn QueryClient>) -> Self {
        Self { client }
    }
}

/// Per-run dedup state. Upstream repeats usage on every content block of a
/// message, so accounting is keyed by message id.
#[derive(Default)]
pub(crate) struct StreamLedger {
    usage_ids: HashSet<String>,
    result_ids: HashSet<String>,
    tool_use_ids: HashSet<String>,
    streamed_message_ids: HashSet<String>,
    conversation_id: Option<String>,
}

impl StreamLedger {
    /// Forward one non-interactive message. Returns the result message, if
    /// this was one, after its cost was accounted.
    pub(crate) fn forward(&mut self, events: &EventSink, message: QueryMessage) -> Option<QueryResult> {
        match message {
            QueryMessage::Init {
                conversation_id, ..
            } => {
                if self.conversation_id.is_none() {
                    events.conversation(SessionStatus::Working, &conversation_id);
                    self.conversation_id = Some(conversation_id);
                }
            }
            QueryMessage::Text {
                message_id,
                text,
                partial: true,
            } => {
                if let Some(id) = message_id {
                    self.streamed_message_ids.insert(id);
                }
                events.output(&text, true);
            }
            QueryMessage::Text {
                message_id, text, ..
            } => {
                let streamed = message_id
                    .as_ref()
                    .is_some_and(|id| self.streamed_message_ids.contains(id));
                if streamed {
                    events.flush_partial();
                } else {
                    events.output(&text, false);
                }
            }
            QueryMessage::ToolUse {
                tool_use_id,
                name,
                input,
                ..
            } => {
                if self.tool_use_ids.insert(tool_use_id) {
                    events.tool_call(&name, &input);
                }
            }
            QueryMessage::ToolResult { tool_use_id, .. } => {
                tracing::trace!(tool_use_id = %tool_use_id, "tool result");
            }
            QueryMessage::Usage { message_id, usage } => {
                if self.usage_ids.insert(message_id) {
                    events.result(0.0, usage.input_tokens, usage.output_tokens);
                }
            }
            QueryMessage::Result(result) => {
                let fresh = match &result.id {
                    Some(id) => self.result_ids.insert(id.clone()),
                    None => true,
                };
                if fresh {
                    events.result(result.cost_usd, 0, 0);
                }
                return Some(result);
            }
            QueryMessage::PermissionRequest(request) => {
                tracing::debug!(tool = %request.tool_name, "permission request ignored");
            }
        }
        None
    }
}

pub(crate) fn result_failure(result: &QueryResult) -> Option<BackendError> {
    if !result.is_error {
        return None;
    }
    let message = result.error_message();
    Some(if result.is_budget_exhausted() {
        BackendError::BudgetExhausted { message }
    } else {
        BackendError::from_message(message)
    })
}

#[async_trait]
impl ExecutionBackend for StreamingBackend {
    async fn run(&self, ctx: BackendContext) -> Result<(), BackendError> {
        let BackendContext {
            session_id,
            config,
            prompt,
            conversation_id,
            events,
            approval_mode,
            gate,
            cancel,
            ..
        } = ctx;
        events.status(SessionStatus::Working);

        let mode = *approval_mode.borrow();
        let request = QueryRequest::from_session(&config, mode, &prompt, conversation_id.as_deref());
        let mut query = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            started = self.client.start(request) => started.map_err(BackendError::spawn)?,
        };

        let gate_ctx = GateContext::new(&session_id, &config, &events);
        let mut ledger = StreamLedger::default();
        let outcome = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Err(BackendError::Cancelled),
                next = query.next_message() => next,
            };
            let message = match next {
                None => break Ok(()),
                Some(Ok(message)) => message,
                Some(Err(err)) => break Err(BackendError::transient(err.to_string())),
            };

            if let QueryMessage::PermissionRequest(request) = message {
                let mode = *approval_mode.borrow();
                let decision = tokio::select! {
                    _ = cancel.cancelled() => break Err(BackendError::Cancelled),
                    decision = gate.check(&gate_ctx, mode, &request.tool_name, &request.input) => decision,
                };
                if let PermissionDecision::Deny { reason } = &decision {
                    events.output(&format!("[denied] {}: {reason}", request.tool_name), false);
                }
                if let Err(err) = query.respond_permission(&request, &decision).await {
                    break Err(BackendError::transient(err.to_string()));
                }
                continue;
            }

            if let Some(result) = ledger.forward(&events, message)
                && let Some(failure) = result_failure(&result)
            {
                break Err(failure);
            }
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, "agent query exhausted");
                events.status(SessionStatus::Idle);
                events.complete();
                Ok(())
            }
            Err(err) => {
                query.close().await;
                Err(err)
            }
        }
    }
}
