//! Execution backends.
//!
//! Every backend translates its native activity into the closed set of
//! [`BackendEvent`]s and hands them to an [`EventSink`], which redacts text
//! before it enters the channel. The manager owns the receiving end and is
//! the only place session state changes.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use mission_protocol::ApprovalMode;
use mission_protocol::JournalEntry;
use mission_protocol::JournalEntryKind;
use mission_protocol::SessionConfig;
use mission_protocol::SessionId;
use mission_protocol::SessionStatus;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::permission::PermissionGate;
use crate::redact::SecretRedactor;
use crate::redact::StreamingRedaction;

pub mod streaming;
pub mod terminal;
pub mod worker;

pub use streaming::StreamingBackend;
pub use terminal::TerminalBackend;
pub use worker::WorkerBackend;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Output {
        text: String,
        partial: bool,
    },
    ToolCall {
        name: String,
        input: Value,
    },
    /// `conversation_id` carries the resumable-conversation handle once the
    /// backend learns it.
    StatusChanged {
        status: SessionStatus,
        conversation_id: Option<String>,
    },
    Result {
        cost_usd: f64,
        tokens_in: u64,
        tokens_out: u64,
    },
    Error {
        message: String,
    },
    /// A note for the session's activity journal.
    Journal(JournalEntry),
    Complete,
}

/// Sending half of a run's event channel. Text and tool input are redacted
/// here, before anything leaves the backend.
///
/// Partial output is redacted as one stream: the tail that could still be
/// the start of a secret or tag is held until more text arrives, and any
/// other event flushes it first so ordering is kept.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BackendEvent>,
    redactor: Arc<SecretRedactor>,
    partial: Arc<StdMutex<StreamingRedaction>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<BackendEvent>, redactor: Arc<SecretRedactor>) -> Self {
        Self {
            tx,
            redactor,
            partial: Arc::new(StdMutex::new(StreamingRedaction::default())),
        }
    }

    pub fn redactor(&self) -> &SecretRedactor {
        &self.redactor
    }

    fn send(&self, event: BackendEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }

    pub fn output(&self, text: &str, partial: bool) {
        if text.is_empty() {
            return;
        }
        if partial {
            let released = self
                .partial
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(&self.redactor, text);
            self.send_partial(released);
            return;
        }
        self.flush_partial();
        self.send(BackendEvent::Output {
            text: self.redactor.redact(text),
            partial: false,
        });
    }

    /// Release held partial output.
    pub fn flush_partial(&self) {
        let tail = self
            .partial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(&self.redactor);
        self.send_partial(tail);
    }

    fn send_partial(&self, text: String) {
        if !text.is_empty() {
            self.send(BackendEvent::Output {
                text,
                partial: true,
            });
        }
    }

    pub fn tool_call(&self, name: &str, input: &Value) {
        self.flush_partial();
        self.send(BackendEvent::ToolCall {
            name: self.redactor.redact(name),
            input: self.redactor.redact_json(input),
        });
    }

    pub fn status(&self, status: SessionStatus) {
        self.flush_partial();
        self.send(BackendEvent::StatusChanged {
            status,
            conversation_id: None,
        });
    }

    pub fn conversation(&self, status: SessionStatus, conversation_id: &str) {
        self.flush_partial();
        self.send(BackendEvent::StatusChanged {
            status,
            conversation_id: Some(conversation_id.to_string()),
        });
    }

    pub fn result(&self, cost_usd: f64, tokens_in: u64, tokens_out: u64) {
        self.flush_partial();
        self.send(BackendEvent::Result {
            cost_usd,
            tokens_in,
            tokens_out,
        });
    }

    pub fn error(&self, message: &str) {
        self.flush_partial();
        self.send(BackendEvent::Error {
            message: self.redactor.redact(message),
        });
    }

    pub fn journal(&self, kind: JournalEntryKind, content: &str, metadata: Value) {
        let entry = JournalEntry::new(kind, self.redactor.redact(content))
            .with_metadata(self.redactor.redact_json(&metadata));
        self.send(BackendEvent::Journal(entry));
    }

    pub fn complete(&self) {
        self.flush_partial();
        self.send(BackendEvent::Complete);
    }
}

/// Everything a backend needs for one run.
pub struct BackendContext {
    pub session_id: SessionId,
    /// Snapshot taken when the run started.
    pub config: SessionConfig,
    /// Initial task or follow-up message.
    pub prompt: String,
    pub conversation_id: Option<String>,
    pub events: EventSink,
    /// Raw input for interactive backends.
    pub input: mpsc::UnboundedReceiver<String>,
    pub approval_mode: watch::Receiver<ApprovalMode>,
    pub gate: Arc<PermissionGate>,
    pub cancel: CancellationToken,
}

impl BackendContext {
    pub fn approval_mode(&self) -> ApprovalMode {
        *self.approval_mode.borrow()
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{message}")]
    Transient { message: String },
    #[error("{message}")]
    BudgetExhausted { message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("process exited with code {code}")]
    Exited { code: i32 },
    #[error("failed to start backend: {source}")]
    Spawn {
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    BudgetExhausted,
    Cancelled,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn spawn(source: impl Into<anyhow::Error>) -> Self {
        Self::Spawn {
            source: source.into(),
        }
    }

    /// Classify a failure reported as free text by an upstream agent.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("budget") && (lower.contains("exceed") || lower.contains("exhaust")) {
            Self::BudgetExhausted { message }
        } else if lower.contains("killed by user") || lower.contains("aborted by user") {
            Self::Cancelled
        } else {
            Self::Transient { message }
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::BudgetExhausted { .. } => FailureKind::BudgetExhausted,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Transient { .. } | Self::Exited { .. } | Self::Spawn { .. } => {
                FailureKind::Transient
            }
        }
    }
}

/// One execution strategy.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Drive one run to completion. Must report `working` on entry and
    /// `idle` when the upstream finishes normally.
    async fn run(&self, ctx: BackendContext) -> Result<(), BackendError>;
}
